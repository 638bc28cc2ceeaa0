//! Backend selection and lifecycle.
//!
//! `HostStoreFactory` is an owned handle meant to be threaded through
//! server state rather than stashed in a global: whoever composes the
//! process decides where the factory lives. It holds at most one live
//! backend; creating a new one closes the previous instance, and a
//! failed create leaves the previous instance untouched.

use std::sync::Arc;

use tracing::{debug, info};

use crate::descriptor::Descriptor;
use crate::memory::MemoryStore;
use crate::sqlite::SqliteStore;
use crate::{HostStore, StoreError};

#[derive(Default)]
pub struct HostStoreFactory {
    active: Option<Arc<dyn HostStore>>,
}

impl std::fmt::Debug for HostStoreFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostStoreFactory")
            .field("active", &self.active.as_ref().map(|store| store.store_type()))
            .finish()
    }
}

impl HostStoreFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses the descriptor, opens the named backend, and installs it.
    ///
    /// The replacement is transactional in spirit: the new backend is
    /// opened completely before the old one is closed, so any error
    /// leaves the factory exactly as it was.
    pub async fn create(&mut self, descriptor: &str) -> Result<(), StoreError> {
        let desc = Descriptor::parse(descriptor)?;
        let store = open_backend(&desc).await?;

        info!(store_type = store.store_type(), "host store created");
        if let Some(old) = self.active.replace(store) {
            debug!(store_type = old.store_type(), "closing replaced host store");
            old.close().await;
        }
        Ok(())
    }

    /// The live backend, or [`StoreError::NoHostStore`] if none was
    /// created (or the last one was destroyed).
    pub fn instance(&self) -> Result<Arc<dyn HostStore>, StoreError> {
        self.active.clone().ok_or(StoreError::NoHostStore)
    }

    /// Closes and releases the current backend. A no-op when none is
    /// active. Pending uncommitted work is lost.
    pub async fn destroy(&mut self) {
        if let Some(store) = self.active.take() {
            debug!(store_type = store.store_type(), "destroying host store");
            store.close().await;
        }
    }
}

async fn open_backend(desc: &Descriptor) -> Result<Arc<dyn HostStore>, StoreError> {
    match desc.backend.as_str() {
        "memory" => {
            // name is unused by the memory backend but required for
            // descriptor uniformity
            desc.name.as_ref().ok_or(StoreError::NoDatabaseName)?;
            Ok(Arc::new(MemoryStore::new()))
        }
        "sqlite" => {
            let name = desc.name.as_ref().ok_or(StoreError::NoDatabaseName)?;
            Ok(Arc::new(SqliteStore::open(name).await?))
        }
        other => Err(StoreError::InvalidType(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv6Addr;
    use std::time::{Duration, SystemTime};

    use tracing_test::traced_test;

    use super::HostStoreFactory;
    use crate::{HostIdentifier, HostRecord, HostStore, LeaseKind, StoreError};

    fn record(duid: &[u8], subnet_id: u32) -> HostRecord {
        HostRecord {
            identifier: HostIdentifier::Duid(duid.to_vec()),
            subnet_id,
            kind: LeaseKind::Address,
            addr: Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 0x99),
            prefix_len: 0,
            preferred_lifetime: 1800,
            valid_lifetime: 3600,
            expires_at: SystemTime::now() + Duration::from_secs(3600),
        }
    }

    #[tokio::test]
    async fn unknown_type_fails_and_leaves_no_instance() {
        let mut factory = HostStoreFactory::new();
        let err = factory
            .create("type=unknown name=keatest host=localhost user=keatest password=keatest")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidType(ty) if ty == "unknown"));
        assert!(matches!(
            factory.instance().unwrap_err(),
            StoreError::NoHostStore
        ));
    }

    #[tokio::test]
    async fn missing_type_reports_invalid_parameter() {
        let mut factory = HostStoreFactory::new();
        let err = factory
            .create("name=keatest host=localhost user=invaliduser password=keatest")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidParameter(_)));
    }

    #[tokio::test]
    async fn missing_name_reports_no_database_name() {
        let mut factory = HostStoreFactory::new();
        let err = factory
            .create("type=memory host=localhost user=keatest password=keatest")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NoDatabaseName));
    }

    #[tokio::test]
    async fn unreachable_sqlite_target_reports_db_open() {
        let mut factory = HostStoreFactory::new();
        let err = factory
            .create("type=sqlite name=/nonexistent-keatest-dir/hosts.db")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DbOpen(_)));
    }

    #[tokio::test]
    async fn failed_create_leaves_previous_backend_untouched() {
        let mut factory = HostStoreFactory::new();
        factory
            .create("type=memory name=keatest")
            .await
            .expect("first create");
        factory
            .instance()
            .expect("instance")
            .add_host(record(&[1], 1))
            .await
            .expect("seed record");

        let err = factory.create("type=unknown name=keatest").await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidType(_)));

        // still the original store, record intact
        let found = factory
            .instance()
            .expect("instance survives failed create")
            .get_host(&HostIdentifier::Duid(vec![1]))
            .await
            .expect("get");
        assert!(found.is_some());
    }

    #[traced_test]
    #[tokio::test]
    async fn second_create_replaces_the_first() {
        let mut factory = HostStoreFactory::new();
        factory
            .create("type=memory name=keatest")
            .await
            .expect("first create");
        factory
            .instance()
            .expect("instance")
            .add_host(record(&[2], 1))
            .await
            .expect("seed record");

        factory
            .create("type=memory name=keatest")
            .await
            .expect("second create");

        // exactly one live backend, and it is the fresh one
        let found = factory
            .instance()
            .expect("instance")
            .get_host(&HostIdentifier::Duid(vec![2]))
            .await
            .expect("get");
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn destroy_is_idempotent() {
        let mut factory = HostStoreFactory::new();
        factory.destroy().await;

        factory
            .create("type=memory name=keatest")
            .await
            .expect("create");
        factory.destroy().await;
        factory.destroy().await;
        assert!(matches!(
            factory.instance().unwrap_err(),
            StoreError::NoHostStore
        ));
    }

    #[tokio::test]
    async fn sqlite_file_commit_survives_reopen() {
        let path = std::env::temp_dir().join(format!(
            "host-store-factory-{}-{}.db",
            std::process::id(),
            line!()
        ));
        let _ = std::fs::remove_file(&path);
        let descriptor = format!("type=sqlite name={}", path.display());

        let mut factory = HostStoreFactory::new();
        factory.create(&descriptor).await.expect("create");
        let store = factory.instance().expect("instance");
        store.add_host(record(&[3], 1)).await.expect("add");
        store.commit().await.expect("commit");
        factory.destroy().await;

        // reopening the same descriptor sees committed data and proves
        // the first instance released the file
        factory.create(&descriptor).await.expect("reopen");
        let found = factory
            .instance()
            .expect("instance")
            .get_host(&HostIdentifier::Duid(vec![3]))
            .await
            .expect("get");
        assert!(found.is_some());

        factory.destroy().await;
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn destroy_discards_uncommitted_work() {
        let path = std::env::temp_dir().join(format!(
            "host-store-factory-{}-{}.db",
            std::process::id(),
            line!()
        ));
        let _ = std::fs::remove_file(&path);
        let descriptor = format!("type=sqlite name={}", path.display());

        let mut factory = HostStoreFactory::new();
        factory.create(&descriptor).await.expect("create");
        factory
            .instance()
            .expect("instance")
            .add_host(record(&[4], 1))
            .await
            .expect("add without commit");
        factory.destroy().await;

        factory.create(&descriptor).await.expect("reopen");
        let found = factory
            .instance()
            .expect("instance")
            .get_host(&HostIdentifier::Duid(vec![4]))
            .await
            .expect("get");
        assert!(found.is_none());

        factory.destroy().await;
        let _ = std::fs::remove_file(&path);
    }
}
