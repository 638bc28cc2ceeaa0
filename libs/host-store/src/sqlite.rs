//! SQLite backend.
//!
//! All operations run inside a single long-lived transaction that is
//! begun lazily on the first call and consumed by `commit`/`rollback`,
//! so a reader on another connection only ever observes fully committed
//! records.

use std::str::FromStr;

use async_trait::async_trait;
use sqlx::{
    ConnectOptions, Row, Sqlite, Transaction,
    sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow},
};
use tokio::sync::Mutex;
use tracing::debug;

use crate::{HostIdentifier, HostRecord, HostStore, StoreError, systime_epoch, to_systime};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS hosts (
    id_kind            INTEGER NOT NULL,
    identifier         BLOB    NOT NULL,
    subnet_id          INTEGER NOT NULL,
    lease_kind         INTEGER NOT NULL,
    addr               BLOB    NOT NULL,
    prefix_len         INTEGER NOT NULL,
    preferred_lifetime INTEGER NOT NULL,
    valid_lifetime     INTEGER NOT NULL,
    expires_at         INTEGER NOT NULL,
    PRIMARY KEY (id_kind, identifier, subnet_id)
)
"#;

#[derive(Debug)]
pub struct SqliteStore {
    pool: SqlitePool,
    txn: Mutex<Option<Transaction<'static, Sqlite>>>,
}

impl SqliteStore {
    /// Opens (creating if missing) the database given by the
    /// descriptor's `name` and ensures the hosts table exists.
    pub async fn open(name: &str) -> Result<Self, StoreError> {
        let mut opts = SqliteConnectOptions::from_str(name)
            .map_err(|err| StoreError::DbOpen(err.to_string()))?
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .create_if_missing(true);
        // make sqlite log queries at trace level so we don't get a bloated log on `info`
        opts.log_statements(tracing::log::LevelFilter::Trace);

        // an in-memory sqlite db lives and dies with its connection, so
        // pin a single connection that the pool never recycles
        let pool = if name.contains("memory") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(opts)
                .await
        } else {
            SqlitePool::connect_with(opts).await
        }
        .map_err(|err| StoreError::DbOpen(err.to_string()))?;

        sqlx::query(SCHEMA)
            .execute(&pool)
            .await
            .map_err(|err| StoreError::DbOpen(err.to_string()))?;

        Ok(Self {
            pool,
            txn: Mutex::new(None),
        })
    }

    async fn ensure_txn<'g>(
        &self,
        guard: &'g mut Option<Transaction<'static, Sqlite>>,
    ) -> Result<&'g mut Transaction<'static, Sqlite>, StoreError> {
        if guard.is_none() {
            *guard = Some(self.pool.begin().await?);
        }
        Ok(guard.as_mut().expect("transaction installed above"))
    }
}

#[async_trait]
impl HostStore for SqliteStore {
    async fn add_host(&self, record: HostRecord) -> Result<(), StoreError> {
        let mut guard = self.txn.lock().await;
        let tx = self.ensure_txn(&mut guard).await?;

        let result = sqlx::query(
            r#"INSERT INTO hosts
                (id_kind, identifier, subnet_id, lease_kind, addr,
                 prefix_len, preferred_lifetime, valid_lifetime, expires_at)
            VALUES
                (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"#,
        )
        .bind(i64::from(record.identifier.kind_tag()))
        .bind(record.identifier.bytes().to_vec())
        .bind(i64::from(record.subnet_id))
        .bind(lease_kind_tag(record.kind))
        .bind(record.addr.octets().to_vec())
        .bind(i64::from(record.prefix_len))
        .bind(i64::from(record.preferred_lifetime))
        .bind(i64::from(record.valid_lifetime))
        .bind(systime_epoch(record.expires_at))
        .execute(&mut **tx)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(err) if is_unique_violation(&err) => Err(StoreError::DuplicateEntry {
                subnet_id: record.subnet_id,
            }),
            Err(err) => Err(err.into()),
        }
    }

    async fn get_host(&self, id: &HostIdentifier) -> Result<Option<HostRecord>, StoreError> {
        let mut guard = self.txn.lock().await;
        let tx = self.ensure_txn(&mut guard).await?;

        sqlx::query(
            r#"SELECT id_kind, identifier, subnet_id, lease_kind, addr,
                      prefix_len, preferred_lifetime, valid_lifetime, expires_at
            FROM hosts
            WHERE id_kind = ?1 AND identifier = ?2
            ORDER BY subnet_id
            LIMIT 1"#,
        )
        .bind(i64::from(id.kind_tag()))
        .bind(id.bytes().to_vec())
        .fetch_optional(&mut **tx)
        .await?
        .map(row_to_record)
        .transpose()
    }

    async fn delete_host(&self, id: &HostIdentifier) -> Result<bool, StoreError> {
        let mut guard = self.txn.lock().await;
        let tx = self.ensure_txn(&mut guard).await?;

        let done = sqlx::query("DELETE FROM hosts WHERE id_kind = ?1 AND identifier = ?2")
            .bind(i64::from(id.kind_tag()))
            .bind(id.bytes().to_vec())
            .execute(&mut **tx)
            .await?;
        Ok(done.rows_affected() > 0)
    }

    async fn commit(&self) -> Result<(), StoreError> {
        let mut guard = self.txn.lock().await;
        if let Some(tx) = guard.take() {
            tx.commit().await?;
        }
        Ok(())
    }

    async fn rollback(&self) -> Result<(), StoreError> {
        let mut guard = self.txn.lock().await;
        if let Some(tx) = guard.take() {
            tx.rollback().await?;
        }
        Ok(())
    }

    async fn close(&self) {
        // pending work is rolled back, never auto-committed
        let mut guard = self.txn.lock().await;
        if let Some(tx) = guard.take() {
            if let Err(err) = tx.rollback().await {
                debug!(%err, "rollback on close failed");
            }
        }
        drop(guard);
        self.pool.close().await;
    }

    fn store_type(&self) -> &'static str {
        "sqlite"
    }
}

fn lease_kind_tag(kind: crate::LeaseKind) -> i64 {
    match kind {
        crate::LeaseKind::Address => 0,
        crate::LeaseKind::Prefix => 1,
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.message().contains("UNIQUE constraint failed"))
}

fn row_to_record(row: SqliteRow) -> Result<HostRecord, StoreError> {
    let identifier = match row.try_get::<i64, _>("id_kind")? {
        0 => HostIdentifier::Duid(row.try_get::<Vec<u8>, _>("identifier")?),
        1 => HostIdentifier::HwAddr(row.try_get::<Vec<u8>, _>("identifier")?),
        other => return Err(StoreError::BadRow(format!("identifier kind {other}"))),
    };
    let kind = match row.try_get::<i64, _>("lease_kind")? {
        0 => crate::LeaseKind::Address,
        1 => crate::LeaseKind::Prefix,
        other => return Err(StoreError::BadRow(format!("lease kind {other}"))),
    };
    let addr_bytes = row.try_get::<Vec<u8>, _>("addr")?;
    let octets: [u8; 16] = addr_bytes
        .as_slice()
        .try_into()
        .map_err(|_| StoreError::BadRow(format!("address blob of {} bytes", addr_bytes.len())))?;

    Ok(HostRecord {
        identifier,
        subnet_id: row.try_get::<i64, _>("subnet_id")? as u32,
        kind,
        addr: octets.into(),
        prefix_len: row.try_get::<i64, _>("prefix_len")? as u8,
        preferred_lifetime: row.try_get::<i64, _>("preferred_lifetime")? as u32,
        valid_lifetime: row.try_get::<i64, _>("valid_lifetime")? as u32,
        expires_at: to_systime(row.try_get::<i64, _>("expires_at")?),
    })
}
