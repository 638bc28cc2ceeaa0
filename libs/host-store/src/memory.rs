//! In-memory backend, mostly used by tests and single-process setups.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::debug;

use crate::{HostIdentifier, HostRecord, HostStore, StoreError};

type Key = (HostIdentifier, u32);

/// Host store backed by two maps: the committed view and a staged
/// working copy that all mutations and reads operate on. `commit`
/// promotes the staged copy, `rollback` re-clones the committed one.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Maps>>,
}

#[derive(Debug, Default)]
struct Maps {
    committed: BTreeMap<Key, HostRecord>,
    staged: BTreeMap<Key, HostRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HostStore for MemoryStore {
    async fn add_host(&self, record: HostRecord) -> Result<(), StoreError> {
        let mut guard = self.inner.lock().expect("memory store lock poisoned");
        let key = (record.identifier.clone(), record.subnet_id);
        if guard.staged.contains_key(&key) {
            return Err(StoreError::DuplicateEntry {
                subnet_id: record.subnet_id,
            });
        }
        debug!(subnet_id = record.subnet_id, "staging host record");
        guard.staged.insert(key, record);
        Ok(())
    }

    async fn get_host(&self, id: &HostIdentifier) -> Result<Option<HostRecord>, StoreError> {
        let guard = self.inner.lock().expect("memory store lock poisoned");
        Ok(guard
            .staged
            .iter()
            .find_map(|((owner, _), record)| (owner == id).then(|| record.clone())))
    }

    async fn delete_host(&self, id: &HostIdentifier) -> Result<bool, StoreError> {
        let mut guard = self.inner.lock().expect("memory store lock poisoned");
        let before = guard.staged.len();
        guard.staged.retain(|(owner, _), _| owner != id);
        Ok(guard.staged.len() != before)
    }

    async fn commit(&self) -> Result<(), StoreError> {
        let mut guard = self.inner.lock().expect("memory store lock poisoned");
        guard.committed = guard.staged.clone();
        Ok(())
    }

    async fn rollback(&self) -> Result<(), StoreError> {
        let mut guard = self.inner.lock().expect("memory store lock poisoned");
        guard.staged = guard.committed.clone();
        Ok(())
    }

    async fn close(&self) {}

    fn store_type(&self) -> &'static str {
        "memory"
    }
}
