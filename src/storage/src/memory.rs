use std::collections::BTreeMap;
use std::sync::RwLock;

use bytes::Bytes;

use crate::batch::{BatchOp, WriteBatch};
use crate::error::StorageResult;
use crate::KvStore;

/// MemoryStore keeps every key in one ordered map. A batch is applied under a
/// single write lock, so readers never observe part of it.
#[derive(Default)]
pub struct MemoryStore {
    store: RwLock<BTreeMap<String, Bytes>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            store: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        let inner = self.store.read().unwrap_or_else(|e| e.into_inner());
        inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> StorageResult<Option<Bytes>> {
        let inner = self.store.read().unwrap_or_else(|e| e.into_inner());
        Ok(inner.get(key).cloned())
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let inner = self.store.read().unwrap_or_else(|e| e.into_inner());
        let keys = inner
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        Ok(keys)
    }

    async fn commit(&self, batch: WriteBatch) -> StorageResult<()> {
        let mut inner = self.store.write().unwrap_or_else(|e| e.into_inner());
        for op in batch.into_ops() {
            match op {
                BatchOp::Put { key, value } => {
                    inner.insert(key, value);
                }
                BatchOp::Delete { key } => {
                    inner.remove(&key);
                }
            }
        }
        Ok(())
    }
}
