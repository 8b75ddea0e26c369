#[macro_use]
extern crate async_trait;

use bytes::Bytes;

pub mod batch;
pub mod error;
pub mod journal;
pub mod memory;
pub mod object;

pub use batch::{BatchOp, WriteBatch};
pub use error::{StorageError, StorageResult};
pub use memory::MemoryStore;
pub use object::ObjectStore;

pub use opendal;

/// KvStore is the persistence boundary of the engine.
///
/// Single reads and writes are atomic per key. A [`WriteBatch`] handed to
/// `commit` is applied all-or-nothing: a reader observes either none of the
/// batch or all of it, and a crash never leaves part of a batch behind.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// get returns the value stored under key, or None.
    async fn get(&self, key: &str) -> StorageResult<Option<Bytes>>;

    /// list returns the sorted keys that start with prefix.
    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>>;

    /// commit applies every operation of the batch atomically.
    async fn commit(&self, batch: WriteBatch) -> StorageResult<()>;
}
