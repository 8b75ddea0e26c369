use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::Bytes;
use futures::TryStreamExt;
use opendal::layers::TracingLayer;
use opendal::{services, ErrorKind, Operator};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::batch::{BatchOp, WriteBatch};
use crate::error::{StorageError, StorageResult};
use crate::journal::{decode_batch, encode_batch};
use crate::KvStore;

const DATA_DIR: &str = "data/";
const JOURNAL_DIR: &str = "journal/";

/// ObjectStore persists keys as objects through opendal.
///
/// Every batch is first written as one checksummed journal object, then
/// applied key by key, then the journal object is removed. On open, intact
/// journals left behind by a crash are replayed and torn ones are dropped, so
/// each batch ends up either fully applied or not applied at all.
///
/// Commits are serialized. When applying a journaled batch fails partway, the
/// journal is kept as pending and the store stalls: reads and commits first
/// roll the pending batch forward and fail while that is impossible. At most
/// one journal therefore exists at any time, and replay never lands on top of
/// data committed after it.
pub struct ObjectStore {
    op: Operator,
    journal_seq: AtomicU64,
    pending: Mutex<Option<String>>,
    stalled: AtomicBool,
}

impl ObjectStore {
    /// open opens (or creates) a store rooted at the local directory `root`.
    pub async fn open(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref();
        let root = root
            .to_str()
            .ok_or_else(|| StorageError::InvalidKey(root.display().to_string()))?;

        let mut builder = services::Fs::default();
        builder.root(root);
        let op = Operator::new(builder)?.layer(TracingLayer).finish();

        Self::with_operator(op).await
    }

    pub async fn with_operator(op: Operator) -> StorageResult<Self> {
        op.create_dir(DATA_DIR).await?;
        op.create_dir(JOURNAL_DIR).await?;

        let store = Self {
            op,
            journal_seq: AtomicU64::new(0),
            pending: Mutex::new(None),
            stalled: AtomicBool::new(false),
        };
        let next_seq = store.recover().await?;
        store.journal_seq.store(next_seq, Ordering::SeqCst);

        Ok(store)
    }

    /// recover replays intact journals in sequence order and returns the next
    /// free journal sequence number.
    async fn recover(&self) -> StorageResult<u64> {
        let mut journals = self.list_names(JOURNAL_DIR).await?;
        journals.sort();

        let mut next_seq = 0;
        for name in journals {
            let path = format!("{}{}", JOURNAL_DIR, name);
            if let Ok(seq) = name.parse::<u64>() {
                next_seq = next_seq.max(seq + 1);
            }

            let data = self.op.read(&path).await?;
            match decode_batch(&data) {
                Ok(batch) => {
                    info!("replaying journal {} ({} ops)", path, batch.len());
                    self.apply(&batch).await?;
                }
                Err(reason) => {
                    warn!("dropping torn journal {}: {}", path, reason);
                }
            }
            self.op.delete(&path).await?;
        }

        Ok(next_seq)
    }

    /// settle rolls a pending journal forward. The caller holds the commit lock.
    async fn settle(&self, pending: &mut Option<String>) -> StorageResult<()> {
        let journal = match pending.as_deref() {
            Some(journal) => journal,
            None => return Ok(()),
        };

        let data = match self.op.read(journal).await {
            Ok(data) => Some(data),
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        match data.as_deref().map(decode_batch) {
            Some(Ok(batch)) => {
                self.apply(&batch).await?;
                info!("rolled pending journal {} forward ({} ops)", journal, batch.len());
            }
            // never fully written, so nothing of it was applied
            Some(Err(reason)) => warn!("dropping torn journal {}: {}", journal, reason),
            None => {}
        }
        if data.is_some() {
            self.op.delete(journal).await?;
        }

        *pending = None;
        self.stalled.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn settle_if_stalled(&self) -> StorageResult<()> {
        if !self.stalled.load(Ordering::SeqCst) {
            return Ok(());
        }
        let mut pending = self.pending.lock().await;
        self.settle(&mut pending).await
    }

    async fn apply(&self, batch: &WriteBatch) -> StorageResult<()> {
        for op in batch.ops() {
            match op {
                BatchOp::Put { key, value } => {
                    self.op.write(&data_path(key), value.clone()).await?;
                }
                BatchOp::Delete { key } => {
                    self.op.delete(&data_path(key)).await?;
                }
            }
        }
        Ok(())
    }

    async fn list_names(&self, dir: &str) -> StorageResult<Vec<String>> {
        let mut names = Vec::new();
        let mut lister = self.op.list(dir).await?;
        while let Some(de) = lister.try_next().await? {
            let name = de.name();
            if name.is_empty() || name.ends_with('/') {
                continue;
            }
            names.push(name.to_string());
        }
        Ok(names)
    }
}

#[async_trait]
impl KvStore for ObjectStore {
    async fn get(&self, key: &str) -> StorageResult<Option<Bytes>> {
        self.settle_if_stalled().await?;
        match self.op.read(&data_path(key)).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        self.settle_if_stalled().await?;
        let mut keys = Vec::new();
        for name in self.list_names(DATA_DIR).await? {
            match decode_key(&name) {
                Some(key) if key.starts_with(prefix) => keys.push(key),
                Some(_) => {}
                None => warn!("skipping foreign object {}{}", DATA_DIR, name),
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn commit(&self, batch: WriteBatch) -> StorageResult<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut pending = self.pending.lock().await;
        self.settle(&mut pending).await?;

        let seq = self.journal_seq.fetch_add(1, Ordering::SeqCst);
        let journal = format!("{}{:020}", JOURNAL_DIR, seq);
        let record = encode_batch(&batch).map_err(|reason| StorageError::CorruptedJournal {
            key: journal.clone(),
            reason,
        })?;

        if let Err(e) = self.op.write(&journal, record).await {
            if let Err(cleanup) = self.op.delete(&journal).await {
                error!("journal {} may be torn, store stalled: {}", journal, cleanup);
                *pending = Some(journal);
                self.stalled.store(true, Ordering::SeqCst);
            }
            return Err(e.into());
        }
        let applied = match self.apply(&batch).await {
            Ok(()) => self.op.delete(&journal).await.map_err(StorageError::from),
            Err(e) => Err(e),
        };
        if let Err(e) = applied {
            error!("commit via {} stopped partway, store stalled: {}", journal, e);
            *pending = Some(journal);
            self.stalled.store(true, Ordering::SeqCst);
            return Err(e);
        }

        debug!("committed {} ops via {}", batch.len(), journal);
        Ok(())
    }
}

fn data_path(key: &str) -> String {
    format!("{}{}", DATA_DIR, encode_key(key))
}

/// encode_key flattens a key into one object name: bytes outside
/// `[A-Za-z0-9._-]` become `%XX`.
pub fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for b in key.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'.' | b'_' | b'-' => out.push(b as char),
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

pub fn decode_key(name: &str) -> Option<String> {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = name.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use crate::batch::WriteBatch;
    use crate::journal::encode_batch;
    use crate::object::{decode_key, encode_key, ObjectStore};
    use crate::KvStore;

    #[test]
    fn test_key_encoding() {
        let key = "chunk/well 1/wb%1/-0000000000000000042";
        let name = encode_key(key);
        assert!(!name.contains('/'));
        assert_eq!(decode_key(&name).as_deref(), Some(key));
        assert_eq!(decode_key("bad%G1"), None);
    }

    #[tokio::test]
    async fn test_commit_and_reopen() {
        let dir = tempfile::tempdir().unwrap();

        {
            let store = ObjectStore::open(dir.path()).await.unwrap();
            let mut batch = WriteBatch::new();
            batch.put("log/w1", Bytes::from_static(b"header"));
            batch.put("chunk/w1/0", Bytes::from_static(b"rows"));
            store.commit(batch).await.unwrap();

            let mut batch = WriteBatch::new();
            batch.delete("chunk/w1/0");
            store.commit(batch).await.unwrap();
        }

        let store = ObjectStore::open(dir.path()).await.unwrap();
        assert_eq!(
            store.get("log/w1").await.unwrap(),
            Some(Bytes::from_static(b"header"))
        );
        assert_eq!(store.get("chunk/w1/0").await.unwrap(), None);
        assert_eq!(store.list("log/").await.unwrap(), vec!["log/w1".to_string()]);
    }

    #[tokio::test]
    async fn test_replay_intact_journal() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("journal")).unwrap();

        // a crash after the journal landed but before any key was applied
        let mut batch = WriteBatch::new();
        batch.put("log/w2", Bytes::from_static(b"h"));
        batch.put("chunk/w2/0", Bytes::from_static(b"r"));
        let record = encode_batch(&batch).unwrap();
        std::fs::write(dir.path().join("journal").join(format!("{:020}", 7)), &record).unwrap();

        let store = ObjectStore::open(dir.path()).await.unwrap();
        assert_eq!(
            store.get("chunk/w2/0").await.unwrap(),
            Some(Bytes::from_static(b"r"))
        );
        assert_eq!(store.list("log/").await.unwrap(), vec!["log/w2".to_string()]);
        assert!(std::fs::read_dir(dir.path().join("journal"))
            .unwrap()
            .next()
            .is_none());
    }

    #[tokio::test]
    async fn test_failed_apply_rolls_forward() {
        let dir = tempfile::tempdir().unwrap();
        let store = ObjectStore::open(dir.path()).await.unwrap();

        // a directory squatting on the second key's object makes its write fail
        let blocker = dir.path().join("data").join(encode_key("log/b"));
        std::fs::create_dir_all(blocker.join("inner")).unwrap();

        let mut batch = WriteBatch::new();
        batch.put("chunk/a", Bytes::from_static(b"v1"));
        batch.put("log/b", Bytes::from_static(b"h"));
        assert!(store.commit(batch).await.is_err());

        // the half applied batch is not readable and nothing else commits
        assert!(store.get("chunk/a").await.is_err());
        let mut batch = WriteBatch::new();
        batch.put("chunk/a", Bytes::from_static(b"v2"));
        assert!(store.commit(batch).await.is_err());

        std::fs::remove_dir_all(&blocker).unwrap();
        assert_eq!(
            store.get("log/b").await.unwrap(),
            Some(Bytes::from_static(b"h"))
        );
        assert_eq!(
            store.get("chunk/a").await.unwrap(),
            Some(Bytes::from_static(b"v1"))
        );

        let mut batch = WriteBatch::new();
        batch.put("chunk/a", Bytes::from_static(b"v2"));
        store.commit(batch).await.unwrap();
        drop(store);

        let store = ObjectStore::open(dir.path()).await.unwrap();
        assert_eq!(
            store.get("chunk/a").await.unwrap(),
            Some(Bytes::from_static(b"v2"))
        );
        assert!(std::fs::read_dir(dir.path().join("journal"))
            .unwrap()
            .next()
            .is_none());
    }

    #[tokio::test]
    async fn test_drop_torn_journal() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("journal")).unwrap();

        let mut batch = WriteBatch::new();
        batch.put("log/w3", Bytes::from_static(b"h"));
        let record = encode_batch(&batch).unwrap();
        let torn = &record[..record.len() - 3];
        std::fs::write(dir.path().join("journal").join(format!("{:020}", 0)), torn).unwrap();

        let store = ObjectStore::open(dir.path()).await.unwrap();
        assert_eq!(store.get("log/w3").await.unwrap(), None);
        assert!(store.list("").await.unwrap().is_empty());
    }
}
