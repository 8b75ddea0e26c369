use std::collections::BTreeMap;
use std::sync::Arc;

use wellstore_storage::{KvStore, WriteBatch};

use crate::channel::LogId;
use crate::chunk::codec::{decode_chunk, encode_chunk};
use crate::chunk::{ChannelDataChunk, ChunkSummary};
use crate::error::{Error, Result};
use crate::partition::ChunkRange;

pub(crate) const CHUNK_KEY_PREFIX: &str = "chunk/";

/// chunk_key orders chunks of one log by start: the sign bit is flipped so
/// negative starts sort first as text.
pub(crate) fn chunk_key(log: &LogId, start: i64) -> String {
    let ordered = (start as u64) ^ (1 << 63);
    format!("{}{}/{:020}", CHUNK_KEY_PREFIX, log, ordered)
}

/// ChunkStore reads chunks and stages chunk writes into a [`WriteBatch`].
///
/// Nothing here commits: the caller gathers every chunk change of one
/// request, together with the metadata change, into a single batch.
#[derive(Clone)]
pub struct ChunkStore {
    store: Arc<dyn KvStore>,
}

impl ChunkStore {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    /// load returns the chunk stored for `range`, projected onto `columns`,
    /// or an empty chunk if nothing is stored there yet.
    pub async fn load(
        &self,
        log: &LogId,
        range: ChunkRange,
        columns: &[String],
    ) -> Result<ChannelDataChunk> {
        let key = chunk_key(log, range.start);
        let mut chunk = match self.store.get(&key).await? {
            Some(data) => decode_chunk(&data).map_err(|reason| Error::corrupted(&key, reason))?,
            None => return Ok(ChannelDataChunk::empty(range, columns.to_vec())),
        };

        if chunk.range != range {
            return Err(Error::corrupted(
                key,
                format!("stored range {:?} differs from directory {:?}", chunk.range, range),
            ));
        }

        chunk.project(columns);
        Ok(chunk)
    }

    /// save stages the chunk; a chunk without rows is removed instead.
    pub fn save(&self, batch: &mut WriteBatch, log: &LogId, chunk: &ChannelDataChunk) {
        let key = chunk_key(log, chunk.range.start);
        if chunk.is_empty() {
            batch.delete(key);
        } else {
            batch.put(key, encode_chunk(chunk));
        }
    }

    /// delete_chunks_in_range stages the removal of every row in [min, max].
    /// Chunks that lie entirely inside the range are dropped without being
    /// read. Returns the resulting chunks, empty ones included.
    pub async fn delete_chunks_in_range(
        &self,
        batch: &mut WriteBatch,
        log: &LogId,
        directory: &BTreeMap<i64, ChunkSummary>,
        columns: &[String],
        min: i64,
        max: i64,
    ) -> Result<Vec<ChannelDataChunk>> {
        let mut changed = Vec::new();
        for (&start, summary) in directory {
            let range = ChunkRange::new(start, summary.end);
            if summary.max_index < min || summary.min_index > max {
                continue;
            }

            if range.within(min, max) {
                let chunk = ChannelDataChunk::empty(range, columns.to_vec());
                self.save(batch, log, &chunk);
                changed.push(chunk);
                continue;
            }

            let mut chunk = self.load(log, range, columns).await?;
            if chunk.delete_rows(min, max) > 0 {
                self.save(batch, log, &chunk);
                changed.push(chunk);
            }
        }
        Ok(changed)
    }

    /// delete_column stages the removal of one channel from every chunk.
    pub async fn delete_column(
        &self,
        batch: &mut WriteBatch,
        log: &LogId,
        directory: &BTreeMap<i64, ChunkSummary>,
        columns: &[String],
        mnemonic: &str,
    ) -> Result<Vec<ChannelDataChunk>> {
        let mut changed = Vec::new();
        for (&start, summary) in directory {
            if !summary.channels.contains_key(mnemonic) {
                continue;
            }

            let range = ChunkRange::new(start, summary.end);
            let mut chunk = self.load(log, range, columns).await?;
            chunk.delete_column(mnemonic);
            self.save(batch, log, &chunk);
            changed.push(chunk);
        }
        Ok(changed)
    }

    /// clear_column_in_range stages nulling one channel over [min, max].
    pub async fn clear_column_in_range(
        &self,
        batch: &mut WriteBatch,
        log: &LogId,
        directory: &BTreeMap<i64, ChunkSummary>,
        columns: &[String],
        mnemonic: &str,
        min: i64,
        max: i64,
    ) -> Result<Vec<ChannelDataChunk>> {
        let mut changed = Vec::new();
        for (&start, summary) in directory {
            match summary.channels.get(mnemonic) {
                Some(&(lo, hi)) if lo <= max && hi >= min => {}
                _ => continue,
            }

            let range = ChunkRange::new(start, summary.end);
            let mut chunk = self.load(log, range, columns).await?;
            let pos = match chunk.column_position(mnemonic) {
                Some(pos) => pos,
                None => continue,
            };
            if chunk.clear_column(pos, min, max) > 0 {
                self.save(batch, log, &chunk);
                changed.push(chunk);
            }
        }
        Ok(changed)
    }
}
