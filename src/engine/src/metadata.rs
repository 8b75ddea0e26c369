use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use wellstore_storage::{KvStore, WriteBatch};

use crate::channel::{ChannelDefinition, DataType, LogHeader, LogId};
use crate::chunk::{ChannelDataChunk, ChunkSummary};
use crate::error::{Error, Result};
use crate::index::{format_key, Direction, IndexType, IndexValue};
use crate::partition::ChunkRange;

const LOG_KEY_PREFIX: &str = "log/";
const GROWING_KEY_PREFIX: &str = "growing/";

pub(crate) fn log_key(id: &LogId) -> String {
    format!("{}{}", LOG_KEY_PREFIX, id)
}

pub(crate) fn growing_key(id: &LogId) -> String {
    format!("{}{}", GROWING_KEY_PREFIX, id)
}

/// ChannelMetadata is the persisted description of one channel. The range
/// covers only rows where the channel holds a value and is unset while the
/// channel has none.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelMetadata {
    pub mnemonic: String,
    pub unit: String,
    pub data_type: DataType,
    #[serde(default)]
    pub description: Option<String>,
    pub min_index: Option<i64>,
    pub max_index: Option<i64>,
}

impl ChannelMetadata {
    pub fn from_definition(def: &ChannelDefinition) -> Self {
        Self {
            mnemonic: def.mnemonic.clone(),
            unit: def.unit.clone(),
            data_type: def.data_type,
            description: def.description.clone(),
            min_index: None,
            max_index: None,
        }
    }

    pub fn definition(&self) -> ChannelDefinition {
        ChannelDefinition {
            mnemonic: self.mnemonic.clone(),
            unit: self.unit.clone(),
            data_type: self.data_type,
            description: self.description.clone(),
        }
    }
}

/// LogMetadata is the persisted state of a log apart from its rows.
///
/// `channels[0]` is the index channel. `chunks` maps each stored chunk's
/// start key to its summary; it is the only place chunk extents are known.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogMetadata {
    pub id: LogId,
    pub name: String,
    pub index_type: IndexType,
    pub direction: Direction,
    pub delimiter: char,
    pub null_value: String,
    pub depth_scale: u32,
    pub channels: Vec<ChannelMetadata>,
    pub min_index: Option<i64>,
    pub max_index: Option<i64>,
    pub chunks: BTreeMap<i64, ChunkSummary>,
    pub version: u64,
    pub created_micros: i64,
    pub updated_micros: i64,
}

impl LogMetadata {
    pub fn from_header(header: &LogHeader, depth_scale: u32, now_micros: i64) -> Self {
        Self {
            id: header.id.clone(),
            name: header.name.clone(),
            index_type: header.index_type,
            direction: header.direction,
            delimiter: header.delimiter,
            null_value: header.null_value.clone(),
            depth_scale,
            channels: header
                .channels
                .iter()
                .map(ChannelMetadata::from_definition)
                .collect(),
            min_index: None,
            max_index: None,
            chunks: BTreeMap::new(),
            version: 0,
            created_micros: now_micros,
            updated_micros: now_micros,
        }
    }

    pub fn header(&self) -> LogHeader {
        LogHeader {
            id: self.id.clone(),
            name: self.name.clone(),
            index_type: self.index_type,
            direction: self.direction,
            delimiter: self.delimiter,
            null_value: self.null_value.clone(),
            channels: self.channels.iter().map(|c| c.definition()).collect(),
        }
    }

    pub fn index_mnemonic(&self) -> &str {
        self.channels
            .first()
            .map(|c| c.mnemonic.as_str())
            .unwrap_or_default()
    }

    /// data_columns lists the non-index mnemonics in column order.
    pub fn data_columns(&self) -> Vec<String> {
        self.channels
            .iter()
            .skip(1)
            .map(|c| c.mnemonic.clone())
            .collect()
    }

    pub fn channel(&self, mnemonic: &str) -> Option<&ChannelMetadata> {
        self.channels.iter().find(|c| c.mnemonic == mnemonic)
    }

    pub fn channel_position(&self, mnemonic: &str) -> Option<usize> {
        self.channels.iter().position(|c| c.mnemonic == mnemonic)
    }

    pub fn has_data(&self) -> bool {
        !self.chunks.is_empty()
    }

    pub fn chunk_range(&self, start: i64) -> Option<ChunkRange> {
        self.chunks.get(&start).map(|s| ChunkRange::new(start, s.end))
    }

    /// apply_chunk records the new state of one chunk in the directory.
    pub fn apply_chunk(&mut self, chunk: &ChannelDataChunk) {
        match chunk.summary() {
            Some(summary) => {
                self.chunks.insert(chunk.range.start, summary);
            }
            None => {
                self.chunks.remove(&chunk.range.start);
            }
        }
    }

    /// recompute_ranges rebuilds every channel range and the log range from
    /// the chunk directory. The log range spans the channel ranges; the index
    /// channel carries the log range.
    pub fn recompute_ranges(&mut self) {
        let mut ranges: BTreeMap<&str, (i64, i64)> = BTreeMap::new();
        for summary in self.chunks.values() {
            for (mnemonic, &(lo, hi)) in &summary.channels {
                ranges
                    .entry(mnemonic.as_str())
                    .and_modify(|r| *r = (r.0.min(lo), r.1.max(hi)))
                    .or_insert((lo, hi));
            }
        }

        let mut log_range: Option<(i64, i64)> = None;
        let mut updated = Vec::with_capacity(self.channels.len());
        for channel in self.channels.iter().skip(1) {
            let range = ranges.get(channel.mnemonic.as_str()).copied();
            if let Some((lo, hi)) = range {
                log_range = Some(match log_range {
                    Some((a, b)) => (a.min(lo), b.max(hi)),
                    None => (lo, hi),
                });
            }
            updated.push(range);
        }

        for (channel, range) in self.channels.iter_mut().skip(1).zip(updated) {
            channel.min_index = range.map(|r| r.0);
            channel.max_index = range.map(|r| r.1);
        }
        self.min_index = log_range.map(|r| r.0);
        self.max_index = log_range.map(|r| r.1);
        if let Some(index) = self.channels.first_mut() {
            index.min_index = self.min_index;
            index.max_index = self.max_index;
        }
    }

    /// end_key is the log end in travel order: the max of an increasing log,
    /// the min of a decreasing one.
    pub fn end_key(&self) -> Option<i64> {
        match self.direction {
            Direction::Increasing => self.max_index,
            Direction::Decreasing => self.min_index,
        }
    }

    pub fn start(&self) -> Option<IndexValue> {
        let (start, _) = self.direction.orient(self.min_index, self.max_index);
        start.map(|k| IndexValue::from_key(self.index_type, k))
    }

    pub fn end(&self) -> Option<IndexValue> {
        let (_, end) = self.direction.orient(self.min_index, self.max_index);
        end.map(|k| IndexValue::from_key(self.index_type, k))
    }

    pub fn format_key(&self, key: i64) -> String {
        format_key(self.index_type, key, self.depth_scale)
    }
}

/// GrowingRecord tracks whether a log is being appended to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrowingRecord {
    pub is_growing: bool,
    pub last_append_micros: i64,
}

/// MetadataStore reads and stages log metadata and growing records.
///
/// Decoded metadata is cached. The cache is only refreshed through
/// [`MetadataStore::publish`] once a batch has committed; a failed commit
/// evicts the entry instead.
pub struct MetadataStore {
    store: Arc<dyn KvStore>,
    cache: DashMap<LogId, Arc<LogMetadata>>,
}

impl MetadataStore {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            store,
            cache: DashMap::new(),
        }
    }

    pub async fn get(&self, id: &LogId) -> Result<Option<Arc<LogMetadata>>> {
        if let Some(meta) = self.cache.get(id) {
            return Ok(Some(meta.value().clone()));
        }

        let key = log_key(id);
        let data = match self.store.get(&key).await? {
            Some(data) => data,
            None => return Ok(None),
        };
        let meta: LogMetadata =
            serde_json::from_slice(&data).map_err(|e| Error::corrupted(&key, e))?;

        let meta = Arc::new(meta);
        self.cache.insert(id.clone(), meta.clone());
        Ok(Some(meta))
    }

    pub async fn require(&self, id: &LogId) -> Result<Arc<LogMetadata>> {
        self.get(id)
            .await?
            .ok_or_else(|| Error::ObjectNotFound(id.to_string()))
    }

    pub fn stage_put(&self, batch: &mut WriteBatch, meta: &LogMetadata) -> Result<()> {
        let key = log_key(&meta.id);
        let data = serde_json::to_vec(meta).map_err(|e| Error::corrupted(&key, e))?;
        batch.put(key, data);
        Ok(())
    }

    pub fn stage_delete(&self, batch: &mut WriteBatch, id: &LogId) {
        batch.delete(log_key(id));
        batch.delete(growing_key(id));
    }

    /// publish makes committed metadata visible to readers.
    pub fn publish(&self, meta: LogMetadata) {
        self.cache.insert(meta.id.clone(), Arc::new(meta));
    }

    pub fn evict(&self, id: &LogId) {
        self.cache.remove(id);
    }

    pub async fn list_logs(&self) -> Result<Vec<LogId>> {
        let keys = self.store.list(LOG_KEY_PREFIX).await?;
        Ok(keys
            .iter()
            .filter_map(|k| k.strip_prefix(LOG_KEY_PREFIX))
            .filter_map(LogId::parse)
            .collect())
    }

    pub async fn get_growing(&self, id: &LogId) -> Result<Option<GrowingRecord>> {
        let key = growing_key(id);
        match self.store.get(&key).await? {
            Some(data) => {
                let record = serde_json::from_slice(&data).map_err(|e| Error::corrupted(&key, e))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    pub fn stage_growing(&self, batch: &mut WriteBatch, id: &LogId, record: &GrowingRecord) -> Result<()> {
        let key = growing_key(id);
        let data = serde_json::to_vec(record).map_err(|e| Error::corrupted(&key, e))?;
        batch.put(key, data);
        Ok(())
    }

    /// list_growing returns every stored growing record, growing or not.
    pub async fn list_growing(&self) -> Result<Vec<(LogId, GrowingRecord)>> {
        let keys = self.store.list(GROWING_KEY_PREFIX).await?;
        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            let id = match key.strip_prefix(GROWING_KEY_PREFIX).and_then(LogId::parse) {
                Some(id) => id,
                None => continue,
            };
            // the log may be removed between list and get
            if let Some(record) = self.get_growing(&id).await? {
                records.push((id, record));
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use wellstore_storage::{KvStore, MemoryStore, WriteBatch};

    use crate::channel::{ChannelDefinition, ChannelValue, DataType, LogHeader, LogId};
    use crate::chunk::{ChannelDataChunk, Row};
    use crate::index::{Direction, IndexType};
    use crate::metadata::{GrowingRecord, LogMetadata, MetadataStore};
    use crate::partition::ChunkRange;

    fn header(direction: Direction) -> LogHeader {
        LogHeader::new(LogId::new("w", "wb", "log"), IndexType::Depth, direction)
            .with_channel(ChannelDefinition::new("DEPTH", "m", DataType::Double))
            .with_channel(ChannelDefinition::new("A", "api", DataType::Double))
            .with_channel(ChannelDefinition::new("B", "api", DataType::Double))
            .with_channel(ChannelDefinition::new("C", "api", DataType::Double))
    }

    fn chunk(start: i64, rows: Vec<(i64, [Option<f64>; 3])>) -> ChannelDataChunk {
        let columns = vec!["A".to_string(), "B".to_string(), "C".to_string()];
        let mut chunk = ChannelDataChunk::empty(ChunkRange::new(start, start + 100), columns);
        chunk.rows = rows
            .into_iter()
            .map(|(i, v)| Row::new(i, v.iter().map(|x| x.map(ChannelValue::Double)).collect()))
            .collect();
        chunk
    }

    #[test]
    fn test_recompute_ranges_from_directory() {
        let mut meta = LogMetadata::from_header(&header(Direction::Increasing), 3, 0);
        meta.apply_chunk(&chunk(0, vec![(13, [Some(1.0), None, None]), (15, [Some(1.0), Some(2.0), None])]));
        meta.apply_chunk(&chunk(100, vec![(120, [None, Some(2.0), None])]));
        meta.recompute_ranges();

        assert_eq!(meta.channel("A").unwrap().min_index, Some(13));
        assert_eq!(meta.channel("A").unwrap().max_index, Some(15));
        assert_eq!(meta.channel("B").unwrap().min_index, Some(15));
        assert_eq!(meta.channel("B").unwrap().max_index, Some(120));
        assert_eq!(meta.channel("C").unwrap().min_index, None);
        assert_eq!((meta.min_index, meta.max_index), (Some(13), Some(120)));
        assert_eq!(meta.channels[0].max_index, Some(120));

        // emptied chunk drops out of the directory
        meta.apply_chunk(&chunk(100, vec![]));
        meta.recompute_ranges();
        assert_eq!(meta.channel("B").unwrap().max_index, Some(15));
        assert_eq!(meta.chunks.len(), 1);
    }

    #[test]
    fn test_start_end_follow_direction() {
        let mut meta = LogMetadata::from_header(&header(Direction::Decreasing), 3, 0);
        meta.min_index = Some(1000);
        meta.max_index = Some(5000);
        assert_eq!(meta.start().unwrap().key(), 5000);
        assert_eq!(meta.end().unwrap().key(), 1000);
        assert_eq!(meta.end_key(), Some(1000));
    }

    #[tokio::test]
    async fn test_store_cache_and_listing() {
        let kv = Arc::new(MemoryStore::new());
        let store = MetadataStore::new(kv.clone());
        let meta = LogMetadata::from_header(&header(Direction::Increasing), 3, 0);

        let mut batch = WriteBatch::new();
        store.stage_put(&mut batch, &meta).unwrap();
        store
            .stage_growing(
                &mut batch,
                &meta.id,
                &GrowingRecord {
                    is_growing: false,
                    last_append_micros: 0,
                },
            )
            .unwrap();
        kv.commit(batch).await.unwrap();

        // a fresh store decodes from the kv store
        let other = MetadataStore::new(kv.clone());
        assert_eq!(*other.get(&meta.id).await.unwrap().unwrap(), meta);
        assert_eq!(other.list_logs().await.unwrap(), vec![meta.id.clone()]);
        assert_eq!(other.list_growing().await.unwrap().len(), 1);

        let mut batch = WriteBatch::new();
        store.stage_delete(&mut batch, &meta.id);
        kv.commit(batch).await.unwrap();
        store.evict(&meta.id);

        assert!(store.get(&meta.id).await.unwrap().is_none());
        assert!(store.list_growing().await.unwrap().is_empty());
    }
}
