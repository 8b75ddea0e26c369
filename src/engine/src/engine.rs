use std::collections::HashSet;
use std::sync::Arc;

use tracing::{error, info};
use wellstore_storage::{KvStore, WriteBatch};
use wellstore_utils::clock::{Clock, SystemClock};

use crate::channel::{
    validate_channel_count, validate_delimiter, validate_mnemonic, ChannelDefinition, LogHeader, LogId,
};
use crate::chunk::ChunkStore;
use crate::config::ConfigHandle;
use crate::error::{Error, Result};
use crate::lock::LogLocks;
use crate::metadata::{ChannelMetadata, GrowingRecord, LogMetadata, MetadataStore};

/// ChannelDataEngine owns every log of one store.
///
/// Mutations of a log run under that log's write lock and stage all of their
/// chunk and metadata changes into one batch, committed at the end. A request
/// that fails before the commit leaves nothing behind.
pub struct ChannelDataEngine {
    pub(crate) store: Arc<dyn KvStore>,
    pub(crate) chunks: ChunkStore,
    pub(crate) metadata: MetadataStore,
    pub(crate) locks: LogLocks,
    config: Arc<ConfigHandle>,
    clock: Arc<dyn Clock>,
}

impl ChannelDataEngine {
    pub fn new(store: Arc<dyn KvStore>, config: Arc<ConfigHandle>) -> Self {
        Self::with_clock(store, config, Arc::new(SystemClock))
    }

    pub fn with_clock(store: Arc<dyn KvStore>, config: Arc<ConfigHandle>, clock: Arc<dyn Clock>) -> Self {
        Self {
            chunks: ChunkStore::new(store.clone()),
            metadata: MetadataStore::new(store.clone()),
            locks: LogLocks::new(),
            store,
            config,
            clock,
        }
    }

    pub fn config(&self) -> &Arc<ConfigHandle> {
        &self.config
    }

    pub(crate) fn now_micros(&self) -> i64 {
        self.clock.now_micros()
    }

    /// commit writes a staged batch. A failed commit may still be rolled
    /// forward by the store later, so the log's cached metadata is dropped and
    /// the next reader decodes whatever the store settled on.
    pub(crate) async fn commit(&self, id: &LogId, batch: WriteBatch) -> Result<()> {
        let ops = batch.len();
        self.store.commit(batch).await.map_err(|e| {
            error!(log = %id, ops, error = %e, "commit failed");
            self.metadata.evict(id);
            Error::from(e)
        })
    }

    /// require_locked loads a log's metadata under a lock already taken on it.
    /// For an unknown log the lock is released and its entry pruned.
    pub(crate) async fn require_locked<G>(&self, id: &LogId, guard: G) -> Result<(G, Arc<LogMetadata>)> {
        match self.metadata.get(id).await? {
            Some(meta) => Ok((guard, meta)),
            None => {
                self.locks.release(id, guard);
                Err(Error::ObjectNotFound(id.to_string()))
            }
        }
    }

    /// create_log stores a new, empty log.
    pub async fn create_log(&self, header: LogHeader) -> Result<LogHeader> {
        validate_header(&header)?;

        let config = self.config.snapshot();
        let _guard = self.locks.write(&header.id, config.lock_timeout).await?;
        if self.metadata.get(&header.id).await?.is_some() {
            return Err(Error::ObjectAlreadyExists(header.id.to_string()));
        }

        let meta = LogMetadata::from_header(&header, config.depth_scale, self.now_micros());
        let mut batch = WriteBatch::new();
        self.metadata.stage_put(&mut batch, &meta)?;
        self.commit(&header.id, batch).await?;

        info!(
            log = %header.id,
            index_type = %meta.index_type,
            direction = %meta.direction,
            channels = meta.channels.len(),
            "log created"
        );
        let header = meta.header();
        self.metadata.publish(meta);
        Ok(header)
    }

    /// update_channels changes channel descriptions without touching rows.
    /// Unknown mnemonics are appended as new channels.
    pub async fn update_channels(&self, id: &LogId, channels: Vec<ChannelDefinition>) -> Result<LogHeader> {
        let config = self.config.snapshot();
        let guard = self.locks.write(id, config.lock_timeout).await?;
        let (_guard, meta) = self.require_locked(id, guard).await?;

        let mut seen = HashSet::new();
        for def in &channels {
            validate_mnemonic(&def.mnemonic, meta.delimiter)?;
            if !seen.insert(def.mnemonic.as_str()) {
                return Err(Error::ChildIdentifierNotUnique(def.mnemonic.clone()));
            }
            if def.unit.trim().is_empty() {
                return Err(Error::MissingUnitForChannel(def.mnemonic.clone()));
            }
        }

        let mut next = (*meta).clone();
        for def in channels {
            match next.channel_position(&def.mnemonic) {
                Some(pos) => {
                    let channel = &mut next.channels[pos];
                    if channel.data_type != def.data_type && channel.min_index.is_some() {
                        return Err(Error::InvalidChannelValue {
                            channel: def.mnemonic,
                            value: format!("{:?}", def.data_type),
                        });
                    }
                    channel.unit = def.unit;
                    channel.data_type = def.data_type;
                    channel.description = def.description;
                }
                None => next.channels.push(ChannelMetadata::from_definition(&def)),
            }
        }
        validate_channel_count(next.channels.len())?;
        next.version += 1;
        next.updated_micros = self.now_micros();

        let mut batch = WriteBatch::new();
        self.metadata.stage_put(&mut batch, &next)?;
        self.commit(id, batch).await?;

        let header = next.header();
        self.metadata.publish(next);
        Ok(header)
    }

    pub async fn log_header(&self, id: &LogId) -> Result<LogHeader> {
        Ok(self.metadata.require(id).await?.header())
    }

    pub async fn log_metadata(&self, id: &LogId) -> Result<Arc<LogMetadata>> {
        self.metadata.require(id).await
    }

    pub async fn list_logs(&self) -> Result<Vec<LogId>> {
        self.metadata.list_logs().await
    }

    pub async fn growing_state(&self, id: &LogId) -> Result<Option<GrowingRecord>> {
        self.metadata.get_growing(id).await
    }
}

fn validate_header(header: &LogHeader) -> Result<()> {
    header.id.validate()?;
    if header.name.trim().is_empty() {
        return Err(Error::RequiredFieldEmpty("log name".to_string()));
    }
    if header.channels.is_empty() {
        return Err(Error::RequiredFieldEmpty("index channel".to_string()));
    }
    validate_delimiter(header.delimiter, &header.null_value)?;
    validate_channel_count(header.channels.len())?;

    let mut seen = HashSet::new();
    for channel in &header.channels {
        validate_mnemonic(&channel.mnemonic, header.delimiter)?;
        if !seen.insert(channel.mnemonic.as_str()) {
            return Err(Error::ChildIdentifierNotUnique(channel.mnemonic.clone()));
        }
        if channel.unit.trim().is_empty() {
            return Err(Error::MissingUnitForChannel(channel.mnemonic.clone()));
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Arc;

    use wellstore_storage::MemoryStore;

    use crate::channel::{ChannelDefinition, DataType, LogHeader, LogId, MAX_CHANNELS};
    use crate::config::{ConfigHandle, EngineConfig};
    use crate::delete::{DeleteRequest, DeleteScope};
    use crate::engine::ChannelDataEngine;
    use crate::error::ErrorKind;
    use crate::index::{Direction, IndexType};
    use crate::query::QueryRequest;

    pub(crate) fn engine(config: EngineConfig) -> ChannelDataEngine {
        ChannelDataEngine::new(Arc::new(MemoryStore::new()), Arc::new(ConfigHandle::new(config)))
    }

    /// depth log with an index channel and the given double channels
    pub(crate) fn depth_header(uid: &str, direction: Direction, channels: &[&str]) -> LogHeader {
        let mut header = LogHeader::new(LogId::new("w1", "wb1", uid), IndexType::Depth, direction)
            .with_channel(ChannelDefinition::new("DEPTH", "m", DataType::Double));
        for c in channels {
            header = header.with_channel(ChannelDefinition::new(*c, "api", DataType::Double));
        }
        header
    }

    #[tokio::test]
    async fn test_create_and_list() {
        let engine = engine(EngineConfig::default());
        let header = depth_header("log-1", Direction::Increasing, &["GR", "ROP"]);

        let created = engine.create_log(header.clone()).await.unwrap();
        assert_eq!(created, header);
        assert_eq!(engine.list_logs().await.unwrap(), vec![header.id.clone()]);

        let e = engine.create_log(header.clone()).await.unwrap_err();
        assert_eq!(e.kind(), ErrorKind::ObjectAlreadyExists);

        let meta = engine.log_metadata(&header.id).await.unwrap();
        assert_eq!(meta.depth_scale, 3);
        assert!(meta.start().is_none());
    }

    #[tokio::test]
    async fn test_create_rejects_bad_headers() {
        let engine = engine(EngineConfig::default());

        let header = depth_header("dup", Direction::Increasing, &["GR", "GR"]);
        let e = engine.create_log(header).await.unwrap_err();
        assert_eq!(e.kind(), ErrorKind::ChildIdentifierNotUnique);

        let mut header = depth_header("unit", Direction::Increasing, &["GR"]);
        header.channels[1].unit = String::new();
        let e = engine.create_log(header).await.unwrap_err();
        assert_eq!(e.kind(), ErrorKind::MissingUnitForChannel);

        let header = depth_header("bad", Direction::Increasing, &["G&R"]);
        let e = engine.create_log(header).await.unwrap_err();
        assert_eq!(e.kind(), ErrorKind::BadColumnIdentifier);

        let long = "A".repeat(65_536);
        let header = depth_header("long", Direction::Increasing, &[long.as_str()]);
        let e = engine.create_log(header).await.unwrap_err();
        assert_eq!(e.kind(), ErrorKind::BadColumnIdentifier);

        let many: Vec<String> = (0..MAX_CHANNELS).map(|i| format!("C{}", i)).collect();
        let many: Vec<&str> = many.iter().map(|c| c.as_str()).collect();
        let header = depth_header("wide", Direction::Increasing, &many);
        let e = engine.create_log(header).await.unwrap_err();
        assert_eq!(e.kind(), ErrorKind::TooManyChannels);

        let header = LogHeader::new(LogId::new("w1", "wb1", "empty"), IndexType::Depth, Direction::Increasing);
        let e = engine.create_log(header).await.unwrap_err();
        assert_eq!(e.kind(), ErrorKind::RequiredFieldEmpty);

        assert!(engine.list_logs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_channels() {
        let engine = engine(EngineConfig::default());
        let header = depth_header("log-1", Direction::Increasing, &["GR"]);
        engine.create_log(header.clone()).await.unwrap();

        let mut gr = ChannelDefinition::new("GR", "gapi", DataType::Double);
        gr.description = Some("gamma ray".to_string());
        let updated = engine
            .update_channels(
                &header.id,
                vec![gr, ChannelDefinition::new("LITH", "none", DataType::String)],
            )
            .await
            .unwrap();

        let names: Vec<&str> = updated.channels.iter().map(|c| c.mnemonic.as_str()).collect();
        assert_eq!(names, vec!["DEPTH", "GR", "LITH"]);
        assert_eq!(updated.channels[1].unit, "gapi");

        let e = engine
            .update_channels(&LogId::new("w1", "wb1", "nope"), vec![])
            .await
            .unwrap_err();
        assert_eq!(e.kind(), ErrorKind::ObjectNotFound);
    }

    #[tokio::test]
    async fn test_unknown_logs_leave_no_lock_entries() {
        let engine = engine(EngineConfig::default());
        let header = depth_header("real", Direction::Increasing, &["GR"]);
        engine.create_log(header.clone()).await.unwrap();
        engine.locks.prune(&header.id);

        for i in 0..50 {
            let id = LogId::new("w1", "wb1", format!("ghost-{}", i));
            let kinds = [
                engine.query(QueryRequest::new(id.clone())).await.unwrap_err().kind(),
                engine
                    .delete(DeleteRequest::new(id.clone(), DeleteScope::FullObject))
                    .await
                    .unwrap_err()
                    .kind(),
                engine.update_channels(&id, vec![]).await.unwrap_err().kind(),
            ];
            assert_eq!(kinds, [ErrorKind::ObjectNotFound; 3]);
        }
        assert!(engine.locks.is_empty());
    }
}
