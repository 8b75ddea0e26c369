use tracing::info;
use wellstore_storage::WriteBatch;

use crate::channel::LogId;
use crate::chunk::store::chunk_key;
use crate::engine::ChannelDataEngine;
use crate::error::{Error, Result};
use crate::index::IndexArg;
use crate::metadata::LogMetadata;

#[derive(Debug, Clone, PartialEq)]
pub enum DeleteScope {
    /// The log with every chunk and its growing record.
    FullObject,
    /// One non-index channel, everywhere.
    FullChannel(String),
    /// Every row between two bounds, given in log direction. An absent bound
    /// is open.
    IndexRange(Option<IndexArg>, Option<IndexArg>),
    /// One channel between two bounds. Naming the index channel deletes rows.
    ChannelIndexRange(String, Option<IndexArg>, Option<IndexArg>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeleteRequest {
    pub log_id: LogId,
    pub scope: DeleteScope,
}

impl DeleteRequest {
    pub fn new(log_id: LogId, scope: DeleteScope) -> Self {
        Self { log_id, scope }
    }
}

fn resolve_bounds(meta: &LogMetadata, start: &Option<IndexArg>, end: &Option<IndexArg>) -> Result<(i64, i64)> {
    let resolve = |arg: &Option<IndexArg>| -> Result<Option<i64>> {
        arg.as_ref()
            .map(|a| a.resolve(meta.index_type, meta.depth_scale))
            .transpose()
    };
    Ok(meta.direction.bounds(resolve(start)?, resolve(end)?))
}

impl ChannelDataEngine {
    pub async fn delete(&self, request: DeleteRequest) -> Result<()> {
        let config = self.config().snapshot();
        let id = &request.log_id;

        let guard = self.locks.write(id, config.lock_timeout).await?;
        let (guard, meta) = self.require_locked(id, guard).await?;

        if request.scope == DeleteScope::FullObject {
            let mut batch = WriteBatch::new();
            for &start in meta.chunks.keys() {
                batch.delete(chunk_key(id, start));
            }
            self.metadata.stage_delete(&mut batch, id);
            self.commit(id, batch).await?;
            self.metadata.evict(id);

            drop(guard);
            self.locks.prune(id);
            info!(log = %id, chunks = meta.chunks.len(), "log deleted");
            return Ok(());
        }

        let columns = meta.data_columns();
        let mut batch = WriteBatch::new();
        let mut next = (*meta).clone();

        let changed = match &request.scope {
            DeleteScope::FullObject => Vec::new(),
            DeleteScope::FullChannel(mnemonic) => {
                let pos = self.channel_to_delete(&meta, mnemonic)?;
                let changed = self
                    .chunks
                    .delete_column(&mut batch, id, &meta.chunks, &columns, mnemonic)
                    .await?;
                next.channels.remove(pos);
                changed
            }
            DeleteScope::IndexRange(start, end) => {
                let (min, max) = resolve_bounds(&meta, start, end)?;
                self.chunks
                    .delete_chunks_in_range(&mut batch, id, &meta.chunks, &columns, min, max)
                    .await?
            }
            DeleteScope::ChannelIndexRange(mnemonic, start, end) => {
                let (min, max) = resolve_bounds(&meta, start, end)?;
                if mnemonic == meta.index_mnemonic() {
                    self.chunks
                        .delete_chunks_in_range(&mut batch, id, &meta.chunks, &columns, min, max)
                        .await?
                } else {
                    if meta.channel(mnemonic).is_none() {
                        return Err(Error::ObjectNotFound(format!("{}/{}", id, mnemonic)));
                    }
                    self.chunks
                        .clear_column_in_range(&mut batch, id, &meta.chunks, &columns, mnemonic, min, max)
                        .await?
                }
            }
        };

        for chunk in &changed {
            next.apply_chunk(chunk);
        }
        next.recompute_ranges();
        next.version += 1;
        next.updated_micros = self.now_micros();
        self.metadata.stage_put(&mut batch, &next)?;
        self.commit(id, batch).await?;

        info!(log = %id, scope = ?request.scope, chunks = changed.len(), "deleted");
        self.metadata.publish(next);
        Ok(())
    }

    fn channel_to_delete(&self, meta: &LogMetadata, mnemonic: &str) -> Result<usize> {
        match meta.channel_position(mnemonic) {
            // the index channel only goes with the whole log
            Some(0) => Err(Error::RequiredFieldEmpty(format!("index channel {}", mnemonic))),
            Some(pos) => Ok(pos),
            None => Err(Error::ObjectNotFound(format!("{}/{}", meta.id, mnemonic))),
        }
    }
}
