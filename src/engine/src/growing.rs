//! Growing object manager.
//!
//! A merge that extends a log past its previous end marks the log growing.
//! The manager periodically demotes growing logs that have seen no append for
//! `growing_timeout`. Each demotion re-reads the record under the log's write
//! lock, so it never races an append, and a log removed after the scan is
//! simply counted as vanished.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use wellstore_storage::WriteBatch;

use crate::channel::LogId;
use crate::engine::ChannelDataEngine;
use crate::error::Result;
use crate::metadata::GrowingRecord;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// growing records seen
    pub scanned: usize,
    /// logs demoted to not growing
    pub expired: usize,
    /// logs deleted between the scan and the demotion
    pub vanished: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Expiry {
    Expired,
    Fresh,
    Vanished,
}

impl ChannelDataEngine {
    /// expire_growing demotes one log if it is still growing and stale at `now`.
    pub(crate) async fn expire_growing(&self, id: &LogId, now_micros: i64) -> Result<Expiry> {
        let config = self.config().snapshot();
        let timeout = config.growing_timeout.as_micros() as i64;

        let guard = self.locks.write(id, config.lock_timeout).await?;
        if self.metadata.get(id).await?.is_none() {
            self.locks.release(id, guard);
            return Ok(Expiry::Vanished);
        }
        let record = match self.metadata.get_growing(id).await? {
            Some(record) => record,
            None => return Ok(Expiry::Vanished),
        };
        if !record.is_growing || now_micros - record.last_append_micros < timeout {
            return Ok(Expiry::Fresh);
        }

        let mut batch = WriteBatch::new();
        self.metadata.stage_growing(
            &mut batch,
            id,
            &GrowingRecord {
                is_growing: false,
                last_append_micros: record.last_append_micros,
            },
        )?;
        self.commit(id, batch).await?;
        Ok(Expiry::Expired)
    }
}

pub struct GrowingObjectManager {
    engine: Arc<ChannelDataEngine>,
}

impl GrowingObjectManager {
    pub fn new(engine: Arc<ChannelDataEngine>) -> Self {
        Self { engine }
    }

    /// sweep runs one expiration pass over every growing log.
    pub async fn sweep(&self) -> Result<SweepStats> {
        let timeout = self.engine.config().snapshot().growing_timeout.as_micros() as i64;
        let now = self.engine.now_micros();

        let mut stats = SweepStats::default();
        for (id, record) in self.engine.metadata.list_growing().await? {
            if !record.is_growing {
                continue;
            }
            stats.scanned += 1;
            if now - record.last_append_micros < timeout {
                continue;
            }

            match self.engine.expire_growing(&id, now).await {
                Ok(Expiry::Expired) => {
                    stats.expired += 1;
                    info!(log = %id, "log stopped growing");
                }
                Ok(Expiry::Vanished) => {
                    stats.vanished += 1;
                    debug!(log = %id, "log vanished during sweep");
                }
                Ok(Expiry::Fresh) => {}
                Err(e) => warn!(log = %id, error = %e, "failed to expire growing log"),
            }
        }

        Ok(stats)
    }

    /// start runs `sweep` every `sweep_interval` until `shutdown` turns true
    /// or its sender is dropped. A sweep in progress finishes first.
    pub fn start(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("growing object manager started");

            loop {
                let interval = self.engine.config().snapshot().sweep_interval;
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                }

                match self.sweep().await {
                    Ok(stats) if stats.expired > 0 || stats.vanished > 0 => {
                        info!(
                            scanned = stats.scanned,
                            expired = stats.expired,
                            vanished = stats.vanished,
                            "growing sweep finished"
                        );
                    }
                    Ok(stats) => debug!(scanned = stats.scanned, "growing sweep finished"),
                    Err(e) => error!(error = %e, "growing sweep failed"),
                }
            }

            info!("growing object manager stopped");
        })
    }
}
