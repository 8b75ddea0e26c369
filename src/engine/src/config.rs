//! Engine configuration.
//!
//! [`EngineConfig`] is a plain value. [`ConfigHandle`] holds the current one
//! and every engine operation takes a snapshot at entry, so an update is
//! picked up by the next operation without restarting anything.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::index::{depth_key, MAX_DEPTH_SCALE};

/// Settings consumed by the chunk partitioner, the merge ceilings and the
/// growing object manager.
///
/// # Example
///
/// ```ignore
/// let config: EngineConfig = serde_json::from_str(r#"{ "depth_chunk_size": 500.0 }"#)?;
/// assert_eq!(config.time_chunk_size, 86_400_000_000);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Width of a depth chunk, in depth units.
    pub depth_chunk_size: f64,

    /// Width of a time chunk, in microseconds.
    pub time_chunk_size: i64,

    /// Decimal places kept for depth index values. Captured by each log when
    /// it is created; later changes only affect new logs.
    pub depth_scale: u32,

    /// Ceiling on rows × columns for one merge request or query response.
    pub max_data_points: usize,

    /// Ceiling on rows for one merge request or query response.
    pub max_data_nodes: usize,

    /// A growing log with no append for this long is demoted by the sweep.
    #[serde(with = "duration_secs")]
    pub growing_timeout: Duration,

    /// Pause between two growing object sweeps.
    #[serde(with = "duration_secs")]
    pub sweep_interval: Duration,

    /// How long a mutation waits for the per-log lock.
    #[serde(with = "duration_secs")]
    pub lock_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            depth_chunk_size: 1000.0,
            time_chunk_size: 86_400_000_000, // one day
            depth_scale: 3,
            max_data_points: 1_000_000,
            max_data_nodes: 10_000,
            growing_timeout: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
            lock_timeout: Duration::from_secs(30),
        }
    }
}

impl EngineConfig {
    /// validate rejects settings no log could be partitioned or served with.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| Err(Error::InvalidConfig(reason));

        if self.depth_scale > MAX_DEPTH_SCALE {
            return invalid(format!(
                "depth_scale {} exceeds {}",
                self.depth_scale, MAX_DEPTH_SCALE
            ));
        }
        match depth_key(self.depth_chunk_size, self.depth_scale) {
            Some(width) if width >= 1 => {}
            _ => {
                return invalid(format!(
                    "depth_chunk_size {} is not a positive width at scale {}",
                    self.depth_chunk_size, self.depth_scale
                ))
            }
        }
        if self.time_chunk_size < 1 {
            return invalid(format!("time_chunk_size {} is not positive", self.time_chunk_size));
        }
        if self.max_data_points == 0 || self.max_data_nodes == 0 {
            return invalid("max_data_points and max_data_nodes must be positive".to_string());
        }
        Ok(())
    }
}

/// ConfigHandle shares the live configuration between the engine and the
/// growing object manager.
#[derive(Debug, Default)]
pub struct ConfigHandle {
    current: RwLock<Arc<EngineConfig>>,
}

impl ConfigHandle {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            current: RwLock::new(Arc::new(config)),
        }
    }

    /// try_new is [`ConfigHandle::new`] for configurations read from outside.
    pub fn try_new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::new(config))
    }

    pub fn snapshot(&self) -> Arc<EngineConfig> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// update installs a new configuration; an invalid one leaves the current
    /// configuration in place.
    pub fn update(&self, config: EngineConfig) -> Result<()> {
        config.validate()?;
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(config);
        Ok(())
    }

    /// modify applies f to a copy of the current configuration and installs it.
    pub fn modify<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut EngineConfig),
    {
        let mut config = (*self.snapshot()).clone();
        f(&mut config);
        self.update(config)
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(serde::de::Error::custom(format!(
                "invalid duration {} seconds",
                secs
            )));
        }
        Ok(Duration::from_secs_f64(secs))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::config::{ConfigHandle, EngineConfig};
    use crate::error::ErrorKind;

    #[test]
    fn test_partial_json() {
        let config: EngineConfig =
            serde_json::from_str(r#"{ "depth_chunk_size": 500.0, "growing_timeout": 1.5 }"#)
                .unwrap();
        assert_eq!(config.depth_chunk_size, 500.0);
        assert_eq!(config.growing_timeout, Duration::from_millis(1500));
        assert_eq!(config.time_chunk_size, EngineConfig::default().time_chunk_size);

        assert!(serde_json::from_str::<EngineConfig>(r#"{ "lock_timeout": -1 }"#).is_err());
    }

    #[test]
    fn test_hot_update() {
        let handle = ConfigHandle::new(EngineConfig::default());
        let before = handle.snapshot();

        handle.modify(|c| c.max_data_nodes = 7).unwrap();

        assert_eq!(before.max_data_nodes, 10_000);
        assert_eq!(handle.snapshot().max_data_nodes, 7);
    }

    #[test]
    fn test_reject_unusable_widths() {
        assert!(EngineConfig::default().validate().is_ok());

        for json in [
            r#"{ "depth_chunk_size": 0.0 }"#,
            r#"{ "depth_chunk_size": 1e-9 }"#,
            r#"{ "depth_chunk_size": -5.0 }"#,
            r#"{ "depth_chunk_size": 1e300 }"#,
            r#"{ "time_chunk_size": 0 }"#,
            r#"{ "depth_scale": 12 }"#,
            r#"{ "max_data_nodes": 0 }"#,
        ] {
            let config: EngineConfig = serde_json::from_str(json).unwrap();
            let e = config.validate().unwrap_err();
            assert_eq!(e.kind(), ErrorKind::InvalidConfig, "{}", json);
            assert!(ConfigHandle::try_new(config).is_err());
        }

        // a smaller width is fine as long as it survives the scale
        let config: EngineConfig = serde_json::from_str(r#"{ "depth_chunk_size": 0.001 }"#).unwrap();
        assert!(config.validate().is_ok());

        let handle = ConfigHandle::new(EngineConfig::default());
        let e = handle.modify(|c| c.depth_chunk_size = 0.0).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::InvalidConfig);
        assert_eq!(handle.snapshot().depth_chunk_size, 1000.0);
    }
}
