//! Engine configuration, loaded from TOML.
//!
//! ```toml
//! [lock]
//! lock_timeout_secs = 3600
//! stale_threshold_secs = 300
//! heartbeat_every_batches = 10
//! heartbeat_interval_secs = 60
//!
//! [executor]
//! batch_size = 1000
//!
//! [limits]
//! time_limit_secs = 259200       # 72h, hard
//! soft_time_limit_secs = 255600  # 71h, graceful stop
//!
//! [tasks]
//! max_retries = 3
//!
//! [sweep]
//! interval_secs = 60
//!
//! [workers]
//! concurrency = 4
//! poll_timeout_ms = 500
//! ```
//!
//! Every section and key is optional.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::SpindleError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Lease TTL (`LOCK_TIMEOUT`).
    pub lock_timeout_secs: u64,
    /// Heartbeat age at which a lease is condemned. Independent of the TTL.
    pub stale_threshold_secs: u64,
    pub heartbeat_every_batches: u64,
    pub heartbeat_interval_secs: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lock_timeout_secs: 3600,
            stale_threshold_secs: 300,
            heartbeat_every_batches: 10,
            heartbeat_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub batch_size: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self { batch_size: 1000 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub time_limit_secs: u64,
    pub soft_time_limit_secs: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            time_limit_secs: 72 * 3600,
            soft_time_limit_secs: 71 * 3600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TasksConfig {
    pub max_retries: u32,
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self { max_retries: 3 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    pub interval_secs: u64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self { interval_secs: 60 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkersConfig {
    pub concurrency: usize,
    pub poll_timeout_ms: u64,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            poll_timeout_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub lock: LockConfig,
    pub executor: ExecutorConfig,
    pub limits: LimitsConfig,
    pub tasks: TasksConfig,
    pub sweep: SweepConfig,
    pub workers: WorkersConfig,
}

impl EngineConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, SpindleError> {
        let config: EngineConfig = toml::from_str(content)
            .map_err(|e| SpindleError::Config(format!("parse engine TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, SpindleError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| SpindleError::Config(format!("read {}: {e}", path.display())))?;
        Self::from_toml_str(&content)
    }

    pub fn to_toml(&self) -> Result<String, SpindleError> {
        toml::to_string_pretty(self)
            .map_err(|e| SpindleError::Config(format!("serialize engine config: {e}")))
    }

    pub fn validate(&self) -> Result<(), SpindleError> {
        let fail = |msg: &str| Err(SpindleError::Config(msg.to_string()));
        if self.lock.lock_timeout_secs == 0 {
            return fail("lock.lock_timeout_secs must be > 0");
        }
        if self.lock.stale_threshold_secs == 0 {
            return fail("lock.stale_threshold_secs must be > 0");
        }
        if self.lock.stale_threshold_secs >= self.lock.lock_timeout_secs {
            return fail("lock.stale_threshold_secs must be below lock.lock_timeout_secs");
        }
        if self.lock.heartbeat_every_batches == 0 {
            return fail("lock.heartbeat_every_batches must be > 0");
        }
        if self.lock.heartbeat_interval_secs >= self.lock.stale_threshold_secs {
            return fail("lock.heartbeat_interval_secs must be below lock.stale_threshold_secs");
        }
        if self.executor.batch_size == 0 {
            return fail("executor.batch_size must be > 0");
        }
        if self.limits.soft_time_limit_secs >= self.limits.time_limit_secs {
            return fail("limits.soft_time_limit_secs must be below limits.time_limit_secs");
        }
        if self.workers.concurrency == 0 {
            return fail("workers.concurrency must be > 0");
        }
        if self.sweep.interval_secs == 0 {
            return fail("sweep.interval_secs must be > 0");
        }
        Ok(())
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock.lock_timeout_secs)
    }

    pub fn stale_threshold(&self) -> Duration {
        Duration::from_secs(self.lock.stale_threshold_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.lock.heartbeat_interval_secs)
    }

    pub fn time_limit(&self) -> Duration {
        Duration::from_secs(self.limits.time_limit_secs)
    }

    pub fn soft_time_limit(&self) -> Duration {
        Duration::from_secs(self.limits.soft_time_limit_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep.interval_secs)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.workers.poll_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn defaults_validate() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.limits.time_limit_secs, 259_200);
        assert_eq!(config.limits.soft_time_limit_secs, 255_600);
        assert_eq!(config.lock.heartbeat_every_batches, 10);
    }

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
            [lock]
            stale_threshold_secs = 400

            [executor]
            batch_size = 50
            "#,
        )
        .unwrap();

        assert_eq!(config.lock.stale_threshold_secs, 400);
        assert_eq!(config.lock.lock_timeout_secs, 3600);
        assert_eq!(config.executor.batch_size, 50);
        assert_eq!(config.tasks.max_retries, 3);
    }

    #[test]
    fn toml_roundtrip() {
        let config = EngineConfig::default();
        let text = config.to_toml().unwrap();
        assert_eq!(EngineConfig::from_toml_str(&text).unwrap(), config);
    }

    #[rstest]
    #[case::soft_after_hard("[limits]\ntime_limit_secs = 100\nsoft_time_limit_secs = 100")]
    #[case::stale_beyond_ttl("[lock]\nlock_timeout_secs = 60\nstale_threshold_secs = 60")]
    #[case::zero_batch("[executor]\nbatch_size = 0")]
    #[case::no_workers("[workers]\nconcurrency = 0")]
    #[case::heartbeat_slower_than_stale("[lock]\nheartbeat_interval_secs = 300")]
    #[case::not_toml("lock = [")]
    fn invalid_configs_are_rejected(#[case] text: &str) {
        assert!(matches!(
            EngineConfig::from_toml_str(text),
            Err(SpindleError::Config(_))
        ));
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spindle.toml");
        std::fs::write(&path, "[tasks]\nmax_retries = 5\n").unwrap();

        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.tasks.max_retries, 5);
        assert!(EngineConfig::load(&dir.path().join("missing.toml")).is_err());
    }
}
