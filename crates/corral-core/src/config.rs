//! corral.toml configuration parser.
//!
//! Every section and field has a default, so an empty file (or no file at
//! all) yields a working configuration:
//!
//! ```toml
//! [scheduler]
//! workers = 4
//! algorithm = "binpack"
//!
//! [scheduler.weights]
//! bin_packing = 1.0
//! affinity = 1.0
//!
//! [preemption]
//! priority_floor = 50
//!
//! [broker]
//! nack_timeout_ms = 60000
//! delivery_limit = 3
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::structs::JobType;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorralConfig {
    pub scheduler: SchedulerConfig,
    pub preemption: PreemptionConfig,
    pub broker: BrokerConfig,
    pub blocked: BlockedConfig,
    pub logging: LoggingConfig,
}

impl CorralConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::from_toml_str(&content)?;
        tracing::debug!(path = %path.display(), "loaded config");
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: CorralConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler.workers == 0 {
            return Err(ConfigError::Invalid("scheduler.workers must be at least 1".into()));
        }
        if self.broker.delivery_limit == 0 {
            return Err(ConfigError::Invalid("broker.delivery_limit must be at least 1".into()));
        }
        let w = &self.scheduler.weights;
        for (name, value) in [
            ("bin_packing", w.bin_packing),
            ("job_anti_affinity", w.job_anti_affinity),
            ("affinity", w.affinity),
            ("spread", w.spread),
            ("reschedule_penalty", w.reschedule_penalty),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "scheduler.weights.{name} must be a non-negative number"
                )));
            }
        }
        if !(1..=100).contains(&self.preemption.priority_floor) {
            return Err(ConfigError::Invalid("preemption.priority_floor must be in 1..=100".into()));
        }
        Ok(())
    }
}

/// How the bin-packing factor ranks nodes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerAlgorithm {
    /// Prefer the most utilized node that fits.
    #[default]
    Binpack,
    /// Prefer the least utilized node.
    Spread,
}

/// Relative weights of the scoring factors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringWeights {
    pub bin_packing: f64,
    pub job_anti_affinity: f64,
    pub affinity: f64,
    pub spread: f64,
    pub reschedule_penalty: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            bin_packing: 1.0,
            job_anti_affinity: 1.0,
            affinity: 1.0,
            spread: 1.0,
            reschedule_penalty: 1.0,
        }
    }
}

/// Plan submission attempts per scheduler type before an evaluation fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaxPlanAttempts {
    pub service: u32,
    pub batch: u32,
    pub system: u32,
    pub sysbatch: u32,
}

impl Default for MaxPlanAttempts {
    fn default() -> Self {
        Self {
            service: 5,
            batch: 2,
            system: 5,
            sysbatch: 2,
        }
    }
}

impl MaxPlanAttempts {
    pub fn for_type(&self, job_type: JobType) -> u32 {
        match job_type {
            JobType::Service => self.service,
            JobType::Batch => self.batch,
            JobType::System => self.system,
            JobType::SysBatch => self.sysbatch,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Number of worker tasks pulling from the broker.
    pub workers: usize,
    pub algorithm: SchedulerAlgorithm,
    pub weights: ScoringWeights,
    pub max_plan_attempts: MaxPlanAttempts,
    /// Delay before the follow-up of an evaluation that exhausted its plan
    /// attempts runs.
    pub failed_followup_delay_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            algorithm: SchedulerAlgorithm::Binpack,
            weights: ScoringWeights::default(),
            max_plan_attempts: MaxPlanAttempts::default(),
            failed_followup_delay_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreemptionConfig {
    pub service_enabled: bool,
    pub batch_enabled: bool,
    pub system_enabled: bool,
    pub sysbatch_enabled: bool,
    /// Jobs below this priority never preempt.
    pub priority_floor: i32,
}

impl Default for PreemptionConfig {
    fn default() -> Self {
        Self {
            service_enabled: true,
            batch_enabled: true,
            system_enabled: true,
            sysbatch_enabled: true,
            priority_floor: 50,
        }
    }
}

impl PreemptionConfig {
    pub fn allowed(&self, job_type: JobType, priority: i32) -> bool {
        let enabled = match job_type {
            JobType::Service => self.service_enabled,
            JobType::Batch => self.batch_enabled,
            JobType::System => self.system_enabled,
            JobType::SysBatch => self.sysbatch_enabled,
        };
        enabled && priority >= self.priority_floor
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Unacked evaluations are nacked automatically after this long.
    pub nack_timeout_ms: u64,
    /// Deliveries before an evaluation is moved to the failed queue.
    pub delivery_limit: u32,
    pub initial_nack_delay_ms: u64,
    pub subsequent_nack_delay_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            nack_timeout_ms: 60_000,
            delivery_limit: 3,
            initial_nack_delay_ms: 1_000,
            subsequent_nack_delay_ms: 20_000,
        }
    }
}

impl BrokerConfig {
    pub fn nack_timeout(&self) -> Duration {
        Duration::from_millis(self.nack_timeout_ms)
    }

    pub fn initial_nack_delay(&self) -> Duration {
        Duration::from_millis(self.initial_nack_delay_ms)
    }

    pub fn subsequent_nack_delay(&self) -> Duration {
        Duration::from_millis(self.subsequent_nack_delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockedConfig {
    /// Minimum time between two unblocks of the same job.
    pub min_unblock_interval_ms: u64,
}

impl Default for BlockedConfig {
    fn default() -> Self {
        Self {
            min_unblock_interval_ms: 500,
        }
    }
}

impl BlockedConfig {
    pub fn min_unblock_interval(&self) -> Duration {
        Duration::from_millis(self.min_unblock_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub filter: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info,corrald=debug,corral=debug".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_is_default() {
        let config = CorralConfig::from_toml_str("").unwrap();
        assert_eq!(config, CorralConfig::default());
        assert_eq!(config.scheduler.max_plan_attempts.for_type(JobType::Batch), 2);
        assert_eq!(config.scheduler.max_plan_attempts.for_type(JobType::Service), 5);
    }

    #[test]
    fn test_parse_partial() {
        let toml_str = r#"
[scheduler]
workers = 8
algorithm = "spread"

[scheduler.weights]
affinity = 2.5

[preemption]
batch_enabled = false
priority_floor = 70
"#;
        let config = CorralConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(config.scheduler.workers, 8);
        assert_eq!(config.scheduler.algorithm, SchedulerAlgorithm::Spread);
        assert_eq!(config.scheduler.weights.affinity, 2.5);
        assert_eq!(config.scheduler.weights.bin_packing, 1.0);
        assert!(!config.preemption.allowed(JobType::Batch, 100));
        assert!(config.preemption.allowed(JobType::Service, 70));
        assert!(!config.preemption.allowed(JobType::Service, 69));
        assert_eq!(config.broker, BrokerConfig::default());
    }

    #[test]
    fn test_rejects_zero_workers() {
        let err = CorralConfig::from_toml_str("[scheduler]\nworkers = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_rejects_negative_weight() {
        let err =
            CorralConfig::from_toml_str("[scheduler.weights]\nspread = -1.0\n").unwrap_err();
        assert!(err.to_string().contains("spread"));
    }

    #[test]
    fn test_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corral.toml");
        let mut config = CorralConfig::default();
        config.broker.delivery_limit = 7;
        std::fs::write(&path, config.to_toml_string().unwrap()).unwrap();
        assert_eq!(CorralConfig::from_file(&path).unwrap(), config);
    }

    #[test]
    fn test_missing_file() {
        let err = CorralConfig::from_file(Path::new("/nonexistent/corral.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
