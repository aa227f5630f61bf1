//! `JobGuardConfig`: a flat, serde-able struct mirroring the configuration
//! surface table (spec.md §6) field-for-field, with a `Default` impl
//! matching every default in that table. Unlike `mqk-config`'s
//! layered-YAML-merge-plus-hash machinery (built for reproducible backtest
//! configs), this system has no merge-order or provenance-hashing
//! requirement, so a single `Default`-and-`serde`-backed struct is the
//! whole story.

use std::time::Duration;

use jobguard_broker::AdapterLimits;
use jobguard_db::{ConnectionManagerConfig, QueueType};
use jobguard_logging::LoggingConfig;
use jobguard_reconcile::ReconcilerConfig;
use serde::{Deserialize, Serialize};

/// `persistence.*` (spec.md §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    pub retention_days: i64,
    pub cleanup_enabled: bool,
    #[serde(with = "duration_millis")]
    pub cleanup_interval: Duration,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            retention_days: 7,
            cleanup_enabled: true,
            cleanup_interval: Duration::from_millis(3_600_000),
        }
    }
}

/// The complete configuration surface of one coordinator instance. `postgres`
/// has no usable default (no DB endpoint to assume) but derives `Default`
/// alongside every other field so a host can `..Default::default()` over
/// just the keys it cares about, filling in `postgres` itself afterward.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobGuardConfig {
    pub postgres: ConnectionManagerConfig,
    /// Identifies which queue this coordinator instance guards — not itself
    /// a config-surface key, but required plumbing every operation needs.
    pub queue_name: String,
    pub queue_type: QueueType,
    pub reconciliation: ReconcilerConfig,
    pub logging: LoggingConfig,
    pub persistence: PersistenceConfig,
    pub limits: AdapterLimits,
}

impl JobGuardConfig {
    /// Reads `JOBGUARD_DATABASE_URL` the way `mqk_db::connect_from_env` reads
    /// `MQK_DATABASE_URL`; every other field keeps its spec default.
    pub fn from_env(queue_name: impl Into<String>, queue_type: QueueType) -> Result<Self, std::env::VarError> {
        let url = std::env::var(jobguard_db::ENV_DB_URL)?;
        Ok(Self {
            postgres: ConnectionManagerConfig::from_url(url),
            queue_name: queue_name.into(),
            queue_type,
            reconciliation: ReconcilerConfig::default(),
            logging: LoggingConfig::default(),
            persistence: PersistenceConfig::default(),
            limits: AdapterLimits::default(),
        })
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persistence_defaults_match_spec_table() {
        let cfg = PersistenceConfig::default();
        assert_eq!(cfg.retention_days, 7);
        assert!(cfg.cleanup_enabled);
        assert_eq!(cfg.cleanup_interval, Duration::from_millis(3_600_000));
    }

    #[test]
    fn job_guard_config_defaults_match_spec_table() {
        let cfg = JobGuardConfig::default();
        assert_eq!(cfg.postgres.pool_max, 10);
        assert_eq!(cfg.queue_type, QueueType::Bull);
        assert!(cfg.reconciliation.enabled);
        assert!(cfg.logging.enabled);
        assert!(cfg.persistence.cleanup_enabled);
        assert_eq!(cfg.limits.max_job_name_length, 255);
    }

    #[test]
    fn job_guard_config_round_trips_through_json() {
        let cfg = JobGuardConfig {
            queue_name: "emails".into(),
            ..JobGuardConfig::default()
        };
        let json = serde_json::to_string(&cfg).expect("serialize");
        let restored: JobGuardConfig = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(restored.queue_name, "emails");
        assert_eq!(restored.queue_type, cfg.queue_type);
    }
}
