//! Typed configuration for Stampede nodes.
//!
//! Every tunable carries the cluster's calibrated default and can be
//! overridden through a `STAMPEDE_*` environment variable. The binaries
//! call [`NodeConfig::from_env`] once at boot; tests construct configs
//! directly and shrink the timers.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub mod telemetry;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },
}

/// Failure-detection ring tunables.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RingConfig {
    /// Gossip period between cron ticks.
    pub interval: Duration,
    /// Deadline for one ping round trip.
    pub ping_timeout: Duration,
    /// UDP read deadline.
    pub read_timeout: Duration,
    /// UDP write deadline.
    pub write_timeout: Duration,
    /// Grace window between suspicion and removal. Roughly four ping
    /// opportunities at the default interval.
    pub expiration: Duration,
    /// Upper bound on successors pinged per tick.
    pub max_successors: usize,
    /// Probability of dropping an outgoing datagram (fault injection).
    pub drop_probability: f64,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(1450),
            ping_timeout: Duration::from_millis(700),
            read_timeout: Duration::from_millis(700),
            write_timeout: Duration::from_millis(700),
            expiration: Duration::from_secs(6),
            max_successors: 6,
            drop_probability: 0.0,
        }
    }
}

/// Key-value store tunables.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Target replicas per key, clamped to the ring size.
    pub replica_count: usize,
    pub read_consistency: usize,
    pub write_consistency: usize,
    pub get_timeout: Duration,
    pub put_timeout: Duration,
    pub delete_timeout: Duration,
    pub lookup_timeout: Duration,
    /// Period of the delete-pool / convergence cron.
    pub cron_interval: Duration,
    /// Total LFU cache capacity in bytes.
    pub cache_capacity: usize,
    /// Files at or below this size are cached.
    pub cache_threshold: usize,
}

impl StoreConfig {
    pub fn delete_consistency(&self) -> usize {
        self.replica_count
    }

    pub fn list_consistency(&self) -> usize {
        self.replica_count
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            replica_count: 4,
            read_consistency: 2,
            write_consistency: 3,
            get_timeout: Duration::from_secs(12),
            put_timeout: Duration::from_secs(12),
            delete_timeout: Duration::from_secs(2),
            lookup_timeout: Duration::from_secs(12),
            cron_interval: Duration::from_millis(200),
            cache_capacity: 100 * 1024 * 1024,
            cache_threshold: 10 * 1024 * 1024,
        }
    }
}

/// Coordinator, scheduler and worker-agent tunables.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServeConfig {
    pub process_queue_interval: Duration,
    pub reschedule_interval: Duration,
    pub flush_interval: Duration,
    pub refresh_interval: Duration,
    pub backup_interval: Duration,
    pub measure_interval: Duration,
    /// Worker query-data loop period.
    pub query_interval: Duration,
    /// Extra back-off the worker sleeps after a failed cycle.
    pub query_backoff: Duration,
    /// Context deadline for one QueryData RPC.
    pub query_data_deadline: Duration,
    /// Added to the node port to reach the local model runner.
    pub runner_port_offset: u16,
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            process_queue_interval: Duration::from_secs(1),
            reschedule_interval: Duration::from_secs(2),
            flush_interval: Duration::from_secs(2),
            refresh_interval: Duration::from_secs(2),
            backup_interval: Duration::from_secs(3),
            measure_interval: Duration::from_secs(1),
            query_interval: Duration::from_millis(800),
            query_backoff: Duration::from_secs(1),
            query_data_deadline: Duration::from_millis(2500),
            runner_port_offset: 1000,
        }
    }
}

/// Full per-node configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    pub ring: RingConfig,
    pub store: StoreConfig,
    pub serve: ServeConfig,
}

impl NodeConfig {
    /// Defaults overlaid with any `STAMPEDE_*` environment overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        override_millis("STAMPEDE_RING_INTERVAL_MS", &mut config.ring.interval)?;
        override_millis("STAMPEDE_PING_TIMEOUT_MS", &mut config.ring.ping_timeout)?;
        override_millis("STAMPEDE_EXPIRATION_MS", &mut config.ring.expiration)?;
        override_parse("STAMPEDE_MAX_SUCCESSORS", &mut config.ring.max_successors)?;
        override_parse("STAMPEDE_DROP_PROBABILITY", &mut config.ring.drop_probability)?;
        if !(0.0..=1.0).contains(&config.ring.drop_probability) {
            return Err(ConfigError::Invalid {
                key: "STAMPEDE_DROP_PROBABILITY".to_string(),
                value: config.ring.drop_probability.to_string(),
                reason: "must be within [0, 1]".to_string(),
            });
        }

        override_parse("STAMPEDE_REPLICA_COUNT", &mut config.store.replica_count)?;
        override_parse("STAMPEDE_READ_CONSISTENCY", &mut config.store.read_consistency)?;
        override_parse(
            "STAMPEDE_WRITE_CONSISTENCY",
            &mut config.store.write_consistency,
        )?;
        override_parse("STAMPEDE_CACHE_CAPACITY", &mut config.store.cache_capacity)?;

        override_millis(
            "STAMPEDE_RESCHEDULE_INTERVAL_MS",
            &mut config.serve.reschedule_interval,
        )?;
        override_millis(
            "STAMPEDE_BACKUP_INTERVAL_MS",
            &mut config.serve.backup_interval,
        )?;
        override_millis(
            "STAMPEDE_QUERY_INTERVAL_MS",
            &mut config.serve.query_interval,
        )?;

        Ok(config)
    }
}

fn override_parse<T: FromStr>(key: &str, slot: &mut T) -> Result<(), ConfigError>
where
    T::Err: std::fmt::Display,
{
    if let Ok(raw) = env::var(key) {
        *slot = raw.parse().map_err(|err: T::Err| ConfigError::Invalid {
            key: key.to_string(),
            value: raw.clone(),
            reason: err.to_string(),
        })?;
    }
    Ok(())
}

fn override_millis(key: &str, slot: &mut Duration) -> Result<(), ConfigError> {
    let mut millis = slot.as_millis() as u64;
    override_parse(key, &mut millis)?;
    *slot = Duration::from_millis(millis);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_cluster_calibration() {
        let config = NodeConfig::default();
        assert_eq!(config.ring.interval, Duration::from_millis(1450));
        assert_eq!(config.ring.expiration, Duration::from_secs(6));
        assert_eq!(config.ring.max_successors, 6);
        assert_eq!(config.store.replica_count, 4);
        assert_eq!(config.store.read_consistency, 2);
        assert_eq!(config.store.write_consistency, 3);
        assert_eq!(config.store.delete_consistency(), 4);
        assert_eq!(config.store.get_timeout, Duration::from_secs(12));
        assert_eq!(config.store.delete_timeout, Duration::from_secs(2));
        assert_eq!(config.serve.query_interval, Duration::from_millis(800));
        assert_eq!(config.serve.backup_interval, Duration::from_secs(3));
    }

    #[test]
    fn env_overrides_apply() {
        // Serial with other tests that touch the environment: none do.
        unsafe {
            env::set_var("STAMPEDE_REPLICA_COUNT", "3");
            env::set_var("STAMPEDE_RING_INTERVAL_MS", "500");
        }
        let config = NodeConfig::from_env().expect("config");
        assert_eq!(config.store.replica_count, 3);
        assert_eq!(config.ring.interval, Duration::from_millis(500));
        unsafe {
            env::remove_var("STAMPEDE_REPLICA_COUNT");
            env::remove_var("STAMPEDE_RING_INTERVAL_MS");
        }
    }

    #[test]
    fn rejects_out_of_range_drop_probability() {
        unsafe {
            env::set_var("STAMPEDE_DROP_PROBABILITY", "1.5");
        }
        assert!(NodeConfig::from_env().is_err());
        unsafe {
            env::remove_var("STAMPEDE_DROP_PROBABILITY");
        }
    }
}
