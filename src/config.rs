use crate::error::{EngineError, Result};
use std::collections::HashSet;
use std::env;
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Process-level configuration, read once at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub upstream_key: String,
    pub upstream_base_url: String,
    /// Reserved for multi-process deployments; unused when the bridge runs
    /// in-process.
    pub bus_dsn: Option<String>,
    /// Accepted for deployment tooling; file loading happens outside the
    /// core.
    pub config_path: Option<String>,
    pub server_port: u16,

    // Rate governor ceilings (rolling windows)
    pub max_rps: u32,
    pub max_rpm: u32,
    pub max_rpd: u32,
    pub rate_acquire_timeout: Duration,

    // Upstream retry policy
    pub request_timeout: Duration,
    pub retry_attempts: u32,
    pub retry_delay: Duration,
    pub max_backoff: Duration,

    // Live ingestion loop
    pub live_workers: usize,
    pub consec_fail_limit: u32,
    pub pull_cooldown: Duration,

    // Storage
    pub pool_max_connections: u32,

    // Fan-out bridge
    pub ring_capacity: usize,
    pub catchup_horizon: usize,
    pub slow_consumer_timeout: Duration,
    pub subscriber_buffer: usize,

    // Lifecycle
    pub drain_timeout: Duration,
    pub fatal_timeout: Duration,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            eprintln!("Warning: invalid {} '{}', using default", key, raw);
            default
        }),
        Err(_) => default,
    }
}

fn env_secs(key: &str, default_secs: u64) -> Duration {
    Duration::from_secs(env_parse(key, default_secs))
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let database_url = env::var("DB_DSN")
            .map_err(|_| EngineError::Config("DB_DSN must be set".into()))?;
        let upstream_key = env::var("UPSTREAM_KEY")
            .map_err(|_| EngineError::Config("UPSTREAM_KEY must be set".into()))?;

        Ok(Self {
            database_url,
            upstream_key,
            upstream_base_url: env::var("UPSTREAM_BASE_URL")
                .unwrap_or_else(|_| "https://v3.football.api-sports.io".to_string()),
            bus_dsn: env::var("BUS_DSN").ok(),
            config_path: env::var("CONFIG_PATH").ok(),
            server_port: env_parse("PORT", 8080u16),

            max_rps: env_parse("MAX_RPS", 6),
            max_rpm: env_parse("MAX_RPM", 280),
            max_rpd: env_parse("MAX_RPD", 7000),
            rate_acquire_timeout: env_secs("RATE_ACQUIRE_TIMEOUT_SECS", 15),

            request_timeout: env_secs("REQUEST_TIMEOUT_SECS", 30),
            retry_attempts: env_parse("RETRY_ATTEMPTS", 3),
            retry_delay: Duration::from_millis(env_parse("RETRY_DELAY_MS", 500u64)),
            max_backoff: env_secs("MAX_BACKOFF_SECS", 30),

            live_workers: env_parse("LIVE_WORKERS", 5usize),
            consec_fail_limit: env_parse("CONSEC_FAIL_LIMIT", 5),
            pull_cooldown: env_secs("PULL_COOLDOWN_SECS", 600),

            pool_max_connections: env_parse("POOL_MAX_CONNECTIONS", 20),

            ring_capacity: env_parse("RING_CAPACITY", 256usize),
            catchup_horizon: env_parse("CATCHUP_HORIZON", 4096usize),
            slow_consumer_timeout: env_secs("SLOW_CONSUMER_TIMEOUT_SECS", 10),
            subscriber_buffer: env_parse("SUBSCRIBER_BUFFER", 64usize),

            drain_timeout: env_secs("DRAIN_TIMEOUT_SECS", 30),
            fatal_timeout: env_secs("FATAL_TIMEOUT_SECS", 120),
        })
    }
}

/// Per-kind live pull cadences.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PullIntervals {
    pub odds: Duration,
    pub events: Duration,
    pub stats: Duration,
}

impl Default for PullIntervals {
    fn default() -> Self {
        Self {
            odds: Duration::from_secs(10),
            events: Duration::from_secs(5),
            stats: Duration::from_secs(15),
        }
    }
}

/// Operator-mutable runtime settings. `None` for leagues means every league
/// is enabled; an explicit set narrows ingestion.
#[derive(Clone, Debug)]
pub struct RuntimeSettings {
    pub enabled_leagues: Option<HashSet<i64>>,
    pub intervals: PullIntervals,
}

impl RuntimeSettings {
    pub fn from_env() -> Self {
        let enabled_leagues = env::var("LEAGUES").ok().map(|raw| {
            raw.split(',')
                .filter_map(|s| s.trim().parse().ok())
                .collect()
        });
        Self {
            enabled_leagues,
            intervals: PullIntervals::default(),
        }
    }

    pub fn league_enabled(&self, league_id: i64) -> bool {
        match &self.enabled_leagues {
            None => true,
            Some(set) => set.contains(&league_id),
        }
    }
}

/// Shared handle around the settings snapshot. Components read a cheap
/// `Arc` clone; the operator surface swaps the snapshot atomically so a
/// change takes effect at the next trigger without restart.
#[derive(Clone)]
pub struct SettingsHandle {
    inner: Arc<RwLock<Arc<RuntimeSettings>>>,
}

impl SettingsHandle {
    pub fn new(settings: RuntimeSettings) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(settings))),
        }
    }

    pub fn snapshot(&self) -> Arc<RuntimeSettings> {
        self.inner.read().unwrap().clone()
    }

    pub fn update<F: FnOnce(&mut RuntimeSettings)>(&self, apply: F) {
        let mut guard = self.inner.write().unwrap();
        let mut next = (**guard).clone();
        apply(&mut next);
        *guard = Arc::new(next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn league_filter_defaults_to_all() {
        let settings = RuntimeSettings {
            enabled_leagues: None,
            intervals: PullIntervals::default(),
        };
        assert!(settings.league_enabled(39));
        assert!(settings.league_enabled(140));
    }

    #[test]
    fn league_filter_narrows() {
        let settings = RuntimeSettings {
            enabled_leagues: Some([39i64].into_iter().collect()),
            intervals: PullIntervals::default(),
        };
        assert!(settings.league_enabled(39));
        assert!(!settings.league_enabled(140));
    }

    #[test]
    fn settings_swap_is_visible_to_existing_handles() {
        let handle = SettingsHandle::new(RuntimeSettings {
            enabled_leagues: None,
            intervals: PullIntervals::default(),
        });
        let reader = handle.clone();
        handle.update(|s| s.enabled_leagues = Some([61i64].into_iter().collect()));
        assert!(!reader.snapshot().league_enabled(39));
        assert!(reader.snapshot().league_enabled(61));
    }
}
