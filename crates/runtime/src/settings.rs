//! Runtime settings, merged from defaults and recognized environment
//! variables.

use std::path::PathBuf;
use std::time::Duration;

use mcp::RestartPolicy;
use tracing::warn;

/// All tunables of the control loop and its collaborators.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Control-loop tick interval (`ACQUIRE_INTERVAL_MS`).
    pub tick_interval: Duration,
    /// Ratio at or above which no acquisition is triggered
    /// (`VARIETY_THRESHOLD`).
    pub variety_threshold: f64,
    /// Upper bound on one acquisition's wall time (`ACQUIRE_TIMEOUT_MS`).
    pub acquire_timeout: Duration,
    /// Catalog HTTP timeout (`HTTP_TIMEOUT_MS`).
    pub http_timeout: Duration,
    /// Installation root (`INSTALL_ROOT`).
    pub install_root: PathBuf,
    /// Discovery cache TTL (`DISCOVERY_CACHE_TTL_MS`).
    pub discovery_cache_ttl: Duration,
    /// Acquisition concurrency bound (`MAX_CONCURRENT_ACQUISITIONS`).
    pub max_concurrent_acquisitions: usize,
    /// Pending acquisitions beyond the concurrency bound; overflow drops.
    pub acquisition_queue_depth: usize,
    /// Tool-server restart policy (`MAX_RESTARTS`, `RESTART_WINDOW_MS`).
    pub restart_policy: RestartPolicy,
    /// Tool-server health-check interval.
    pub health_interval: Duration,
    /// Tool-server handshake timeout.
    pub init_timeout: Duration,
    /// Grace given to a stopping tool server.
    pub stop_grace: Duration,
    /// Grace given to in-flight acquisitions at shutdown.
    pub shutdown_grace: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(30_000),
            variety_threshold: 0.85,
            acquire_timeout: Duration::from_millis(120_000),
            http_timeout: Duration::from_millis(10_000),
            install_root: std::env::temp_dir().join("quartermaster-install"),
            discovery_cache_ttl: Duration::from_millis(300_000),
            max_concurrent_acquisitions: 3,
            acquisition_queue_depth: 16,
            restart_policy: RestartPolicy::default(),
            health_interval: mcp::DEFAULT_HEALTH_INTERVAL,
            init_timeout: mcp::DEFAULT_INIT_TIMEOUT,
            stop_grace: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

impl Settings {
    /// Defaults overridden by the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden through an arbitrary lookup. Unparsable values
    /// are warned about and ignored.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut settings = Self::default();
        if let Some(v) = parse_ms(&lookup, "ACQUIRE_INTERVAL_MS") {
            settings.tick_interval = v;
        }
        if let Some(v) = parse_num::<f64>(&lookup, "VARIETY_THRESHOLD") {
            settings.variety_threshold = v;
        }
        if let Some(v) = parse_ms(&lookup, "ACQUIRE_TIMEOUT_MS") {
            settings.acquire_timeout = v;
        }
        if let Some(v) = parse_ms(&lookup, "HTTP_TIMEOUT_MS") {
            settings.http_timeout = v;
        }
        if let Some(v) = lookup("INSTALL_ROOT") {
            settings.install_root = PathBuf::from(v);
        }
        if let Some(v) = parse_ms(&lookup, "DISCOVERY_CACHE_TTL_MS") {
            settings.discovery_cache_ttl = v;
        }
        if let Some(v) = parse_num::<usize>(&lookup, "MAX_CONCURRENT_ACQUISITIONS") {
            settings.max_concurrent_acquisitions = v.max(1);
        }
        if let Some(v) = parse_num::<u32>(&lookup, "MAX_RESTARTS") {
            settings.restart_policy.max_restarts = v;
        }
        if let Some(v) = parse_ms(&lookup, "RESTART_WINDOW_MS") {
            settings.restart_policy.window = v;
        }
        settings
    }
}

fn parse_ms(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<Duration> {
    parse_num::<u64>(lookup, key).map(Duration::from_millis)
}

fn parse_num<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Option<T> {
    let raw = lookup(key)?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, raw, "ignoring unparsable environment value");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_contract() {
        let s = Settings::default();
        assert_eq!(s.tick_interval, Duration::from_secs(30));
        assert_eq!(s.variety_threshold, 0.85);
        assert_eq!(s.acquire_timeout, Duration::from_secs(120));
        assert_eq!(s.max_concurrent_acquisitions, 3);
        assert_eq!(s.restart_policy.max_restarts, 5);
        assert_eq!(s.restart_policy.window, Duration::from_secs(60));
    }

    #[test]
    fn environment_overrides_apply() {
        let s = Settings::from_lookup(lookup_from(&[
            ("ACQUIRE_INTERVAL_MS", "5000"),
            ("VARIETY_THRESHOLD", "0.9"),
            ("MAX_RESTARTS", "2"),
            ("RESTART_WINDOW_MS", "10000"),
            ("INSTALL_ROOT", "/opt/qm"),
        ]));
        assert_eq!(s.tick_interval, Duration::from_secs(5));
        assert_eq!(s.variety_threshold, 0.9);
        assert_eq!(s.restart_policy.max_restarts, 2);
        assert_eq!(s.restart_policy.window, Duration::from_secs(10));
        assert_eq!(s.install_root, PathBuf::from("/opt/qm"));
    }

    #[test]
    fn garbage_values_fall_back_to_defaults() {
        let s = Settings::from_lookup(lookup_from(&[
            ("ACQUIRE_INTERVAL_MS", "soon"),
            ("VARIETY_THRESHOLD", "high"),
        ]));
        assert_eq!(s.tick_interval, Duration::from_secs(30));
        assert_eq!(s.variety_threshold, 0.85);
    }
}
