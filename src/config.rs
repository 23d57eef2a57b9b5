//! Configuration module for pingcheck.
//!
//! Loads configuration from environment variables, optionally seeded from a
//! `.env` file. Startup settings live in [`ServerConfig`]; the tuning knobs the
//! workers read on every tick live in [`MonitorConfig`] and can be reloaded
//! while the process runs through a [`ConfigHandle`].

use std::collections::{HashMap, HashSet};
use std::env;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tokio::sync::watch;

/// How often a target's reachability is re-checked.
pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Timeout for the plain reachability request of a health check.
pub const REACHABILITY_TIMEOUT: Duration = Duration::from_secs(1);

/// Configuration error types. All of them are fatal at startup.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
    #[error("targets file {path}: {reason}")]
    TargetsFile { path: String, reason: String },
}

fn invalid(name: &'static str, reason: impl Display) -> ConfigError {
    ConfigError::Invalid {
        name,
        reason: reason.to_string(),
    }
}

/// Parameters of the per-target statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct StatsConfig {
    /// Capacity of the history, received-flag and baseline windows.
    pub ping_history: usize,
    /// EWMA smoothing factor, in (0, 1].
    pub alpha: f64,
    /// Relative margin above the baseline before the average is abnormal.
    pub margin: f64,
    /// Loss fraction tolerated before a target is abnormal.
    pub acceptable_loss: f64,
    /// Relation between baseline and the maximum tolerated jitter.
    pub jitter_margin: f64,
    /// Time to fully cycle the baseline window.
    pub time_to_refresh: Duration,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            ping_history: 30,
            alpha: 0.1,
            margin: 0.5,
            acceptable_loss: 0.05,
            jitter_margin: 1.0,
            time_to_refresh: Duration::from_secs(3600),
        }
    }
}

impl StatsConfig {
    /// Minimum time between two time-decay evictions of the baseline.
    pub fn eviction_interval(&self) -> Duration {
        self.time_to_refresh / self.ping_history.max(1) as u32
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.ping_history == 0 {
            return Err(invalid("PING_HISTORY", "must be at least 1"));
        }
        if self.alpha.is_nan() || self.alpha <= 0.0 || self.alpha > 1.0 {
            return Err(invalid("ALPHA", "must be in (0, 1]"));
        }
        if self.margin.is_nan() || self.margin < 0.0 {
            return Err(invalid("MARGIN", "must not be negative"));
        }
        if !(0.0..=1.0).contains(&self.acceptable_loss) {
            return Err(invalid("ACCEPTABLE_LOSS", "must be in [0, 1]"));
        }
        if self.jitter_margin.is_nan() || self.jitter_margin < 0.0 {
            return Err(invalid("JITTER_MARGIN", "must not be negative"));
        }
        if self.time_to_refresh.is_zero() {
            return Err(invalid("TIME_TO_REFRESH", "must be positive"));
        }
        Ok(())
    }
}

/// Settings the workers read on every tick. Swapped as a whole on reload.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorConfig {
    pub stats: StatsConfig,
    /// Timeout of a relay ping request.
    pub probe_timeout: Duration,
    /// Delay between two iterations of a worker.
    pub tick: Duration,
    /// A target is not probed again before this much time has passed.
    pub min_probe_spacing: Duration,
    /// Reliable address pinged through each target during health checks.
    pub health_test_ip: Option<String>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            stats: StatsConfig::default(),
            probe_timeout: Duration::from_secs(2),
            tick: Duration::from_millis(100),
            min_probe_spacing: Duration::from_secs(1),
            health_test_ip: None,
        }
    }
}

impl MonitorConfig {
    /// Load from the process environment.
    ///
    /// Environment variables:
    /// - `PING_HISTORY`, `ALPHA`, `MARGIN`, `ACCEPTABLE_LOSS`, `JITTER_MARGIN`
    /// - `TIME_TO_REFRESH`, `PINGING_TIMEOUT`, `PING_INTERVAL`, `MIN_PROBE_SPACING` (seconds)
    /// - `HEALTH_TEST_IP` (optional)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let cfg = Self {
            stats: StatsConfig {
                ping_history: parse_or(&lookup, "PING_HISTORY", defaults.stats.ping_history)?,
                alpha: parse_or(&lookup, "ALPHA", defaults.stats.alpha)?,
                margin: parse_or(&lookup, "MARGIN", defaults.stats.margin)?,
                acceptable_loss: parse_or(
                    &lookup,
                    "ACCEPTABLE_LOSS",
                    defaults.stats.acceptable_loss,
                )?,
                jitter_margin: parse_or(&lookup, "JITTER_MARGIN", defaults.stats.jitter_margin)?,
                time_to_refresh: seconds_or(
                    &lookup,
                    "TIME_TO_REFRESH",
                    defaults.stats.time_to_refresh,
                )?,
            },
            probe_timeout: seconds_or(&lookup, "PINGING_TIMEOUT", defaults.probe_timeout)?,
            tick: seconds_or(&lookup, "PING_INTERVAL", defaults.tick)?,
            min_probe_spacing: seconds_or(
                &lookup,
                "MIN_PROBE_SPACING",
                defaults.min_probe_spacing,
            )?,
            health_test_ip: var(&lookup, "HEALTH_TEST_IP"),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.stats.validate()?;
        if self.probe_timeout.is_zero() {
            return Err(invalid("PINGING_TIMEOUT", "must be positive"));
        }
        if self.tick.is_zero() {
            return Err(invalid("PING_INTERVAL", "must be positive"));
        }
        Ok(())
    }
}

/// Status-page reporting target.
#[derive(Debug, Clone)]
pub struct ReportConfig {
    /// Base URL of the status page.
    pub url: String,
    pub api_key: String,
    pub metric_id: i64,
}

/// Startup configuration. Not reloaded.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// JSON file holding `[id, name, address]` triples.
    pub servers_file: PathBuf,
    /// Address of this monitor, pinged by each target's relay.
    pub source_ip: String,
    /// Bind host of the snapshot API (default: "0.0.0.0")
    pub host: String,
    /// Port of the snapshot API (default: 8080)
    pub http_port: u16,
    /// Path to the SQLite database file (default: "pingcheck.db")
    pub db_path: String,
    /// Number of probing workers (default: 4)
    pub worker_count: usize,
    /// Period of the reporting loop (default: 60s)
    pub report_interval: Duration,
    /// `None` when `URL`, `API_KEY` or `METRIC_ID` is unset.
    pub report: Option<ReportConfig>,
}

impl ServerConfig {
    /// Load from the process environment.
    ///
    /// `SERVERS_FILE` and `IP` are required. `HOST`, `PORT`, `DB_PATH`,
    /// `WORKER_COUNT`, `INTERVAL`, `URL`, `API_KEY` and `METRIC_ID` are optional.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let servers_file = var(&lookup, "SERVERS_FILE")
            .map(PathBuf::from)
            .ok_or(ConfigError::Missing("SERVERS_FILE"))?;
        let source_ip = var(&lookup, "IP").ok_or(ConfigError::Missing("IP"))?;

        let worker_count: usize = parse_or(&lookup, "WORKER_COUNT", 4)?;
        if worker_count == 0 {
            return Err(invalid("WORKER_COUNT", "must be at least 1"));
        }

        let report_interval = seconds_or(&lookup, "INTERVAL", Duration::from_secs(60))?;
        if report_interval.is_zero() {
            return Err(invalid("INTERVAL", "must be positive"));
        }

        let report = match (
            var(&lookup, "URL"),
            var(&lookup, "API_KEY"),
            var(&lookup, "METRIC_ID"),
        ) {
            (Some(url), Some(api_key), Some(metric_id)) => Some(ReportConfig {
                url: url.trim_end_matches('/').to_string(),
                api_key,
                metric_id: metric_id.parse().map_err(|e| invalid("METRIC_ID", e))?,
            }),
            _ => None,
        };

        Ok(Self {
            servers_file,
            source_ip,
            host: var(&lookup, "HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            http_port: parse_or(&lookup, "PORT", 8080)?,
            db_path: var(&lookup, "DB_PATH").unwrap_or_else(|| "pingcheck.db".to_string()),
            worker_count,
            report_interval,
            report,
        })
    }
}

/// Read the `.env` file into the process environment.
///
/// Only call this at startup, before any other thread reads the environment.
pub fn load_dotenv() {
    match dotenvy::dotenv() {
        Ok(path) => tracing::debug!("Loaded environment from {}", path.display()),
        Err(e) if e.not_found() => {}
        Err(e) => tracing::warn!("Failed to read .env file: {}", e),
    }
}

/// Parse the `.env` file without touching the process environment.
///
/// A missing file yields an empty map.
pub fn read_dotenv() -> Result<HashMap<String, String>, ConfigError> {
    let iter = match dotenvy::from_filename_iter(".env") {
        Ok(iter) => iter,
        Err(e) if e.not_found() => return Ok(HashMap::new()),
        Err(e) => return Err(invalid(".env", e)),
    };

    iter.collect::<Result<HashMap<_, _>, _>>()
        .map_err(|e| invalid(".env", e))
}

/// Shared, atomically swappable [`MonitorConfig`].
pub struct ConfigHandle {
    tx: watch::Sender<Arc<MonitorConfig>>,
}

impl ConfigHandle {
    pub fn new(initial: MonitorConfig) -> Self {
        let (tx, _) = watch::channel(Arc::new(initial));
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<MonitorConfig>> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> Arc<MonitorConfig> {
        self.tx.borrow().clone()
    }

    /// Replace the current config. Returns whether anything changed.
    pub fn publish(&self, next: MonitorConfig) -> bool {
        self.tx.send_if_modified(|current| {
            if **current == next {
                return false;
            }
            *current = Arc::new(next);
            true
        })
    }

    /// Re-read `.env` over the environment, then publish the result.
    ///
    /// `.env` values win, as edits to the file are how a running process is
    /// retuned. Does blocking file I/O. On error the previous config stays
    /// in place.
    pub fn reload(&self) -> Result<bool, ConfigError> {
        let file = read_dotenv()?;
        self.reload_from(|name| file.get(name).cloned().or_else(|| env::var(name).ok()))
    }

    pub fn reload_from(
        &self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<bool, ConfigError> {
        let next = MonitorConfig::from_lookup(lookup)?;
        Ok(self.publish(next))
    }
}

/// One monitored endpoint as listed in the targets file.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetSpec {
    pub id: i64,
    pub name: String,
    pub address: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Number(i64),
    Text(String),
}

/// Load the target list from a JSON array of `[id, name, address]` triples.
pub fn load_targets(path: &Path) -> Result<Vec<TargetSpec>, ConfigError> {
    let file_err = |reason: String| ConfigError::TargetsFile {
        path: path.display().to_string(),
        reason,
    };

    let content = std::fs::read_to_string(path).map_err(|e| file_err(e.to_string()))?;
    parse_targets(&content).map_err(file_err)
}

fn parse_targets(content: &str) -> Result<Vec<TargetSpec>, String> {
    let rows: Vec<(RawId, String, String)> =
        serde_json::from_str(content).map_err(|e| e.to_string())?;

    let mut seen = HashSet::new();
    let mut targets = Vec::with_capacity(rows.len());

    for (raw_id, name, address) in rows {
        let id = match raw_id {
            RawId::Number(n) => n,
            RawId::Text(s) => s
                .trim()
                .parse()
                .map_err(|_| format!("target id {:?} is not an integer", s))?,
        };
        if !seen.insert(id) {
            return Err(format!("duplicate target id {}", id));
        }
        if address.trim().is_empty() {
            return Err(format!("target {} has an empty address", id));
        }
        targets.push(TargetSpec { id, name, address });
    }

    Ok(targets)
}

fn var(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_or<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match var(lookup, name) {
        Some(raw) => raw.parse().map_err(|e| invalid(name, e)),
        None => Ok(default),
    }
}

fn seconds_or(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    match var(lookup, name) {
        Some(raw) => {
            let secs: f64 = raw.parse().map_err(|e| invalid(name, e))?;
            Duration::try_from_secs_f64(secs).map_err(|e| invalid(name, e))
        }
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_default_monitor_config() {
        let cfg = MonitorConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(cfg, MonitorConfig::default());
        assert_eq!(cfg.stats.eviction_interval(), Duration::from_secs(120));
    }

    #[test]
    fn test_monitor_config_overrides() {
        let cfg = MonitorConfig::from_lookup(lookup(&[
            ("PING_HISTORY", "5"),
            ("ALPHA", "0.5"),
            ("PINGING_TIMEOUT", "0.75"),
            ("HEALTH_TEST_IP", " 8.8.8.8 "),
        ]))
        .unwrap();
        assert_eq!(cfg.stats.ping_history, 5);
        assert_eq!(cfg.stats.alpha, 0.5);
        assert_eq!(cfg.probe_timeout, Duration::from_millis(750));
        assert_eq!(cfg.health_test_ip.as_deref(), Some("8.8.8.8"));
    }

    #[test]
    fn test_monitor_config_rejects_bad_values() {
        let err = MonitorConfig::from_lookup(lookup(&[("ALPHA", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "ALPHA", .. }));

        let err = MonitorConfig::from_lookup(lookup(&[("PING_HISTORY", "abc")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "PING_HISTORY", .. }));

        let err = MonitorConfig::from_lookup(lookup(&[("ACCEPTABLE_LOSS", "1.5")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "ACCEPTABLE_LOSS", .. }));

        let err = MonitorConfig::from_lookup(lookup(&[("TIME_TO_REFRESH", "-3")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "TIME_TO_REFRESH", .. }));
    }

    #[test]
    fn test_reload_publishes_changes() {
        let handle = ConfigHandle::new(MonitorConfig::default());
        let mut rx = handle.subscribe();

        assert!(handle.reload_from(lookup(&[("ALPHA", "0.3")])).unwrap());
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().stats.alpha, 0.3);

        // Same values again is not a change.
        assert!(!handle.reload_from(lookup(&[("ALPHA", "0.3")])).unwrap());
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn test_invalid_reload_keeps_previous_config() {
        let handle = ConfigHandle::new(MonitorConfig::default());
        handle.reload_from(lookup(&[("PING_HISTORY", "10")])).unwrap();
        let before = handle.current();

        let err = handle
            .reload_from(lookup(&[("PING_HISTORY", "20"), ("ALPHA", "7")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "ALPHA", .. }));
        assert_eq!(handle.current(), before);
        assert_eq!(handle.current().stats.ping_history, 10);
    }

    #[test]
    fn test_server_config_requires_targets_and_ip() {
        let err = ServerConfig::from_lookup(lookup(&[("IP", "10.0.0.1")])).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("SERVERS_FILE")));

        let err = ServerConfig::from_lookup(lookup(&[("SERVERS_FILE", "s.json")])).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("IP")));
    }

    #[test]
    fn test_server_config_reporting_needs_all_fields() {
        let base = [("SERVERS_FILE", "s.json"), ("IP", "10.0.0.1")];
        let cfg = ServerConfig::from_lookup(lookup(&base)).unwrap();
        assert!(cfg.report.is_none());
        assert_eq!(cfg.http_port, 8080);
        assert_eq!(cfg.worker_count, 4);

        let cfg = ServerConfig::from_lookup(lookup(&[
            base[0],
            base[1],
            ("URL", "https://status.example.com/"),
            ("API_KEY", "secret"),
            ("METRIC_ID", "3"),
        ]))
        .unwrap();
        let report = cfg.report.unwrap();
        assert_eq!(report.url, "https://status.example.com");
        assert_eq!(report.metric_id, 3);
    }

    #[test]
    fn test_server_config_rejects_zero_workers() {
        let err = ServerConfig::from_lookup(lookup(&[
            ("SERVERS_FILE", "s.json"),
            ("IP", "10.0.0.1"),
            ("WORKER_COUNT", "0"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "WORKER_COUNT", .. }));
    }

    #[test]
    fn test_parse_targets() {
        let targets =
            parse_targets(r#"[[1, "Sao Paulo", "10.0.0.2:8000"], ["2", "Miami", "10.0.0.3"]]"#)
                .unwrap();
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].id, 1);
        assert_eq!(targets[1].id, 2);
        assert_eq!(targets[1].name, "Miami");

        assert!(parse_targets(r#"[[1, "a", "x"], [1, "b", "y"]]"#)
            .unwrap_err()
            .contains("duplicate"));
        assert!(parse_targets(r#"[["one", "a", "x"]]"#).is_err());
        assert!(parse_targets(r#"{"id": 1}"#).is_err());
    }

    #[test]
    fn test_load_targets_missing_file() {
        let err = load_targets(Path::new("/nonexistent/servers.json")).unwrap_err();
        assert!(matches!(err, ConfigError::TargetsFile { .. }));
    }

    #[test]
    fn test_config_handle_publish() {
        let handle = ConfigHandle::new(MonitorConfig::default());
        let rx = handle.subscribe();

        assert!(!handle.publish(MonitorConfig::default()));

        let mut next = MonitorConfig::default();
        next.stats.ping_history = 10;
        assert!(handle.publish(next));
        assert_eq!(rx.borrow().stats.ping_history, 10);
        assert_eq!(handle.current().stats.ping_history, 10);
    }
}
