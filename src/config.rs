/**
 * Configuration constants and the loadable configuration tree
 */
use crate::error::{Error, Result};
use crate::k8s::remote::ResourceKind;
use crate::watch::BreakerScope;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Delay before the first reconnect attempt, in milliseconds
pub const INITIAL_BACKOFF_MS: u64 = 1_000;

/// Maximum delay between reconnect attempts, in milliseconds
pub const MAX_BACKOFF_MS: u64 = 60_000;

/// Fraction of the computed delay added as jitter (never subtracted)
pub const BACKOFF_JITTER: f64 = 0.2;

/// Consecutive failures that trip a circuit breaker
pub const BREAKER_THRESHOLD: u32 = 5;

/// How long a tripped breaker stays open, in seconds
pub const BREAKER_COOLDOWN_SECONDS: u64 = 30;

/// How often a session re-checks an open breaker, in milliseconds
pub const BREAKER_POLL_INTERVAL_MS: u64 = 1_000;

/// Per-subscription delta buffer; older deltas are overwritten when full
pub const SINK_CAPACITY: usize = 256;

/// Watch stream timeout in seconds (294 vs 300 to allow 6 seconds for graceful shutdown)
pub const WATCH_TIMEOUT_SECONDS: u32 = 294;

/// Lines fetched from the log tail on the first connect of a log subscription
pub const DEFAULT_LOG_TAIL_LINES: i64 = 100;

/// Default drain window for `stop`
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECONDS: u64 = 5;

/// Validate configuration constants at compile time
const _: () = {
    assert!(INITIAL_BACKOFF_MS > 0, "INITIAL_BACKOFF_MS must be greater than 0");
    assert!(MAX_BACKOFF_MS >= INITIAL_BACKOFF_MS, "MAX_BACKOFF_MS must not be below INITIAL_BACKOFF_MS");
    assert!(BREAKER_THRESHOLD > 0, "BREAKER_THRESHOLD must be greater than 0");
    assert!(BREAKER_COOLDOWN_SECONDS > 0, "BREAKER_COOLDOWN_SECONDS must be greater than 0");
    assert!(BREAKER_POLL_INTERVAL_MS > 0, "BREAKER_POLL_INTERVAL_MS must be greater than 0");
    assert!(SINK_CAPACITY > 0, "SINK_CAPACITY must be greater than 0");
    assert!(WATCH_TIMEOUT_SECONDS > 0, "WATCH_TIMEOUT_SECONDS must be greater than 0");
};

/// Root configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub log_level: String,
    /// Namespace used by the binary when none is given on the command line
    pub namespace: Option<String>,
    pub backoff: BackoffConfig,
    pub breaker: BreakerConfig,
    pub sink_capacity: usize,
    pub watch_timeout_secs: u32,
    pub graph: GraphConfig,
    pub events: EventsConfig,
    pub logs: LogsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct BackoffConfig {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub jitter: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct BreakerConfig {
    pub threshold: u32,
    pub cooldown_secs: u64,
    pub poll_interval_ms: u64,
    pub scope: BreakerScope,
}

/// Kinds watched by the graph manager and the cross-kind reference rules between them
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct GraphConfig {
    pub kinds: Vec<ResourceKind>,
    pub references: Vec<ReferenceRule>,
}

/// An edge derived from a name held in one object's field
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceRule {
    pub from_kind: String,
    /// Dot separated path to the referenced name, e.g. `spec.templateRef.name`
    pub path: String,
    pub to_kind: String,
    pub relation: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct EventsConfig {
    pub primary: ResourceKind,
    pub fallback: ResourceKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct LogsConfig {
    pub tail_lines: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            namespace: None,
            backoff: BackoffConfig::default(),
            breaker: BreakerConfig::default(),
            sink_capacity: SINK_CAPACITY,
            watch_timeout_secs: WATCH_TIMEOUT_SECONDS,
            graph: GraphConfig::default(),
            events: EventsConfig::default(),
            logs: LogsConfig::default(),
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: INITIAL_BACKOFF_MS,
            max_ms: MAX_BACKOFF_MS,
            jitter: BACKOFF_JITTER,
        }
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            threshold: BREAKER_THRESHOLD,
            cooldown_secs: BREAKER_COOLDOWN_SECONDS,
            poll_interval_ms: BREAKER_POLL_INTERVAL_MS,
            scope: BreakerScope::default(),
        }
    }
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            kinds: vec![
                ResourceKind::new("apps", "v1", "Deployment", "deployments"),
                ResourceKind::new("apps", "v1", "ReplicaSet", "replicasets"),
                ResourceKind::new("", "v1", "Pod", "pods"),
            ],
            references: Vec::new(),
        }
    }
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            primary: ResourceKind::new("events.k8s.io", "v1", "Event", "events"),
            fallback: ResourceKind::new("", "v1", "Event", "events"),
        }
    }
}

impl Default for LogsConfig {
    fn default() -> Self {
        Self {
            tail_lines: DEFAULT_LOG_TAIL_LINES,
        }
    }
}

impl BackoffConfig {
    #[must_use]
    pub const fn initial(&self) -> Duration {
        Duration::from_millis(self.initial_ms)
    }

    #[must_use]
    pub const fn max(&self) -> Duration {
        Duration::from_millis(self.max_ms)
    }
}

impl BreakerConfig {
    #[must_use]
    pub const fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Config {
    /// Load configuration from an optional YAML file, then apply environment overrides
    ///
    /// Precedence (highest first): `KUBEDELTA_*` environment variables, the file, built-in defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if the result fails validation
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let contents = std::fs::read_to_string(path).map_err(|e| {
                    Error::Config(format!("failed to read {}: {e}", path.display()))
                })?;
                Self::from_yaml(&contents)?
            }
            None => Self::default(),
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    ///
    /// Returns an error if the document is not valid YAML for this schema
    pub fn from_yaml(contents: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(contents)?)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("KUBEDELTA_LOG_LEVEL") {
            if !level.is_empty() {
                self.log_level = level;
            }
        }
        if let Ok(ns) = std::env::var("KUBEDELTA_NAMESPACE") {
            self.namespace = match ns.as_str() {
                "" | "all" | "-A" => None,
                _ => Some(ns),
            };
        }
    }

    /// Reject settings that would make the watch machinery misbehave
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` naming the first offending setting
    pub fn validate(&self) -> Result<()> {
        if self.backoff.initial_ms == 0 {
            return Err(Error::Config("backoff.initialMs must be greater than 0".into()));
        }
        if self.backoff.max_ms < self.backoff.initial_ms {
            return Err(Error::Config("backoff.maxMs must not be below backoff.initialMs".into()));
        }
        if !(0.0..=1.0).contains(&self.backoff.jitter) {
            return Err(Error::Config("backoff.jitter must be within [0, 1]".into()));
        }
        if self.breaker.threshold == 0 {
            return Err(Error::Config("breaker.threshold must be greater than 0".into()));
        }
        if self.breaker.poll_interval_ms == 0 {
            return Err(Error::Config("breaker.pollIntervalMs must be greater than 0".into()));
        }
        if self.sink_capacity == 0 {
            return Err(Error::Config("sinkCapacity must be greater than 0".into()));
        }
        for rule in &self.graph.references {
            for kind in [&rule.from_kind, &rule.to_kind] {
                if !self.graph.kinds.iter().any(|k| &k.kind == kind) {
                    return Err(Error::Config(format!(
                        "reference rule {} -> {} names unwatched kind {kind}",
                        rule.from_kind, rule.to_kind
                    )));
                }
            }
        }
        Ok(())
    }
}
