//! WolfCoord Configuration
//!
//! This module provides configuration structures for a coordination
//! context, plus the per-mode timing view derived from them.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::degrade::Mode;

/// Main WolfCoord configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CoordConfig {
    /// Context-specific configuration
    #[serde(default)]
    pub node: NodeConfig,

    /// Heartbeat, lease and dedup timing
    #[serde(default)]
    pub coordination: CoordinationConfig,

    /// Shared persisted fallback channel
    #[serde(default)]
    pub fallback: FallbackConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Context-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique context identifier (generated when absent)
    #[serde(default)]
    pub id: Option<String>,

    /// Election rank, lower wins
    #[serde(default = "default_priority")]
    pub priority: u32,

    /// Contexts only coordinate with others in the same namespace
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

/// Coordination timing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationConfig {
    /// Heartbeat interval in milliseconds
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// A peer is dead after this many heartbeat intervals of silence
    #[serde(default = "default_liveness_timeout_multiplier")]
    pub liveness_timeout_multiplier: u32,

    /// Election window in milliseconds (defaults to one heartbeat interval)
    #[serde(default)]
    pub election_window_ms: Option<u64>,

    /// Default lease hold in milliseconds
    #[serde(default = "default_lease_hold_ms")]
    pub lease_hold_ms: u64,

    /// Query dedup window in milliseconds
    #[serde(default = "default_dedup_timeout_ms")]
    pub dedup_timeout_ms: u64,

    /// How long a request to the leader waits for its reply
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

/// Fallback channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackConfig {
    /// Use the shared SQLite mailbox when the primary transport is down
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Mailbox file shared by all contexts on the device
    #[serde(default = "default_fallback_path")]
    pub path: PathBuf,

    /// Heartbeat cadence while in Polling mode
    #[serde(default = "default_polling_interval_ms")]
    pub polling_interval_ms: u64,

    /// Mailbox rows older than this are pruned
    #[serde(default = "default_retention_ms")]
    pub retention_ms: u64,

    /// Re-probe cadence while degraded
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_priority() -> u32 {
    100
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_heartbeat_interval_ms() -> u64 {
    500
}

fn default_liveness_timeout_multiplier() -> u32 {
    3
}

fn default_lease_hold_ms() -> u64 {
    5000
}

fn default_dedup_timeout_ms() -> u64 {
    10_000
}

fn default_request_timeout_ms() -> u64 {
    1000
}

fn default_true() -> bool {
    true
}

fn default_fallback_path() -> PathBuf {
    std::env::temp_dir().join("wolfcoord.db")
}

fn default_polling_interval_ms() -> u64 {
    1000
}

fn default_retention_ms() -> u64 {
    60_000
}

fn default_probe_interval_ms() -> u64 {
    2000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: None,
            priority: default_priority(),
            namespace: default_namespace(),
        }
    }
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            liveness_timeout_multiplier: default_liveness_timeout_multiplier(),
            election_window_ms: None,
            lease_hold_ms: default_lease_hold_ms(),
            dedup_timeout_ms: default_dedup_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: default_fallback_path(),
            polling_interval_ms: default_polling_interval_ms(),
            retention_ms: default_retention_ms(),
            probe_interval_ms: default_probe_interval_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl CoordConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: CoordConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if matches!(self.node.id.as_deref(), Some("")) {
            return Err(crate::Error::Config("node.id cannot be empty".into()));
        }

        if self.node.namespace.is_empty() {
            return Err(crate::Error::Config("node.namespace cannot be empty".into()));
        }

        let c = &self.coordination;
        if c.heartbeat_interval_ms == 0 {
            return Err(crate::Error::Config(
                "coordination.heartbeat_interval_ms must be positive".into(),
            ));
        }

        // One missed beat must never be enough to declare a peer dead
        if c.liveness_timeout_multiplier < 2 {
            return Err(crate::Error::Config(
                "coordination.liveness_timeout_multiplier must be at least 2".into(),
            ));
        }

        if c.lease_hold_ms == 0 || c.dedup_timeout_ms == 0 || c.request_timeout_ms == 0 {
            return Err(crate::Error::Config(
                "lease_hold_ms, dedup_timeout_ms and request_timeout_ms must be positive".into(),
            ));
        }

        if c.election_window_ms == Some(0) {
            return Err(crate::Error::Config(
                "coordination.election_window_ms must be positive".into(),
            ));
        }

        if self.fallback.polling_interval_ms < c.heartbeat_interval_ms {
            return Err(crate::Error::Config(
                "fallback.polling_interval_ms cannot be shorter than the heartbeat interval".into(),
            ));
        }

        Ok(())
    }

    /// Get the configured id, or generate one for this context
    pub fn resolve_peer_id(&self) -> String {
        self.node
            .id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
    }

    /// Topic all coordination traffic of this namespace is sent on
    pub fn topic(&self) -> String {
        format!("wolfcoord/{}", self.node.namespace)
    }

    /// Get heartbeat interval as Duration
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.coordination.heartbeat_interval_ms)
    }

    /// Liveness timeout (multiplier x heartbeat interval)
    pub fn liveness_timeout(&self) -> Duration {
        self.heartbeat_interval() * self.coordination.liveness_timeout_multiplier
    }

    /// Get election window as Duration
    pub fn election_window(&self) -> Duration {
        self.coordination
            .election_window_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.heartbeat_interval())
    }

    /// Get default lease hold as Duration
    pub fn lease_hold(&self) -> Duration {
        Duration::from_millis(self.coordination.lease_hold_ms)
    }

    /// Get dedup timeout as Duration
    pub fn dedup_timeout(&self) -> Duration {
        Duration::from_millis(self.coordination.dedup_timeout_ms)
    }

    /// Get leader request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.coordination.request_timeout_ms)
    }

    /// Get polling interval as Duration
    pub fn polling_interval(&self) -> Duration {
        Duration::from_millis(self.fallback.polling_interval_ms)
    }

    /// Get fallback probe interval as Duration
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.fallback.probe_interval_ms)
    }

    /// Get mailbox retention as Duration
    pub fn retention(&self) -> Duration {
        Duration::from_millis(self.fallback.retention_ms)
    }

    /// Timing parameters for the given operating mode
    pub fn timing(&self, mode: Mode) -> Timing {
        let base = Timing {
            heartbeat_interval: self.heartbeat_interval(),
            liveness_timeout: self.liveness_timeout(),
            election_window: self.election_window(),
            lease_hold: self.lease_hold(),
            dedup_timeout: self.dedup_timeout(),
            request_timeout: self.request_timeout(),
        };

        match mode {
            Mode::Full | Mode::Standalone => base,
            Mode::Polling => {
                // Same state machine, stretched to the polling cadence
                let interval = self.polling_interval();
                let factor = interval.as_secs_f64() / base.heartbeat_interval.as_secs_f64();
                Timing {
                    heartbeat_interval: interval,
                    liveness_timeout: interval * self.coordination.liveness_timeout_multiplier,
                    election_window: base.election_window.mul_f64(factor),
                    lease_hold: base.lease_hold.max(interval * self.coordination.liveness_timeout_multiplier),
                    dedup_timeout: base.dedup_timeout,
                    request_timeout: base.request_timeout.mul_f64(factor),
                }
            }
        }
    }

    /// Sample configuration written by `wolfcoord init`
    pub fn sample(node_id: &str) -> String {
        format!(
            r#"# WolfCoord Configuration

[node]
id = "{node_id}"
priority = 100
namespace = "default"

[coordination]
heartbeat_interval_ms = 500
liveness_timeout_multiplier = 3
lease_hold_ms = 5000
dedup_timeout_ms = 10000
request_timeout_ms = 1000

[fallback]
enabled = true
path = "/tmp/wolfcoord.db"
polling_interval_ms = 1000
retention_ms = 60000
probe_interval_ms = 2000

[logging]
level = "info"
format = "pretty"
"#
        )
    }
}

/// Timing parameters the components run with in the current mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    pub heartbeat_interval: Duration,
    pub liveness_timeout: Duration,
    pub election_window: Duration,
    pub lease_hold: Duration,
    pub dedup_timeout: Duration,
    pub request_timeout: Duration,
}
