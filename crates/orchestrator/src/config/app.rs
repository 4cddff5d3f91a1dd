//! Application configuration for the orchestrator server.

use serde::Deserialize;

/// Application configuration loaded from environment variables.
///
/// Environment variables are prefixed with `ORCH_`:
/// - `ORCH_HOST`: Server bind address (default: "0.0.0.0")
/// - `ORCH_PORT`: Server port (default: 8090)
/// - `ORCH_SERVER_NAME`: Server name for identification
/// - `ORCH_NATS_URL`: NATS URL for queue notifications (optional)
/// - `ORCH_MAX_VERSION_GAP_ALLOWED`: Recovery cycles a worker may lag before
///   it is reported as non-responding (default: 2)
/// - `ORCH_SPLIT_JOIN_BULK_SIZE`: Join sweep bulk size (default: 200)
/// - `ORCH_JOIN_INTERVAL_MS`: Join sweep interval (default: 1000)
/// - `ORCH_RECOVERY_INTERVAL_SECS`: Recovery sweep interval (default: 30)
/// - `ORCH_LOG_JSON`: Emit JSON logs (default: false)
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server bind address
    #[serde(default = "default_host")]
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Server name for identification
    #[serde(default = "default_server_name")]
    pub server_name: String,

    /// NATS URL (optional)
    #[serde(default)]
    pub nats_url: Option<String>,

    /// Maximum number of recovery cycles a worker may fall behind
    #[serde(default = "default_max_version_gap")]
    pub max_version_gap_allowed: i64,

    /// Number of join-ready suspended executions handled per sweep
    #[serde(default = "default_split_join_bulk_size")]
    pub split_join_bulk_size: usize,

    /// Join sweep interval in milliseconds
    #[serde(default = "default_join_interval_ms")]
    pub join_interval_ms: u64,

    /// Recovery sweep interval in seconds
    #[serde(default = "default_recovery_interval_secs")]
    pub recovery_interval_secs: u64,

    /// Emit logs as JSON lines
    #[serde(default)]
    pub log_json: bool,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8090
}

fn default_server_name() -> String {
    "orchestrator".to_string()
}

fn default_max_version_gap() -> i64 {
    2
}

fn default_split_join_bulk_size() -> usize {
    200
}

fn default_join_interval_ms() -> u64 {
    1000
}

fn default_recovery_interval_secs() -> u64 {
    30
}

/// Settings handed to the orchestration services at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Recovery cycles a worker may lag before it is non-responding.
    pub max_version_gap_allowed: i64,
    /// Default bulk size of the zero-argument join sweep.
    pub split_join_bulk_size: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_version_gap_allowed: default_max_version_gap(),
            split_join_bulk_size: default_split_join_bulk_size(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables are prefixed with `ORCH_`.
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::prefixed("ORCH_").from_env::<AppConfig>()
    }

    /// Get the server bind address as a string suitable for `TcpListener::bind`.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Settings for the orchestration services.
    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            max_version_gap_allowed: self.max_version_gap_allowed,
            split_join_bulk_size: self.split_join_bulk_size,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            server_name: default_server_name(),
            nats_url: None,
            max_version_gap_allowed: default_max_version_gap(),
            split_join_bulk_size: default_split_join_bulk_size(),
            join_interval_ms: default_join_interval_ms(),
            recovery_interval_secs: default_recovery_interval_secs(),
            log_json: false,
        }
    }
}
