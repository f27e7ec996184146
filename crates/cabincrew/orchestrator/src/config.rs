//! Configuration for the orchestrator

use std::path::PathBuf;
use std::time::Duration;

use cabincrew_types::AggregationMethod;
use cabincrew_wal::{SyncMode, WalConfig};
use serde::{Deserialize, Serialize};

/// Main orchestrator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Protocol version written into engine requests and plan tokens
    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,

    /// Engine subprocess configuration
    #[serde(default)]
    pub engine: EngineConfig,

    /// Preflight policy configuration
    #[serde(default)]
    pub policy: PolicyConfig,

    /// Take-off integrity configuration
    #[serde(default)]
    pub integrity: IntegrityConfig,

    /// Write-ahead log configuration
    #[serde(default)]
    pub wal: WalSettings,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            protocol_version: default_protocol_version(),
            engine: EngineConfig::default(),
            policy: PolicyConfig::default(),
            integrity: IntegrityConfig::default(),
            wal: WalSettings::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Engine subprocess configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Program to spawn for each engine call
    #[serde(default)]
    pub command: Option<String>,

    /// Arguments passed to the program
    #[serde(default)]
    pub args: Vec<String>,

    /// Working directory of the engine process
    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    /// Engine call timeout in seconds
    #[serde(default = "default_engine_timeout")]
    pub timeout_secs: u64,

    /// Most bytes read from each of the engine's stdout and stderr
    #[serde(default = "default_engine_max_output")]
    pub max_output_bytes: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            command: None,
            args: Vec::new(),
            working_dir: None,
            timeout_secs: default_engine_timeout(),
            max_output_bytes: default_engine_max_output(),
        }
    }
}

impl EngineConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Preflight policy configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default)]
    pub aggregation_method: AggregationMethod,

    /// Role asked to approve when a policy does not name one
    #[serde(default = "default_approval_role")]
    pub default_approval_role: String,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            aggregation_method: AggregationMethod::default(),
            default_approval_role: default_approval_role(),
        }
    }
}

/// Take-off integrity configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IntegrityConfig {
    /// Honour operator overrides of a failed plan-token check
    #[serde(default)]
    pub allow_override: bool,
}

/// Write-ahead log configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalSettings {
    /// Directory holding one log per workflow. `None` keeps the log in memory.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    #[serde(default)]
    pub sync_mode: SyncMode,

    /// Segment rotation threshold in bytes
    #[serde(default = "default_max_segment_size")]
    pub max_segment_size: u64,

    /// Appends between fsyncs in batched mode
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
}

impl Default for WalSettings {
    fn default() -> Self {
        Self {
            data_dir: None,
            sync_mode: SyncMode::default(),
            max_segment_size: default_max_segment_size(),
            batch_size: default_batch_size(),
        }
    }
}

impl WalSettings {
    pub fn wal_config(&self) -> WalConfig {
        WalConfig {
            max_segment_size: self.max_segment_size,
            sync_mode: self.sync_mode,
            batch_size: self.batch_size,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// JSON format
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// Default value helpers
fn default_protocol_version() -> String {
    "1".to_string()
}

fn default_engine_timeout() -> u64 {
    300
}

fn default_engine_max_output() -> u64 {
    16 * 1024 * 1024
}

fn default_approval_role() -> String {
    cabincrew_policy::DEFAULT_APPROVAL_ROLE.to_string()
}

fn default_max_segment_size() -> u64 {
    64 * 1024 * 1024
}

fn default_batch_size() -> u32 {
    64
}

fn default_log_level() -> String {
    "info".to_string()
}

impl OrchestratorConfig {
    /// Load configuration from defaults, an optional file and the environment.
    ///
    /// Environment variables use the `CABINCREW_` prefix and `__` between
    /// nested keys, e.g. `CABINCREW_ENGINE__TIMEOUT_SECS=60`.
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        // Add default configuration
        builder = builder.add_source(config::Config::try_from(&OrchestratorConfig::default())?);

        // Add file configuration if provided
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("CABINCREW")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    /// Configuration for tests and local runs: in-memory WAL, short timeout.
    pub fn ephemeral() -> Self {
        Self {
            engine: EngineConfig {
                timeout_secs: 30,
                ..EngineConfig::default()
            },
            ..Default::default()
        }
    }
}
