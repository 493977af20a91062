//! Configuration for the `threadsync` engine and demo binary.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/threadsync/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.

use std::path::PathBuf;
use std::time::Duration;

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    sync: SyncFileConfig,
    remote: RemoteFileConfig,
    demo: DemoFileConfig,
}

/// `[sync]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct SyncFileConfig {
    page_size: Option<usize>,
    event_buffer: Option<usize>,
    live_buffer: Option<usize>,
}

/// `[remote]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct RemoteFileConfig {
    request_timeout_ms: Option<u64>,
}

/// `[demo]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct DemoFileConfig {
    conversation_id: Option<String>,
    sender_id: Option<String>,
    history_size: Option<usize>,
    timestamp_format: Option<String>,
}

// ---------------------------------------------------------------------------
// Resolved configuration (concrete types, all fields populated)
// ---------------------------------------------------------------------------

/// Engine configuration (used by `ConversationSyncEngine`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Messages requested per history page.
    pub page_size: usize,
    /// Capacity of the engine's event channel.
    pub event_buffer: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            page_size: 20,
            event_buffer: 64,
        }
    }
}

/// Fully resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    // -- Sync --
    /// Engine settings.
    pub sync: SyncConfig,
    /// Capacity of each live subscription's snapshot channel.
    pub live_buffer: usize,

    // -- Remote --
    /// Deadline for each remote request.
    pub request_timeout: Duration,

    // -- Demo --
    /// Conversation the demo opens.
    pub conversation_id: String,
    /// Identity the demo sends as.
    pub sender_id: String,
    /// Number of history messages the demo backend is seeded with.
    pub history_size: usize,
    /// Timestamp display format string (chrono).
    pub timestamp_format: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            sync: SyncConfig::default(),
            live_buffer: 32,
            request_timeout: Duration::from_secs(10),
            conversation_id: "general".to_string(),
            sender_id: "me".to_string(),
            history_size: 45,
            timestamp_format: "%H:%M".to_string(),
        }
    }
}

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// If `--config` is given and the file does not exist, returns an error.
    /// Otherwise the default path (`~/.config/threadsync/config.toml`) is
    /// tried and silently ignored if missing.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the config file cannot be read or parsed.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    /// Resolve a `ClientConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default.
    #[must_use]
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let defaults = Self::default();

        Self {
            sync: SyncConfig {
                page_size: cli
                    .page_size
                    .or(file.sync.page_size)
                    .unwrap_or(defaults.sync.page_size),
                event_buffer: file
                    .sync
                    .event_buffer
                    .unwrap_or(defaults.sync.event_buffer),
            },
            live_buffer: file.sync.live_buffer.unwrap_or(defaults.live_buffer),
            request_timeout: file
                .remote
                .request_timeout_ms
                .map_or(defaults.request_timeout, Duration::from_millis),
            conversation_id: cli
                .conversation
                .clone()
                .or_else(|| file.demo.conversation_id.clone())
                .unwrap_or(defaults.conversation_id),
            sender_id: cli
                .sender
                .clone()
                .or_else(|| file.demo.sender_id.clone())
                .unwrap_or(defaults.sender_id),
            history_size: cli
                .history_size
                .or(file.demo.history_size)
                .unwrap_or(defaults.history_size),
            timestamp_format: cli
                .timestamp_format
                .clone()
                .or_else(|| file.demo.timestamp_format.clone())
                .unwrap_or(defaults.timestamp_format),
        }
    }

    /// The engine settings.
    #[must_use]
    pub fn to_sync_config(&self) -> SyncConfig {
        self.sync.clone()
    }
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Conversation sync engine demo")]
pub struct CliArgs {
    /// Conversation to open.
    #[arg(long, env = "THREADSYNC_CONVERSATION")]
    pub conversation: Option<String>,

    /// Identity to send as.
    #[arg(long, env = "THREADSYNC_SENDER")]
    pub sender: Option<String>,

    /// Messages per history page.
    #[arg(long)]
    pub page_size: Option<usize>,

    /// Number of history messages to seed the demo backend with.
    #[arg(long)]
    pub history_size: Option<usize>,

    /// Path to config file (default: `~/.config/threadsync/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Timestamp display format (chrono format string).
    #[arg(long)]
    pub timestamp_format: Option<String>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "THREADSYNC_LOG")]
    pub log_level: String,

    /// Path to log file (default: `$TMPDIR/threadsync.log`).
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Load and parse a TOML config file.
///
/// If `explicit_path` is `Some`, the file must exist (error if not).
/// If `explicit_path` is `None`, the default path is tried and missing file
/// is treated as empty config.
fn load_config_file(explicit_path: Option<&std::path::Path>) -> Result<ConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(ConfigFile::default());
        };
        config_dir.join("threadsync").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
