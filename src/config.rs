//! Configuration types.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;
use crate::pipeline::DedupStrategy;

/// Tuning for a single mail listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// How many of the newest messages each poll fetches.
    pub fetch_window: u32,
    /// Successful polls before the connection is recycled.
    pub max_checks: u32,
    /// Consecutive failed polls tolerated before a forced reconnect.
    pub max_errors: u32,
    /// Delay between connection attempts while the server is unreachable.
    pub connect_retry_delay: Duration,
    /// Forced reconnects after which every further one is logged as a warning.
    pub login_error_warning: u32,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            fetch_window: 5,
            max_checks: 15,
            max_errors: 10,
            connect_retry_delay: Duration::from_secs(60), // 1 minute
            login_error_warning: 15,
        }
    }
}

/// Chat tokens recognized while a draft body is being written.
#[derive(Debug, Clone)]
pub struct ComposeTokens {
    pub send: String,
    pub cancel: String,
    pub remove_attachment: String,
}

impl Default for ComposeTokens {
    fn default() -> Self {
        Self {
            send: "!send".to_string(),
            cancel: "!cancel".to_string(),
            remove_attachment: "!rm".to_string(),
        }
    }
}

/// Bridge configuration, built from environment variables.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Root directory for the database, staged attachments and logs.
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    /// Poll interval given to newly created rooms.
    pub default_poll_interval_secs: u64,
    /// Whether new drafts render their body as markdown.
    pub markdown_default: bool,
    /// Whether new rooms prefer HTML bodies for inbound mail.
    pub html_default: bool,
    /// Chat identity of the bridge; its own events are ignored.
    pub bot_id: String,
    pub dedup_strategy: DedupStrategy,
    pub listener: ListenerConfig,
    pub tokens: ComposeTokens,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        let data_dir = PathBuf::from("./");
        Self {
            db_path: data_dir.join("data.db"),
            data_dir,
            default_poll_interval_secs: 30,
            markdown_default: true,
            html_default: false,
            bot_id: "@mailbridge".to_string(),
            dedup_strategy: DedupStrategy::default(),
            listener: ListenerConfig::default(),
            tokens: ComposeTokens::default(),
        }
    }
}

impl BridgeConfig {
    /// Build config from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let data_dir = std::env::var("BRIDGE_DATA_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.data_dir);

        let db_path = std::env::var("BRIDGE_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("data.db"));

        let default_poll_interval_secs = match std::env::var("BRIDGE_DEFAULT_POLL_INTERVAL_SECS") {
            Ok(raw) => raw.trim().parse::<u64>().map_err(|e| ConfigError::InvalidValue {
                key: "BRIDGE_DEFAULT_POLL_INTERVAL_SECS".into(),
                message: e.to_string(),
            })?,
            Err(_) => defaults.default_poll_interval_secs,
        }
        .max(1);

        let markdown_default = env_bool("BRIDGE_MARKDOWN_DEFAULT")?.unwrap_or(defaults.markdown_default);
        let html_default = env_bool("BRIDGE_HTML_DEFAULT")?.unwrap_or(defaults.html_default);
        let bot_id = std::env::var("BRIDGE_BOT_ID").unwrap_or(defaults.bot_id);
        let dedup_strategy = match std::env::var("BRIDGE_DEDUP_KEY") {
            Ok(raw) => parse_dedup(&raw).ok_or_else(|| ConfigError::InvalidValue {
                key: "BRIDGE_DEDUP_KEY".into(),
                message: format!("expected subject-timestamp or message-id, got {raw:?}"),
            })?,
            Err(_) => defaults.dedup_strategy,
        };

        Ok(Self {
            data_dir,
            db_path,
            default_poll_interval_secs,
            markdown_default,
            html_default,
            bot_id,
            dedup_strategy,
            listener: defaults.listener,
            tokens: defaults.tokens,
        })
    }

    /// Directory holding attachments staged for outgoing drafts.
    pub fn staging_dir(&self) -> PathBuf {
        self.data_dir.join("temp")
    }

    /// Directory holding the rolling log files.
    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    /// Create the data directory if needed.
    pub fn ensure_data_dir(&self) -> Result<(), ConfigError> {
        ensure_dir(&self.data_dir)
    }
}

fn ensure_dir(path: &Path) -> Result<(), ConfigError> {
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(ConfigError::NotADirectory(path.display().to_string())),
        Err(_) => Ok(std::fs::create_dir_all(path)?),
    }
}

fn env_bool(key: &str) -> Result<Option<bool>, ConfigError> {
    let Ok(raw) = std::env::var(key) else {
        return Ok(None);
    };
    parse_bool(&raw).map(Some).ok_or_else(|| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("expected true/false, got {raw:?}"),
    })
}

/// `BRIDGE_DEDUP_KEY` spellings.
fn parse_dedup(raw: &str) -> Option<DedupStrategy> {
    match raw.trim().to_lowercase().as_str() {
        "subject-timestamp" | "subject" => Some(DedupStrategy::SubjectTimestamp),
        "message-id" | "msgid" => Some(DedupStrategy::MessageId),
        _ => None,
    }
}

/// Parse the on/off spellings accepted in config and chat.
pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "true" | "on" | "1" | "yes" => Some(true),
        "false" | "off" | "0" | "no" => Some(false),
        _ => None,
    }
}
