use clap::{Parser, ValueEnum};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Default location of the TOML config file
pub const DEFAULT_CONFIG_PATH: &str = "./lanchat.toml";

/// Upper bound for every `*_secs` policy value (100 years). Keeps duration
/// arithmetic against the wall clock in range.
pub const MAX_POLICY_SECS: u64 = 100 * 365 * 24 * 60 * 60;

/// Command-line layer. Every flag is optional so that flags the user did
/// not pass leave the TOML and environment values alone.
#[derive(Parser, Serialize, Clone, Debug, Default)]
#[command(name = "lanchat-server", version, about = "LAN broadcast chatroom server")]
pub struct Cli {
    /// Port to listen on [default: 8081]
    #[arg(long, env = "LANCHAT_PORT")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Bind address [default: 0.0.0.0]
    #[arg(long, env = "LANCHAT_BIND_ADDRESS")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind_address: Option<String>,

    /// Path to TOML config file
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    #[serde(skip)]
    pub config: String,

    /// Enable structured JSON logging (for Docker/production)
    #[arg(long)]
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub json_logs: bool,

    /// Output a commented TOML config template and exit
    #[arg(long)]
    #[serde(skip)]
    pub generate_config: bool,

    /// Data directory for the SQLite database [default: ./data]
    #[arg(long, env = "LANCHAT_DATA_DIR")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<String>,

    /// Storage backend [default: sqlite]
    #[arg(long, env = "LANCHAT_STORAGE", value_enum)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageBackend>,

    /// Chatroom title shown to clients [default: LAN Chat]
    #[arg(long, env = "LANCHAT_CHAT_TITLE")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_title: Option<String>,

    /// Identify users by the first X-Forwarded-For address instead of the peer address
    #[arg(long)]
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub trust_forwarded_for: bool,
}

/// Where users and messages are kept.
#[derive(ValueEnum, Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Sqlite,
    Memory,
}

/// Effective server configuration after layering.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct Config {
    pub port: u16,
    pub bind_address: String,
    pub json_logs: bool,
    pub data_dir: String,
    pub storage: StorageBackend,
    pub chat_title: String,
    pub trust_forwarded_for: bool,

    /// Chat policy (loaded from [chat] section in TOML)
    pub chat: ChatConfig,
}

/// Policy constants for recall, presence, the inactivity sweep and
/// per-connection queues.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    /// How long after sending a user may recall a message (default: 8 hours)
    #[serde(default = "default_recall_window")]
    pub recall_window_secs: u64,

    /// Durable last-seen window for "recently seen" users (default: 30)
    #[serde(default = "default_online_window")]
    pub online_window_secs: u64,

    /// Users idle longer than this are deleted by the sweep (default: 60)
    #[serde(default = "default_inactive_user")]
    pub inactive_user_secs: u64,

    /// Interval between inactive-user sweeps (default: 300)
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Interval between last-seen touches for open sessions (default: 15)
    #[serde(default = "default_liveness_interval")]
    pub liveness_interval_secs: u64,

    /// Outbound frames buffered per connection before it counts as stalled (default: 256)
    #[serde(default = "default_outbound_queue_capacity")]
    pub outbound_queue_capacity: usize,

    /// Join already-queued frames with '\n' into one write (default: false)
    #[serde(default)]
    pub coalesce_frames: bool,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            recall_window_secs: default_recall_window(),
            online_window_secs: default_online_window(),
            inactive_user_secs: default_inactive_user(),
            sweep_interval_secs: default_sweep_interval(),
            liveness_interval_secs: default_liveness_interval(),
            outbound_queue_capacity: default_outbound_queue_capacity(),
            coalesce_frames: false,
        }
    }
}

impl ChatConfig {
    pub fn recall_window(&self) -> chrono::Duration {
        policy_duration(self.recall_window_secs)
    }

    pub fn online_window(&self) -> chrono::Duration {
        policy_duration(self.online_window_secs)
    }

    pub fn inactive_after(&self) -> chrono::Duration {
        policy_duration(self.inactive_user_secs)
    }

    pub fn sweep_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.sweep_interval_secs.clamp(1, MAX_POLICY_SECS))
    }

    pub fn liveness_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.liveness_interval_secs.clamp(1, MAX_POLICY_SECS))
    }
}

fn policy_duration(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(secs.min(MAX_POLICY_SECS) as i64)
}

fn default_recall_window() -> u64 {
    8 * 60 * 60
}

fn default_online_window() -> u64 {
    30
}

fn default_inactive_user() -> u64 {
    60
}

fn default_sweep_interval() -> u64 {
    300
}

fn default_liveness_interval() -> u64 {
    15
}

fn default_outbound_queue_capacity() -> usize {
    256
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8081,
            bind_address: "0.0.0.0".to_string(),
            json_logs: false,
            data_dir: "./data".to_string(),
            storage: StorageBackend::Sqlite,
            chat_title: "LAN Chat".to_string(),
            trust_forwarded_for: false,
            chat: ChatConfig::default(),
        }
    }
}

impl Config {
    /// Load config with layered precedence:
    /// built-in defaults < TOML file < env vars (LANCHAT_*) < CLI args
    ///
    /// Nested keys use a double underscore in env vars, e.g.
    /// `LANCHAT_CHAT__RECALL_WINDOW_SECS=60`.
    pub fn load(cli: &Cli) -> Result<Self, figment::Error> {
        Self::figment(cli).extract()
    }

    pub fn figment(cli: &Cli) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&cli.config))
            .merge(Env::prefixed("LANCHAT_").split("__"))
            .merge(Serialized::defaults(cli))
    }
}

/// Generate a commented TOML config template
pub fn generate_config_template() -> String {
    r#"# LAN Chat Server Configuration
# Place this file at ./lanchat.toml or specify with --config <path>
# All settings can be overridden via environment variables (LANCHAT_PORT,
# LANCHAT_CHAT__RECALL_WINDOW_SECS, etc.) or CLI flags (--port, etc.)

# Server port (default: 8081)
# port = 8081

# Bind address (default: 0.0.0.0, all interfaces)
# bind_address = "0.0.0.0"

# Enable structured JSON logging for Docker/production
# json_logs = false

# Data directory for the SQLite database
# data_dir = "./data"

# Storage backend: "sqlite" or "memory"
# Falls back to memory if the database cannot be opened
# storage = "sqlite"

# Chatroom title (changeable at runtime via POST /api/title)
# chat_title = "LAN Chat"

# Users are identified by origin address. Enable when running behind a
# reverse proxy that sets X-Forwarded-For.
# trust_forwarded_for = false

# ---- Chat Policy ----
# [chat]

# Seconds after sending during which a message may be recalled (default: 8 hours)
# recall_window_secs = 28800

# Users seen within this many seconds are candidates for the online list
# online_window_secs = 30

# Users idle longer than this are deleted by the periodic sweep
# inactive_user_secs = 60
# sweep_interval_secs = 300

# Open sessions refresh their last-seen timestamp at this interval
# liveness_interval_secs = 15

# Frames buffered per connection; a full queue disconnects that client
# outbound_queue_capacity = 256

# Join queued frames with '\n' into a single WebSocket write
# coalesce_frames = false
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn toml_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    fn cli(args: &[&str]) -> Cli {
        Cli::parse_from(std::iter::once("lanchat-server").chain(args.iter().copied()))
    }

    #[test]
    fn test_toml_values_survive_cli_layer() {
        let file = toml_file(
            "port = 9000\nstorage = \"memory\"\njson_logs = true\n\
             [chat]\nrecall_window_secs = 60\noutbound_queue_capacity = 8\n",
        );
        let path = file.path().to_str().unwrap();

        let config = Config::load(&cli(&["--config", path])).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.storage, StorageBackend::Memory);
        assert!(config.json_logs);
        assert_eq!(config.chat.recall_window(), chrono::Duration::seconds(60));
        assert_eq!(config.chat.outbound_queue_capacity, 8);
        // Keys absent from the file keep their defaults
        assert_eq!(config.chat.online_window_secs, 30);
        assert_eq!(config.bind_address, "0.0.0.0");
    }

    #[test]
    fn test_cli_flags_override_toml() {
        let file = toml_file("port = 9000\nstorage = \"memory\"\n[chat]\nrecall_window_secs = 60\n");
        let path = file.path().to_str().unwrap();

        let config = Config::load(&cli(&[
            "--config",
            path,
            "--port",
            "9100",
            "--storage",
            "sqlite",
            "--trust-forwarded-for",
        ]))
        .unwrap();
        assert_eq!(config.port, 9100);
        assert_eq!(config.storage, StorageBackend::Sqlite);
        assert!(config.trust_forwarded_for);
        assert_eq!(config.chat.recall_window_secs, 60);
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        let config = Config::load(&cli(&["--config", path.to_str().unwrap()])).unwrap();
        assert_eq!(config.port, 8081);
        assert_eq!(config.storage, StorageBackend::Sqlite);
        assert_eq!(config.chat.outbound_queue_capacity, 256);
    }

    #[test]
    fn test_unknown_storage_backend_is_rejected() {
        let file = toml_file("storage = \"postgres\"\n");
        let path = file.path().to_str().unwrap();
        assert!(Config::load(&cli(&["--config", path])).is_err());
        assert!(Cli::try_parse_from(["lanchat-server", "--storage", "postgres"]).is_err());
    }

    #[test]
    fn test_oversized_policy_values_are_capped() {
        let chat = ChatConfig {
            recall_window_secs: u64::MAX,
            online_window_secs: u64::MAX,
            inactive_user_secs: u64::MAX,
            sweep_interval_secs: u64::MAX,
            liveness_interval_secs: 0,
            ..ChatConfig::default()
        };
        let cap = chrono::Duration::seconds(MAX_POLICY_SECS as i64);
        assert_eq!(chat.recall_window(), cap);
        assert_eq!(chat.online_window(), cap);
        assert_eq!(chat.inactive_after(), cap);
        assert_eq!(
            chat.sweep_interval(),
            std::time::Duration::from_secs(MAX_POLICY_SECS)
        );
        assert_eq!(chat.liveness_interval(), std::time::Duration::from_secs(1));

        // Subtracting the cap from the current time stays in range
        let _ = chrono::Utc::now() - chat.online_window();
    }

    #[test]
    fn test_template_parses_as_defaults() {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::string(&generate_config_template()))
            .extract()
            .unwrap();

        assert_eq!(config.port, 8081);
        assert_eq!(config.chat.inactive_user_secs, 60);
    }
}
