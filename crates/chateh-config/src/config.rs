//! Configuration structs with sensible defaults and RON persistence.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

const CONFIG_FILE: &str = "config.ron";

/// Top-level relay configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Listener and session limits.
    pub server: ServerSection,
    /// Liveness pings.
    pub heartbeat: HeartbeatSection,
    /// Fan-out queue.
    pub broadcast: BroadcastSection,
    /// Chat message limits.
    pub chat: ChatSection,
    /// Logging.
    pub log: LogSection,
}

/// Listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerSection {
    /// Address to listen on, `host:port`.
    pub bind_address: String,
    /// Maximum concurrently registered sessions.
    pub max_sessions: usize,
    /// Seconds a new connection has to send Connected.
    pub handshake_timeout_secs: u64,
    /// Milliseconds shutdown waits for sessions to finish.
    pub shutdown_grace_ms: u64,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HeartbeatSection {
    /// Seconds between pings.
    pub interval_secs: u64,
    /// Unanswered pings tolerated before disconnecting.
    pub max_missed_pongs: u32,
}

/// Which frame to discard when the broadcast queue is full.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum OverflowPolicySetting {
    /// Reject the incoming frame.
    #[default]
    DropNewest,
    /// Evict the oldest queued frame.
    DropOldest,
}

/// Broadcast configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BroadcastSection {
    /// Maximum queued outbound frames.
    pub queue_capacity: usize,
    /// Overflow behaviour.
    pub overflow_policy: OverflowPolicySetting,
    /// Deliver a message back to its author as well.
    pub echo_to_sender: bool,
    /// Milliseconds allowed for a single peer write.
    pub write_timeout_ms: u64,
}

/// Chat configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChatSection {
    /// Longest text (in bytes) the relay forwards, at most 4096. Larger
    /// values are clamped to the wire limit.
    pub max_text_len: usize,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogSection {
    /// Default filter when `RUST_LOG` is unset (e.g. "info", "chateh_net=debug").
    pub level: String,
    /// Also write JSON logs to `chateh.log` in the log directory.
    pub json_file: bool,
}

// --- Default implementations ---

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:9494".to_string(),
            max_sessions: 1024,
            handshake_timeout_secs: 15,
            shutdown_grace_ms: 2000,
        }
    }
}

impl Default for HeartbeatSection {
    fn default() -> Self {
        Self {
            interval_secs: 15,
            max_missed_pongs: 1,
        }
    }
}

impl Default for BroadcastSection {
    fn default() -> Self {
        Self {
            queue_capacity: 128,
            overflow_policy: OverflowPolicySetting::DropNewest,
            echo_to_sender: true,
            write_timeout_ms: 5000,
        }
    }
}

impl Default for ChatSection {
    fn default() -> Self {
        Self { max_text_len: 4096 }
    }
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_file: false,
        }
    }
}

// --- Load / Save / Reload ---

impl Config {
    /// Platform config directory for the relay, e.g. `~/.config/chateh`.
    pub fn default_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("chateh"))
    }

    /// Load config from the given directory, or create a default config file.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE);

        if config_path.exists() {
            let config = read_config(&config_path)?;
            log::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Save config to the given directory as `config.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(|source| ConfigError::WriteError {
            path: config_dir.to_path_buf(),
            source,
        })?;

        let config_path = config_dir.join(CONFIG_FILE);
        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(3)
            .separate_tuple_members(true)
            .enumerate_arrays(false);

        let serialized =
            ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::SerializeError)?;

        std::fs::write(&config_path, serialized).map_err(|source| ConfigError::WriteError {
            path: config_path.clone(),
            source,
        })?;
        Ok(())
    }

    /// Re-read the file: returns `Some(new_config)` if it changed, `None` otherwise.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE);
        let new_config = read_config(&config_path)?;

        if &new_config != self {
            log::info!("Config reloaded with changes");
            Ok(Some(new_config))
        } else {
            Ok(None)
        }
    }
}

fn read_config(path: &Path) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
        path: path.to_path_buf(),
        source,
    })?;
    ron::from_str(&contents).map_err(|source| ConfigError::ParseError {
        path: path.to_path_buf(),
        source,
    })
}
