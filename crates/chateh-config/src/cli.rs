//! Command-line argument parsing for the relay server.

use std::path::PathBuf;

use clap::Parser;

use crate::Config;

/// Chat relay command-line arguments.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug, Default)]
#[command(name = "chateh-server", about = "Minimal TCP chat relay")]
pub struct CliArgs {
    /// Address to listen on, e.g. 0.0.0.0:9494.
    #[arg(long)]
    pub bind: Option<String>,

    /// Maximum concurrent sessions.
    #[arg(long)]
    pub max_sessions: Option<usize>,

    /// Seconds between heartbeat pings.
    #[arg(long)]
    pub heartbeat_interval: Option<u64>,

    /// Broadcast queue capacity.
    #[arg(long)]
    pub queue_capacity: Option<usize>,

    /// Do not send messages back to their author.
    #[arg(long)]
    pub no_echo: bool,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Directory for the JSON log file.
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(ref bind) = args.bind {
            self.server.bind_address = bind.clone();
        }
        if let Some(max) = args.max_sessions {
            self.server.max_sessions = max;
        }
        if let Some(secs) = args.heartbeat_interval {
            self.heartbeat.interval_secs = secs;
        }
        if let Some(capacity) = args.queue_capacity {
            self.broadcast.queue_capacity = capacity;
        }
        if args.no_echo {
            self.broadcast.echo_to_sender = false;
        }
        if let Some(ref level) = args.log_level {
            self.log.level = level.clone();
        }
        if args.log_dir.is_some() {
            self.log.json_file = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_override() {
        let mut config = Config::default();
        let args = CliArgs {
            bind: Some("127.0.0.1:4000".to_string()),
            heartbeat_interval: Some(3),
            no_echo: true,
            ..CliArgs::default()
        };
        config.apply_cli_overrides(&args);
        assert_eq!(config.server.bind_address, "127.0.0.1:4000");
        assert_eq!(config.heartbeat.interval_secs, 3);
        assert!(!config.broadcast.echo_to_sender);
        // Non-overridden fields retain defaults
        assert_eq!(config.server.max_sessions, 1024);
        assert_eq!(config.broadcast.queue_capacity, 128);
    }

    #[test]
    fn test_cli_no_override() {
        let original = Config::default();
        let mut config = Config::default();
        config.apply_cli_overrides(&CliArgs::default());
        assert_eq!(config, original);
    }

    #[test]
    fn test_parse_flags() {
        let args = CliArgs::parse_from([
            "chateh-server",
            "--bind",
            "127.0.0.1:9000",
            "--max-sessions",
            "8",
            "--queue-capacity",
            "4",
            "--no-echo",
            "--log-dir",
            "/tmp/chateh",
        ]);
        assert_eq!(args.bind.as_deref(), Some("127.0.0.1:9000"));
        assert_eq!(args.max_sessions, Some(8));
        assert_eq!(args.queue_capacity, Some(4));
        assert!(args.no_echo);

        let mut config = Config::default();
        config.apply_cli_overrides(&args);
        assert!(config.log.json_file);
    }
}
