//! Configuration for the chat relay.
//!
//! Settings persist to disk as RON files and can be overridden from the
//! command line via clap. Unknown fields are ignored and missing sections
//! fall back to defaults, so older and newer config files both load.

mod cli;
mod config;
mod error;

pub use cli::CliArgs;
pub use config::{
    BroadcastSection, ChatSection, Config, HeartbeatSection, LogSection, OverflowPolicySetting,
    ServerSection,
};
pub use error::ConfigError;
