//! Maps the persisted [`Config`] onto the relay's runtime configuration.

use std::net::SocketAddr;
use std::time::Duration;

use chateh_config::{Config, OverflowPolicySetting};
use chateh_net::{
    BroadcastConfig, HeartbeatConfig, MAX_TEXT_LEN, OverflowPolicy, ServerConfig, SessionConfig,
};

/// The configured bind address could not be parsed.
#[derive(Debug, thiserror::Error)]
#[error("invalid bind address {address:?}: {source}")]
pub struct InvalidBindAddress {
    address: String,
    source: std::net::AddrParseError,
}

/// Build a [`ServerConfig`] from the file/CLI configuration.
pub fn server_config(config: &Config) -> Result<ServerConfig, InvalidBindAddress> {
    let bind_addr: SocketAddr =
        config
            .server
            .bind_address
            .parse()
            .map_err(|source| InvalidBindAddress {
                address: config.server.bind_address.clone(),
                source,
            })?;

    let overflow_policy = match config.broadcast.overflow_policy {
        OverflowPolicySetting::DropNewest => OverflowPolicy::DropNewest,
        OverflowPolicySetting::DropOldest => OverflowPolicy::DropOldest,
    };

    let max_text_len = if config.chat.max_text_len > MAX_TEXT_LEN {
        tracing::warn!(
            configured = config.chat.max_text_len,
            limit = MAX_TEXT_LEN,
            "chat.max_text_len exceeds the wire limit, clamping"
        );
        MAX_TEXT_LEN
    } else {
        config.chat.max_text_len
    };
    let write_timeout = Duration::from_millis(config.broadcast.write_timeout_ms);

    Ok(ServerConfig {
        bind_addr,
        max_sessions: config.server.max_sessions,
        session: SessionConfig {
            handshake_timeout: Duration::from_secs(config.server.handshake_timeout_secs),
            heartbeat: HeartbeatConfig {
                interval: Duration::from_secs(config.heartbeat.interval_secs.max(1)),
                max_missed_pongs: config.heartbeat.max_missed_pongs.max(1),
            },
            max_text_len,
            write_timeout,
            ..SessionConfig::default()
        },
        broadcast: BroadcastConfig {
            queue_capacity: config.broadcast.queue_capacity,
            overflow_policy,
            echo_to_sender: config.broadcast.echo_to_sender,
            write_timeout,
        },
        shutdown_grace: Duration::from_millis(config.server.shutdown_grace_ms),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_map_to_default_server() {
        let server = server_config(&Config::default()).unwrap();
        assert_eq!(server.bind_addr.to_string(), "0.0.0.0:9494");
        assert_eq!(server.max_sessions, 1024);
        assert_eq!(server.session.heartbeat.interval, Duration::from_secs(15));
        assert_eq!(server.session.handshake_timeout, Duration::from_secs(15));
        assert_eq!(server.broadcast.queue_capacity, 128);
        assert_eq!(server.broadcast.overflow_policy, OverflowPolicy::DropNewest);
        assert!(server.broadcast.echo_to_sender);
        assert_eq!(server.shutdown_grace, Duration::from_secs(2));
    }

    #[test]
    fn test_overrides_are_carried() {
        let mut config = Config::default();
        config.broadcast.overflow_policy = OverflowPolicySetting::DropOldest;
        config.broadcast.write_timeout_ms = 250;
        config.heartbeat.interval_secs = 0;
        config.chat.max_text_len = 280;

        let server = server_config(&config).unwrap();
        assert_eq!(server.broadcast.overflow_policy, OverflowPolicy::DropOldest);
        assert_eq!(server.broadcast.write_timeout, Duration::from_millis(250));
        assert_eq!(server.session.write_timeout, Duration::from_millis(250));
        assert_eq!(server.session.heartbeat.interval, Duration::from_secs(1));
        assert_eq!(server.session.max_text_len, 280);
    }

    #[test]
    fn test_text_limit_is_clamped_to_wire_limit() {
        let mut config = Config::default();
        config.chat.max_text_len = 10_000;
        let server = server_config(&config).unwrap();
        assert_eq!(server.session.max_text_len, MAX_TEXT_LEN);

        config.chat.max_text_len = MAX_TEXT_LEN;
        let server = server_config(&config).unwrap();
        assert_eq!(server.session.max_text_len, 4096);
    }

    #[test]
    fn test_bad_bind_address_is_reported() {
        let mut config = Config::default();
        config.server.bind_address = "not-an-address".to_string();
        let err = server_config(&config).unwrap_err();
        assert!(err.to_string().contains("not-an-address"));
    }
}
