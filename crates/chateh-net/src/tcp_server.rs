//! TCP relay server: accepts connections and runs one session per client.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::broadcaster::{BroadcastConfig, BroadcastHandle, BroadcastSnapshot, Broadcaster};
use crate::registry::{ConnectionRegistry, IdGenerator, Transport};
use crate::session::{CloseReason, SessionConfig, SessionHandler};

/// Port the relay listens on unless configured otherwise.
pub const DEFAULT_PORT: u16 = 9494;

/// Configuration for [`ChatServer`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to. Default: `0.0.0.0:9494`.
    pub bind_addr: SocketAddr,
    /// Maximum concurrently registered sessions. Default: 1024.
    pub max_sessions: usize,
    /// Per-session settings.
    pub session: SessionConfig,
    /// Fan-out settings.
    pub broadcast: BroadcastConfig,
    /// How long shutdown waits for sessions to finish. Default: 2 s.
    pub shutdown_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            max_sessions: 1024,
            session: SessionConfig::default(),
            broadcast: BroadcastConfig::default(),
            shutdown_grace: Duration::from_secs(2),
        }
    }
}

/// Chat relay server.
pub struct ChatServer {
    config: ServerConfig,
    registry: Arc<ConnectionRegistry>,
    id_gen: Arc<IdGenerator>,
    broadcaster: Mutex<Option<Broadcaster>>,
    handle: BroadcastHandle,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ChatServer {
    /// Create a new server with the given configuration.
    pub fn new(config: ServerConfig) -> Self {
        let registry = Arc::new(ConnectionRegistry::new(config.max_sessions));
        let (broadcaster, handle) =
            Broadcaster::new(Arc::clone(&registry), config.broadcast.clone());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            config,
            registry,
            id_gen: Arc::new(IdGenerator::new()),
            broadcaster: Mutex::new(Some(broadcaster)),
            handle,
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Bind to the configured address and run the accept loop.
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.run_with_listener(listener).await
    }

    /// Run the accept loop with a pre-bound listener (useful for tests).
    ///
    /// Returns once [`shutdown`](Self::shutdown) has been called and every
    /// session has finished or the grace period ran out.
    pub async fn run_with_listener(&self, listener: TcpListener) -> std::io::Result<()> {
        let broadcaster = self
            .broadcaster
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| std::io::Error::other("server is already running"))?;
        let broadcaster_task = tokio::spawn(broadcaster.run(self.shutdown_rx.clone()));

        let local_addr = listener.local_addr()?;
        tracing::info!("Chat relay listening on {local_addr}");

        let mut sessions: JoinSet<CloseReason> = JoinSet::new();
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (stream, peer_addr) = match result {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            tracing::error!("Accept failed: {e}");
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            continue;
                        }
                    };
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::debug!("Cannot set TCP_NODELAY for {peer_addr}: {e}");
                    }

                    let id = self.id_gen.next_id();
                    let (reader, writer) = stream.into_split();
                    let transport = Arc::new(Transport::new(id.clone(), Box::new(writer)));
                    tracing::info!(session = %id, peer = %peer_addr, "Accepted connection");

                    let handler = SessionHandler::new(
                        id,
                        transport,
                        Arc::clone(&self.registry),
                        self.handle.clone(),
                        self.config.session.clone(),
                    );
                    sessions.spawn(handler.run(reader, self.shutdown_rx.clone()));
                }
                Some(finished) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = finished {
                        tracing::error!("Session task failed: {e}");
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        tracing::info!(sessions = sessions.len(), "Server shutting down");
                        break;
                    }
                }
            }
        }

        drop(listener);
        let drained = tokio::time::timeout(self.config.shutdown_grace, async {
            while sessions.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::warn!(
                remaining = sessions.len(),
                "Shutdown grace period elapsed, aborting sessions"
            );
            sessions.shutdown().await;
        }
        if let Err(e) = broadcaster_task.await {
            tracing::error!("Broadcaster task failed: {e}");
        }

        tracing::info!("Server stopped");
        Ok(())
    }

    /// Signal the server to shut down gracefully.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Registered sessions.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Current fan-out counters.
    pub fn stats(&self) -> BroadcastSnapshot {
        self.handle.stats().snapshot()
    }

    /// The server's configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}
