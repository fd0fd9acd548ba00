//! TCP client for a chat relay.
//!
//! [`ChatClient::connect`] opens the socket, announces itself with a
//! Connected frame and spawns two pumps: the read pump decodes incoming
//! frames, answers Pings and hands chat messages to the receiver channel;
//! the write pump turns outgoing text into Message frames. State changes are
//! broadcast via a [`watch`] channel so any number of consumers can react
//! without polling.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};

use crate::framing::{Frame, FrameError, Tag, read_frame, read_frame_timeout};
use crate::payload::ChatMessage;
use crate::registry::{SessionId, Transport};

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Attempting to establish a TCP connection.
    Connecting,
    /// TCP connection established, ready for communication.
    Connected,
    /// Connection lost or intentionally closed.
    Disconnected,
}

/// Observable connection state backed by a [`watch`] channel.
///
/// Multiple subscribers can observe state transitions without polling.
pub struct ConnectionStateWatch {
    tx: watch::Sender<ConnectionState>,
    rx: watch::Receiver<ConnectionState>,
}

impl Default for ConnectionStateWatch {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStateWatch {
    /// Create a new watch initialized to [`ConnectionState::Disconnected`].
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(ConnectionState::Disconnected);
        Self { tx, rx }
    }

    /// Set the current connection state, notifying all subscribers.
    pub fn set(&self, state: ConnectionState) {
        let _ = self.tx.send(state);
    }

    /// Return a new subscriber receiver.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.rx.clone()
    }

    /// Return the current state without blocking.
    pub fn current(&self) -> ConnectionState {
        *self.rx.borrow()
    }
}

/// Configuration for [`ChatClient`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Capacity of the outgoing text channel. Default: 32.
    pub send_capacity: usize,
    /// Capacity of the incoming message channel. Messages arriving while it
    /// is full are dropped so pings keep being answered. Default: 32.
    pub receive_capacity: usize,
    /// Give up if the server sends nothing for this long. The server pings
    /// every heartbeat interval, so this should exceed it. Default: none.
    pub read_timeout: Option<Duration>,
    /// Deadline for shutting the socket down on disconnect. Default: 1 s.
    pub close_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            send_capacity: 32,
            receive_capacity: 32,
            read_timeout: None,
            close_timeout: Duration::from_secs(1),
        }
    }
}

/// Handle to a connected relay session.
pub struct ChatClient {
    transport: Arc<Transport>,
    state: Arc<ConnectionStateWatch>,
    outgoing: mpsc::Sender<String>,
    incoming: Option<mpsc::Receiver<ChatMessage>>,
    /// Sending `true` causes both pumps to exit.
    shutdown_tx: watch::Sender<bool>,
    close_timeout: Duration,
}

impl ChatClient {
    /// Connect to the relay at `addr` and send the Connected handshake.
    pub async fn connect(addr: SocketAddr, config: ClientConfig) -> std::io::Result<Self> {
        let state = Arc::new(ConnectionStateWatch::new());
        state.set(ConnectionState::Connecting);

        let stream = match TcpStream::connect(addr).await {
            Ok(stream) => stream,
            Err(e) => {
                state.set(ConnectionState::Disconnected);
                return Err(e);
            }
        };
        stream.set_nodelay(true)?;

        let (reader, writer) = stream.into_split();
        let transport = Arc::new(Transport::new(
            SessionId::new(addr.to_string()),
            Box::new(writer),
        ));
        transport.send_frame(&Frame::control(Tag::Connected)).await?;
        state.set(ConnectionState::Connected);
        tracing::debug!("Connected to {addr}");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (outgoing, outgoing_rx) = mpsc::channel(config.send_capacity.max(1));
        let (incoming_tx, incoming) = mpsc::channel(config.receive_capacity.max(1));

        tokio::spawn(Self::read_loop(
            reader,
            Arc::clone(&transport),
            incoming_tx,
            Arc::clone(&state),
            shutdown_rx.clone(),
            config.read_timeout,
            config.close_timeout,
        ));
        tokio::spawn(Self::write_loop(
            outgoing_rx,
            Arc::clone(&transport),
            Arc::clone(&state),
            shutdown_rx,
        ));

        Ok(Self {
            transport,
            state,
            outgoing,
            incoming: Some(incoming),
            shutdown_tx,
            close_timeout: config.close_timeout,
        })
    }

    /// Return the connection state watch.
    pub fn state(&self) -> &Arc<ConnectionStateWatch> {
        &self.state
    }

    /// A sender for outgoing chat text. The server fills in the sender name.
    pub fn sender(&self) -> mpsc::Sender<String> {
        self.outgoing.clone()
    }

    /// Queue one line of text for sending.
    pub async fn send(&self, text: impl Into<String>) -> Result<(), mpsc::error::SendError<String>> {
        self.outgoing.send(text.into()).await
    }

    /// Take the receiver of relayed chat messages. Returns `None` after the
    /// first call.
    pub fn take_receiver(&mut self) -> Option<mpsc::Receiver<ChatMessage>> {
        self.incoming.take()
    }

    /// Say goodbye and close the connection.
    ///
    /// Sends a Disconnected frame, signals both pumps to exit and shuts the
    /// socket down. Safe to call more than once.
    pub async fn disconnect(&self) {
        if !self.transport.is_closed() {
            if let Err(e) = self
                .transport
                .send_frame(&Frame::control(Tag::Disconnected))
                .await
            {
                tracing::debug!("Could not send Disconnected: {e}");
            }
        }
        let _ = self.shutdown_tx.send(true);
        self.transport.close(self.close_timeout).await;
        self.state.set(ConnectionState::Disconnected);
    }

    /// Decode frames until the connection closes or shutdown is signalled.
    async fn read_loop(
        mut reader: OwnedReadHalf,
        transport: Arc<Transport>,
        incoming: mpsc::Sender<ChatMessage>,
        state: Arc<ConnectionStateWatch>,
        mut shutdown_rx: watch::Receiver<bool>,
        read_timeout: Option<Duration>,
        close_timeout: Duration,
    ) {
        let mut delivering = true;
        loop {
            let result = tokio::select! {
                result = Self::next_frame(&mut reader, read_timeout) => result,
                _ = shutdown_rx.changed() => break,
            };

            let frame = match result {
                Ok(frame) => frame,
                Err(e) if e.is_disconnect() => {
                    tracing::debug!("Connection ended: {e}");
                    break;
                }
                Err(e) => {
                    tracing::warn!("Read failed: {e}");
                    break;
                }
            };

            match frame.tag() {
                Some(Tag::Ping) => {
                    if let Err(e) = transport.send_frame(&Frame::control(Tag::Pong)).await {
                        tracing::warn!("Could not answer ping: {e}");
                        break;
                    }
                }
                Some(Tag::Message) if !delivering => {}
                Some(Tag::Message) => match ChatMessage::from_bytes(frame.payload()) {
                    Ok(msg) => match incoming.try_send(msg) {
                        Ok(()) => {}
                        Err(TrySendError::Full(msg)) => {
                            tracing::warn!(sender = %msg.sender, "Receive queue full, dropping message");
                        }
                        Err(TrySendError::Closed(_)) => {
                            tracing::debug!("Receiver dropped, no longer delivering messages");
                            delivering = false;
                        }
                    },
                    Err(e) => tracing::warn!("Dropping malformed message: {e}"),
                },
                Some(Tag::Disconnected) => {
                    tracing::debug!("Server said goodbye");
                    break;
                }
                Some(Tag::Connected | Tag::Pong) => {}
                None => tracing::debug!("Ignoring frame with unknown tag {}", frame.raw_tag()),
            }
        }

        transport.close(close_timeout).await;
        state.set(ConnectionState::Disconnected);
    }

    async fn next_frame(reader: &mut OwnedReadHalf, timeout: Option<Duration>) -> Result<Frame, FrameError> {
        match timeout {
            Some(timeout) => read_frame_timeout(reader, timeout).await,
            None => read_frame(reader).await,
        }
    }

    /// Encode outgoing text until the sender side is dropped or shutdown is
    /// signalled.
    async fn write_loop(
        mut outgoing: mpsc::Receiver<String>,
        transport: Arc<Transport>,
        state: Arc<ConnectionStateWatch>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            let text = tokio::select! {
                text = outgoing.recv() => match text {
                    Some(text) => text,
                    None => break,
                },
                _ = shutdown_rx.changed() => break,
            };

            let frame = match ChatMessage::new("", text).to_frame() {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::warn!("Cannot send message: {e}");
                    continue;
                }
            };
            if let Err(e) = transport.send_frame(&frame).await {
                tracing::warn!("Write failed: {e}");
                state.set(ConnectionState::Disconnected);
                break;
            }
        }
    }
}
