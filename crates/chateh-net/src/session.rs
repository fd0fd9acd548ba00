//! Per-connection session state machine.
//!
//! Lifecycle: Connecting → Active → Closing → Closed.
//!
//! | State      | Event                         | Action                                   | Next    |
//! |------------|-------------------------------|------------------------------------------|---------|
//! | Connecting | Connected                     | register, start heartbeat                | Active  |
//! | Active     | Message                       | decode, stamp sender, enqueue broadcast  | Active  |
//! | any        | Ping                          | reply Pong                               | same    |
//! | Active     | Pong                          | clear outstanding ping                   | Active  |
//! | any        | Disconnected                  | none                                     | Closing |
//! | any        | read error, heartbeat expiry, handshake expiry, eviction, shutdown | none | Closing |
//! | Closing    | cleanup done                  | stop heartbeat, deregister, close writer | Closed  |
//!
//! Frames with unknown tags are logged and skipped. Cleanup runs exactly once
//! on every exit path; if the task is aborted the `Drop` impl performs it.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncRead;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::broadcaster::{BroadcastHandle, Enqueued};
use crate::framing::{Frame, FrameError, Tag, read_frame};
use crate::heartbeat::{HeartbeatAction, HeartbeatConfig, HeartbeatMonitor};
use crate::payload::{ChatMessage, MAX_TEXT_LEN};
use crate::registry::{ConnectionRegistry, SessionId, Transport};

/// Frames decoded ahead of the session loop before the reader waits.
const INBOUND_CAPACITY: usize = 20;

/// State machine for a client session's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Socket accepted, waiting for the Connected frame.
    Connecting,
    /// Registered and heartbeating.
    Active,
    /// Teardown in progress.
    Closing,
    /// Teardown complete.
    Closed,
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer sent Disconnected.
    PeerDisconnected,
    /// The peer closed the socket between frames.
    PeerHungUp,
    /// A read deadline elapsed.
    ReadTimeout,
    /// No Connected frame within the handshake timeout.
    HandshakeTimeout,
    /// The peer stopped answering pings.
    HeartbeatTimeout {
        /// Consecutive unanswered pings.
        missed: u32,
    },
    /// The peer sent a frame that could not be decoded.
    BadFrame(String),
    /// The socket failed.
    Io(String),
    /// A control reply could not be written.
    WriteFailed(String),
    /// The transport was closed by someone else, usually the broadcaster
    /// after a failed write.
    Evicted,
    /// The registry refused the session.
    RegistryRejected(String),
    /// The server is shutting down.
    Shutdown,
}

impl CloseReason {
    fn from_read_error(e: FrameError) -> Self {
        match e {
            FrameError::Timeout(_) => CloseReason::ReadTimeout,
            e if e.is_disconnect() => CloseReason::PeerHungUp,
            FrameError::ConnectionClosed => CloseReason::PeerHungUp,
            FrameError::Io(e) => CloseReason::Io(e.to_string()),
            e @ (FrameError::BadFrame { .. } | FrameError::PayloadTooLarge { .. }) => {
                CloseReason::BadFrame(e.to_string())
            }
        }
    }

    /// Whether this is an ordinary way for a session to end.
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            CloseReason::PeerDisconnected
                | CloseReason::PeerHungUp
                | CloseReason::ReadTimeout
                | CloseReason::Shutdown
        )
    }
}

/// Configuration shared by every session of a server.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Time allowed between accept and the Connected frame. Default: 15 s.
    pub handshake_timeout: Duration,
    /// Heartbeat schedule.
    pub heartbeat: HeartbeatConfig,
    /// Longest chat text relayed; longer messages are dropped.
    /// Default: [`MAX_TEXT_LEN`].
    pub max_text_len: usize,
    /// Deadline for writing a Ping or Pong. A peer that stops reading
    /// fails the write instead of stalling the session. Default: 5 s.
    pub write_timeout: Duration,
    /// Deadline for shutting the writer down on close. Default: 1 s.
    pub close_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(15),
            heartbeat: HeartbeatConfig::default(),
            max_text_len: MAX_TEXT_LEN,
            write_timeout: Duration::from_secs(5),
            close_timeout: Duration::from_secs(1),
        }
    }
}

enum Event {
    Frame(Frame),
    ReadFailed(FrameError),
    Heartbeat(HeartbeatAction),
    HandshakeExpired,
    TransportClosed,
    Shutdown,
}

enum Step {
    Continue,
    Close(CloseReason),
}

/// Aborts the reader task when the session goes away.
struct ReaderTask(JoinHandle<()>);

impl Drop for ReaderTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Decode frames on a separate task so the session loop only ever waits on
/// cancel-safe channel receives.
fn spawn_reader<R>(mut reader: R, id: SessionId) -> (mpsc::Receiver<Result<Frame, FrameError>>, ReaderTask)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);
    let handle = tokio::spawn(async move {
        loop {
            let result = read_frame(&mut reader).await;
            let failed = result.is_err();
            if tx.send(result).await.is_err() || failed {
                break;
            }
        }
        tracing::trace!(session = %id, "Reader stopped");
    });
    (rx, ReaderTask(handle))
}

/// Resolves once the flag is raised or its sender is gone.
async fn raised(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|flag| *flag).await;
}

/// Owns one accepted connection from accept to close.
pub struct SessionHandler {
    id: SessionId,
    state: SessionState,
    transport: Arc<Transport>,
    registry: Arc<ConnectionRegistry>,
    broadcaster: BroadcastHandle,
    heartbeat: HeartbeatMonitor,
    config: SessionConfig,
    registered: bool,
}

impl SessionHandler {
    /// Create a handler in the Connecting state.
    pub fn new(
        id: SessionId,
        transport: Arc<Transport>,
        registry: Arc<ConnectionRegistry>,
        broadcaster: BroadcastHandle,
        config: SessionConfig,
    ) -> Self {
        let heartbeat = HeartbeatMonitor::new(config.heartbeat.clone());
        Self {
            id,
            state: SessionState::Connecting,
            transport,
            registry,
            broadcaster,
            heartbeat,
            config,
            registered: false,
        }
    }

    /// Session identifier.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Drive the session until it closes, then clean up.
    pub async fn run<R>(mut self, reader: R, mut shutdown_rx: watch::Receiver<bool>) -> CloseReason
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (mut frames, _reader_task) = spawn_reader(reader, self.id.clone());
        let mut closed_rx = self.transport.closed();
        let handshake_deadline = Instant::now() + self.config.handshake_timeout;

        let reason = if *shutdown_rx.borrow_and_update() {
            CloseReason::Shutdown
        } else {
            loop {
                let event = tokio::select! {
                    inbound = frames.recv() => match inbound {
                        Some(Ok(frame)) => Event::Frame(frame),
                        Some(Err(e)) => Event::ReadFailed(e),
                        None => Event::ReadFailed(FrameError::ConnectionClosed),
                    },
                    action = self.heartbeat.tick() => Event::Heartbeat(action),
                    _ = tokio::time::sleep_until(handshake_deadline), if self.state == SessionState::Connecting => {
                        Event::HandshakeExpired
                    }
                    changed = closed_rx.changed() => {
                        if changed.is_ok() && !*closed_rx.borrow() {
                            continue;
                        }
                        Event::TransportClosed
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_ok() && !*shutdown_rx.borrow() {
                            continue;
                        }
                        Event::Shutdown
                    }
                };

                // Handling may block on a control write; closing still wins.
                let step = tokio::select! {
                    biased;
                    step = self.handle(event) => step,
                    _ = raised(&mut shutdown_rx) => Step::Close(CloseReason::Shutdown),
                    _ = raised(&mut closed_rx) => Step::Close(CloseReason::Evicted),
                };
                if let Step::Close(reason) = step {
                    break reason;
                }
            }
        };

        self.teardown(&reason).await;
        reason
    }

    async fn handle(&mut self, event: Event) -> Step {
        match event {
            Event::Frame(frame) => self.on_frame(frame).await,
            Event::ReadFailed(e) => Step::Close(CloseReason::from_read_error(e)),
            Event::Heartbeat(HeartbeatAction::SendPing) => {
                tracing::trace!(session = %self.id, "Ping");
                self.send_control(Tag::Ping).await
            }
            Event::Heartbeat(HeartbeatAction::Expired { missed }) => {
                Step::Close(CloseReason::HeartbeatTimeout { missed })
            }
            Event::HandshakeExpired => Step::Close(CloseReason::HandshakeTimeout),
            Event::TransportClosed => Step::Close(CloseReason::Evicted),
            Event::Shutdown => Step::Close(CloseReason::Shutdown),
        }
    }

    async fn on_frame(&mut self, frame: Frame) -> Step {
        let Some(tag) = frame.tag() else {
            tracing::warn!(
                session = %self.id,
                tag = frame.raw_tag(),
                len = frame.length(),
                "Ignoring frame with unknown tag"
            );
            return Step::Continue;
        };
        if tag.is_control() && frame.length() > 0 {
            tracing::debug!(session = %self.id, ?tag, len = frame.length(), "Discarding control frame payload");
        }

        match (self.state, tag) {
            // The loop exits before either state is reached.
            (SessionState::Closing | SessionState::Closed, _) => Step::Continue,
            (_, Tag::Disconnected) => Step::Close(CloseReason::PeerDisconnected),
            (_, Tag::Ping) => self.send_control(Tag::Pong).await,
            (SessionState::Connecting, Tag::Connected) => self.activate(),
            (SessionState::Active, Tag::Connected) => {
                tracing::debug!(session = %self.id, "Ignoring repeated Connected");
                Step::Continue
            }
            (SessionState::Active, Tag::Pong) => {
                self.heartbeat.on_pong();
                tracing::trace!(session = %self.id, "Pong");
                Step::Continue
            }
            (SessionState::Active, Tag::Message) => {
                self.relay(frame.payload());
                Step::Continue
            }
            (SessionState::Connecting, Tag::Pong | Tag::Message) => {
                tracing::debug!(session = %self.id, ?tag, "Ignoring frame before Connected");
                Step::Continue
            }
        }
    }

    async fn send_control(&self, tag: Tag) -> Step {
        let bytes = Frame::control(tag).to_bytes();
        match self.transport.send_timeout(&bytes, self.config.write_timeout).await {
            Ok(()) => Step::Continue,
            Err(e) => {
                tracing::debug!(session = %self.id, ?tag, error = %e, "Control write failed");
                Step::Close(CloseReason::WriteFailed(e.to_string()))
            }
        }
    }

    fn activate(&mut self) -> Step {
        if let Err(e) = self
            .registry
            .add(self.id.clone(), Arc::clone(&self.transport))
        {
            tracing::warn!(session = %self.id, error = %e, "Registry rejected session");
            return Step::Close(CloseReason::RegistryRejected(e.to_string()));
        }
        self.registered = true;
        self.heartbeat.start();
        self.state = SessionState::Active;
        tracing::info!(session = %self.id, active = self.registry.len(), "Client connected");
        Step::Continue
    }

    /// Decode, stamp and enqueue a chat message. Bad payloads only cost the
    /// frame, never the session.
    fn relay(&mut self, payload: &[u8]) {
        let mut msg = match ChatMessage::from_bytes(payload) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!(session = %self.id, error = %e, "Dropping malformed message");
                return;
            }
        };
        if msg.text.len() > self.config.max_text_len {
            tracing::warn!(
                session = %self.id,
                len = msg.text.len(),
                max = self.config.max_text_len,
                "Dropping oversized message"
            );
            return;
        }

        msg.sender = self.id.as_str().to_owned();
        let frame = match msg.to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(session = %self.id, error = %e, "Cannot re-encode message");
                return;
            }
        };
        tracing::debug!(session = %self.id, len = msg.text.len(), "Relaying message");
        if self.broadcaster.enqueue(frame, Some(self.id.clone())) == Enqueued::DroppedNewest {
            tracing::debug!(session = %self.id, "Message lost to queue overflow");
        }
    }

    /// Stop the heartbeat and leave the registry.
    fn release(&mut self) {
        self.heartbeat.stop();
        if self.registered {
            self.registry.remove(&self.id);
            self.registered = false;
        }
    }

    async fn teardown(&mut self, reason: &CloseReason) {
        if self.state == SessionState::Closed {
            return;
        }
        self.state = SessionState::Closing;
        self.release();
        self.transport.close(self.config.close_timeout).await;
        self.state = SessionState::Closed;

        if reason.is_expected() {
            tracing::info!(session = %self.id, ?reason, "Client disconnected");
        } else {
            tracing::warn!(session = %self.id, ?reason, "Session closed");
        }
    }
}

impl Drop for SessionHandler {
    fn drop(&mut self) {
        if self.state != SessionState::Closed {
            self.release();
            self.transport.mark_closed();
            self.state = SessionState::Closed;
        }
    }
}
