//! TCP chat relay: message framing, chat payloads, the session registry,
//! broadcast fan-out, heartbeats and the per-connection session lifecycle.

pub mod broadcaster;
pub mod framing;
pub mod heartbeat;
pub mod payload;
pub mod registry;
pub mod session;
pub mod tcp_client;
pub mod tcp_server;

pub use broadcaster::{
    BroadcastConfig, BroadcastHandle, BroadcastSnapshot, BroadcastStats, Broadcaster, Enqueued,
    OverflowPolicy, Outbound,
};
pub use framing::{Frame, FrameError, Tag, read_frame, read_frame_timeout, write_frame};
pub use heartbeat::{HeartbeatAction, HeartbeatConfig, HeartbeatMonitor};
pub use payload::{ChatMessage, MAX_SENDER_LEN, MAX_TEXT_LEN, PayloadError};
pub use registry::{ConnectionRegistry, IdGenerator, RegistryError, SessionId, Transport};
pub use session::{CloseReason, SessionConfig, SessionHandler, SessionState};
pub use tcp_client::{ChatClient, ClientConfig, ConnectionState, ConnectionStateWatch};
pub use tcp_server::{ChatServer, DEFAULT_PORT, ServerConfig};
