//! Active-session registry and the per-peer write handle it stores.
//!
//! The registry only ever holds its lock for map mutation or for copying a
//! snapshot; all socket I/O happens on the returned [`Transport`] handles
//! after the lock is released.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;

use crate::framing::Frame;

/// Identifier of one connected peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(String);

impl SessionId {
    /// Wrap an existing identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identifier as text, as stamped into chat messages.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Atomic generator for unique [`SessionId`]s (`guest-1`, `guest-2`, ...).
pub struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    /// Create a new generator starting at 1.
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Return the next unique [`SessionId`].
    pub fn next_id(&self) -> SessionId {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        SessionId(format!("guest-{n}"))
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Boxed write half of a peer connection.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Write side of one peer connection.
///
/// Writes from the owning session (Pong, Ping) and from the broadcaster go
/// through the same async mutex, so frames never interleave on the wire.
/// Closing is latched: once closed, every later send fails and every
/// [`closed`](Transport::closed) subscriber observes `true`.
pub struct Transport {
    id: SessionId,
    writer: tokio::sync::Mutex<BoxedWriter>,
    closed_tx: watch::Sender<bool>,
}

impl Transport {
    /// Wrap a writer for session `id`.
    pub fn new(id: SessionId, writer: BoxedWriter) -> Self {
        let (closed_tx, _) = watch::channel(false);
        Self {
            id,
            writer: tokio::sync::Mutex::new(writer),
            closed_tx,
        }
    }

    /// Session this transport belongs to.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Write pre-encoded frame bytes and flush.
    pub async fn send(&self, bytes: &[u8]) -> std::io::Result<()> {
        if self.is_closed() {
            return Err(std::io::ErrorKind::NotConnected.into());
        }
        let mut writer = self.writer.lock().await;
        writer.write_all(bytes).await?;
        writer.flush().await
    }

    /// Encode and write a single frame.
    pub async fn send_frame(&self, frame: &Frame) -> std::io::Result<()> {
        self.send(&frame.to_bytes()).await
    }

    /// [`send`](Transport::send) bounded by a deadline.
    pub async fn send_timeout(&self, bytes: &[u8], timeout: Duration) -> std::io::Result<()> {
        match tokio::time::timeout(timeout, self.send(bytes)).await {
            Ok(result) => result,
            Err(_) => Err(std::io::ErrorKind::TimedOut.into()),
        }
    }

    /// Mark the transport closed without touching the socket.
    ///
    /// Returns `true` for the call that actually performed the transition.
    pub fn mark_closed(&self) -> bool {
        self.closed_tx.send_if_modified(|closed| {
            if *closed {
                false
            } else {
                *closed = true;
                true
            }
        })
    }

    /// Mark closed and shut the writer down. Idempotent.
    ///
    /// The shutdown waits behind any in-flight write, bounded by `timeout`.
    pub async fn close(&self, timeout: Duration) {
        if !self.mark_closed() {
            return;
        }
        let shutdown = async {
            let mut writer = self.writer.lock().await;
            writer.shutdown().await
        };
        match tokio::time::timeout(timeout, shutdown).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!(session = %self.id, error = %e, "writer shutdown failed"),
            Err(_) => tracing::debug!(session = %self.id, "writer shutdown timed out"),
        }
    }

    /// Whether the transport has been closed.
    pub fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }

    /// Subscribe to the closed flag.
    pub fn closed(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Errors returned by [`ConnectionRegistry::add`].
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// The registry holds its maximum number of sessions.
    #[error("registry full ({max} sessions)")]
    Full {
        /// The configured capacity.
        max: usize,
    },
    /// A session with this id is already registered.
    #[error("session {0} already registered")]
    Duplicate(SessionId),
}

/// Thread-safe map of Active sessions keyed by [`SessionId`].
pub struct ConnectionRegistry {
    inner: Mutex<HashMap<SessionId, Arc<Transport>>>,
    max_sessions: usize,
}

impl ConnectionRegistry {
    /// Create a new registry with the given capacity limit.
    pub fn new(max_sessions: usize) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            max_sessions,
        }
    }

    // A panic while holding the lock cannot leave the map half-updated, so a
    // poisoned lock is still safe to use.
    fn map(&self) -> MutexGuard<'_, HashMap<SessionId, Arc<Transport>>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a session's transport.
    pub fn add(&self, id: SessionId, transport: Arc<Transport>) -> Result<(), RegistryError> {
        let mut map = self.map();
        if map.contains_key(&id) {
            return Err(RegistryError::Duplicate(id));
        }
        if map.len() >= self.max_sessions {
            return Err(RegistryError::Full {
                max: self.max_sessions,
            });
        }
        map.insert(id, transport);
        Ok(())
    }

    /// Remove a session. Removing an absent id is a no-op.
    pub fn remove(&self, id: &SessionId) -> Option<Arc<Transport>> {
        self.map().remove(id)
    }

    /// Copy of every registered transport, ordered by session id.
    ///
    /// The lock is released before this returns; callers do their I/O on the
    /// copy.
    pub fn snapshot(&self) -> Vec<Arc<Transport>> {
        let mut transports: Vec<Arc<Transport>> = self.map().values().cloned().collect();
        transports.sort_by(|a, b| a.id().cmp(b.id()));
        transports
    }

    /// Whether `id` is registered.
    pub fn contains(&self, id: &SessionId) -> bool {
        self.map().contains_key(id)
    }

    /// Registered session ids, sorted.
    pub fn ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.map().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Return the number of registered sessions.
    pub fn len(&self) -> usize {
        self.map().len()
    }

    /// Return whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.map().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::{Tag, read_frame};
    use tokio::io::duplex;

    fn transport(id: &str) -> Arc<Transport> {
        Arc::new(Transport::new(SessionId::new(id), Box::new(tokio::io::sink())))
    }

    #[test]
    fn test_session_id_uniqueness() {
        let id_gen = IdGenerator::new();
        let id1 = id_gen.next_id();
        let id2 = id_gen.next_id();
        assert_ne!(id1, id2);
        assert_eq!(id1.as_str(), "guest-1");
        assert_eq!(id2.to_string(), "guest-2");
    }

    #[test]
    fn test_add_remove_snapshot() {
        let registry = ConnectionRegistry::new(16);
        registry.add(SessionId::new("b"), transport("b")).unwrap();
        registry.add(SessionId::new("a"), transport("a")).unwrap();
        assert_eq!(registry.len(), 2);

        let snapshot = registry.snapshot();
        let ids: Vec<&str> = snapshot.iter().map(|t| t.id().as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);

        assert!(registry.remove(&SessionId::new("a")).is_some());
        assert!(!registry.contains(&SessionId::new("a")));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_remove_absent_is_noop() {
        let registry = ConnectionRegistry::new(16);
        assert!(registry.remove(&SessionId::new("ghost")).is_none());
        registry.add(SessionId::new("a"), transport("a")).unwrap();
        assert!(registry.remove(&SessionId::new("a")).is_some());
        assert!(registry.remove(&SessionId::new("a")).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let registry = ConnectionRegistry::new(16);
        registry.add(SessionId::new("a"), transport("a")).unwrap();
        let result = registry.add(SessionId::new("a"), transport("a"));
        assert!(matches!(result, Err(RegistryError::Duplicate(_))));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_capacity_enforced() {
        let registry = ConnectionRegistry::new(2);
        registry.add(SessionId::new("a"), transport("a")).unwrap();
        registry.add(SessionId::new("b"), transport("b")).unwrap();
        let result = registry.add(SessionId::new("c"), transport("c"));
        assert!(matches!(result, Err(RegistryError::Full { max: 2 })));
    }

    #[test]
    fn test_snapshot_is_detached_from_registry() {
        let registry = ConnectionRegistry::new(16);
        registry.add(SessionId::new("a"), transport("a")).unwrap();
        let snapshot = registry.snapshot();
        registry.remove(&SessionId::new("a"));
        registry.add(SessionId::new("b"), transport("b")).unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id().as_str(), "a");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_churn_leaves_exact_set() {
        let registry = Arc::new(ConnectionRegistry::new(1024));
        let mut tasks = Vec::new();
        for i in 0..64 {
            let registry = Arc::clone(&registry);
            tasks.push(tokio::spawn(async move {
                let id = SessionId::new(format!("s{i:02}"));
                registry.add(id.clone(), transport(id.as_str())).unwrap();
                tokio::task::yield_now().await;
                let _ = registry.snapshot();
                if i % 2 == 0 {
                    registry.remove(&id);
                    // A second remove must be harmless.
                    registry.remove(&id);
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let expected: Vec<SessionId> = (0..64)
            .filter(|i| i % 2 == 1)
            .map(|i| SessionId::new(format!("s{i:02}")))
            .collect();
        assert_eq!(registry.ids(), expected);
    }

    #[tokio::test]
    async fn test_transport_writes_frames() {
        let (writer, mut reader) = duplex(1024);
        let transport = Transport::new(SessionId::new("a"), Box::new(writer));
        transport
            .send_frame(&Frame::control(Tag::Ping))
            .await
            .unwrap();
        let frame = read_frame(&mut reader).await.unwrap();
        assert_eq!(frame.tag(), Some(Tag::Ping));
    }

    #[tokio::test]
    async fn test_transport_close_is_latched() {
        let (writer, mut reader) = duplex(1024);
        let transport = Transport::new(SessionId::new("a"), Box::new(writer));
        let mut closed = transport.closed();

        transport.close(Duration::from_secs(1)).await;
        closed.changed().await.unwrap();
        assert!(*closed.borrow());
        assert!(transport.is_closed());
        assert!(!transport.mark_closed(), "second close is a no-op");

        let result = transport.send(&Frame::control(Tag::Pong).to_bytes()).await;
        assert_eq!(result.unwrap_err().kind(), std::io::ErrorKind::NotConnected);
        // The peer observes EOF after shutdown.
        assert!(read_frame(&mut reader).await.is_err());
    }

    #[tokio::test]
    async fn test_concurrent_sends_do_not_interleave() {
        let (writer, mut reader) = duplex(64);
        let transport = Arc::new(Transport::new(SessionId::new("a"), Box::new(writer)));
        let payload = vec![0x5A; 500];
        let frame = Frame::new(Tag::Message, payload.clone()).unwrap();

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let transport = Arc::clone(&transport);
            let frame = frame.clone();
            tasks.push(tokio::spawn(async move {
                transport.send_frame(&frame).await.unwrap();
            }));
        }
        for _ in 0..8 {
            let received = read_frame(&mut reader).await.unwrap();
            assert_eq!(received.payload(), payload.as_slice());
        }
        for task in tasks {
            task.await.unwrap();
        }
    }
}
