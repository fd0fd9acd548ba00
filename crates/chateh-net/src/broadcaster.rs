//! Fan-out of outbound frames to every registered session.
//!
//! Sessions push frames into a bounded queue through a [`BroadcastHandle`].
//! A single [`Broadcaster`] task pops them in FIFO order, takes a registry
//! snapshot and writes the encoded frame to every transport in it. A peer
//! whose write fails or exceeds the write deadline is pruned from the
//! registry and closed; the other peers still receive the frame.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{Notify, watch};
use tokio::task::JoinSet;

use crate::framing::Frame;
use crate::registry::{ConnectionRegistry, SessionId};

/// What to discard when the queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Reject the frame being enqueued.
    #[default]
    DropNewest,
    /// Evict the oldest queued frame to make room.
    DropOldest,
}

/// Configuration for the broadcaster.
#[derive(Debug, Clone)]
pub struct BroadcastConfig {
    /// Maximum queued frames. Default: 128.
    pub queue_capacity: usize,
    /// Overflow behaviour. Default: drop newest.
    pub overflow_policy: OverflowPolicy,
    /// Whether the author of a message also receives it. Default: true.
    pub echo_to_sender: bool,
    /// Deadline for a single peer write. Default: 5 s.
    pub write_timeout: Duration,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 128,
            overflow_policy: OverflowPolicy::DropNewest,
            echo_to_sender: true,
            write_timeout: Duration::from_secs(5),
        }
    }
}

/// A frame waiting for fan-out, with the session that produced it.
#[derive(Debug, Clone)]
pub struct Outbound {
    /// The frame to deliver.
    pub frame: Frame,
    /// Author session, if any.
    pub origin: Option<SessionId>,
}

/// Result of [`BroadcastHandle::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    /// The frame was queued.
    Accepted,
    /// The queue was full and the new frame was dropped.
    DroppedNewest,
    /// The queue was full and the oldest frame was evicted.
    DroppedOldest,
}

/// Live counters bumped by the broadcaster and its handles.
#[derive(Debug, Default)]
pub struct BroadcastStats {
    /// Frames accepted into the queue.
    pub enqueued: AtomicU64,
    /// Frames discarded on overflow.
    pub dropped: AtomicU64,
    /// Successful per-peer writes.
    pub delivered: AtomicU64,
    /// Failed or timed-out per-peer writes.
    pub write_failures: AtomicU64,
    /// Sessions removed from the registry after a write failure.
    pub pruned: AtomicU64,
}

/// Point-in-time copy of [`BroadcastStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastSnapshot {
    /// Frames accepted into the queue.
    pub enqueued: u64,
    /// Frames discarded on overflow.
    pub dropped: u64,
    /// Successful per-peer writes.
    pub delivered: u64,
    /// Failed or timed-out per-peer writes.
    pub write_failures: u64,
    /// Sessions removed after a write failure.
    pub pruned: u64,
}

impl BroadcastStats {
    /// Read all counters.
    pub fn snapshot(&self) -> BroadcastSnapshot {
        BroadcastSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
            pruned: self.pruned.load(Ordering::Relaxed),
        }
    }
}

struct Queue {
    items: Mutex<VecDeque<Outbound>>,
    notify: Notify,
    capacity: usize,
    policy: OverflowPolicy,
}

impl Queue {
    fn items(&self) -> MutexGuard<'_, VecDeque<Outbound>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, item: Outbound) -> Enqueued {
        let outcome = {
            let mut items = self.items();
            if items.len() < self.capacity {
                items.push_back(item);
                Enqueued::Accepted
            } else {
                match self.policy {
                    OverflowPolicy::DropNewest => return Enqueued::DroppedNewest,
                    OverflowPolicy::DropOldest => {
                        items.pop_front();
                        items.push_back(item);
                        Enqueued::DroppedOldest
                    }
                }
            }
        };
        self.notify.notify_one();
        outcome
    }

    async fn pop(&self) -> Outbound {
        loop {
            let notified = self.notify.notified();
            if let Some(item) = self.items().pop_front() {
                return item;
            }
            notified.await;
        }
    }

    fn len(&self) -> usize {
        self.items().len()
    }
}

/// Cloneable producer side of the broadcast queue.
#[derive(Clone)]
pub struct BroadcastHandle {
    queue: Arc<Queue>,
    stats: Arc<BroadcastStats>,
}

impl BroadcastHandle {
    /// Queue a frame for fan-out. Never blocks.
    pub fn enqueue(&self, frame: Frame, origin: Option<SessionId>) -> Enqueued {
        let outcome = self.queue.push(Outbound { frame, origin });
        match outcome {
            Enqueued::Accepted => {
                self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
            }
            Enqueued::DroppedNewest | Enqueued::DroppedOldest => {
                if outcome == Enqueued::DroppedOldest {
                    self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
                }
                let dropped = self.stats.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(
                    policy = ?self.queue.policy,
                    capacity = self.queue.capacity,
                    dropped,
                    "Broadcast queue full, frame dropped"
                );
            }
        }
        outcome
    }

    /// Frames currently waiting.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Shared counters.
    pub fn stats(&self) -> &Arc<BroadcastStats> {
        &self.stats
    }
}

/// The single consumer of the broadcast queue.
pub struct Broadcaster {
    queue: Arc<Queue>,
    stats: Arc<BroadcastStats>,
    registry: Arc<ConnectionRegistry>,
    config: BroadcastConfig,
}

impl Broadcaster {
    /// Create the broadcaster and its producer handle.
    pub fn new(registry: Arc<ConnectionRegistry>, config: BroadcastConfig) -> (Self, BroadcastHandle) {
        let queue = Arc::new(Queue {
            items: Mutex::new(VecDeque::with_capacity(config.queue_capacity)),
            notify: Notify::new(),
            capacity: config.queue_capacity.max(1),
            policy: config.overflow_policy,
        });
        let stats = Arc::new(BroadcastStats::default());
        let handle = BroadcastHandle {
            queue: Arc::clone(&queue),
            stats: Arc::clone(&stats),
        };
        let broadcaster = Self {
            queue,
            stats,
            registry,
            config,
        };
        (broadcaster, handle)
    }

    /// Pop and deliver frames until shutdown is signalled.
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                outbound = self.queue.pop() => {
                    self.deliver(outbound).await;
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        tracing::debug!(pending = self.queue.len(), "Broadcaster stopping");
                        break;
                    }
                }
            }
        }
    }

    /// Deliver one frame to every registered session.
    ///
    /// Writes to all peers run concurrently; this returns once every write
    /// has finished or timed out, so each peer sees frames in queue order.
    pub async fn deliver(&self, outbound: Outbound) {
        let bytes: Arc<[u8]> = outbound.frame.to_bytes().into();
        let mut writes = JoinSet::new();

        for transport in self.registry.snapshot() {
            if !self.config.echo_to_sender && outbound.origin.as_ref() == Some(transport.id()) {
                continue;
            }
            let bytes = Arc::clone(&bytes);
            let timeout = self.config.write_timeout;
            writes.spawn(async move {
                let result = transport.send_timeout(&bytes, timeout).await;
                (transport, result)
            });
        }

        while let Some(joined) = writes.join_next().await {
            let (transport, result) = match joined {
                Ok(done) => done,
                Err(e) => {
                    tracing::error!(error = %e, "Broadcast write task failed");
                    continue;
                }
            };
            match result {
                Ok(()) => {
                    self.stats.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    self.stats.write_failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(session = %transport.id(), error = %e, "Broadcast write failed, pruning session");
                    if self.registry.remove(transport.id()).is_some() {
                        self.stats.pruned.fetch_add(1, Ordering::Relaxed);
                    }
                    transport.close(self.config.write_timeout).await;
                }
            }
        }
        tracing::trace!(tag = outbound.frame.raw_tag(), "Frame delivered");
    }

    #[cfg(test)]
    pub(crate) async fn next_queued(&self) -> Outbound {
        self.queue.pop().await
    }
}
