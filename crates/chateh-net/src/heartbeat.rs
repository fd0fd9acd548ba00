//! Per-session liveness tracking.
//!
//! The server pings every Active session at a fixed interval. A Pong clears
//! the outstanding ping. If a ping is still outstanding when the next one is
//! due, the miss is counted; once `max_missed_pongs` misses accumulate the
//! session is declared dead and the owner tears it down.

use std::time::Duration;

use tokio::time::{Instant, Interval, MissedTickBehavior};

/// Configuration for [`HeartbeatMonitor`].
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Time between pings. Default: 15 s.
    pub interval: Duration,
    /// Consecutive unanswered pings tolerated before the peer is declared
    /// dead. Default: 1 (no Pong before the next scheduled Ping).
    pub max_missed_pongs: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
            max_missed_pongs: 1,
        }
    }
}

/// What the owner should do after a heartbeat tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    /// Send a Ping to the peer.
    SendPing,
    /// The peer missed too many Pongs.
    Expired {
        /// Consecutive unanswered pings.
        missed: u32,
    },
}

/// Ping scheduler and Pong bookkeeping for one session.
///
/// Idle until [`start`](HeartbeatMonitor::start); [`tick`](HeartbeatMonitor::tick)
/// never resolves while stopped, so it can sit in a `select!` unconditionally.
pub struct HeartbeatMonitor {
    config: HeartbeatConfig,
    ticker: Option<Interval>,
    awaiting_pong: bool,
    missed: u32,
    last_pong: Option<Instant>,
    pings_sent: u64,
    pongs_received: u64,
}

impl HeartbeatMonitor {
    /// Create a stopped monitor.
    pub fn new(config: HeartbeatConfig) -> Self {
        Self {
            config,
            ticker: None,
            awaiting_pong: false,
            missed: 0,
            last_pong: None,
            pings_sent: 0,
            pongs_received: 0,
        }
    }

    /// Start the timer. The first ping is due one interval from now.
    pub fn start(&mut self) {
        let period = self.config.interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.ticker = Some(ticker);
        self.awaiting_pong = false;
        self.missed = 0;
    }

    /// Stop the timer and release it.
    pub fn stop(&mut self) {
        self.ticker = None;
        self.awaiting_pong = false;
    }

    /// Whether the timer is armed.
    pub fn is_running(&self) -> bool {
        self.ticker.is_some()
    }

    /// Record a Pong from the peer.
    pub fn on_pong(&mut self) {
        self.awaiting_pong = false;
        self.missed = 0;
        self.last_pong = Some(Instant::now());
        self.pongs_received += 1;
    }

    /// Wait for the next scheduled ping and decide what to do.
    ///
    /// Cancel-safe: dropping the future before it resolves loses no state.
    pub async fn tick(&mut self) -> HeartbeatAction {
        match self.ticker.as_mut() {
            Some(ticker) => {
                ticker.tick().await;
            }
            None => std::future::pending::<()>().await,
        }

        if self.awaiting_pong {
            self.missed += 1;
            if self.missed >= self.config.max_missed_pongs {
                return HeartbeatAction::Expired {
                    missed: self.missed,
                };
            }
        }
        self.awaiting_pong = true;
        self.pings_sent += 1;
        HeartbeatAction::SendPing
    }

    /// Consecutive pings left unanswered so far.
    pub fn missed(&self) -> u32 {
        self.missed
    }

    /// When the last Pong arrived.
    pub fn last_pong(&self) -> Option<Instant> {
        self.last_pong
    }

    /// Total pings scheduled.
    pub fn pings_sent(&self) -> u64 {
        self.pings_sent
    }

    /// Total Pongs received.
    pub fn pongs_received(&self) -> u64 {
        self.pongs_received
    }
}
