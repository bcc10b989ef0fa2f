//! Election timer.
//!
//! Election timeouts are randomized within `[election_timeout_min,
//! election_timeout_max)` so split votes resolve quickly. Each fire is
//! tagged with the role epoch and the reset generation current when the
//! timer was armed. The election loop drops a fire if either has moved on,
//! so a fire still queued when a heartbeat or role change arrives never
//! starts an election.

use crate::config::RaftConfig;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tokio::time::{sleep_until, Instant};

/// One expiry of the election timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFire {
    pub epoch: u64,
    pub generation: u64,
}

/// Resettable, randomized election timer.
pub struct ElectionTimer {
    config: RaftConfig,

    /// Role epoch shared with `RaftState`
    epoch: Arc<AtomicU64>,

    /// Bumped by every `reset`
    generation: AtomicU64,

    reset_notify: Notify,
    shutdown_notify: Notify,

    /// Capacity 1: a pending fire is enough, extras are dropped
    timeout_tx: mpsc::Sender<TimerFire>,
    timeout_rx: Mutex<Option<mpsc::Receiver<TimerFire>>>,
}

impl ElectionTimer {
    pub fn new(config: RaftConfig, epoch: Arc<AtomicU64>) -> Self {
        let (timeout_tx, timeout_rx) = mpsc::channel(1);
        Self {
            config,
            epoch,
            generation: AtomicU64::new(0),
            reset_notify: Notify::new(),
            shutdown_notify: Notify::new(),
            timeout_tx,
            timeout_rx: Mutex::new(Some(timeout_rx)),
        }
    }

    /// Take the receiving end of timeout notifications.
    ///
    /// Returns `None` after the first call.
    pub fn take_receiver(&self) -> Option<mpsc::Receiver<TimerFire>> {
        self.timeout_rx.lock().take()
    }

    /// Restart the countdown with a fresh random timeout.
    ///
    /// Called on valid leader traffic, on granting a vote, on starting an
    /// election and on every role change.
    pub fn reset(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.reset_notify.notify_one();
    }

    /// Tag for a countdown starting now.
    pub(crate) fn arm(&self) -> TimerFire {
        TimerFire {
            epoch: self.epoch.load(Ordering::SeqCst),
            generation: self.generation.load(Ordering::SeqCst),
        }
    }

    /// Whether `fire` was armed before the latest reset or role change.
    pub fn is_stale(&self, fire: TimerFire) -> bool {
        fire.epoch != self.epoch.load(Ordering::SeqCst)
            || fire.generation != self.generation.load(Ordering::SeqCst)
    }

    pub fn shutdown(&self) {
        self.shutdown_notify.notify_one();
    }

    /// Timer loop. Spawn as a background task.
    pub async fn run(self: Arc<Self>) {
        loop {
            let armed = self.arm();
            let deadline = Instant::now() + self.config.random_election_timeout();

            tokio::select! {
                biased;
                _ = self.shutdown_notify.notified() => break,
                _ = self.reset_notify.notified() => continue,
                _ = sleep_until(deadline) => {
                    // Full channel means a fire is already queued
                    if let Err(mpsc::error::TrySendError::Closed(_)) =
                        self.timeout_tx.try_send(armed)
                    {
                        break;
                    }
                }
            }
        }
        tracing::debug!("Election timer stopped");
    }
}
