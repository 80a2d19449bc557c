//! Periodic refresh timer
//!
//! Sends a trigger on a fixed interval while a thread is open. The first
//! trigger fires one interval after start; the initial fetch is the
//! caller's job.

use flume::{Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::types::ThreadKey;

/// Trigger sent by the monitor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefreshTrigger {
    /// Time for a refresh
    Tick,
    /// Monitor is stopping
    Shutdown,
}

/// Interval timer bound to one thread
pub struct RefreshMonitor {
    thread_key: ThreadKey,
    interval: Duration,
    running: Arc<AtomicBool>,
    trigger_tx: Sender<RefreshTrigger>,
}

impl RefreshMonitor {
    pub fn new(thread_key: ThreadKey, interval: Duration) -> (Self, Receiver<RefreshTrigger>) {
        let (tx, rx) = flume::unbounded();

        let monitor = Self {
            thread_key,
            interval,
            running: Arc::new(AtomicBool::new(false)),
            trigger_tx: tx,
        };

        (monitor, rx)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Mark as running; call before spawning `start`
    pub fn mark_running(&self) {
        self.running.store(true, Ordering::SeqCst);
    }

    pub fn stop(&self) {
        info!("Stopping refresh timer for thread {}", self.thread_key);
        self.running.store(false, Ordering::SeqCst);
        let _ = self.trigger_tx.send(RefreshTrigger::Shutdown);
    }

    /// Run the poll loop until stopped
    pub async fn start(&self) {
        let start = tokio::time::Instant::now() + self.interval;
        let mut ticker = tokio::time::interval_at(start, self.interval);

        info!(
            "Starting refresh timer for thread {} (interval: {:?})",
            self.thread_key, self.interval
        );

        let mut tick_count = 0u64;
        while self.running.load(Ordering::SeqCst) {
            ticker.tick().await;

            if !self.running.load(Ordering::SeqCst) {
                break;
            }

            tick_count += 1;
            debug!("Refresh tick #{} for thread {}", tick_count, self.thread_key);

            if let Err(e) = self.trigger_tx.send(RefreshTrigger::Tick) {
                error!("Failed to send refresh tick #{}: {}", tick_count, e);
                break;
            }
        }

        info!(
            "Refresh timer stopped for thread {} after {} ticks",
            self.thread_key, tick_count
        );
    }
}

/// Drop triggers queued behind a slow refresh
///
/// Returns true when a shutdown was among them.
pub fn drain_pending(rx: &Receiver<RefreshTrigger>) -> bool {
    let mut skipped = 0usize;
    for trigger in rx.drain() {
        match trigger {
            RefreshTrigger::Tick => skipped += 1,
            RefreshTrigger::Shutdown => return true,
        }
    }
    if skipped > 0 {
        debug!("Collapsed {} queued refresh ticks", skipped);
    }
    false
}
