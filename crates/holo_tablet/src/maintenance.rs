//! Background log garbage collection.
//!
//! One worker per peer wakes on a fixed interval, asks the peer for the
//! earliest log index anything still needs, and drops WAL segments entirely
//! below it. The worker holds only a weak reference to the peer and `stop`
//! joins the thread, so unregistration during shutdown guarantees no GC pass
//! touches the log after tear-down has started.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Weak;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::Deserialize;

use crate::peer::TabletPeer;

/// Log-GC scheduling knobs.
#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(default)]
pub struct LogGcConfig {
    /// Interval between GC passes, in milliseconds.
    pub interval_ms: u64,
}

impl Default for LogGcConfig {
    fn default() -> Self {
        Self { interval_ms: 60_000 }
    }
}

/// Handle to the running worker. Dropping the handle without calling
/// [`LogGcWorker::stop`] also stops the worker, but without joining it.
pub struct LogGcWorker {
    shutdown_tx: Option<Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl LogGcWorker {
    pub fn spawn(peer: Weak<TabletPeer>, config: LogGcConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = mpsc::channel();
        let interval = Duration::from_millis(config.interval_ms.max(1));
        let worker = thread::Builder::new()
            .name("tablet-log-gc".to_string())
            .spawn(move || Self::run(peer, shutdown_rx, interval))
            .expect("failed to spawn log gc worker");
        Self {
            shutdown_tx: Some(shutdown_tx),
            worker: Some(worker),
        }
    }

    fn run(peer: Weak<TabletPeer>, shutdown_rx: Receiver<()>, interval: Duration) {
        loop {
            match shutdown_rx.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
            }
            let Some(peer) = peer.upgrade() else {
                return;
            };
            if let Err(err) = peer.run_log_gc() {
                tracing::warn!(
                    error = ?err,
                    tablet = %peer.tablet_id(),
                    "log gc pass failed"
                );
            }
        }
    }

    /// Signals the worker and joins it. After this returns no further GC
    /// pass will run.
    pub fn stop(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!("log gc worker panicked");
            }
        }
    }
}

impl Drop for LogGcWorker {
    fn drop(&mut self) {
        // Dropping the sender disconnects the channel and the worker exits
        // at its next wakeup.
        self.shutdown_tx.take();
    }
}
