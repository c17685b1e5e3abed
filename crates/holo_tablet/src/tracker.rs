//! Set of in-flight operation drivers for one tablet.
//!
//! The tracker owns the strong references that keep drivers alive, charges
//! their footprint against an admission budget, and is the rendezvous point
//! for the shutdown drain. `add` is the only place an operation can be
//! refused before it enters the state machine.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use serde::Deserialize;

use holo_raft::raft::OpId;

use crate::driver::OperationDriver;
use crate::metrics::TrackerMetrics;

/// Admission knobs for the tracker.
#[derive(Clone, Copy, Debug, Default, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Cap on bytes held by in-flight operations; zero disables the cap.
    pub memory_limit_bytes: u64,
}

struct TrackedOp {
    driver: Arc<OperationDriver>,
    bytes: u64,
}

#[derive(Default)]
struct TrackerInner {
    ops: HashMap<usize, TrackedOp>,
    queued_bytes: u64,
    /// Zero means admission is not byte-limited.
    memory_limit: u64,
}

pub struct OperationTracker {
    tablet_id: String,
    inner: Mutex<TrackerInner>,
    drained: Condvar,
    metrics: Mutex<Option<Arc<TrackerMetrics>>>,
}

fn driver_key(driver: &OperationDriver) -> usize {
    driver as *const OperationDriver as usize
}

impl OperationTracker {
    pub fn new(tablet_id: impl Into<String>) -> Self {
        Self {
            tablet_id: tablet_id.into(),
            inner: Mutex::new(TrackerInner::default()),
            drained: Condvar::new(),
            metrics: Mutex::new(None),
        }
    }

    /// Admits a driver, or rejects it when the queued-bytes budget would be
    /// exceeded. Rejection is surfaced to the submitter synchronously.
    pub fn add(&self, driver: &Arc<OperationDriver>) -> Result<()> {
        let bytes = driver.space_used() as u64;
        let mut inner = self.inner.lock().unwrap();

        if inner.memory_limit > 0 && inner.queued_bytes + bytes > inner.memory_limit {
            if let Some(metrics) = self.metrics.lock().unwrap().as_deref() {
                metrics.record_rejection();
            }
            bail!(
                "tablet {}: operation of {} bytes rejected, {} bytes of operations \
                 already in flight (limit {})",
                self.tablet_id,
                bytes,
                inner.queued_bytes,
                inner.memory_limit
            );
        }

        inner.ops.insert(
            driver_key(driver),
            TrackedOp {
                driver: Arc::clone(driver),
                bytes,
            },
        );
        inner.queued_bytes += bytes;
        drop(inner);

        if let Some(metrics) = self.metrics.lock().unwrap().as_deref() {
            metrics.record_add(driver.op_type(), bytes);
        }
        Ok(())
    }

    /// Removes a driver. On a successful apply the caller passes the vector
    /// collecting applied op-ids and the driver's id is recorded there.
    pub fn release(&self, driver: &OperationDriver, applied_op_ids: Option<&mut Vec<OpId>>) {
        if let Some(applied) = applied_op_ids {
            let op_id = driver.op_id();
            if op_id.valid() {
                applied.push(op_id);
            }
        }

        let removed = {
            let mut inner = self.inner.lock().unwrap();
            let removed = inner.ops.remove(&driver_key(driver));
            if let Some(tracked) = &removed {
                inner.queued_bytes = inner.queued_bytes.saturating_sub(tracked.bytes);
            }
            if inner.ops.is_empty() {
                self.drained.notify_all();
            }
            removed
        };

        match removed {
            Some(tracked) => {
                if let Some(metrics) = self.metrics.lock().unwrap().as_deref() {
                    metrics.record_release(tracked.bytes);
                }
                // `tracked.driver` drops here, after the map lock is gone.
                drop(tracked.driver);
            }
            None => {
                tracing::error!(
                    tablet = %self.tablet_id,
                    "released an operation that was not tracked"
                );
                debug_assert!(false, "released an untracked operation");
            }
        }
    }

    /// Snapshot of every in-flight driver.
    pub fn pending_operations(&self) -> Vec<Arc<OperationDriver>> {
        let inner = self.inner.lock().unwrap();
        inner
            .ops
            .values()
            .map(|tracked| Arc::clone(&tracked.driver))
            .collect()
    }

    pub fn num_pending(&self) -> usize {
        self.inner.lock().unwrap().ops.len()
    }

    pub fn queued_bytes(&self) -> u64 {
        self.inner.lock().unwrap().queued_bytes
    }

    /// Blocks until every tracked driver has been released, logging the
    /// stragglers once a second.
    pub fn wait_for_all_to_finish(&self) {
        let mut inner = self.inner.lock().unwrap();
        while !inner.ops.is_empty() {
            let (guard, wait) = self
                .drained
                .wait_timeout(inner, Duration::from_secs(1))
                .unwrap();
            inner = guard;
            if wait.timed_out() && !inner.ops.is_empty() {
                let descriptions: Vec<String> = inner
                    .ops
                    .values()
                    .take(5)
                    .map(|tracked| tracked.driver.description())
                    .collect();
                tracing::warn!(
                    tablet = %self.tablet_id,
                    pending = inner.ops.len(),
                    operations = ?descriptions,
                    "still waiting for in-flight operations to finish"
                );
            }
        }
    }

    pub fn start_instrumentation(&self, metrics: Arc<TrackerMetrics>) {
        *self.metrics.lock().unwrap() = Some(metrics);
    }

    /// Enables the queued-bytes admission cap.
    pub fn start_memory_tracking(&self, config: TrackerConfig) {
        self.inner.lock().unwrap().memory_limit = config.memory_limit_bytes;
    }
}
