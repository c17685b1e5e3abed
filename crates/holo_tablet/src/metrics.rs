//! Atomically updated counters for the preparer and the operation tracker.
//!
//! Histogram-shaped readings are kept as count/total/max triplets in
//! microseconds; `snapshot` returns a copy for scraping.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::operations::OperationType;

fn as_micros(duration: Duration) -> u64 {
    duration.as_micros().min(u128::from(u64::MAX)) as u64
}

/// Number of [`OperationType`] variants, for the per-type counter arrays.
pub const OP_TYPE_SLOTS: usize = 6;

fn op_type_slot(op_type: OperationType) -> usize {
    match op_type {
        OperationType::Write => 0,
        OperationType::AlterSchema => 1,
        OperationType::UpdateTransaction => 2,
        OperationType::Truncate => 3,
        OperationType::Snapshot => 4,
        OperationType::Empty => 5,
    }
}

/// Preparer instrumentation: queue depth at submit, time spent queued, time
/// spent in prepare.
#[derive(Default)]
pub struct PreparerMetrics {
    queue_depth: AtomicU64,
    queue_len_count: AtomicU64,
    queue_len_total: AtomicU64,
    queue_len_max: AtomicU64,
    queue_time_count: AtomicU64,
    queue_time_total_us: AtomicU64,
    queue_time_max_us: AtomicU64,
    run_time_count: AtomicU64,
    run_time_total_us: AtomicU64,
    run_time_max_us: AtomicU64,
}

#[derive(Default, Debug, Clone, Copy)]
pub struct PreparerMetricsSnapshot {
    pub queue_depth: u64,
    pub queue_len_count: u64,
    pub queue_len_total: u64,
    pub queue_len_max: u64,
    pub queue_time_count: u64,
    pub queue_time_total_us: u64,
    pub queue_time_max_us: u64,
    pub run_time_count: u64,
    pub run_time_total_us: u64,
    pub run_time_max_us: u64,
}

impl PreparerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one enqueue and returns nothing; the sampled depth includes
    /// the new entry.
    pub fn record_enqueue(&self) {
        let depth = self.queue_depth.fetch_add(1, Ordering::Relaxed) + 1;
        self.queue_len_count.fetch_add(1, Ordering::Relaxed);
        self.queue_len_total.fetch_add(depth, Ordering::Relaxed);
        self.queue_len_max.fetch_max(depth, Ordering::Relaxed);
    }

    /// Undo of `record_enqueue` for a submit whose send failed.
    pub fn record_enqueue_failed(&self) {
        self.queue_depth.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_dequeue(&self, queued_for: Duration) {
        self.queue_depth.fetch_sub(1, Ordering::Relaxed);
        let us = as_micros(queued_for);
        self.queue_time_count.fetch_add(1, Ordering::Relaxed);
        self.queue_time_total_us.fetch_add(us, Ordering::Relaxed);
        self.queue_time_max_us.fetch_max(us, Ordering::Relaxed);
    }

    pub fn record_run(&self, ran_for: Duration) {
        let us = as_micros(ran_for);
        self.run_time_count.fetch_add(1, Ordering::Relaxed);
        self.run_time_total_us.fetch_add(us, Ordering::Relaxed);
        self.run_time_max_us.fetch_max(us, Ordering::Relaxed);
    }

    pub fn queue_depth(&self) -> u64 {
        self.queue_depth.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> PreparerMetricsSnapshot {
        PreparerMetricsSnapshot {
            queue_depth: self.queue_depth.load(Ordering::Relaxed),
            queue_len_count: self.queue_len_count.load(Ordering::Relaxed),
            queue_len_total: self.queue_len_total.load(Ordering::Relaxed),
            queue_len_max: self.queue_len_max.load(Ordering::Relaxed),
            queue_time_count: self.queue_time_count.load(Ordering::Relaxed),
            queue_time_total_us: self.queue_time_total_us.load(Ordering::Relaxed),
            queue_time_max_us: self.queue_time_max_us.load(Ordering::Relaxed),
            run_time_count: self.run_time_count.load(Ordering::Relaxed),
            run_time_total_us: self.run_time_total_us.load(Ordering::Relaxed),
            run_time_max_us: self.run_time_max_us.load(Ordering::Relaxed),
        }
    }
}

/// Tracker instrumentation: admission outcomes, live gauges, and totals
/// broken down by operation type.
#[derive(Default)]
pub struct TrackerMetrics {
    ops_added: AtomicU64,
    ops_released: AtomicU64,
    ops_rejected: AtomicU64,
    ops_in_flight: AtomicU64,
    queued_bytes: AtomicU64,
    ops_added_by_type: [AtomicU64; OP_TYPE_SLOTS],
}

#[derive(Default, Debug, Clone, Copy)]
pub struct TrackerMetricsSnapshot {
    pub ops_added: u64,
    pub ops_released: u64,
    pub ops_rejected: u64,
    pub ops_in_flight: u64,
    pub queued_bytes: u64,
    /// Total admissions per operation type, indexed by `op_type_slot` order.
    pub ops_added_by_type: [u64; OP_TYPE_SLOTS],
}

impl TrackerMetricsSnapshot {
    pub fn ops_added_of_type(&self, op_type: OperationType) -> u64 {
        self.ops_added_by_type[op_type_slot(op_type)]
    }
}

impl TrackerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_add(&self, op_type: OperationType, bytes: u64) {
        self.ops_added.fetch_add(1, Ordering::Relaxed);
        self.ops_added_by_type[op_type_slot(op_type)].fetch_add(1, Ordering::Relaxed);
        self.ops_in_flight.fetch_add(1, Ordering::Relaxed);
        self.queued_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_release(&self, bytes: u64) {
        self.ops_released.fetch_add(1, Ordering::Relaxed);
        self.ops_in_flight.fetch_sub(1, Ordering::Relaxed);
        self.queued_bytes.fetch_sub(bytes, Ordering::Relaxed);
    }

    pub fn record_rejection(&self) {
        self.ops_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TrackerMetricsSnapshot {
        let mut ops_added_by_type = [0u64; OP_TYPE_SLOTS];
        for (slot, counter) in self.ops_added_by_type.iter().enumerate() {
            ops_added_by_type[slot] = counter.load(Ordering::Relaxed);
        }
        TrackerMetricsSnapshot {
            ops_added: self.ops_added.load(Ordering::Relaxed),
            ops_released: self.ops_released.load(Ordering::Relaxed),
            ops_rejected: self.ops_rejected.load(Ordering::Relaxed),
            ops_in_flight: self.ops_in_flight.load(Ordering::Relaxed),
            queued_bytes: self.queued_bytes.load(Ordering::Relaxed),
            ops_added_by_type,
        }
    }
}
