//! Storage-engine contract consumed by the tablet peer.
//!
//! The peer never touches storage directly: it prepares and applies
//! operations through [`Tablet`], pushes safe time through [`MvccManager`],
//! and consults the transaction coordinator for GC floors. Implementations
//! live with the storage engine.

use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;

use holo_raft::raft::{HybridTime, OpId};

use crate::operations::OperationType;

/// Kind of table a tablet belongs to. Transaction-status tables keep their
/// whole history in the transaction coordinator, which changes the log-GC
/// arithmetic.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TableType {
    Regular,
    TransactionStatus,
}

/// Largest op-ids the storage engine has made durable, split by store.
/// `intents` is absent when the tablet has no intents store.
#[derive(Clone, Copy, Debug)]
pub struct MaxPersistentOpIds {
    pub regular: OpId,
    pub intents: Option<OpId>,
}

/// Frontier metadata of one immutable memtable, as seen by the flush filter.
#[derive(Clone, Copy, Debug, Default)]
pub struct MemTableFrontier {
    /// Largest op-id of any entry written to the memtable, `None` for a
    /// degenerate memtable with no frontier recorded.
    pub largest_op_id: Option<OpId>,
}

/// Predicate deciding whether a memtable may flush.
pub type FlushFilter = Box<dyn Fn(&MemTableFrontier) -> Result<bool> + Send + Sync>;

/// Factory producing a fresh flush filter per flush decision.
pub type FlushFilterFactory = Box<dyn Fn() -> FlushFilter + Send + Sync>;

/// Everything an apply call needs besides the payload.
#[derive(Clone, Copy, Debug)]
pub struct ApplyContext {
    pub op_id: OpId,
    pub hybrid_time: HybridTime,
    pub leader_term: i64,
}

/// MVCC safe-time plumbing.
pub trait MvccManager: Send + Sync {
    fn set_propagated_safe_time_on_follower(&self, ht: HybridTime);
    fn update_propagated_safe_time_on_leader(&self, ht: HybridTime);
    /// Safe time under the given hybrid-time leader lease.
    fn safe_time(&self, ht_lease: HybridTime) -> HybridTime;
    fn last_replicated_hybrid_time(&self) -> HybridTime;
}

/// Transaction coordinator surface: lifecycle plus its log-GC floor.
pub trait TransactionCoordinator: Send + Sync {
    fn start(&self);
    /// Smallest log index the coordinator still needs retained.
    fn prepare_gc(&self) -> i64;
}

/// The tablet storage engine.
pub trait Tablet: Send + Sync {
    fn tablet_id(&self) -> &str;
    fn table_type(&self) -> TableType;

    /// Makes new operation acquisitions fail; set at the start of peer
    /// shutdown, before in-flight work drains.
    fn set_shutdown_requested(&self);
    fn shutdown(&self);

    /// Installs the factory gating memtable flushes on WAL durability.
    fn set_mem_table_flush_filter_factory(&self, factory: FlushFilterFactory);

    /// Operation-specific side effects that must run before replication is
    /// requested (lock acquisition, schema validation).
    fn prepare_operation(&self, op_type: OperationType, payload: &Bytes) -> Result<()>;

    /// Applies a replicated operation to storage. Failure here is treated as
    /// data corruption by the caller.
    fn apply_operation(&self, op_type: OperationType, payload: &Bytes, ctx: ApplyContext)
        -> Result<()>;

    fn max_persistent_op_id(&self) -> Result<MaxPersistentOpIds>;
    fn last_committed_write_index(&self) -> i64;

    /// Raises the tablet's monotonic counter to at least `value`.
    fn update_monotonic_counter(&self, value: i64);

    fn transaction_coordinator(&self) -> Option<Arc<dyn TransactionCoordinator>>;
    fn mvcc(&self) -> Arc<dyn MvccManager>;

    fn total_sst_file_sizes(&self) -> u64;
}
