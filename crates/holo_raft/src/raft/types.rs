//! Shared value types for the consensus contract.
//!
//! These are kept in a small, dependency-light module because they are used
//! by both the replication engine side and the tablet orchestration side.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Identity of one replicated log entry: the term it was proposed in and its
/// position in the log. An op-id with `index == 0` is the "not yet assigned"
/// sentinel.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct OpId {
    pub term: i64,
    pub index: i64,
}

impl OpId {
    pub const fn new(term: i64, index: i64) -> Self {
        Self { term, index }
    }

    pub const fn invalid() -> Self {
        Self { term: 0, index: 0 }
    }

    pub const fn valid(&self) -> bool {
        self.index > 0
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.term, self.index)
    }
}

/// Publish-once cell for an op-id that must stay readable without taking the
/// owner's lock.
///
/// The writer stores the term first and the index last with release ordering;
/// readers load the index with acquire ordering and only then the term. Since
/// an op-id is assigned exactly once and a valid op-id has a non-zero index,
/// a reader either observes the full assignment or `OpId::invalid()`.
#[derive(Debug, Default)]
pub struct AtomicOpId {
    term: AtomicI64,
    index: AtomicI64,
}

impl AtomicOpId {
    pub const fn new() -> Self {
        Self {
            term: AtomicI64::new(0),
            index: AtomicI64::new(0),
        }
    }

    pub fn store(&self, op_id: OpId) {
        self.term.store(op_id.term, Ordering::Relaxed);
        self.index.store(op_id.index, Ordering::Release);
    }

    pub fn load(&self) -> OpId {
        let index = self.index.load(Ordering::Acquire);
        if index == 0 {
            return OpId::invalid();
        }
        OpId {
            term: self.term.load(Ordering::Relaxed),
            index,
        }
    }
}

/// Hybrid logical/physical timestamp: microseconds since the epoch in the
/// upper bits, a logical sequence in the lower [`HybridTime::LOGICAL_BITS`].
///
/// Zero doubles as the "invalid / unset" sentinel, which is also the
/// default.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HybridTime(u64);

impl HybridTime {
    pub const LOGICAL_BITS: u32 = 12;
    pub const INVALID: HybridTime = HybridTime(0);
    pub const MAX: HybridTime = HybridTime(u64::MAX);
    /// Largest physical component a hybrid time can carry. Lease expirations
    /// at or above this bound mean leases are effectively disabled.
    pub const MAX_PHYSICAL_MICROS: u64 = u64::MAX >> Self::LOGICAL_BITS;

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn from_micros(micros: u64) -> Self {
        Self(micros << Self::LOGICAL_BITS)
    }

    pub const fn new(micros: u64, logical: u64) -> Self {
        Self((micros << Self::LOGICAL_BITS) | (logical & ((1 << Self::LOGICAL_BITS) - 1)))
    }

    pub const fn raw(&self) -> u64 {
        self.0
    }

    pub const fn physical_micros(&self) -> u64 {
        self.0 >> Self::LOGICAL_BITS
    }

    pub const fn logical(&self) -> u64 {
        self.0 & ((1 << Self::LOGICAL_BITS) - 1)
    }

    pub const fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for HybridTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_valid() {
            return write!(f, "<invalid>");
        }
        write!(f, "{{ physical: {} logical: {} }}", self.physical_micros(), self.logical())
    }
}

/// Operation kind as it appears in a replicate message. There is no wire
/// form for in-memory-only safe-time updates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WireOpType {
    Write,
    AlterSchema,
    UpdateTransaction,
    Truncate,
    Snapshot,
}

impl fmt::Display for WireOpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WireOpType::Write => "WRITE_OP",
            WireOpType::AlterSchema => "ALTER_SCHEMA_OP",
            WireOpType::UpdateTransaction => "UPDATE_TRANSACTION_OP",
            WireOpType::Truncate => "TRUNCATE_OP",
            WireOpType::Snapshot => "SNAPSHOT_OP",
        };
        f.write_str(name)
    }
}

/// One proposed log entry. The engine treats the payload as opaque bytes;
/// `op_id` and `hybrid_time` are assigned by the engine when the entry is
/// appended to the local log.
#[derive(Clone, Debug)]
pub struct ReplicateMsg {
    pub op_type: WireOpType,
    pub op_id: OpId,
    pub committed_op_id: OpId,
    pub hybrid_time: HybridTime,
    pub monotonic_counter: i64,
    pub payload: Bytes,
}

impl ReplicateMsg {
    pub fn new(op_type: WireOpType, payload: Bytes) -> Self {
        Self {
            op_type,
            op_id: OpId::invalid(),
            committed_op_id: OpId::invalid(),
            hybrid_time: HybridTime::INVALID,
            monotonic_counter: 0,
            payload,
        }
    }

    /// Approximate in-memory footprint, used for admission accounting.
    pub fn space_used(&self) -> usize {
        std::mem::size_of::<Self>() + self.payload.len()
    }
}

/// Which op-id to ask the engine for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpIdType {
    Received,
    Committed,
}

/// Leadership as seen by the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LeaderStatus {
    NotLeader,
    LeaderNotReady,
    LeaderReady,
}

/// State recovered from the log before the engine starts: the last entry
/// written and the last entry known committed.
#[derive(Clone, Copy, Debug, Default)]
pub struct ConsensusBootstrapInfo {
    pub last_id: Option<OpId>,
    pub last_committed_id: Option<OpId>,
}

/// Committed membership of the tablet's raft group.
#[derive(Clone, Debug, Default)]
pub struct RaftConfig {
    /// Log index at which this configuration was committed.
    pub opid_index: Option<i64>,
    pub peer_uuids: Vec<String>,
}
