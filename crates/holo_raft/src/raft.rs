//! Raft contract module wiring.
//!
//! `types` holds the shared value types (op-ids, hybrid time, replicate
//! messages), `clock` the hybrid clock, `consensus` the round handle and the
//! consensus trait, and `log` the WAL trait plus the anchor registry.

mod clock;
mod consensus;
mod log;
mod types;

pub use clock::{Clock, HybridClock};
pub use consensus::{
    ConsensusRound, MajorityReplicatedListenerFn, RaftConsensus, ReplicationFinishedFn,
    RoundAppendListener, SafeTimeProviderFn,
};
pub use log::{AnchorId, Log, LogAnchorRegistry, MaxIdxToSegmentSizeMap};
pub use types::{
    AtomicOpId, ConsensusBootstrapInfo, HybridTime, LeaderStatus, OpId, OpIdType, RaftConfig,
    ReplicateMsg, WireOpType,
};
