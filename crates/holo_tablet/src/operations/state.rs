//! Shared per-operation state and the operation contract.

use std::fmt;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use bytes::Bytes;

use holo_raft::raft::{ConsensusRound, HybridTime, OpId, ReplicateMsg, WireOpType};

use crate::tablet::{ApplyContext, Tablet};

/// Invoked exactly once with the operation's terminal status. All
/// user-visible outcomes flow through here; the driver never reports errors
/// to its caller directly.
pub type CompletionCallback = Box<dyn FnOnce(Result<()>) + Send>;

/// Operation kind, including the in-memory-only `Empty` used when a driver
/// carries nothing but a propagated safe time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OperationType {
    Write,
    AlterSchema,
    UpdateTransaction,
    Truncate,
    Snapshot,
    Empty,
}

impl OperationType {
    /// Wire form of this type; `Empty` has none.
    pub fn wire_type(&self) -> Option<WireOpType> {
        match self {
            OperationType::Write => Some(WireOpType::Write),
            OperationType::AlterSchema => Some(WireOpType::AlterSchema),
            OperationType::UpdateTransaction => Some(WireOpType::UpdateTransaction),
            OperationType::Truncate => Some(WireOpType::Truncate),
            OperationType::Snapshot => Some(WireOpType::Snapshot),
            OperationType::Empty => None,
        }
    }

    pub fn from_wire(wire: WireOpType) -> OperationType {
        match wire {
            WireOpType::Write => OperationType::Write,
            WireOpType::AlterSchema => OperationType::AlterSchema,
            WireOpType::UpdateTransaction => OperationType::UpdateTransaction,
            WireOpType::Truncate => OperationType::Truncate,
            WireOpType::Snapshot => OperationType::Snapshot,
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationType::Write => "write",
            OperationType::AlterSchema => "alter schema",
            OperationType::UpdateTransaction => "update transaction",
            OperationType::Truncate => "truncate",
            OperationType::Snapshot => "snapshot",
            OperationType::Empty => "empty",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
struct StateInner {
    op_id: OpId,
    hybrid_time: HybridTime,
    consensus_round: Option<Arc<ConsensusRound>>,
}

/// Per-operation record: identity, timing, the consensus round, and the
/// completion callback. The op-id and hybrid time are each assigned once.
pub struct OperationState {
    tablet: Arc<dyn Tablet>,
    request: Bytes,
    inner: Mutex<StateInner>,
    completion: Mutex<Option<CompletionCallback>>,
}

impl OperationState {
    pub fn new(tablet: Arc<dyn Tablet>, request: Bytes) -> Self {
        Self {
            tablet,
            request,
            inner: Mutex::new(StateInner {
                op_id: OpId::invalid(),
                hybrid_time: HybridTime::INVALID,
                consensus_round: None,
            }),
            completion: Mutex::new(None),
        }
    }

    pub fn with_completion(
        tablet: Arc<dyn Tablet>,
        request: Bytes,
        completion: CompletionCallback,
    ) -> Self {
        let state = Self::new(tablet, request);
        *state.completion.lock().unwrap() = Some(completion);
        state
    }

    pub fn tablet(&self) -> &Arc<dyn Tablet> {
        &self.tablet
    }

    pub fn request(&self) -> &Bytes {
        &self.request
    }

    pub fn op_id(&self) -> OpId {
        self.inner.lock().unwrap().op_id
    }

    pub fn set_op_id(&self, op_id: OpId) {
        let mut inner = self.inner.lock().unwrap();
        debug_assert!(!inner.op_id.valid(), "op id assigned twice");
        inner.op_id = op_id;
    }

    pub fn hybrid_time(&self) -> HybridTime {
        self.inner.lock().unwrap().hybrid_time
    }

    pub fn has_hybrid_time(&self) -> bool {
        self.hybrid_time().is_valid()
    }

    pub fn set_hybrid_time(&self, ht: HybridTime) {
        self.inner.lock().unwrap().hybrid_time = ht;
    }

    pub fn consensus_round(&self) -> Option<Arc<ConsensusRound>> {
        self.inner.lock().unwrap().consensus_round.clone()
    }

    pub fn set_consensus_round(&self, round: Arc<ConsensusRound>) {
        self.inner.lock().unwrap().consensus_round = Some(round);
    }

    /// Fires the completion callback. Later calls are no-ops, so a terminal
    /// status is delivered at most once.
    pub fn complete(&self, result: Result<()>) {
        if let Some(callback) = self.completion.lock().unwrap().take() {
            callback(result);
        }
    }

    /// In-memory footprint charged against the tracker's admission budget:
    /// the replicate message once a round exists, the raw request before.
    pub fn space_used(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        match &inner.consensus_round {
            Some(round) => round.replicate_msg().space_used(),
            None => std::mem::size_of::<Self>() + self.request.len(),
        }
    }
}

impl fmt::Debug for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock().unwrap();
        f.debug_struct("OperationState")
            .field("op_id", &inner.op_id)
            .field("hybrid_time", &inner.hybrid_time)
            .field("request_len", &self.request.len())
            .finish()
    }
}

/// One replicatable operation. Variants supply their type; the sequencing
/// hooks have defaults that route prepare/apply through the tablet and the
/// terminal status through the completion callback.
pub trait Operation: Send + Sync {
    fn state(&self) -> &OperationState;

    fn op_type(&self) -> OperationType;

    fn description(&self) -> String {
        format!(
            "{} [{} byte request]",
            self.op_type(),
            self.state().request().len()
        )
    }

    /// Builds the wire message proposed to consensus on the leader.
    fn new_replicate_msg(&self) -> ReplicateMsg {
        let Some(wire) = self.op_type().wire_type() else {
            panic!("operation type '{}' has no wire form", self.op_type());
        };
        ReplicateMsg::new(wire, self.state().request().clone())
    }

    /// Pre-replication side effects; failure aborts the operation as long as
    /// replication has not begun.
    fn prepare(&self) -> Result<()> {
        self.state()
            .tablet()
            .prepare_operation(self.op_type(), self.state().request())
    }

    /// Applies the operation to storage. Runs exactly once, only after both
    /// prepare and replication have succeeded.
    fn replicated(&self, leader_term: i64) -> Result<()> {
        let state = self.state();
        let ctx = ApplyContext {
            op_id: state.op_id(),
            hybrid_time: state.hybrid_time(),
            leader_term,
        };
        state
            .tablet()
            .apply_operation(self.op_type(), state.request(), ctx)?;
        state.complete(Ok(()));
        Ok(())
    }

    /// Terminal failure path for operations that never replicated.
    fn aborted(&self, status: anyhow::Error) {
        self.state().complete(Err(status));
    }

    fn submitted_to_preparer(&self) {}

    /// Leader-side notification that the entry hit the local log: records
    /// the op-id and adopts the hybrid time consensus stamped on the round.
    fn added_to_leader(&self, op_id: OpId, _committed_op_id: OpId) {
        let state = self.state();
        state.set_op_id(op_id);
        if let Some(round) = state.consensus_round() {
            let ht = round.replicate_msg().hybrid_time;
            if ht.is_valid() {
                state.set_hybrid_time(ht);
            }
        }
    }

    fn added_to_follower(&self) {}
}
