//! Consensus round handle and the engine-facing trait.
//!
//! A `ConsensusRound` is shared between the engine and the code that proposed
//! it. The engine drives the round through `notify_append` /
//! `notify_replicated`; the proposer listens through a weak append listener
//! and a one-shot replicated callback. Weak handles keep the round from
//! extending the proposer's lifetime: a callback whose target is gone is a
//! no-op.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use super::types::{
    ConsensusBootstrapInfo, HybridTime, LeaderStatus, OpId, OpIdType, RaftConfig, ReplicateMsg,
};

/// Callback fired exactly once when a round finishes replicating. On success
/// the callee appends the op-ids it applied to the provided vector.
pub type ReplicationFinishedFn =
    Box<dyn FnOnce(anyhow::Result<()>, i64, &mut Vec<OpId>) + Send>;

/// Provider returning the current propagated-safe-time candidate, registered
/// with the engine so it can piggyback safe time on outgoing traffic.
pub type SafeTimeProviderFn = Box<dyn Fn() -> HybridTime + Send + Sync>;

/// Listener invoked whenever the majority-replicated watermark advances.
pub type MajorityReplicatedListenerFn = Box<dyn Fn() + Send + Sync>;

/// Receives the local-log append notification for a round.
pub trait RoundAppendListener: Send + Sync {
    fn handle_consensus_append(&self, op_id: OpId, committed_op_id: OpId);
}

/// A single proposed log entry in flight through the engine.
pub struct ConsensusRound {
    msg: Mutex<ReplicateMsg>,
    bound_term: AtomicI64,
    append_listener: Mutex<Option<Weak<dyn RoundAppendListener>>>,
    replicated_cb: Mutex<Option<ReplicationFinishedFn>>,
    appended: AtomicBool,
    replication_finished: AtomicBool,
}

impl ConsensusRound {
    pub fn new(msg: ReplicateMsg) -> Arc<Self> {
        Arc::new(Self {
            msg: Mutex::new(msg),
            bound_term: AtomicI64::new(0),
            append_listener: Mutex::new(None),
            replicated_cb: Mutex::new(None),
            appended: AtomicBool::new(false),
            replication_finished: AtomicBool::new(false),
        })
    }

    /// Ties the round to the term it was proposed in. The engine rejects the
    /// round if leadership changes before the entry is appended.
    pub fn bind_to_term(&self, term: i64) {
        self.bound_term.store(term, Ordering::Release);
    }

    pub fn bound_term(&self) -> i64 {
        self.bound_term.load(Ordering::Acquire)
    }

    pub fn set_append_listener(&self, listener: Weak<dyn RoundAppendListener>) {
        *self.append_listener.lock().unwrap() = Some(listener);
    }

    pub fn set_replicated_callback(&self, callback: ReplicationFinishedFn) {
        *self.replicated_cb.lock().unwrap() = Some(callback);
    }

    /// Detaches the proposer from the round. Later notifications become
    /// no-ops; only legal before replication has been requested.
    pub fn clear_callbacks(&self) {
        *self.append_listener.lock().unwrap() = None;
        *self.replicated_cb.lock().unwrap() = None;
    }

    pub fn replicate_msg(&self) -> ReplicateMsg {
        self.msg.lock().unwrap().clone()
    }

    /// Engine-side mutation of the message (op-id and hybrid-time assignment
    /// at append time).
    pub fn with_replicate_msg_mut<R>(&self, f: impl FnOnce(&mut ReplicateMsg) -> R) -> R {
        f(&mut self.msg.lock().unwrap())
    }

    /// Engine entry point: the entry was appended to the local log. Panics on
    /// a second call; the append notification is a once-per-round contract.
    pub fn notify_append(&self, op_id: OpId, committed_op_id: OpId) {
        assert!(
            !self.appended.swap(true, Ordering::AcqRel),
            "consensus round appended twice (op id {op_id})"
        );
        {
            let mut msg = self.msg.lock().unwrap();
            msg.op_id = op_id;
            msg.committed_op_id = committed_op_id;
        }
        let listener = self.append_listener.lock().unwrap().clone();
        if let Some(listener) = listener.and_then(|weak| weak.upgrade()) {
            listener.handle_consensus_append(op_id, committed_op_id);
        }
    }

    /// Engine entry point: the round finished replicating (or failed). The
    /// callback fires at most once even if the engine misbehaves.
    pub fn notify_replicated(
        &self,
        result: anyhow::Result<()>,
        leader_term: i64,
        applied_op_ids: &mut Vec<OpId>,
    ) {
        if self.replication_finished.swap(true, Ordering::AcqRel) {
            tracing::error!(
                op_id = %self.replicate_msg().op_id,
                "replication finished delivered twice for one round"
            );
            debug_assert!(false, "replication finished delivered twice");
            return;
        }
        let callback = self.replicated_cb.lock().unwrap().take();
        match callback {
            Some(callback) => callback(result, leader_term, applied_op_ids),
            None => tracing::debug!(
                op_id = %self.replicate_msg().op_id,
                "replication finished for a round with no callback"
            ),
        }
    }

    pub fn appended(&self) -> bool {
        self.appended.load(Ordering::Acquire)
    }

    pub fn replication_finished(&self) -> bool {
        self.replication_finished.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for ConsensusRound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsensusRound")
            .field("msg", &self.replicate_msg())
            .field("bound_term", &self.bound_term())
            .field("appended", &self.appended())
            .finish()
    }
}

/// Replication engine contract consumed by a tablet peer.
///
/// Implementations own leader election, log append, and commit tracking; the
/// peer only proposes rounds and reacts to their callbacks.
pub trait RaftConsensus: Send + Sync {
    fn tablet_id(&self) -> &str;
    fn peer_uuid(&self) -> &str;

    fn start(&self, bootstrap_info: &ConsensusBootstrapInfo) -> anyhow::Result<()>;
    fn shutdown(&self);
    fn is_running(&self) -> bool;

    fn current_term(&self) -> i64;
    fn leader_status(&self) -> LeaderStatus;
    fn committed_config(&self) -> RaftConfig;

    /// Builds a pending round around `msg`. The caller installs its
    /// callbacks and binds the term before handing the round back through
    /// [`RaftConsensus::replicate_round`].
    fn new_round(&self, msg: ReplicateMsg) -> Arc<ConsensusRound>;

    /// Submits a prepared round for append and replication. Ordering of
    /// successive calls is the log ordering.
    fn replicate_round(&self, round: &Arc<ConsensusRound>) -> anyhow::Result<()>;

    /// Last op-id of the requested kind, `None` when nothing qualifies yet.
    fn last_op_id(&self, op_id_type: OpIdType) -> anyhow::Result<Option<OpId>>;

    /// Majority-replicated leader-lease expiration in physical microseconds;
    /// zero when no lease information is available.
    fn majority_replicated_ht_lease_expiration(&self, min_allowed: u64, deadline: Instant) -> u64;

    fn set_propagated_safe_time_provider(&self, provider: SafeTimeProviderFn);
    fn set_majority_replicated_listener(&self, listener: MajorityReplicatedListenerFn);

    fn on_disk_size(&self) -> u64;
}
