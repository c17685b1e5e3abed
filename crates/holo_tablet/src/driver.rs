//! Two-axis operation state machine.
//!
//! Every operation moves along two independent axes: prepare (run by the
//! preparer worker) and replication (driven by consensus callbacks). Apply
//! fires exactly once, from whichever completion path observes the other
//! axis already done. Both completion paths take the driver lock, set their
//! own axis, snapshot the other, release, and act on the snapshot; the
//! critical sections stay constant-time.
//!
//! Failure handling is asymmetric: before replication begins an operation
//! can be aborted and its caller notified; once an entry may exist in the
//! replicated log the operation has to run to completion, and asking to
//! cancel it is a process-fatal bug.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::Result;

use holo_raft::raft::{
    AtomicOpId, ConsensusRound, HybridTime, OpId, RaftConsensus, RoundAppendListener,
};

use crate::operations::{Operation, OperationType};
use crate::preparer::Preparer;
use crate::tablet::{MvccManager, TableType};
use crate::tracker::OperationTracker;

/// Replication axis. `ReplicationFailed` is terminal; a round can never
/// succeed after it has failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplicationState {
    NotReplicating,
    Replicating,
    Replicated,
    ReplicationFailed,
}

/// Prepare axis.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PrepareState {
    NotPrepared,
    Prepared,
}

/// Whether the driver proposes the operation or applies a replicated one.
#[derive(Clone, Copy, Debug)]
pub enum DriverMode {
    Leader { term: i64 },
    Replica,
}

/// Returned when driver initialization fails; ownership of the operation
/// moves back to the caller so it can fire the completion callback.
pub struct InitFailure {
    pub error: anyhow::Error,
    pub operation: Option<Box<dyn Operation>>,
}

impl fmt::Debug for InitFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InitFailure")
            .field("error", &self.error)
            .field("has_operation", &self.operation.is_some())
            .finish()
    }
}

#[derive(Debug)]
struct DriverState {
    replication: ReplicationState,
    prepare: PrepareState,
    propagated_safe_time: Option<HybridTime>,
}

/// Drives one operation from submission to apply or abort.
///
/// The tracker holds the strong references that keep a driver alive while it
/// is in flight; consensus rounds reach it through weak handles only, so a
/// released driver turns late callbacks into no-ops.
pub struct OperationDriver {
    tracker: Arc<OperationTracker>,
    consensus: Option<Arc<dyn RaftConsensus>>,
    preparer: Arc<Preparer>,
    table_type: TableType,
    submit_delay: Option<Duration>,

    operation: Mutex<Option<Box<dyn Operation>>>,
    /// Lock-free copy of the assigned op-id, published as soon as it is
    /// known so GC accounting can read it without the driver lock.
    op_id_copy: AtomicOpId,
    state: Mutex<DriverState>,
    mvcc: Mutex<Option<Arc<dyn MvccManager>>>,
    is_leader_side: AtomicBool,
    start_time: Instant,
    prepare_physical_micros: AtomicU64,
}

fn unix_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros()
        .min(u128::from(u64::MAX)) as u64
}

impl OperationDriver {
    pub fn new(
        tracker: Arc<OperationTracker>,
        consensus: Option<Arc<dyn RaftConsensus>>,
        preparer: Arc<Preparer>,
        table_type: TableType,
        submit_delay: Option<Duration>,
    ) -> Arc<Self> {
        Arc::new(Self {
            tracker,
            consensus,
            preparer,
            table_type,
            submit_delay,
            operation: Mutex::new(None),
            op_id_copy: AtomicOpId::new(),
            state: Mutex::new(DriverState {
                replication: ReplicationState::NotReplicating,
                prepare: PrepareState::NotPrepared,
                propagated_safe_time: None,
            }),
            mvcc: Mutex::new(None),
            is_leader_side: AtomicBool::new(false),
            start_time: Instant::now(),
            prepare_physical_micros: AtomicU64::new(0),
        })
    }

    /// Adopts the operation and registers with the tracker.
    ///
    /// Leader mode builds the consensus round and installs this driver as
    /// its append listener and replicated callback. Replica mode publishes
    /// the already-known op-id and marks replication as in progress. If the
    /// tracker rejects the driver, the operation is handed back.
    pub fn init(
        self: &Arc<Self>,
        operation: Option<Box<dyn Operation>>,
        mode: DriverMode,
    ) -> Result<(), InitFailure> {
        if let Some(op) = operation {
            *self.operation.lock().unwrap() = Some(op);
        }

        match mode {
            DriverMode::Replica => {
                if let Some(op) = self.operation.lock().unwrap().as_deref() {
                    let op_id = op.state().op_id();
                    if op_id.valid() {
                        self.op_id_copy.store(op_id);
                    }
                }
                self.state.lock().unwrap().replication = ReplicationState::Replicating;
            }
            DriverMode::Leader { term } => {
                self.is_leader_side.store(true, Ordering::Relaxed);
                if let Some(consensus) = &self.consensus {
                    let guard = self.operation.lock().unwrap();
                    let Some(op) = guard.as_deref() else {
                        return Err(InitFailure {
                            error: anyhow::anyhow!("leader driver requires an operation"),
                            operation: None,
                        });
                    };
                    let round = consensus.new_round(op.new_replicate_msg());
                    round.bind_to_term(term);
                    let weak = Arc::downgrade(self);
                    round.set_replicated_callback(Box::new(
                        move |result, leader_term, applied_op_ids| {
                            if let Some(driver) = weak.upgrade() {
                                driver.replication_finished(result, leader_term, applied_op_ids);
                            }
                        },
                    ));
                    round.set_append_listener(
                        Arc::downgrade(self) as Weak<dyn RoundAppendListener>
                    );
                    op.state().set_consensus_round(round);
                }
            }
        }

        if let Err(error) = self.tracker.add(self) {
            let operation = self.operation.lock().unwrap().take();
            return Err(InitFailure { error, operation });
        }

        if matches!(mode, DriverMode::Replica) {
            if let Some(op) = self.operation.lock().unwrap().as_deref() {
                op.added_to_follower();
            }
        }

        Ok(())
    }

    /// Hands the driver to the preparer. A failed submission is routed
    /// through the failure path; the operation is notified either way.
    pub fn execute_async(self: &Arc<Self>) {
        if let Some(delay) = self.submit_delay {
            if self.op_type() == OperationType::Write && self.table_type == TableType::Regular {
                tracing::info!(
                    delay_ms = delay.as_millis() as u64,
                    "{}delaying submission for testing",
                    self.log_prefix()
                );
                thread::sleep(delay);
            }
        }

        let submitted = self.preparer.submit(Arc::clone(self));

        if let Some(op) = self.operation.lock().unwrap().as_deref() {
            op.submitted_to_preparer();
        }

        if let Err(err) = submitted {
            if !self.has_operation() {
                // Safe-time-only drivers have nothing to abort and no
                // caller to notify; just let go of the tracker slot.
                tracing::warn!(
                    error = %err,
                    "{}dropping safe-time propagation, preparer rejected it",
                    self.log_prefix()
                );
                self.tracker.release(self, None);
            } else {
                self.handle_failure(err);
            }
        }
    }

    /// Published op-id; `OpId::invalid()` until assignment.
    pub fn op_id(&self) -> OpId {
        self.op_id_copy.load()
    }

    pub fn op_type(&self) -> OperationType {
        self.operation
            .lock()
            .unwrap()
            .as_deref()
            .map(|op| op.op_type())
            .unwrap_or(OperationType::Empty)
    }

    pub fn has_operation(&self) -> bool {
        self.operation.lock().unwrap().is_some()
    }

    pub fn replication_state(&self) -> ReplicationState {
        self.state.lock().unwrap().replication
    }

    pub fn prepare_state(&self) -> PrepareState {
        self.state.lock().unwrap().prepare
    }

    pub fn start_time(&self) -> Instant {
        self.start_time
    }

    /// Wall-clock microseconds at which prepare last started, zero before.
    pub fn prepare_physical_micros(&self) -> u64 {
        self.prepare_physical_micros.load(Ordering::Relaxed)
    }

    pub fn space_used(&self) -> usize {
        self.operation
            .lock()
            .unwrap()
            .as_deref()
            .map(|op| op.state().space_used())
            .unwrap_or(0)
    }

    /// Attaches a safe time to push into MVCC when the driver starts.
    pub fn set_propagated_safe_time(&self, ht: HybridTime, mvcc: Arc<dyn MvccManager>) {
        *self.mvcc.lock().unwrap() = Some(mvcc);
        self.state.lock().unwrap().propagated_safe_time = Some(ht);
    }

    /// Runs prepare on the preparer worker. Returns whether the driver is
    /// ready for its round to be handed to consensus.
    pub(crate) fn prepare_and_start_task(&self) -> bool {
        match self.prepare_and_start() {
            Ok(()) => true,
            Err(err) => {
                self.handle_failure(err);
                false
            }
        }
    }

    fn prepare_and_start(&self) -> Result<()> {
        self.prepare_physical_micros
            .store(unix_micros(), Ordering::Relaxed);

        {
            let guard = self.operation.lock().unwrap();
            if let Some(op) = guard.as_deref() {
                op.prepare()?;
            }
        }

        // Only hold the lock long enough to copy the replication state and
        // check our own axis. This is what guarantees that exactly one of
        // the prepare/replicate completions triggers apply.
        let repl_state_copy = {
            let state = self.state.lock().unwrap();
            assert_eq!(
                state.prepare,
                PrepareState::NotPrepared,
                "prepare ran twice for one operation"
            );
            state.replication
        };

        if repl_state_copy != ReplicationState::NotReplicating {
            // Replication is already underway (replica path), so the hybrid
            // time is assigned and it is safe to start immediately.
            if !self.start_operation() {
                return Ok(());
            }
        }

        {
            let mut state = self.state.lock().unwrap();
            // Nobody else writes the prepare flag, so the assertion above
            // still holds. After this update the replicated callback is
            // allowed to apply the operation.
            assert_eq!(
                state.prepare,
                PrepareState::NotPrepared,
                "prepare ran twice for one operation"
            );
            state.prepare = PrepareState::Prepared;

            if state.replication == ReplicationState::NotReplicating {
                state.replication = ReplicationState::Replicating;
            }
        }

        Ok(())
    }

    /// Pushes the attached safe time into MVCC. Returns false when the
    /// driver has no operation (safe-time-only drivers), in which case it
    /// has already released itself from the tracker.
    fn start_operation(&self) -> bool {
        let propagated = self.state.lock().unwrap().propagated_safe_time;
        if let Some(ht) = propagated {
            let mvcc = self.mvcc.lock().unwrap().clone();
            if let Some(mvcc) = mvcc {
                mvcc.set_propagated_safe_time_on_follower(ht);
            }
        }

        if !self.has_operation() {
            self.tracker.release(self, None);
            return false;
        }
        true
    }

    /// Consensus callback: the round finished replicating, successfully or
    /// not. Applies or aborts depending on the outcome once prepare is also
    /// done.
    pub fn replication_finished(
        &self,
        result: Result<()>,
        leader_term: i64,
        applied_op_ids: &mut Vec<OpId>,
    ) {
        if result.is_ok() && !self.op_id().valid() {
            tracing::error!("{}replication succeeded without an op id", self.log_prefix());
            debug_assert!(false, "replication succeeded without an op id");
        }

        let prepare_state_copy = {
            let mut state = self.state.lock().unwrap();
            if state.replication == ReplicationState::ReplicationFailed {
                if result.is_ok() {
                    tracing::error!(
                        "round replicated after its replication had already failed"
                    );
                    debug_assert!(false, "replication success after failure");
                }
                return;
            }
            assert_eq!(
                state.replication,
                ReplicationState::Replicating,
                "replication finished while not replicating"
            );
            state.replication = if result.is_ok() {
                ReplicationState::Replicated
            } else {
                ReplicationState::ReplicationFailed
            };
            state.prepare
        };

        if prepare_state_copy != PrepareState::Prepared {
            // On a replica the commit notification can outrun the prepare
            // queue. The preparer always drains, so wait for it rather than
            // giving up on an entry that is already in the log.
            tracing::warn!(
                "{}replication finished before prepare completed, waiting for prepare",
                self.log_prefix()
            );
            let mut waited_ms = 0u64;
            loop {
                thread::sleep(Duration::from_millis(1));
                waited_ms += 1;
                if self.state.lock().unwrap().prepare == PrepareState::Prepared {
                    break;
                }
                if waited_ms % 1000 == 0 {
                    tracing::warn!(
                        waited_ms,
                        "{}still waiting for prepare to complete",
                        self.log_prefix()
                    );
                }
            }
        }

        match result {
            Ok(()) => self.apply_task(leader_term, applied_op_ids),
            Err(err) => self.handle_failure(err),
        }
    }

    fn apply_task(&self, leader_term: i64, applied_op_ids: &mut Vec<OpId>) {
        // Every path into apply (preparer worker, round callback upgrade)
        // holds a strong reference, so releasing from the tracker below
        // cannot drop the driver out from under us.
        #[cfg(debug_assertions)]
        {
            let state = self.state.lock().unwrap();
            debug_assert_eq!(state.replication, ReplicationState::Replicated);
            debug_assert_eq!(state.prepare, PrepareState::Prepared);
        }

        let log_prefix = self.log_prefix();
        {
            let guard = self.operation.lock().unwrap();
            let Some(op) = guard.as_deref() else {
                panic!("{log_prefix}apply requested for a driver without an operation");
            };
            if let Err(err) = op.replicated(leader_term) {
                // The entry is in the replicated log but storage refused it;
                // continuing would diverge this replica.
                panic!("{log_prefix}apply failed: {err:?}");
            }
        }

        self.tracker.release(self, Some(applied_op_ids));
    }

    /// Routes a failure according to how far replication got: abort and
    /// notify before replication, process-fatal after.
    pub fn handle_failure(&self, status: anyhow::Error) {
        let repl_state_copy = self.state.lock().unwrap().replication;

        match repl_state_copy {
            ReplicationState::NotReplicating | ReplicationState::ReplicationFailed => {
                tracing::info!(
                    error = %status,
                    "{}operation failed prior to replication success",
                    self.log_prefix()
                );
                {
                    let guard = self.operation.lock().unwrap();
                    if let Some(op) = guard.as_deref() {
                        // Detach from the round so a late append or commit
                        // notification cannot resurrect the operation.
                        if let Some(round) = op.state().consensus_round() {
                            round.clear_callbacks();
                        }
                        op.aborted(status);
                    }
                }
                self.tracker.release(self, None);
            }
            ReplicationState::Replicating | ReplicationState::Replicated => {
                panic!(
                    "{}cannot cancel an operation that has already replicated: {status:?}",
                    self.log_prefix()
                );
            }
        }
    }

    /// External cancellation. Effective only before replication begins; an
    /// operation past that point runs to completion and its applied side
    /// effects stand.
    pub fn abort(&self, status: anyhow::Error) {
        let repl_state_copy = self.state.lock().unwrap().replication;
        if repl_state_copy == ReplicationState::NotReplicating {
            self.handle_failure(status);
        }
    }

    /// The consensus round to submit for replication after prepare, present
    /// only on leader-side drivers.
    pub(crate) fn round_for_replication(&self) -> Option<Arc<ConsensusRound>> {
        if !self.is_leader_side.load(Ordering::Relaxed) {
            return None;
        }
        self.operation
            .lock()
            .unwrap()
            .as_deref()
            .and_then(|op| op.state().consensus_round())
    }

    fn state_code(replication: ReplicationState, prepare: PrepareState) -> String {
        let repl = match replication {
            ReplicationState::NotReplicating => "NR",
            ReplicationState::Replicating => "R",
            ReplicationState::ReplicationFailed => "RF",
            ReplicationState::Replicated => "RD",
        };
        let prep = match prepare {
            PrepareState::Prepared => "P",
            PrepareState::NotPrepared => "NP",
        };
        format!("{repl}-{prep}")
    }

    /// Two-axis state as a short code (`NR|R|RF|RD` × `P|NP`).
    pub fn state_str(&self) -> String {
        let state = self.state.lock().unwrap();
        Self::state_code(state.replication, state.prepare)
    }

    pub fn description(&self) -> String {
        let state_str = self.state_str();
        match self.operation.lock().unwrap().as_deref() {
            Some(op) => format!("{state_str} {}", op.description()),
            None => format!("{state_str} [no operation]"),
        }
    }

    /// `T <tablet> P <peer> S <state> Ts <hybrid time> <op type>: ` prefix
    /// identifying the operation in log output.
    pub fn log_prefix(&self) -> String {
        let state_str = self.state_str();
        let ts_string = self
            .operation
            .lock()
            .unwrap()
            .as_deref()
            .filter(|op| op.state().has_hybrid_time())
            .map(|op| op.state().hybrid_time().to_string())
            .unwrap_or_else(|| "<unassigned>".to_string());
        let (tablet, peer) = match &self.consensus {
            Some(consensus) => (
                consensus.tablet_id().to_string(),
                consensus.peer_uuid().to_string(),
            ),
            None => ("(unknown)".to_string(), "(unknown)".to_string()),
        };
        format!(
            "T {tablet} P {peer} S {state_str} Ts {ts_string} {}: ",
            self.op_type()
        )
    }
}

impl RoundAppendListener for OperationDriver {
    /// Consensus callback on the leader: the entry hit the local log.
    /// Publishes the op-id and starts the operation.
    fn handle_consensus_append(&self, op_id: OpId, committed_op_id: OpId) {
        assert!(
            !self.op_id().valid(),
            "consensus append delivered twice (op id {op_id})"
        );
        self.op_id_copy.store(op_id);

        {
            let guard = self.operation.lock().unwrap();
            let Some(op) = guard.as_deref() else {
                panic!("append notification for a driver without an operation");
            };
            op.added_to_leader(op_id, committed_op_id);
        }

        self.start_operation();
    }
}

impl fmt::Debug for OperationDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationDriver")
            .field("op_id", &self.op_id())
            .field("description", &self.description())
            .finish()
    }
}
