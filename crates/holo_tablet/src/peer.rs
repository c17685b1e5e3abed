//! Tablet peer: lifecycle, submission entry points, GC accounting, and
//! shutdown sequencing for one tablet replica.
//!
//! The peer wires the storage engine, the replication engine, the WAL, the
//! preparer, and the operation tracker together. Submissions build an
//! `OperationDriver` and hand it off; lifecycle transitions go through an
//! atomic state enum with a separate lock serializing the transitions
//! themselves. Shutdown drains in-flight work before anything underneath it
//! is torn down.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use holo_raft::raft::{
    Clock, ConsensusBootstrapInfo, ConsensusRound, HybridTime, LeaderStatus, Log,
    LogAnchorRegistry, MaxIdxToSegmentSizeMap, OpId, OpIdType, RaftConfig, RaftConsensus,
    ReplicateMsg, WireOpType,
};

use crate::driver::{DriverMode, InitFailure, OperationDriver};
use crate::maintenance::{LogGcConfig, LogGcWorker};
use crate::metrics::{PreparerMetrics, TrackerMetrics};
use crate::operations::{
    AlterSchemaOperation, CompletionCallback, Operation, OperationState, SnapshotOperation,
    TruncateOperation, UpdateTxnOperation, WriteOperation,
};
use crate::preparer::Preparer;
use crate::tablet::{MemTableFrontier, Tablet, TableType};
use crate::tracker::{OperationTracker, TrackerConfig};

/// Tablet replica lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum TabletState {
    NotStarted = 0,
    Bootstrapping = 1,
    Running = 2,
    Quiescing = 3,
    Shutdown = 4,
    Failed = 5,
}

impl TabletState {
    pub fn name(&self) -> &'static str {
        match self {
            TabletState::NotStarted => "NOT_STARTED",
            TabletState::Bootstrapping => "BOOTSTRAPPING",
            TabletState::Running => "RUNNING",
            TabletState::Quiescing => "QUIESCING",
            TabletState::Shutdown => "SHUTDOWN",
            TabletState::Failed => "FAILED",
        }
    }

    fn from_u8(value: u8) -> TabletState {
        match value {
            0 => TabletState::NotStarted,
            1 => TabletState::Bootstrapping,
            2 => TabletState::Running,
            3 => TabletState::Quiescing,
            4 => TabletState::Shutdown,
            5 => TabletState::Failed,
            other => unreachable!("invalid tablet state value {other}"),
        }
    }
}

/// Why the mark-dirty callback fired.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StateChangeReason {
    PeerStarted,
    PeerFailed,
}

/// Context handed to the mark-dirty callback so external reporting can
/// refresh. `caller_holds_consensus_lock` tells the callee whether it may
/// take consensus locks of its own.
#[derive(Clone, Copy, Debug)]
pub struct StateChangeContext {
    pub reason: StateChangeReason,
    pub caller_holds_consensus_lock: bool,
}

pub type MarkDirtyCallback = Box<dyn Fn(&StateChangeContext) + Send + Sync>;

/// Peer tuning and test hooks, threaded through construction instead of
/// process-wide flags.
#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(default)]
pub struct TabletPeerConfig {
    /// Test hook: delay write submissions by this many milliseconds.
    pub submit_delay_ms: u64,
    /// Admission cap on bytes held by in-flight operations; zero disables.
    pub in_flight_memory_limit_bytes: u64,
    /// Poll interval for `wait_until_shutdown`.
    pub shutdown_poll_ms: u64,
}

impl Default for TabletPeerConfig {
    fn default() -> Self {
        Self {
            submit_delay_ms: 0,
            in_flight_memory_limit_bytes: 0,
            shutdown_poll_ms: 10,
        }
    }
}

/// Metric handles owned by the peer and shared with its components.
pub struct TabletPeerMetrics {
    pub preparer: Arc<PreparerMetrics>,
    pub tracker: Arc<TrackerMetrics>,
}

/// One in-flight operation, as reported externally.
#[derive(Clone, Debug, Serialize)]
pub struct InFlightOperation {
    pub op_id: OpId,
    pub op_type: String,
    pub description: String,
    pub running_for_micros: u64,
}

/// Externally visible peer status snapshot.
#[derive(Clone, Debug, Serialize)]
pub struct TabletStatus {
    pub tablet_id: String,
    pub peer_uuid: String,
    pub state: String,
    pub estimated_on_disk_size: u64,
    pub in_flight_operations: usize,
}

#[derive(Default)]
struct PeerInner {
    tablet: Option<Arc<dyn Tablet>>,
    consensus: Option<Arc<dyn RaftConsensus>>,
    log: Option<Arc<dyn Log>>,
    preparer: Option<Arc<Preparer>>,
    clock: Option<Arc<dyn Clock>>,
}

pub struct TabletPeer {
    tablet_id: String,
    permanent_uuid: String,
    config: TabletPeerConfig,

    state: AtomicU8,
    inner: Mutex<PeerInner>,
    /// Serializes lifecycle transitions and maintenance registration so a
    /// late registration cannot race tear-down.
    state_change_lock: Mutex<()>,

    has_consensus: AtomicBool,
    /// Log handle readable without `inner` for metric and status callers.
    log_cell: RwLock<Option<Arc<dyn Log>>>,

    tracker: Arc<OperationTracker>,
    anchor_registry: Arc<LogAnchorRegistry>,
    error: Mutex<Option<anyhow::Error>>,
    mark_dirty: MarkDirtyCallback,
    metrics: TabletPeerMetrics,
    maintenance_workers: Mutex<Vec<LogGcWorker>>,
}

fn distant_future() -> Instant {
    Instant::now() + Duration::from_secs(60 * 60 * 24 * 365)
}

fn lease_micros_to_hybrid_time(micros: u64) -> HybridTime {
    if micros == 0 {
        HybridTime::INVALID
    } else if micros >= HybridTime::MAX_PHYSICAL_MICROS {
        // Leases disabled.
        HybridTime::MAX
    } else {
        HybridTime::from_micros(micros)
    }
}

impl TabletPeer {
    pub fn new(
        tablet_id: impl Into<String>,
        permanent_uuid: impl Into<String>,
        config: TabletPeerConfig,
        mark_dirty: MarkDirtyCallback,
    ) -> Self {
        let tablet_id = tablet_id.into();
        Self {
            tracker: Arc::new(OperationTracker::new(tablet_id.clone())),
            tablet_id,
            permanent_uuid: permanent_uuid.into(),
            config,
            state: AtomicU8::new(TabletState::NotStarted as u8),
            inner: Mutex::new(PeerInner::default()),
            state_change_lock: Mutex::new(()),
            has_consensus: AtomicBool::new(false),
            log_cell: RwLock::new(None),
            anchor_registry: Arc::new(LogAnchorRegistry::new()),
            error: Mutex::new(None),
            mark_dirty,
            metrics: TabletPeerMetrics {
                preparer: Arc::new(PreparerMetrics::new()),
                tracker: Arc::new(TrackerMetrics::new()),
            },
            maintenance_workers: Mutex::new(Vec::new()),
        }
    }

    pub fn tablet_id(&self) -> &str {
        &self.tablet_id
    }

    pub fn permanent_uuid(&self) -> &str {
        &self.permanent_uuid
    }

    pub fn state(&self) -> TabletState {
        TabletState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn cas_state(&self, expected: TabletState, new_state: TabletState) -> Result<(), TabletState> {
        self.state
            .compare_exchange(
                expected as u8,
                new_state as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
            .map_err(TabletState::from_u8)
    }

    fn update_state(
        &self,
        expected: TabletState,
        new_state: TabletState,
        error_message: &str,
    ) -> Result<()> {
        match self.cas_state(expected, new_state) {
            Ok(()) => {
                tracing::info!(
                    from = expected.name(),
                    to = new_state.name(),
                    "{}changed state",
                    self.log_prefix()
                );
                Ok(())
            }
            Err(actual) => bail!(
                "{error_message}: expected state {}, got {}",
                expected.name(),
                actual.name()
            ),
        }
    }

    /// External transition into recovery; only valid from `NotStarted`.
    pub fn mark_bootstrapping(&self) -> Result<()> {
        self.update_state(
            TabletState::NotStarted,
            TabletState::Bootstrapping,
            "cannot start bootstrapping",
        )
    }

    /// Wires the collaborators together. Valid only while bootstrapping.
    pub fn init_tablet_peer(
        &self,
        tablet: Arc<dyn Tablet>,
        clock: Arc<dyn Clock>,
        consensus: Arc<dyn RaftConsensus>,
        log: Arc<dyn Log>,
    ) -> Result<()> {
        let preparer;
        {
            let mut inner = self.inner.lock().unwrap();
            let state = self.state();
            if state != TabletState::Bootstrapping {
                bail!("invalid tablet state for init: {}", state.name());
            }

            // A memtable may flush only once every entry in it is also in
            // the WAL; the factory captures the log head at decision time.
            let log_for_filter = Arc::clone(&log);
            tablet.set_mem_table_flush_filter_factory(Box::new(move || {
                let index = log_for_filter.latest_entry_op_id().index;
                Box::new(move |frontier: &MemTableFrontier| -> Result<bool> {
                    match frontier.largest_op_id {
                        Some(largest) => Ok(largest.index <= index),
                        None => bail!(
                            "memtable has no frontier recorded, cannot decide flush safety"
                        ),
                    }
                })
            }));

            // Providers registered with consensus hold a weak handle back to
            // it; once the engine is gone they report "no lease".
            let weak_consensus = Arc::downgrade(&consensus);
            let ht_lease_provider = move |min_allowed: u64, deadline: Instant| -> HybridTime {
                let Some(consensus) = weak_consensus.upgrade() else {
                    return HybridTime::INVALID;
                };
                lease_micros_to_hybrid_time(
                    consensus.majority_replicated_ht_lease_expiration(min_allowed, deadline),
                )
            };

            let mvcc = tablet.mvcc();
            {
                let ht_lease_provider = ht_lease_provider.clone();
                let mvcc = Arc::clone(&mvcc);
                consensus.set_propagated_safe_time_provider(Box::new(move || {
                    // Current majority-replicated lease without waiting.
                    let ht_lease = ht_lease_provider(0, distant_future());
                    if !ht_lease.is_valid() {
                        return HybridTime::INVALID;
                    }
                    mvcc.safe_time(ht_lease)
                }));
            }
            {
                let ht_lease_provider = ht_lease_provider.clone();
                let mvcc = Arc::clone(&mvcc);
                consensus.set_majority_replicated_listener(Box::new(move || {
                    let ht_lease = ht_lease_provider(0, distant_future());
                    if ht_lease.is_valid() {
                        mvcc.update_propagated_safe_time_on_leader(ht_lease);
                    }
                }));
            }

            preparer = Arc::new(Preparer::new(
                Some(Arc::clone(&consensus)),
                Arc::clone(&self.metrics.preparer),
            ));

            *self.log_cell.write().unwrap() = Some(Arc::clone(&log));
            self.has_consensus.store(true, Ordering::Release);
            inner.tablet = Some(Arc::clone(&tablet));
            inner.consensus = Some(consensus);
            inner.log = Some(log);
            inner.preparer = Some(Arc::clone(&preparer));
            inner.clock = Some(clock);
        }

        preparer.start()?;

        self.tracker
            .start_instrumentation(Arc::clone(&self.metrics.tracker));
        self.tracker.start_memory_tracking(TrackerConfig {
            memory_limit_bytes: self.config.in_flight_memory_limit_bytes,
        });

        if let Some(coordinator) = tablet.transaction_coordinator() {
            coordinator.start();
        }

        tracing::debug!("{}peer initialized", self.log_prefix());
        Ok(())
    }

    /// Starts consensus and moves the peer into `Running`, then lets
    /// external reporting know the peer changed.
    pub fn start(&self, bootstrap_info: &ConsensusBootstrapInfo) -> Result<()> {
        {
            let _transition = self.state_change_lock.lock().unwrap();
            let consensus = self.consensus()?;
            tracing::debug!(
                config = ?consensus.committed_config(),
                "{}raft config before starting",
                self.log_prefix()
            );
            consensus.start(bootstrap_info)?;
            self.update_state(
                TabletState::Bootstrapping,
                TabletState::Running,
                "incorrect state to start tablet peer",
            )?;
        }
        (self.mark_dirty)(&StateChangeContext {
            reason: StateChangeReason::PeerStarted,
            caller_holds_consensus_lock: false,
        });
        Ok(())
    }

    pub fn check_running(&self) -> Result<()> {
        let state = self.state();
        if state != TabletState::Running {
            bail!("the tablet is not in a running state: {}", state.name());
        }
        Ok(())
    }

    pub fn check_shutdown_or_not_started(&self) -> Result<()> {
        let state = self.state();
        if state != TabletState::Shutdown && state != TabletState::NotStarted {
            bail!("the tablet is not in a shutdown state: {}", state.name());
        }
        Ok(())
    }

    /// Waits for consensus to come up, backing off exponentially up to
    /// 256 ms per probe.
    pub fn wait_until_consensus_running(&self, timeout: Duration) -> Result<()> {
        let start = Instant::now();
        let mut backoff_exp = 0u32;
        const MAX_BACKOFF_EXP: u32 = 8;
        loop {
            let cached_state = self.state();
            if matches!(cached_state, TabletState::Quiescing | TabletState::Shutdown) {
                bail!(
                    "the tablet is already shutting down or shut down, state: {}",
                    cached_state.name()
                );
            }
            if cached_state == TabletState::Running && self.has_consensus.load(Ordering::Acquire) {
                if let Ok(consensus) = self.consensus() {
                    if consensus.is_running() {
                        return Ok(());
                    }
                }
            }
            if start.elapsed() > timeout {
                bail!(
                    "consensus is not running after waiting {:?}, state: {}",
                    start.elapsed(),
                    cached_state.name()
                );
            }
            thread::sleep(Duration::from_millis(1 << backoff_exp));
            backoff_exp = (backoff_exp + 1).min(MAX_BACKOFF_EXP);
        }
    }

    // ------------------------------------------------------------------
    // Leader submission paths.
    // ------------------------------------------------------------------

    /// Validates the lifecycle, then drives the operation. Failures are
    /// delivered through the operation's completion callback.
    pub fn submit(&self, operation: Box<dyn Operation>) {
        if let Err(err) = self.check_running() {
            operation.aborted(err);
            return;
        }
        self.start_execution(operation);
    }

    /// Builds a leader driver for the operation and executes it.
    pub fn start_execution(&self, operation: Box<dyn Operation>) {
        match self.new_leader_operation_driver(operation) {
            Ok(driver) => driver.execute_async(),
            Err(failure) => {
                tracing::info!(
                    error = %failure.error,
                    "{}failed to build leader operation driver",
                    self.log_prefix()
                );
                if let Some(operation) = failure.operation {
                    operation.aborted(failure.error);
                }
            }
        }
    }

    /// Submits a client write. The deadline travels with the operation and
    /// is enforced in prepare.
    pub fn write_async(
        &self,
        payload: Bytes,
        deadline: Option<Instant>,
        completion: CompletionCallback,
    ) {
        let tablet = match self.tablet() {
            Ok(tablet) => tablet,
            Err(err) => {
                completion(Err(err));
                return;
            }
        };
        if let Err(err) = self.check_running() {
            completion(Err(err));
            return;
        }
        let state = OperationState::with_completion(tablet, payload, completion);
        self.start_execution(Box::new(WriteOperation::new(state, deadline)));
    }

    /// Awaitable write: bridges the completion callback through a oneshot
    /// and enforces `timeout` end to end.
    pub async fn write(&self, payload: Bytes, timeout: Duration) -> Result<()> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let deadline = Instant::now() + timeout;
        self.write_async(
            payload,
            Some(deadline),
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => bail!("write completion dropped without a status"),
            Err(_) => bail!("write timed out after {timeout:?}"),
        }
    }

    /// Submits a transaction-status update on behalf of the coordinator.
    pub fn submit_update_transaction(&self, payload: Bytes, completion: CompletionCallback) {
        let tablet = match self.tablet() {
            Ok(tablet) => tablet,
            Err(err) => {
                completion(Err(err));
                return;
            }
        };
        let state = OperationState::with_completion(tablet, payload, completion);
        self.submit(Box::new(UpdateTxnOperation::new(state)));
    }

    // ------------------------------------------------------------------
    // Follower paths.
    // ------------------------------------------------------------------

    /// Entry point for a round replicated from the leader. Builds the
    /// matching operation, adopts the message's timestamps, and drives it.
    pub fn start_replica_operation(
        &self,
        round: Arc<ConsensusRound>,
        propagated_safe_time: Option<HybridTime>,
    ) -> Result<()> {
        let state = self.state();
        if state != TabletState::Running && state != TabletState::Bootstrapping {
            bail!("cannot start replica operation in state {}", state.name());
        }

        let tablet = self.tablet()?;
        let clock = self.clock()?;
        let msg = round.replicate_msg();
        debug_assert!(
            msg.hybrid_time.is_valid(),
            "replica operation without a hybrid time"
        );

        let operation = Self::create_operation(&tablet, &msg);
        // Keeping the round on the state keeps the request alive without
        // copying it out of the message.
        operation.state().set_consensus_round(Arc::clone(&round));
        operation.state().set_op_id(msg.op_id);
        operation.state().set_hybrid_time(msg.hybrid_time);
        clock.observe(msg.hybrid_time);

        tablet.update_monotonic_counter(msg.monotonic_counter);

        let driver = self
            .new_replica_operation_driver(Some(operation))
            .map_err(|failure| failure.error)?;

        let weak = Arc::downgrade(&driver);
        round.set_replicated_callback(Box::new(move |result, leader_term, applied_op_ids| {
            if let Some(driver) = weak.upgrade() {
                driver.replication_finished(result, leader_term, applied_op_ids);
            }
        }));

        if let Some(ht) = propagated_safe_time {
            driver.set_propagated_safe_time(ht, tablet.mvcc());
        }
        driver.execute_async();
        Ok(())
    }

    /// Pushes a safe time into MVCC through an operation-less replica
    /// driver, the single channel all safe-time propagation flows through.
    pub fn set_propagated_safe_time(&self, ht: HybridTime) {
        let tablet = match self.tablet() {
            Ok(tablet) => tablet,
            Err(err) => {
                tracing::error!(
                    error = %err,
                    "{}cannot propagate safe time without a tablet",
                    self.log_prefix()
                );
                return;
            }
        };
        match self.new_replica_operation_driver(None) {
            Ok(driver) => {
                driver.set_propagated_safe_time(ht, tablet.mvcc());
                driver.execute_async();
            }
            Err(failure) => tracing::error!(
                error = %failure.error,
                "{}failed to create operation driver to set propagated safe time",
                self.log_prefix()
            ),
        }
    }

    fn create_operation(tablet: &Arc<dyn Tablet>, msg: &ReplicateMsg) -> Box<dyn Operation> {
        let state = OperationState::new(Arc::clone(tablet), msg.payload.clone());
        match msg.op_type {
            WireOpType::Write => Box::new(WriteOperation::new(state, None)),
            WireOpType::AlterSchema => Box::new(AlterSchemaOperation::new(state)),
            WireOpType::UpdateTransaction => Box::new(UpdateTxnOperation::new(state)),
            WireOpType::Truncate => Box::new(TruncateOperation::new(state)),
            WireOpType::Snapshot => Box::new(SnapshotOperation::new(state)),
        }
    }

    // ------------------------------------------------------------------
    // Driver construction.
    // ------------------------------------------------------------------

    fn create_operation_driver(&self) -> Result<Arc<OperationDriver>> {
        let inner = self.inner.lock().unwrap();
        let preparer = inner
            .preparer
            .clone()
            .context("tablet peer is not initialized")?;
        let consensus = inner.consensus.clone();
        let table_type = inner
            .tablet
            .as_ref()
            .map(|tablet| tablet.table_type())
            .unwrap_or(TableType::Regular);
        let submit_delay = (self.config.submit_delay_ms > 0)
            .then(|| Duration::from_millis(self.config.submit_delay_ms));
        Ok(OperationDriver::new(
            Arc::clone(&self.tracker),
            consensus,
            preparer,
            table_type,
            submit_delay,
        ))
    }

    fn new_leader_operation_driver(
        &self,
        operation: Box<dyn Operation>,
    ) -> Result<Arc<OperationDriver>, InitFailure> {
        let term = match self.consensus() {
            Ok(consensus) => consensus.current_term(),
            Err(error) => {
                return Err(InitFailure {
                    error,
                    operation: Some(operation),
                })
            }
        };
        self.new_operation_driver(Some(operation), DriverMode::Leader { term })
    }

    fn new_replica_operation_driver(
        &self,
        operation: Option<Box<dyn Operation>>,
    ) -> Result<Arc<OperationDriver>, InitFailure> {
        self.new_operation_driver(operation, DriverMode::Replica)
    }

    fn new_operation_driver(
        &self,
        operation: Option<Box<dyn Operation>>,
        mode: DriverMode,
    ) -> Result<Arc<OperationDriver>, InitFailure> {
        let driver = match self.create_operation_driver() {
            Ok(driver) => driver,
            Err(error) => return Err(InitFailure { error, operation }),
        };
        driver.init(operation, mode)?;
        Ok(driver)
    }

    // ------------------------------------------------------------------
    // Log GC accounting.
    // ------------------------------------------------------------------

    /// Smallest log index anything on this peer still needs. The log head
    /// is the upper bound; anchors, in-flight drivers, the transaction
    /// coordinator, unflushed writes, and the committed watermark can each
    /// pull it down.
    pub fn get_earliest_needed_log_index(&self) -> Result<i64> {
        let log = self.log()?;
        let mut min_index = log.latest_entry_op_id().index;

        // Nothing was ever written, nothing to retain.
        if min_index == 0 {
            return Ok(0);
        }

        if let Some(anchor_index) = self.anchor_registry.earliest_anchor_index() {
            min_index = min_index.min(anchor_index);
        }

        for driver in self.tracker.pending_operations() {
            let op_id = driver.op_id();
            // A driver with no op-id has not been submitted for replication
            // and does not pin the log.
            if op_id.valid() {
                min_index = min_index.min(op_id.index);
            }
        }

        let tablet = self.tablet()?;
        if let Some(coordinator) = tablet.transaction_coordinator() {
            min_index = min_index.min(coordinator.prepare_gc());
        }

        if tablet.table_type() != TableType::TransactionStatus {
            let max_persistent = tablet.max_persistent_op_id()?;
            let mut max_persistent_index = max_persistent.regular.index;
            if let Some(intents) = max_persistent.intents {
                if intents < max_persistent.regular {
                    max_persistent_index = intents.index;
                }
            }
            // Only anchor on the flushed watermark when there really are
            // writes past it. The committed-write index can read zero after
            // a restart with a clean log, so the comparison is 'less than',
            // not 'not equal'.
            if max_persistent_index < tablet.last_committed_write_index() {
                min_index = min_index.min(max_persistent_index);
            }
        }

        // Retain at least one committed entry so safe time can always be
        // recovered during bootstrap.
        if let Some(committed) = self.consensus()?.last_op_id(OpIdType::Committed)? {
            min_index = min_index.min(committed.index);
        }

        Ok(min_index)
    }

    pub fn get_max_indexes_to_segment_size_map(&self) -> Result<MaxIdxToSegmentSizeMap> {
        self.check_running()?;
        let min_index = self.get_earliest_needed_log_index()?;
        Ok(self.log()?.max_indexes_to_segment_size_map(min_index))
    }

    pub fn get_gcable_data_size(&self) -> Result<u64> {
        self.check_running()?;
        let min_index = self.get_earliest_needed_log_index()?;
        Ok(self.log()?.gcable_data_size(min_index))
    }

    /// One GC pass: compute the floor, drop whole segments below it. A
    /// no-op unless the peer is running.
    pub fn run_log_gc(&self) -> Result<()> {
        if self.check_running().is_err() {
            return Ok(());
        }
        let min_index = self.get_earliest_needed_log_index()?;
        let removed = self.log()?.gc(min_index)?;
        if removed > 0 {
            tracing::info!(
                min_index,
                removed_segments = removed,
                "{}log gc removed segments",
                self.log_prefix()
            );
        }
        Ok(())
    }

    pub fn latest_log_entry_op_id(&self) -> OpId {
        self.log_cell
            .read()
            .unwrap()
            .as_ref()
            .map(|log| log.latest_entry_op_id())
            .unwrap_or_else(OpId::invalid)
    }

    pub fn anchor_registry(&self) -> &Arc<LogAnchorRegistry> {
        &self.anchor_registry
    }

    // ------------------------------------------------------------------
    // Maintenance workers.
    // ------------------------------------------------------------------

    /// Starts the periodic log-GC worker. Only valid while running; the
    /// transition lock keeps this from racing shutdown.
    pub fn register_log_gc(self: &Arc<Self>, config: LogGcConfig) {
        let _transition = self.state_change_lock.lock().unwrap();
        if self.state() != TabletState::Running {
            tracing::warn!(
                "{}not registering maintenance workers, tablet is not running",
                self.log_prefix()
            );
            return;
        }
        let worker = LogGcWorker::spawn(Arc::downgrade(self), config);
        self.maintenance_workers.lock().unwrap().push(worker);
    }

    fn unregister_maintenance_workers(&self) {
        let workers: Vec<LogGcWorker> =
            std::mem::take(&mut *self.maintenance_workers.lock().unwrap());
        for worker in workers {
            worker.stop();
        }
    }

    // ------------------------------------------------------------------
    // Shutdown.
    // ------------------------------------------------------------------

    /// First half of shutdown. Returns false when another caller owns the
    /// sequence already.
    pub fn start_shutdown(&self) -> bool {
        tracing::info!("{}initiating tablet peer shutdown", self.log_prefix());

        if let Some(tablet) = self.tablet_opt() {
            tablet.set_shutdown_requested();
        }

        {
            let mut state = self.state();
            loop {
                if matches!(state, TabletState::Quiescing | TabletState::Shutdown) {
                    return false;
                }
                match self.cas_state(state, TabletState::Quiescing) {
                    Ok(()) => {
                        tracing::info!(
                            from = state.name(),
                            "{}started shutdown",
                            self.log_prefix()
                        );
                        break;
                    }
                    Err(observed) => state = observed,
                }
            }
        }

        let _transition = self.state_change_lock.lock().unwrap();
        // Stop maintenance first: a GC pass must not call into the log
        // while the rest of the sequence tears it down.
        self.unregister_maintenance_workers();

        if let Some(consensus) = self.consensus_opt() {
            consensus.shutdown();
        }
        true
    }

    /// Second half: drain in-flight operations, then stop the preparer,
    /// close the log, shut the tablet down, and drop the collaborators.
    pub fn complete_shutdown(&self) {
        let drain_start = Instant::now();
        self.tracker.wait_for_all_to_finish();
        if drain_start.elapsed() > Duration::from_secs(1) {
            tracing::warn!(
                elapsed_ms = drain_start.elapsed().as_millis() as u64,
                "{}waiting for operations to complete was slow",
                self.log_prefix()
            );
        }

        if let Some(preparer) = self.preparer_opt() {
            preparer.stop();
        }

        let log = self.log_cell.read().unwrap().clone();
        if let Some(log) = log {
            if let Err(err) = log.close() {
                tracing::warn!(error = ?err, "{}error closing the log", self.log_prefix());
            }
        }

        if let Some(tablet) = self.tablet_opt() {
            tablet.shutdown();
        }

        {
            let mut inner = self.inner.lock().unwrap();
            self.has_consensus.store(false, Ordering::Release);
            inner.consensus = None;
            inner.preparer = None;
            inner.tablet = None;
            inner.log = None;
            *self.log_cell.write().unwrap() = None;

            let state = self.state();
            if state != TabletState::Quiescing {
                tracing::error!(
                    state = state.name(),
                    "unexpected state when completing shutdown"
                );
                debug_assert!(false, "completing shutdown while not quiescing");
            }
            self.state
                .store(TabletState::Shutdown as u8, Ordering::Release);
        }
        tracing::info!("{}tablet peer shut down", self.log_prefix());
    }

    pub fn wait_until_shutdown(&self) {
        let poll = Duration::from_millis(self.config.shutdown_poll_ms.max(1));
        while self.state() != TabletState::Shutdown {
            thread::sleep(poll);
        }
    }

    /// Idempotent shutdown: the first caller runs the sequence, everyone
    /// else waits for it to finish.
    pub fn shutdown(&self) {
        if self.start_shutdown() {
            self.complete_shutdown();
        } else {
            self.wait_until_shutdown();
        }
    }

    /// Marks the peer failed unless it is already failed or tearing down.
    pub fn set_failed(&self, error: anyhow::Error) {
        {
            let mut slot = self.error.lock().unwrap();
            if slot.is_none() {
                *slot = Some(error);
            }
        }
        let mut state = self.state();
        loop {
            if matches!(
                state,
                TabletState::Failed | TabletState::Quiescing | TabletState::Shutdown
            ) {
                return;
            }
            match self.cas_state(state, TabletState::Failed) {
                Ok(()) => {
                    tracing::info!(
                        from = state.name(),
                        "{}changed state to FAILED",
                        self.log_prefix()
                    );
                    (self.mark_dirty)(&StateChangeContext {
                        reason: StateChangeReason::PeerFailed,
                        caller_holds_consensus_lock: false,
                    });
                    return;
                }
                Err(observed) => state = observed,
            }
        }
    }

    // ------------------------------------------------------------------
    // Status reporting.
    // ------------------------------------------------------------------

    /// Snapshot of every in-flight operation that is externally meaningful.
    /// Safe-time-only drivers and drivers with no operation are skipped.
    pub fn in_flight_operations(&self) -> Vec<InFlightOperation> {
        let mut out = Vec::new();
        for driver in self.tracker.pending_operations() {
            if !driver.has_operation() {
                continue;
            }
            let Some(wire_type) = driver.op_type().wire_type() else {
                continue;
            };
            out.push(InFlightOperation {
                op_id: driver.op_id(),
                op_type: wire_type.to_string(),
                description: driver.description(),
                running_for_micros: driver.start_time().elapsed().as_micros().min(u128::from(
                    u64::MAX,
                )) as u64,
            });
        }
        out
    }

    /// Total footprint on disk; components not yet initialized count zero.
    pub fn on_disk_size(&self) -> u64 {
        let inner = self.inner.lock().unwrap();
        let mut total = 0u64;
        if let Some(consensus) = &inner.consensus {
            total += consensus.on_disk_size();
        }
        if let Some(tablet) = &inner.tablet {
            total += tablet.total_sst_file_sizes();
        }
        if let Some(log) = &inner.log {
            total += log.on_disk_size();
        }
        total
    }

    pub fn human_readable_state(&self) -> String {
        let state = self.state();
        if state == TabletState::Failed {
            let error = self.error.lock().unwrap();
            let detail = error
                .as_ref()
                .map(|err| err.to_string())
                .unwrap_or_else(|| "unknown error".to_string());
            return format!("{} ({})", state.name(), detail);
        }
        state.name().to_string()
    }

    pub fn tablet_status(&self) -> TabletStatus {
        TabletStatus {
            tablet_id: self.tablet_id.clone(),
            peer_uuid: self.permanent_uuid.clone(),
            state: self.human_readable_state(),
            estimated_on_disk_size: self.on_disk_size(),
            in_flight_operations: self.tracker.num_pending(),
        }
    }

    pub fn status_json(&self) -> Result<String> {
        serde_json::to_string(&self.tablet_status()).context("failed to serialize tablet status")
    }

    pub fn raft_config(&self) -> Result<RaftConfig> {
        Ok(self.consensus()?.committed_config())
    }

    pub fn leader_status(&self) -> LeaderStatus {
        match self.consensus_opt() {
            Some(consensus) => consensus.leader_status(),
            None => LeaderStatus::NotLeader,
        }
    }

    /// Upper bound on timestamps this leader may serve reads at.
    pub fn ht_lease_expiration(&self) -> Result<HybridTime> {
        let consensus = self.consensus()?;
        let tablet = self.tablet()?;
        let lease = lease_micros_to_hybrid_time(
            consensus.majority_replicated_ht_lease_expiration(0, distant_future()),
        );
        Ok(lease.max(tablet.mvcc().last_replicated_hybrid_time()))
    }

    pub fn now(&self) -> Result<HybridTime> {
        Ok(self.clock()?.now())
    }

    pub fn tracker(&self) -> &Arc<OperationTracker> {
        &self.tracker
    }

    pub fn metrics(&self) -> &TabletPeerMetrics {
        &self.metrics
    }

    // ------------------------------------------------------------------
    // Collaborator accessors.
    // ------------------------------------------------------------------

    fn tablet_opt(&self) -> Option<Arc<dyn Tablet>> {
        self.inner.lock().unwrap().tablet.clone()
    }

    fn consensus_opt(&self) -> Option<Arc<dyn RaftConsensus>> {
        self.inner.lock().unwrap().consensus.clone()
    }

    fn preparer_opt(&self) -> Option<Arc<Preparer>> {
        self.inner.lock().unwrap().preparer.clone()
    }

    pub fn tablet(&self) -> Result<Arc<dyn Tablet>> {
        self.tablet_opt().context("tablet is not initialized")
    }

    pub fn consensus(&self) -> Result<Arc<dyn RaftConsensus>> {
        self.consensus_opt().context("consensus is not initialized")
    }

    pub fn clock(&self) -> Result<Arc<dyn Clock>> {
        self.inner
            .lock()
            .unwrap()
            .clock
            .clone()
            .context("clock is not initialized")
    }

    pub fn log(&self) -> Result<Arc<dyn Log>> {
        self.log_cell
            .read()
            .unwrap()
            .clone()
            .context("log is not initialized")
    }

    fn log_prefix(&self) -> String {
        format!(
            "T {} P {} [state={}]: ",
            self.tablet_id,
            self.permanent_uuid,
            self.state().name()
        )
    }
}
