//! Shared stubs and builders for integration tests.
//!
//! `StubConsensus` is fully scripted: tests decide when a round is appended
//! and when its replication finishes, which makes every interleaving of the
//! prepare and replicate axes reproducible.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use bytes::Bytes;

use holo_raft::raft::{
    Clock, ConsensusBootstrapInfo, ConsensusRound, HybridClock, HybridTime, LeaderStatus, Log,
    MajorityReplicatedListenerFn, MaxIdxToSegmentSizeMap, OpId, OpIdType, RaftConfig,
    RaftConsensus, ReplicateMsg, SafeTimeProviderFn, WireOpType,
};
use holo_tablet::operations::{CompletionCallback, OperationType};
use holo_tablet::peer::{StateChangeContext, StateChangeReason, TabletPeer, TabletPeerConfig};
use holo_tablet::tablet::{
    ApplyContext, FlushFilterFactory, MaxPersistentOpIds, MvccManager, Tablet, TableType,
    TransactionCoordinator,
};

pub const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

static TRACING_INIT: std::sync::Once = std::sync::Once::new();

/// Installs a test-writer subscriber once per binary; `RUST_LOG` filters.
pub fn init_test_tracing() {
    TRACING_INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Polls `cond` until it holds or the timeout expires.
pub fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + WAIT_TIMEOUT;
    while !cond() {
        if Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        std::thread::sleep(Duration::from_millis(2));
    }
}

/// Completion callback writing its terminal status into a channel.
pub fn completion_channel() -> (CompletionCallback, mpsc::Receiver<Result<()>>) {
    let (tx, rx) = mpsc::channel();
    let callback: CompletionCallback = Box::new(move |result| {
        let _ = tx.send(result);
    });
    (callback, rx)
}

pub fn recv_completion(rx: &mpsc::Receiver<Result<()>>) -> Result<()> {
    rx.recv_timeout(WAIT_TIMEOUT)
        .expect("timed out waiting for completion callback")
}

// ----------------------------------------------------------------------
// Consensus stub.
// ----------------------------------------------------------------------

pub struct StubConsensus {
    tablet_id: String,
    peer_uuid: String,
    term: AtomicI64,
    next_index: AtomicI64,
    clock: Arc<HybridClock>,
    started: AtomicBool,
    shut_down: AtomicBool,
    /// Append rounds on the caller thread as soon as they are submitted.
    auto_append: AtomicBool,
    rounds: Mutex<Vec<Arc<ConsensusRound>>>,
    replicated: Mutex<Vec<Arc<ConsensusRound>>>,
    last_appended: Mutex<Option<OpId>>,
    committed_op_id: Mutex<Option<OpId>>,
    lease_micros: AtomicU64,
    on_disk: AtomicU64,
    config: Mutex<RaftConfig>,
    safe_time_provider: Mutex<Option<SafeTimeProviderFn>>,
    majority_listener: Mutex<Option<MajorityReplicatedListenerFn>>,
}

impl StubConsensus {
    pub fn new(tablet_id: &str, peer_uuid: &str) -> Arc<Self> {
        Arc::new(Self {
            tablet_id: tablet_id.to_string(),
            peer_uuid: peer_uuid.to_string(),
            term: AtomicI64::new(1),
            next_index: AtomicI64::new(1),
            clock: Arc::new(HybridClock::new()),
            started: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
            auto_append: AtomicBool::new(true),
            rounds: Mutex::new(Vec::new()),
            replicated: Mutex::new(Vec::new()),
            last_appended: Mutex::new(None),
            committed_op_id: Mutex::new(None),
            lease_micros: AtomicU64::new(0),
            on_disk: AtomicU64::new(0),
            config: Mutex::new(RaftConfig {
                opid_index: Some(0),
                peer_uuids: vec![peer_uuid.to_string()],
            }),
            safe_time_provider: Mutex::new(None),
            majority_listener: Mutex::new(None),
        })
    }

    pub fn set_term(&self, term: i64) {
        self.term.store(term, Ordering::SeqCst);
    }

    pub fn set_next_index(&self, index: i64) {
        self.next_index.store(index, Ordering::SeqCst);
    }

    pub fn set_auto_append(&self, enabled: bool) {
        self.auto_append.store(enabled, Ordering::SeqCst);
    }

    pub fn set_lease_micros(&self, micros: u64) {
        self.lease_micros.store(micros, Ordering::SeqCst);
    }

    pub fn set_on_disk_size(&self, bytes: u64) {
        self.on_disk.store(bytes, Ordering::SeqCst);
    }

    pub fn set_committed_op_id(&self, op_id: OpId) {
        *self.committed_op_id.lock().unwrap() = Some(op_id);
    }

    pub fn all_rounds(&self) -> Vec<Arc<ConsensusRound>> {
        self.rounds.lock().unwrap().clone()
    }

    pub fn replicated_rounds(&self) -> Vec<Arc<ConsensusRound>> {
        self.replicated.lock().unwrap().clone()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Stamps the round with the next op-id and fires its append callback.
    pub fn append_round(&self, round: &Arc<ConsensusRound>) -> OpId {
        let op_id = OpId::new(
            self.term.load(Ordering::SeqCst),
            self.next_index.fetch_add(1, Ordering::SeqCst),
        );
        let ht = self.clock.now();
        round.with_replicate_msg_mut(|msg| {
            msg.hybrid_time = ht;
        });
        let committed = self.committed_op_id.lock().unwrap().unwrap_or_else(OpId::invalid);
        *self.last_appended.lock().unwrap() = Some(op_id);
        round.notify_append(op_id, committed);
        op_id
    }

    /// Finishes the round successfully and returns the op-ids the driver
    /// reported applied.
    pub fn commit_round(&self, round: &Arc<ConsensusRound>) -> Vec<OpId> {
        let op_id = round.replicate_msg().op_id;
        let mut applied = Vec::new();
        round.notify_replicated(Ok(()), self.term.load(Ordering::SeqCst), &mut applied);
        if op_id.valid() {
            // The committed watermark only moves forward.
            let mut committed = self.committed_op_id.lock().unwrap();
            if committed.map_or(true, |current| op_id > current) {
                *committed = Some(op_id);
            }
        }
        applied
    }

    pub fn fail_round(&self, round: &Arc<ConsensusRound>, error: anyhow::Error) {
        let mut applied = Vec::new();
        round.notify_replicated(Err(error), self.term.load(Ordering::SeqCst), &mut applied);
        assert!(applied.is_empty(), "nothing applies on a failed round");
    }

    pub fn invoke_safe_time_provider(&self) -> Option<HybridTime> {
        self.safe_time_provider
            .lock()
            .unwrap()
            .as_ref()
            .map(|provider| provider())
    }

    pub fn invoke_majority_replicated_listener(&self) {
        if let Some(listener) = self.majority_listener.lock().unwrap().as_ref() {
            listener();
        }
    }

    pub fn clock(&self) -> Arc<HybridClock> {
        Arc::clone(&self.clock)
    }
}

impl RaftConsensus for StubConsensus {
    fn tablet_id(&self) -> &str {
        &self.tablet_id
    }

    fn peer_uuid(&self) -> &str {
        &self.peer_uuid
    }

    fn start(&self, _bootstrap_info: &ConsensusBootstrapInfo) -> Result<()> {
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
        // Abort every submitted round that has not completed.
        let pending: Vec<Arc<ConsensusRound>> = self
            .replicated
            .lock()
            .unwrap()
            .iter()
            .filter(|round| !round.replication_finished())
            .cloned()
            .collect();
        for round in pending {
            let mut applied = Vec::new();
            round.notify_replicated(
                Err(anyhow::anyhow!("aborted: consensus is shutting down")),
                self.term.load(Ordering::SeqCst),
                &mut applied,
            );
        }
    }

    fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst) && !self.shut_down.load(Ordering::SeqCst)
    }

    fn current_term(&self) -> i64 {
        self.term.load(Ordering::SeqCst)
    }

    fn leader_status(&self) -> LeaderStatus {
        if self.is_running() {
            LeaderStatus::LeaderReady
        } else {
            LeaderStatus::NotLeader
        }
    }

    fn committed_config(&self) -> RaftConfig {
        self.config.lock().unwrap().clone()
    }

    fn new_round(&self, msg: ReplicateMsg) -> Arc<ConsensusRound> {
        let round = ConsensusRound::new(msg);
        self.rounds.lock().unwrap().push(Arc::clone(&round));
        round
    }

    fn replicate_round(&self, round: &Arc<ConsensusRound>) -> Result<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            bail!("consensus is shut down");
        }
        self.replicated.lock().unwrap().push(Arc::clone(round));
        if self.auto_append.load(Ordering::SeqCst) {
            self.append_round(round);
        }
        Ok(())
    }

    fn last_op_id(&self, op_id_type: OpIdType) -> Result<Option<OpId>> {
        let slot = match op_id_type {
            OpIdType::Received => &self.last_appended,
            OpIdType::Committed => &self.committed_op_id,
        };
        Ok(*slot.lock().unwrap())
    }

    fn majority_replicated_ht_lease_expiration(
        &self,
        _min_allowed: u64,
        _deadline: Instant,
    ) -> u64 {
        self.lease_micros.load(Ordering::SeqCst)
    }

    fn set_propagated_safe_time_provider(&self, provider: SafeTimeProviderFn) {
        *self.safe_time_provider.lock().unwrap() = Some(provider);
    }

    fn set_majority_replicated_listener(&self, listener: MajorityReplicatedListenerFn) {
        *self.majority_listener.lock().unwrap() = Some(listener);
    }

    fn on_disk_size(&self) -> u64 {
        self.on_disk.load(Ordering::SeqCst)
    }
}

// ----------------------------------------------------------------------
// Log stub.
// ----------------------------------------------------------------------

pub struct TestLog {
    latest: Mutex<OpId>,
    /// max contained index -> segment size.
    segments: Mutex<BTreeMap<i64, u64>>,
    gc_calls: Mutex<Vec<i64>>,
    closed: AtomicBool,
    gc_after_close: AtomicBool,
    on_disk: AtomicU64,
}

impl TestLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            latest: Mutex::new(OpId::invalid()),
            segments: Mutex::new(BTreeMap::new()),
            gc_calls: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            gc_after_close: AtomicBool::new(false),
            on_disk: AtomicU64::new(0),
        })
    }

    pub fn set_latest(&self, op_id: OpId) {
        *self.latest.lock().unwrap() = op_id;
    }

    pub fn add_segment(&self, max_index: i64, size: u64) {
        self.segments.lock().unwrap().insert(max_index, size);
    }

    pub fn gc_calls(&self) -> Vec<i64> {
        self.gc_calls.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn gc_ran_after_close(&self) -> bool {
        self.gc_after_close.load(Ordering::SeqCst)
    }

    pub fn set_on_disk_size(&self, bytes: u64) {
        self.on_disk.store(bytes, Ordering::SeqCst);
    }
}

impl Log for TestLog {
    fn latest_entry_op_id(&self) -> OpId {
        *self.latest.lock().unwrap()
    }

    fn gc(&self, min_index: i64) -> Result<usize> {
        if self.closed.load(Ordering::SeqCst) {
            self.gc_after_close.store(true, Ordering::SeqCst);
            bail!("log is closed");
        }
        self.gc_calls.lock().unwrap().push(min_index);
        let mut segments = self.segments.lock().unwrap();
        let before = segments.len();
        segments.retain(|max_index, _| *max_index >= min_index);
        Ok(before - segments.len())
    }

    fn max_indexes_to_segment_size_map(&self, min_index: i64) -> MaxIdxToSegmentSizeMap {
        self.segments
            .lock()
            .unwrap()
            .iter()
            .filter(|(max_index, _)| **max_index >= min_index)
            .map(|(max_index, size)| (*max_index, *size))
            .collect()
    }

    fn gcable_data_size(&self, min_index: i64) -> u64 {
        self.segments
            .lock()
            .unwrap()
            .iter()
            .filter(|(max_index, _)| **max_index < min_index)
            .map(|(_, size)| *size)
            .sum()
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn on_disk_size(&self) -> u64 {
        self.on_disk.load(Ordering::SeqCst)
    }
}

// ----------------------------------------------------------------------
// Storage stubs.
// ----------------------------------------------------------------------

#[derive(Default)]
pub struct TestMvcc {
    pub follower_safe_times: Mutex<Vec<HybridTime>>,
    pub leader_safe_times: Mutex<Vec<HybridTime>>,
    pub safe_time_value: Mutex<HybridTime>,
    pub last_replicated: Mutex<HybridTime>,
}

impl MvccManager for TestMvcc {
    fn set_propagated_safe_time_on_follower(&self, ht: HybridTime) {
        self.follower_safe_times.lock().unwrap().push(ht);
    }

    fn update_propagated_safe_time_on_leader(&self, ht: HybridTime) {
        self.leader_safe_times.lock().unwrap().push(ht);
    }

    fn safe_time(&self, _ht_lease: HybridTime) -> HybridTime {
        *self.safe_time_value.lock().unwrap()
    }

    fn last_replicated_hybrid_time(&self) -> HybridTime {
        *self.last_replicated.lock().unwrap()
    }
}

pub struct TestCoordinator {
    pub started: AtomicBool,
    pub prepare_gc_index: AtomicI64,
}

impl TestCoordinator {
    pub fn new(prepare_gc_index: i64) -> Arc<Self> {
        Arc::new(Self {
            started: AtomicBool::new(false),
            prepare_gc_index: AtomicI64::new(prepare_gc_index),
        })
    }
}

impl TransactionCoordinator for TestCoordinator {
    fn start(&self) {
        self.started.store(true, Ordering::SeqCst);
    }

    fn prepare_gc(&self) -> i64 {
        self.prepare_gc_index.load(Ordering::SeqCst)
    }
}

pub struct TestTablet {
    tablet_id: String,
    table_type: TableType,
    pub mvcc: Arc<TestMvcc>,
    pub coordinator: Option<Arc<TestCoordinator>>,

    shutdown_requested: AtomicBool,
    shut_down: AtomicBool,
    prepare_delay: Mutex<Option<Duration>>,
    fail_prepare: Mutex<Option<String>>,
    fail_when_shutdown_requested: AtomicBool,

    pub prepared: Mutex<Vec<(OperationType, Bytes)>>,
    pub applied: Mutex<Vec<(OperationType, Bytes, ApplyContext)>>,
    pub apply_count: AtomicUsize,
    pub monotonic_counter: AtomicI64,
    max_persistent: Mutex<MaxPersistentOpIds>,
    last_committed_write_index: AtomicI64,
    flush_filter_factory: Mutex<Option<FlushFilterFactory>>,
    sst_size: AtomicU64,
}

impl TestTablet {
    pub fn new(tablet_id: &str, table_type: TableType) -> Arc<Self> {
        Arc::new(Self {
            tablet_id: tablet_id.to_string(),
            table_type,
            mvcc: Arc::new(TestMvcc::default()),
            coordinator: None,
            shutdown_requested: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
            prepare_delay: Mutex::new(None),
            fail_prepare: Mutex::new(None),
            fail_when_shutdown_requested: AtomicBool::new(true),
            prepared: Mutex::new(Vec::new()),
            applied: Mutex::new(Vec::new()),
            apply_count: AtomicUsize::new(0),
            monotonic_counter: AtomicI64::new(0),
            max_persistent: Mutex::new(MaxPersistentOpIds {
                regular: OpId::invalid(),
                intents: None,
            }),
            last_committed_write_index: AtomicI64::new(0),
            flush_filter_factory: Mutex::new(None),
            sst_size: AtomicU64::new(0),
        })
    }

    pub fn with_coordinator(tablet_id: &str, coordinator: Arc<TestCoordinator>) -> Arc<Self> {
        let mut tablet = Self::new(tablet_id, TableType::Regular);
        Arc::get_mut(&mut tablet).expect("fresh arc").coordinator = Some(coordinator);
        tablet
    }

    pub fn set_prepare_delay(&self, delay: Duration) {
        *self.prepare_delay.lock().unwrap() = Some(delay);
    }

    pub fn set_fail_prepare(&self, message: &str) {
        *self.fail_prepare.lock().unwrap() = Some(message.to_string());
    }

    /// Makes prepares survive a requested shutdown, to exercise the
    /// replication-error drain path instead of the prepare-failure one.
    pub fn set_ignore_shutdown_requested(&self) {
        self.fail_when_shutdown_requested
            .store(false, Ordering::SeqCst);
    }

    pub fn set_max_persistent_op_id(&self, regular: OpId, intents: Option<OpId>) {
        *self.max_persistent.lock().unwrap() = MaxPersistentOpIds { regular, intents };
    }

    pub fn set_last_committed_write_index(&self, index: i64) {
        self.last_committed_write_index
            .store(index, Ordering::SeqCst);
    }

    pub fn set_sst_size(&self, bytes: u64) {
        self.sst_size.store(bytes, Ordering::SeqCst);
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    pub fn flush_filter_factory(&self) -> Option<FlushFilterFactory> {
        self.flush_filter_factory.lock().unwrap().take()
    }

    pub fn applied_payloads(&self) -> Vec<Bytes> {
        self.applied
            .lock()
            .unwrap()
            .iter()
            .map(|(_, payload, _)| payload.clone())
            .collect()
    }
}

impl Tablet for TestTablet {
    fn tablet_id(&self) -> &str {
        &self.tablet_id
    }

    fn table_type(&self) -> TableType {
        self.table_type
    }

    fn set_shutdown_requested(&self) {
        self.shutdown_requested.store(true, Ordering::SeqCst);
    }

    fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
    }

    fn set_mem_table_flush_filter_factory(&self, factory: FlushFilterFactory) {
        *self.flush_filter_factory.lock().unwrap() = Some(factory);
    }

    fn prepare_operation(&self, op_type: OperationType, payload: &Bytes) -> Result<()> {
        let delay = *self.prepare_delay.lock().unwrap();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        if self.shutdown_requested.load(Ordering::SeqCst)
            && self.fail_when_shutdown_requested.load(Ordering::SeqCst)
        {
            bail!("tablet is shutting down");
        }
        if let Some(message) = self.fail_prepare.lock().unwrap().clone() {
            bail!("{message}");
        }
        self.prepared.lock().unwrap().push((op_type, payload.clone()));
        Ok(())
    }

    fn apply_operation(
        &self,
        op_type: OperationType,
        payload: &Bytes,
        ctx: ApplyContext,
    ) -> Result<()> {
        self.apply_count.fetch_add(1, Ordering::SeqCst);
        self.applied
            .lock()
            .unwrap()
            .push((op_type, payload.clone(), ctx));
        Ok(())
    }

    fn max_persistent_op_id(&self) -> Result<MaxPersistentOpIds> {
        Ok(*self.max_persistent.lock().unwrap())
    }

    fn last_committed_write_index(&self) -> i64 {
        self.last_committed_write_index.load(Ordering::SeqCst)
    }

    fn update_monotonic_counter(&self, value: i64) {
        self.monotonic_counter.fetch_max(value, Ordering::SeqCst);
    }

    fn transaction_coordinator(&self) -> Option<Arc<dyn TransactionCoordinator>> {
        self.coordinator
            .as_ref()
            .map(|coordinator| Arc::clone(coordinator) as Arc<dyn TransactionCoordinator>)
    }

    fn mvcc(&self) -> Arc<dyn MvccManager> {
        Arc::clone(&self.mvcc) as Arc<dyn MvccManager>
    }

    fn total_sst_file_sizes(&self) -> u64 {
        self.sst_size.load(Ordering::SeqCst)
    }
}

// ----------------------------------------------------------------------
// Peer harness.
// ----------------------------------------------------------------------

pub struct PeerHarness {
    pub peer: Arc<TabletPeer>,
    pub consensus: Arc<StubConsensus>,
    pub log: Arc<TestLog>,
    pub tablet: Arc<TestTablet>,
    pub clock: Arc<HybridClock>,
    pub dirty_events: Arc<Mutex<Vec<StateChangeReason>>>,
}

impl PeerHarness {
    /// Builds and initializes a peer (bootstrapping, not yet started).
    pub fn bootstrapped_with(tablet: Arc<TestTablet>, config: TabletPeerConfig) -> Self {
        init_test_tracing();
        let consensus = StubConsensus::new("tablet-77", "peer-1");
        let log = TestLog::new();
        let clock = consensus.clock();
        let dirty_events = Arc::new(Mutex::new(Vec::new()));
        let dirty_clone = Arc::clone(&dirty_events);
        let peer = Arc::new(TabletPeer::new(
            "tablet-77",
            "peer-1",
            config,
            Box::new(move |context: &StateChangeContext| {
                dirty_clone.lock().unwrap().push(context.reason);
            }),
        ));
        peer.mark_bootstrapping().expect("enter bootstrapping");
        peer.init_tablet_peer(
            Arc::clone(&tablet) as Arc<dyn Tablet>,
            clock.clone() as Arc<dyn Clock>,
            Arc::clone(&consensus) as Arc<dyn RaftConsensus>,
            Arc::clone(&log) as Arc<dyn Log>,
        )
        .expect("init tablet peer");
        Self {
            peer,
            consensus,
            log,
            tablet,
            clock,
            dirty_events,
        }
    }

    pub fn bootstrapped() -> Self {
        Self::bootstrapped_with(
            TestTablet::new("tablet-77", TableType::Regular),
            TabletPeerConfig::default(),
        )
    }

    pub fn start(&self) {
        self.peer
            .start(&ConsensusBootstrapInfo::default())
            .expect("start peer");
    }

    pub fn running() -> Self {
        let harness = Self::bootstrapped();
        harness.start();
        harness
    }

    pub fn running_with(tablet: Arc<TestTablet>, config: TabletPeerConfig) -> Self {
        let harness = Self::bootstrapped_with(tablet, config);
        harness.start();
        harness
    }

    /// Waits until exactly `count` rounds have been submitted for
    /// replication and returns the newest one.
    pub fn wait_for_replicated_round(&self, count: usize) -> Arc<ConsensusRound> {
        wait_until("round submitted for replication", || {
            self.consensus.replicated_rounds().len() >= count
        });
        self.consensus
            .replicated_rounds()
            .last()
            .cloned()
            .expect("round present")
    }
}

/// Builds a round the way a leader's message arrives at a replica: op-id and
/// hybrid time already assigned.
pub fn follower_round(
    op_type: WireOpType,
    payload: &'static [u8],
    op_id: OpId,
    ht: HybridTime,
) -> Arc<ConsensusRound> {
    let mut msg = ReplicateMsg::new(op_type, Bytes::from_static(payload));
    msg.op_id = op_id;
    msg.hybrid_time = ht;
    msg.monotonic_counter = op_id.index;
    ConsensusRound::new(msg)
}
