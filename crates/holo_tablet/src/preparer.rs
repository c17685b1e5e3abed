//! Per-tablet FIFO prepare queue.
//!
//! One dedicated worker drains submissions in order, so prepare sees
//! operations exactly as they were submitted and never contends with itself.
//! After a successful prepare the worker hands leader-side rounds to
//! consensus, which keeps prepare order equal to log order. Stop drains the
//! backlog, then joins the worker.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use anyhow::{bail, Context, Result};

use holo_raft::raft::RaftConsensus;

use crate::driver::OperationDriver;
use crate::metrics::PreparerMetrics;

struct QueuedDriver {
    driver: Arc<OperationDriver>,
    enqueued_at: Instant,
}

#[derive(Default)]
struct PreparerInner {
    tx: Option<Sender<QueuedDriver>>,
    worker: Option<JoinHandle<()>>,
}

pub struct Preparer {
    consensus: Option<Arc<dyn RaftConsensus>>,
    metrics: Arc<PreparerMetrics>,
    inner: Mutex<PreparerInner>,
}

impl Preparer {
    pub fn new(consensus: Option<Arc<dyn RaftConsensus>>, metrics: Arc<PreparerMetrics>) -> Self {
        Self {
            consensus,
            metrics,
            inner: Mutex::new(PreparerInner::default()),
        }
    }

    pub fn start(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.tx.is_some() || inner.worker.is_some() {
            bail!("preparer already started");
        }

        let (tx, rx) = mpsc::channel();
        let consensus = self.consensus.clone();
        let metrics = Arc::clone(&self.metrics);
        let worker = thread::Builder::new()
            .name("tablet-preparer".to_string())
            .spawn(move || Self::run_worker(rx, consensus, metrics))
            .context("failed to spawn preparer worker")?;

        inner.tx = Some(tx);
        inner.worker = Some(worker);
        Ok(())
    }

    /// Non-blocking enqueue. Fails once the preparer has been stopped.
    pub fn submit(&self, driver: Arc<OperationDriver>) -> Result<()> {
        let inner = self.inner.lock().unwrap();
        let Some(tx) = inner.tx.as_ref() else {
            bail!("preparer is not accepting submissions");
        };

        self.metrics.record_enqueue();
        if tx
            .send(QueuedDriver {
                driver,
                enqueued_at: Instant::now(),
            })
            .is_err()
        {
            self.metrics.record_enqueue_failed();
            bail!("preparer worker has exited");
        }
        Ok(())
    }

    /// Stops accepting work, drains everything already queued, and joins the
    /// worker. Idempotent.
    pub fn stop(&self) {
        let (tx, worker) = {
            let mut inner = self.inner.lock().unwrap();
            (inner.tx.take(), inner.worker.take())
        };
        drop(tx);
        if let Some(worker) = worker {
            if worker.join().is_err() {
                tracing::error!("preparer worker panicked");
            }
        }
    }

    pub fn metrics(&self) -> &Arc<PreparerMetrics> {
        &self.metrics
    }

    fn run_worker(
        rx: Receiver<QueuedDriver>,
        consensus: Option<Arc<dyn RaftConsensus>>,
        metrics: Arc<PreparerMetrics>,
    ) {
        while let Ok(item) = rx.recv() {
            metrics.record_dequeue(item.enqueued_at.elapsed());

            let run_start = Instant::now();
            let prepared = item.driver.prepare_and_start_task();
            metrics.record_run(run_start.elapsed());

            if !prepared {
                continue;
            }
            // Leader-side drivers replicate only after prepare, in queue
            // order. A rejection here is a consensus-originating failure and
            // is routed through the replication-finished path.
            if let Some(round) = item.driver.round_for_replication() {
                let Some(consensus) = consensus.as_ref() else {
                    continue;
                };
                if let Err(err) = consensus.replicate_round(&round) {
                    item.driver
                        .replication_finished(Err(err), round.bound_term(), &mut Vec::new());
                }
            }
        }
    }
}
