//! Scheduler module: probing workers, persistence and reporting loops.

mod reporter;
mod retention;
mod rollup;

pub use reporter::*;
pub use retention::*;
pub use rollup::*;

use crate::config::MonitorConfig;
use crate::db::{RawSample, Store};
use crate::monitor::{Registry, Sample};
use crate::probe::{HealthGate, ProbeOutcome, Prober};

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// What one worker iteration did.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TickOutcome {
    /// Every target was probed too recently.
    Idle,
    /// The claimed target is offline; nothing was recorded.
    Offline,
    /// A sample was ingested.
    Probed(Sample),
    /// The relay broke protocol; nothing was recorded.
    Rejected,
}

/// Pool of workers sharing one least-recently-probed queue.
pub struct Scheduler {
    registry: Arc<Registry>,
    prober: Arc<dyn Prober>,
    gate: HealthGate,
    config: watch::Receiver<Arc<MonitorConfig>>,
    source_ip: String,
    samples_tx: Option<mpsc::Sender<RawSample>>,
}

impl Scheduler {
    pub fn new(
        registry: Arc<Registry>,
        prober: Arc<dyn Prober>,
        config: watch::Receiver<Arc<MonitorConfig>>,
        source_ip: String,
    ) -> Self {
        Self {
            registry,
            gate: HealthGate::new(prober.clone()),
            prober,
            config,
            source_ip,
            samples_tx: None,
        }
    }

    /// Forward every recorded sample to the batch writer.
    pub fn with_persistence(mut self, samples_tx: mpsc::Sender<RawSample>) -> Self {
        self.samples_tx = Some(samples_tx);
        self
    }

    /// Spawn `workers` probing tasks. They run until aborted.
    pub fn start(self: Arc<Self>, workers: usize) -> Vec<JoinHandle<()>> {
        tracing::info!(
            "Starting scheduler with {} workers over {} targets",
            workers,
            self.registry.len()
        );

        (0..workers)
            .map(|worker| tokio::spawn(self.clone().run_worker(worker)))
            .collect()
    }

    async fn run_worker(self: Arc<Self>, worker: usize) {
        // Stagger workers so they do not tick in lockstep
        let jitter = rand::random::<u64>() % 100;
        tokio::time::sleep(Duration::from_millis(jitter)).await;
        tracing::debug!("Worker {} started", worker);

        loop {
            let cfg = self.config.borrow().clone();
            self.tick(&cfg).await;
            tokio::time::sleep(cfg.tick).await;
        }
    }

    /// Claim the stalest target, gate it on health, probe it and record the result.
    pub async fn tick(&self, cfg: &MonitorConfig) -> TickOutcome {
        let Some(slot) = self.registry.claim_next(Utc::now(), cfg.min_probe_spacing) else {
            return TickOutcome::Idle;
        };

        if !self.gate.check(&slot, cfg, Utc::now()).await {
            return TickOutcome::Offline;
        }

        let (target_id, address) = {
            let state = slot.read();
            (state.id, state.address.clone())
        };

        let outcome = match self
            .prober
            .measure(&address, &self.source_ip, cfg.probe_timeout)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) if !e.is_protocol() => {
                tracing::debug!("Relay on {} unreachable: {}", address, e);
                ProbeOutcome::Failed
            }
            Err(e) => {
                tracing::warn!("Relay on {} broke protocol, skipping sample: {}", address, e);
                return TickOutcome::Rejected;
            }
        };

        let sample = Sample::from(outcome);
        let now = Utc::now();
        let jitter_ms = {
            let mut state = slot.write();
            state.ingest(sample, now, &cfg.stats);
            state.jitter()
        };

        let (latency_ms, ttl) = match outcome {
            ProbeOutcome::Measured { ms, ttl } => (Some(ms), Some(ttl)),
            ProbeOutcome::Failed => (None, None),
        };
        self.persist(RawSample {
            time: now,
            target_id,
            latency_ms,
            ttl,
            jitter_ms,
        });

        TickOutcome::Probed(sample)
    }

    fn persist(&self, sample: RawSample) {
        let Some(tx) = &self.samples_tx else {
            return;
        };

        match tx.try_send(sample) {
            Ok(()) => {}
            Err(TrySendError::Full(s)) => {
                tracing::warn!(
                    "Sample writer is behind, dropping sample for target {}",
                    s.target_id
                )
            }
            Err(TrySendError::Closed(_)) => tracing::debug!("Sample writer is gone"),
        }
    }
}

/// Spawn the batch writer and return the channel feeding it.
pub fn spawn_batch_writer(store: Arc<Store>) -> (mpsc::Sender<RawSample>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(1000);
    let handle = tokio::spawn(run_batch_writer(rx, store));
    (tx, handle)
}

/// Run the batch writer that accumulates and flushes samples.
async fn run_batch_writer(mut rx: mpsc::Receiver<RawSample>, store: Arc<Store>) {
    let mut buffer: Vec<RawSample> = Vec::with_capacity(100);
    let mut interval = tokio::time::interval(Duration::from_secs(2));

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Some(s) => {
                        buffer.push(s);
                        if buffer.len() >= 500 {
                            flush_buffer(&store, &mut buffer);
                        }
                    }
                    None => {
                        // Channel closed, flush remaining and exit
                        flush_buffer(&store, &mut buffer);
                        break;
                    }
                }
            }
            _ = interval.tick() => {
                flush_buffer(&store, &mut buffer);
            }
        }
    }
}

fn flush_buffer(store: &Store, buffer: &mut Vec<RawSample>) {
    if buffer.is_empty() {
        return;
    }

    if let Err(e) = store.add_samples(buffer) {
        tracing::error!("Failed to flush {} samples: {}", buffer.len(), e);
    }

    buffer.clear();
}
