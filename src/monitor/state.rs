//! Per-target state accumulated by the workers.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};

use crate::config::TargetSpec;

/// One latency observation as fed to the statistics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Sample {
    /// Round-trip latency in milliseconds.
    Latency(f64),
    /// The relay answered but could not measure, or the relay was unreachable.
    Failed,
}

/// A monitored endpoint and its rolling statistics.
///
/// Windows are stored newest-first and never exceed the configured
/// `ping_history` once a mutation completes.
#[derive(Debug, Clone)]
pub struct TargetState {
    pub id: i64,
    pub name: String,
    pub address: String,
    /// Last health-check verdict.
    pub online: bool,
    pub last_checked_at: Option<DateTime<Utc>>,
    /// Set when a worker claims the target, before the probe runs.
    pub last_probed_at: Option<DateTime<Utc>>,
    pub(super) average: Option<f64>,
    pub(super) history: VecDeque<f64>,
    pub(super) received: VecDeque<bool>,
    pub(super) baseline: Vec<f64>,
    pub(super) sample_count: u64,
    pub(super) last_baseline_evict_at: DateTime<Utc>,
}

impl TargetState {
    pub fn new(spec: TargetSpec, now: DateTime<Utc>) -> Self {
        Self {
            id: spec.id,
            name: spec.name,
            address: spec.address,
            online: false,
            last_checked_at: None,
            last_probed_at: None,
            average: None,
            history: VecDeque::new(),
            received: VecDeque::new(),
            baseline: Vec::new(),
            sample_count: 0,
            last_baseline_evict_at: now,
        }
    }

    /// EWMA of successful samples, `None` until the first one.
    pub fn average(&self) -> Option<f64> {
        self.average
    }

    /// Recent successful latencies, newest first.
    pub fn history(&self) -> &VecDeque<f64> {
        &self.history
    }

    /// Success flag of recent probes, newest first.
    pub fn received(&self) -> &VecDeque<bool> {
        &self.received
    }

    /// Low-water latency samples, in insertion order.
    pub fn baseline(&self) -> &[f64] {
        &self.baseline
    }

    /// Total probes fed into the statistics.
    pub fn sample_count(&self) -> u64 {
        self.sample_count
    }
}
