//! Rolling statistics and abnormality heuristics.
//!
//! Every operation here is synchronous and works on a single
//! [`TargetState`]. The caller holds the target's lock.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::state::{Sample, TargetState};
use crate::config::StatsConfig;

/// Verdict of the three abnormality heuristics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Classification {
    pub abnormal_ping: bool,
    pub abnormal_loss: bool,
    pub abnormal_jitter: bool,
    /// Any heuristic fired while the target is online.
    pub abnormal: bool,
}

impl TargetState {
    /// Feed one probe result into the statistics.
    ///
    /// Failed or negative samples only count towards loss.
    pub fn ingest(&mut self, sample: Sample, now: DateTime<Utc>, cfg: &StatsConfig) {
        let capacity = cfg.ping_history.max(1);

        self.sample_count += 1;
        self.received.push_front(matches!(sample, Sample::Latency(_)));
        self.shrink_to(capacity);

        let ms = match sample {
            Sample::Latency(ms) if ms >= 0.0 => ms,
            _ => return,
        };

        let baseline_max = self.baseline_max();

        self.average = Some(match self.average {
            None => ms,
            Some(avg) => avg * (1.0 - cfg.alpha) + ms * cfg.alpha,
        });

        if baseline_max > ms || self.baseline.len() < capacity {
            self.baseline.push(ms);
            if self.baseline.len() > capacity {
                // Drop the max from before the insertion, never the new sample.
                remove_first(&mut self.baseline, baseline_max);
            }
        }

        self.history.push_front(ms);
        self.history.truncate(capacity);

        self.decay_baseline(now, cfg);
    }

    /// Forget the lowest baseline sample once per eviction interval.
    ///
    /// Returns the evicted value, if any.
    pub fn decay_baseline(&mut self, now: DateTime<Utc>, cfg: &StatsConfig) -> Option<f64> {
        let elapsed = (now - self.last_baseline_evict_at).to_std().ok()?;
        if elapsed <= cfg.eviction_interval() || self.baseline.is_empty() {
            return None;
        }

        let (pos, min) = self
            .baseline
            .iter()
            .copied()
            .enumerate()
            .min_by(|(_, a), (_, b)| a.total_cmp(b))?;
        self.baseline.remove(pos);
        self.last_baseline_evict_at = now;

        Some(min)
    }

    /// Fraction of recent probes that failed.
    pub fn loss(&self) -> f64 {
        if self.received.is_empty() {
            return 0.0;
        }

        let failed = self.received.iter().filter(|ok| !**ok).count();
        failed as f64 / self.received.len() as f64
    }

    /// Mean of the baseline window, 0 when empty.
    pub fn baseline_value(&self) -> f64 {
        if self.baseline.is_empty() {
            return 0.0;
        }

        self.baseline.iter().sum::<f64>() / self.baseline.len() as f64
    }

    /// Population standard deviation of the history window.
    pub fn jitter(&self) -> f64 {
        if self.history.len() <= 1 {
            return 0.0;
        }

        let n = self.history.len() as f64;
        let mean = self.history.iter().sum::<f64>() / n;
        let variance = self
            .history
            .iter()
            .map(|v| (v - mean).powi(2))
            .sum::<f64>()
            / n;

        variance.sqrt()
    }

    pub fn classify(&self, cfg: &StatsConfig) -> Classification {
        let baseline = self.baseline_value();
        let jitter = self.jitter();

        let abnormal_ping = match self.average {
            Some(avg) => {
                avg > baseline + jitter.max(baseline * cfg.margin) * 2.0
                    && self.history.len() >= cfg.ping_history
            }
            None => false,
        };
        let abnormal_loss =
            self.loss() > cfg.acceptable_loss && self.sample_count >= cfg.ping_history as u64;
        let abnormal_jitter = jitter > baseline * cfg.jitter_margin;

        Classification {
            abnormal_ping,
            abnormal_loss,
            abnormal_jitter,
            abnormal: self.online && (abnormal_ping || abnormal_loss || abnormal_jitter),
        }
    }

    fn baseline_max(&self) -> f64 {
        self.baseline.iter().copied().fold(0.0, f64::max)
    }

    /// Enforce a capacity that may have shrunk since the last mutation.
    fn shrink_to(&mut self, capacity: usize) {
        self.received.truncate(capacity);
        self.history.truncate(capacity);
        while self.baseline.len() > capacity {
            let max = self.baseline_max();
            remove_first(&mut self.baseline, max);
        }
    }
}

fn remove_first(values: &mut Vec<f64>, value: f64) {
    if let Some(pos) = values.iter().position(|v| *v == value) {
        values.remove(pos);
    }
}
