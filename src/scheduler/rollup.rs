//! Rollup manager for consolidating samples into time windows.
//!
//! Raw samples become 1 minute rollups, which in turn become 10 minute
//! rollups. Only windows that are fully in the past are consolidated.

use crate::db::{Rollup, Store};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Samples younger than this may still be waiting in the batch writer.
const SETTLE_SECONDS: i64 = 5;

/// How long rows of one window size are kept. Window 0 is the raw samples.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetentionPolicy {
    pub window: i64,
    pub retention: Duration,
}

/// Default retention policies.
pub fn default_policies() -> Vec<RetentionPolicy> {
    const DAY: u64 = 86400;
    vec![
        RetentionPolicy { window: 0, retention: Duration::from_secs(DAY) },       // Raw: 1 day
        RetentionPolicy { window: 60, retention: Duration::from_secs(3 * DAY) },  // 1m: 3 days
        RetentionPolicy { window: 600, retention: Duration::from_secs(30 * DAY) }, // 10m: 30 days
    ]
}

/// Manager for rolling up raw samples into time windows.
pub struct RollupManager {
    store: Arc<Store>,
    policies: Vec<RetentionPolicy>,
}

impl RollupManager {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            policies: default_policies(),
        }
    }

    /// Start the rollup manager background task.
    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(10));

            loop {
                interval.tick().await;
                process_rollups(&self.store, &self.policies, Utc::now());
            }
        })
    }
}

fn process_rollups(store: &Store, policies: &[RetentionPolicy], now: DateTime<Utc>) {
    let target_ids = match store.sample_target_ids() {
        Ok(ids) => ids,
        Err(e) => {
            tracing::error!("RollupManager: Failed to list targets: {}", e);
            return;
        }
    };

    let mut windows: Vec<i64> = policies.iter().map(|p| p.window).filter(|w| *w > 0).collect();
    windows.sort_unstable();

    for target_id in target_ids {
        let mut source_window = 0;
        for &window in &windows {
            process_target_window(store, target_id, window, source_window, now);
            source_window = window;
        }
    }
}

/// Consolidate every complete window of `window_seconds` not yet rolled up.
///
/// `source_window` 0 reads raw samples; otherwise finer rollups are merged.
/// Returns the number of rollups written.
pub fn process_target_window(
    store: &Store,
    target_id: i64,
    window_seconds: i64,
    source_window: i64,
    now: DateTime<Utc>,
) -> usize {
    let window = ChronoDuration::seconds(window_seconds);

    let mut next_window_start = match store.last_rollup_time(target_id, window_seconds) {
        Ok(Some(last)) => last + window,
        Ok(None) => match store.earliest_sample_time(target_id) {
            Ok(Some(earliest)) => truncate_to_window(earliest, window_seconds),
            Ok(None) => return 0,
            Err(e) => {
                tracing::error!("RollupManager: Error getting earliest time: {}", e);
                return 0;
            }
        },
        Err(e) => {
            tracing::error!("RollupManager: Failed to get last rollup time: {}", e);
            return 0;
        }
    };

    let cutoff = now - ChronoDuration::seconds(SETTLE_SECONDS);
    let mut results = Vec::new();

    loop {
        let window_end = next_window_start + window;
        if window_end > cutoff {
            break;
        }

        let rollup = aggregate_window(
            store,
            target_id,
            window_seconds,
            source_window,
            next_window_start,
            window_end,
        );
        match rollup {
            Some(rollup) => results.push(rollup),
            // Retry from here on the next pass
            None => break,
        }

        next_window_start = window_end;
    }

    if results.is_empty() {
        return 0;
    }

    let count = results.len();
    if let Err(e) = store.add_rollups(&results) {
        tracing::error!(
            "RollupManager: Failed to save batch for target {} (w={}s): {}",
            target_id,
            window_seconds,
            e
        );
        return 0;
    }

    tracing::debug!(
        "RollupManager: Saved {} rollups for target {} (w={}s)",
        count,
        target_id,
        window_seconds
    );
    count
}

fn aggregate_window(
    store: &Store,
    target_id: i64,
    window_seconds: i64,
    source_window: i64,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Option<Rollup> {
    if source_window == 0 {
        match store.get_samples(target_id, start, end) {
            Ok(samples) => Some(Rollup::from_samples(start, target_id, window_seconds, &samples)),
            Err(e) => {
                tracing::error!("RollupManager: Error fetching samples: {}", e);
                None
            }
        }
    } else {
        match store.get_rollups(target_id, source_window, start, end) {
            Ok(parts) => Some(Rollup::merge(start, target_id, window_seconds, &parts)),
            Err(e) => {
                tracing::error!("RollupManager: Error fetching rollups: {}", e);
                None
            }
        }
    }
}

/// Truncate a datetime to the start of its containing window.
pub fn truncate_to_window(dt: DateTime<Utc>, window_seconds: i64) -> DateTime<Utc> {
    let ts = dt.timestamp();
    let truncated = ts - ts.rem_euclid(window_seconds);
    DateTime::from_timestamp(truncated, 0).unwrap_or(dt)
}
