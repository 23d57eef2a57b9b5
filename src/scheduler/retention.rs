//! Retention manager for cleaning up old data.

use crate::db::Store;

use super::rollup::{default_policies, RetentionPolicy};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Manager for deleting data past retention periods.
pub struct RetentionManager {
    store: Arc<Store>,
    policies: Vec<RetentionPolicy>,
}

impl RetentionManager {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            policies: default_policies(),
        }
    }

    /// Start the retention manager background task.
    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));

            loop {
                interval.tick().await;
                process_retention(&self.store, &self.policies, Utc::now());
            }
        })
    }
}

/// Delete rows older than each policy allows. Returns the total row count.
pub fn process_retention(store: &Store, policies: &[RetentionPolicy], now: DateTime<Utc>) -> usize {
    let mut total = 0;

    for policy in policies {
        let Some(cutoff) = ChronoDuration::from_std(policy.retention)
            .ok()
            .and_then(|retention| now.checked_sub_signed(retention))
        else {
            continue;
        };

        let result = if policy.window == 0 {
            store.delete_samples_before(cutoff)
        } else {
            store.delete_rollups_before(policy.window, cutoff)
        };

        match result {
            Ok(deleted) => {
                if deleted > 0 {
                    tracing::debug!(
                        "RetentionManager: Deleted {} rows (w={}s) before {}",
                        deleted,
                        policy.window,
                        cutoff
                    );
                }
                total += deleted;
            }
            Err(e) => {
                tracing::error!(
                    "RetentionManager: Failed to delete rows (w={}s): {}",
                    policy.window,
                    e
                );
            }
        }
    }

    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{RawSample, Rollup};
    use chrono::TimeZone;
    use tempfile::NamedTempFile;

    #[test]
    fn test_process_retention() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();

        let sample = |days: i64| RawSample {
            time: now - ChronoDuration::days(days),
            target_id: 1,
            latency_ms: Some(5.0),
            ttl: Some(60),
            jitter_ms: 0.0,
        };
        store.add_samples(&[sample(0), sample(2)]).unwrap();

        store
            .add_rollups(&[
                Rollup::empty(now - ChronoDuration::days(2), 1, 60),
                Rollup::empty(now - ChronoDuration::days(4), 1, 60),
                Rollup::empty(now - ChronoDuration::days(4), 1, 600),
            ])
            .unwrap();

        assert_eq!(process_retention(&store, &default_policies(), now), 2);

        let start = now - ChronoDuration::days(40);
        let end = now + ChronoDuration::days(1);
        assert_eq!(store.get_samples(1, start, end).unwrap().len(), 1);
        assert_eq!(store.get_rollups(1, 60, start, end).unwrap().len(), 1);
        assert_eq!(store.get_rollups(1, 600, start, end).unwrap().len(), 1);
    }
}
