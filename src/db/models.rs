//! Database model types.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// A single persisted probe result.
#[derive(Debug, Clone, PartialEq)]
pub struct RawSample {
    pub time: DateTime<Utc>,
    pub target_id: i64,
    /// `None` for a failed probe.
    pub latency_ms: Option<f64>,
    pub ttl: Option<i64>,
    /// Target jitter right after this sample was ingested.
    pub jitter_ms: f64,
}

/// Consolidated samples of one target over a time window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Rollup {
    /// Start of the window.
    pub time: DateTime<Utc>,
    pub target_id: i64,
    pub window_seconds: i64,
    pub min_ms: Option<f64>,
    pub avg_ms: Option<f64>,
    pub max_ms: Option<f64>,
    /// Successful samples in the window.
    pub sample_count: i64,
    pub failed_count: i64,
}

impl Rollup {
    /// A window with no data; marks the window as processed.
    pub fn empty(time: DateTime<Utc>, target_id: i64, window_seconds: i64) -> Self {
        Self {
            time,
            target_id,
            window_seconds,
            min_ms: None,
            avg_ms: None,
            max_ms: None,
            sample_count: 0,
            failed_count: 0,
        }
    }

    /// Consolidate raw samples.
    pub fn from_samples(
        time: DateTime<Utc>,
        target_id: i64,
        window_seconds: i64,
        samples: &[RawSample],
    ) -> Self {
        let mut rollup = Self::empty(time, target_id, window_seconds);
        let mut sum = 0.0;

        for sample in samples {
            match sample.latency_ms {
                Some(ms) => {
                    rollup.min_ms = Some(rollup.min_ms.map_or(ms, |m| m.min(ms)));
                    rollup.max_ms = Some(rollup.max_ms.map_or(ms, |m| m.max(ms)));
                    sum += ms;
                    rollup.sample_count += 1;
                }
                None => rollup.failed_count += 1,
            }
        }

        if rollup.sample_count > 0 {
            rollup.avg_ms = Some(sum / rollup.sample_count as f64);
        }
        rollup
    }

    /// Consolidate finer rollups into a coarser window.
    pub fn merge(
        time: DateTime<Utc>,
        target_id: i64,
        window_seconds: i64,
        parts: &[Rollup],
    ) -> Self {
        let mut rollup = Self::empty(time, target_id, window_seconds);
        let mut weighted = 0.0;

        for part in parts {
            rollup.failed_count += part.failed_count;
            if let (Some(min), Some(avg), Some(max)) = (part.min_ms, part.avg_ms, part.max_ms) {
                rollup.min_ms = Some(rollup.min_ms.map_or(min, |m| m.min(min)));
                rollup.max_ms = Some(rollup.max_ms.map_or(max, |m| m.max(max)));
                weighted += avg * part.sample_count as f64;
                rollup.sample_count += part.sample_count;
            }
        }

        if rollup.sample_count > 0 {
            rollup.avg_ms = Some(weighted / rollup.sample_count as f64);
        }
        rollup
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn sample(latency_ms: Option<f64>) -> RawSample {
        RawSample {
            time: at(),
            target_id: 1,
            latency_ms,
            ttl: latency_ms.map(|_| 55),
            jitter_ms: 0.0,
        }
    }

    #[test]
    fn test_from_samples() {
        let samples = vec![
            sample(Some(10.0)),
            sample(None),
            sample(Some(30.0)),
            sample(Some(20.0)),
        ];
        let rollup = Rollup::from_samples(at(), 1, 60, &samples);

        assert_eq!(rollup.min_ms, Some(10.0));
        assert_eq!(rollup.max_ms, Some(30.0));
        assert_eq!(rollup.avg_ms, Some(20.0));
        assert_eq!(rollup.sample_count, 3);
        assert_eq!(rollup.failed_count, 1);
    }

    #[test]
    fn test_only_failures() {
        let rollup = Rollup::from_samples(at(), 1, 60, &[sample(None), sample(None)]);
        assert_eq!(rollup.avg_ms, None);
        assert_eq!(rollup.failed_count, 2);
    }

    #[test]
    fn test_merge_weights_by_count() {
        let a = Rollup::from_samples(at(), 1, 60, &[sample(Some(10.0))]);
        let b = Rollup::from_samples(
            at(),
            1,
            60,
            &[sample(Some(40.0)), sample(Some(40.0)), sample(Some(40.0)), sample(None)],
        );
        let empty = Rollup::empty(at(), 1, 60);

        let merged = Rollup::merge(at(), 1, 600, &[a, b, empty]);
        assert_eq!(merged.window_seconds, 600);
        assert_eq!(merged.min_ms, Some(10.0));
        assert_eq!(merged.max_ms, Some(40.0));
        assert_eq!(merged.avg_ms, Some(32.5));
        assert_eq!(merged.sample_count, 4);
        assert_eq!(merged.failed_count, 1);
    }
}
