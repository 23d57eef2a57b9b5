//! Health gate deciding whether a target gets probed.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::{ProbeOutcome, Prober};
use crate::config::{MonitorConfig, HEALTH_CHECK_INTERVAL, REACHABILITY_TIMEOUT};
use crate::monitor::TargetSlot;

/// Re-checks target reachability at most once per interval.
///
/// Errors never leave the gate: an unreachable target simply becomes offline.
pub struct HealthGate {
    prober: Arc<dyn Prober>,
    interval: Duration,
}

impl HealthGate {
    pub fn new(prober: Arc<dyn Prober>) -> Self {
        Self {
            prober,
            interval: HEALTH_CHECK_INTERVAL,
        }
    }

    fn is_due(&self, last_checked: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        match last_checked {
            None => true,
            Some(last) => (now - last)
                .to_std()
                .map(|elapsed| elapsed > self.interval)
                .unwrap_or(false),
        }
    }

    /// Return the target's online verdict, refreshing it when due.
    pub async fn check(&self, slot: &TargetSlot, cfg: &MonitorConfig, now: DateTime<Utc>) -> bool {
        let address = {
            let mut state = slot.write();
            if !self.is_due(state.last_checked_at, now) {
                return state.online;
            }
            state.last_checked_at = Some(now);
            state.address.clone()
        };

        let online = match self.prober.reachable(&address, REACHABILITY_TIMEOUT).await {
            Ok(()) => {
                if let Some(reliable) = &cfg.health_test_ip {
                    self.check_relay(&address, reliable, cfg.probe_timeout).await;
                }
                true
            }
            Err(e) => {
                tracing::debug!("Health check of {} failed: {}", address, e);
                false
            }
        };

        let mut state = slot.write();
        if state.online != online {
            if online {
                tracing::info!("Server {} turned ON", address);
            } else {
                tracing::info!("Server {} turned offline as it's not responding", address);
            }
        }
        state.online = online;

        online
    }

    /// Ping a reliable address through the target's relay. Advisory only.
    async fn check_relay(&self, address: &str, reliable: &str, timeout: Duration) {
        match self.prober.measure(address, reliable, timeout).await {
            Ok(ProbeOutcome::Measured { .. }) => {}
            Ok(ProbeOutcome::Failed) => {
                tracing::warn!("Relay on {} could not reach reliable address {}", address, reliable)
            }
            Err(e) => tracing::warn!(
                "Relay on {} misbehaved pinging reliable address {}: {}",
                address,
                reliable,
                e
            ),
        }
    }
}
