//! Probe module for target monitoring.
//!
//! Latency is measured through a ping relay reached over HTTP; reachability
//! is a plain HTTP request to the target. Both sit behind [`Prober`].

mod health;
mod relay;

pub use health::*;
pub use relay::*;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::monitor::Sample;

/// Probe error types.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("network error: {0}")]
    Transport(String),
    #[error("unexpected status {status}")]
    Protocol { status: u16 },
    #[error("malformed response: {0}")]
    Decode(String),
}

impl ProbeError {
    /// Peer answered but broke the expected contract.
    pub fn is_protocol(&self) -> bool {
        matches!(self, Self::Protocol { .. } | Self::Decode(_))
    }
}

/// Result of a relay ping that reached the relay.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProbeOutcome {
    Measured { ms: f64, ttl: i64 },
    /// The relay reported a failed ping, or could not be reached.
    Failed,
}

impl From<ProbeOutcome> for Sample {
    fn from(outcome: ProbeOutcome) -> Self {
        match outcome {
            ProbeOutcome::Measured { ms, .. } => Sample::Latency(ms),
            ProbeOutcome::Failed => Sample::Failed,
        }
    }
}

/// Network side of the monitor.
#[async_trait]
pub trait Prober: Send + Sync {
    /// Plain reachability check of a target's base address.
    async fn reachable(&self, address: &str, timeout: Duration) -> Result<(), ProbeError>;

    /// Ask the relay at `src` to ping `dst`.
    ///
    /// Transport failures map to [`ProbeOutcome::Failed`]; an unexpected
    /// status or body is an error.
    async fn measure(
        &self,
        src: &str,
        dst: &str,
        timeout: Duration,
    ) -> Result<ProbeOutcome, ProbeError>;
}
