//! Periodic summary of abnormal targets, optionally pushed to a status page.

use crate::config::{ConfigHandle, ReportConfig};
use crate::monitor::Registry;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;

/// Status page error types.
#[derive(Error, Debug)]
pub enum ReportError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("status page answered {0}")]
    Status(u16),
}

#[derive(Debug, Serialize)]
struct MetricPoint {
    value: usize,
    timestamp: i64,
}

/// Client for a Cachet-style metric endpoint.
pub struct StatusReporter {
    client: reqwest::Client,
    report: ReportConfig,
}

impl StatusReporter {
    pub fn new(report: ReportConfig) -> Result<Self, ReportError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { client, report })
    }

    fn points_url(&self) -> String {
        format!("{}/api/v1/metrics/{}/points", self.report.url, self.report.metric_id)
    }

    /// Post the abnormal count as one metric point.
    pub async fn post(&self, abnormal: usize, now: DateTime<Utc>) -> Result<(), ReportError> {
        let point = MetricPoint {
            value: abnormal,
            timestamp: now.timestamp(),
        };

        let resp = self
            .client
            .post(self.points_url())
            .header("X-Cachet-Token", &self.report.api_key)
            .json(&point)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(ReportError::Status(resp.status().as_u16()));
        }
        Ok(())
    }
}

/// Reloads tunables and reports the abnormal count on a fixed interval.
pub struct Reporter {
    registry: Arc<Registry>,
    config: Arc<ConfigHandle>,
    status: Option<StatusReporter>,
    interval: Duration,
}

impl Reporter {
    pub fn new(registry: Arc<Registry>, config: Arc<ConfigHandle>, interval: Duration) -> Self {
        Self {
            registry,
            config,
            status: None,
            interval,
        }
    }

    pub fn with_status_page(mut self, status: StatusReporter) -> Self {
        self.status = Some(status);
        self
    }

    /// Start the reporter background task.
    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            // The first tick completes immediately
            interval.tick().await;

            loop {
                interval.tick().await;

                let config = self.config.clone();
                match tokio::task::spawn_blocking(move || config.reload()).await {
                    Ok(Ok(true)) => tracing::info!("Configuration reloaded"),
                    Ok(Ok(false)) => {}
                    Ok(Err(e)) => tracing::warn!("Keeping previous configuration: {}", e),
                    Err(e) => tracing::error!("Configuration reload task failed: {}", e),
                }

                self.report(Utc::now()).await;
            }
        })
    }

    /// Log the state of every target and publish the abnormal count.
    pub async fn report(&self, now: DateTime<Utc>) -> usize {
        let cfg = self.config.current();

        for state in self.registry.snapshot() {
            let class = state.classify(&cfg.stats);
            tracing::debug!(
                "{} ({}): online={} ping={:.2} baseline={:.2} loss={:.3} jitter={:.2} abnormal={}",
                state.name,
                state.address,
                state.online,
                state.average().unwrap_or(0.0),
                state.baseline_value(),
                state.loss(),
                state.jitter(),
                class.abnormal
            );
        }

        let abnormal = self.registry.abnormal_count(&cfg.stats);
        tracing::info!("Currently {} abnormal servers", abnormal);

        if let Some(status) = &self.status {
            if let Err(e) = status.post(abnormal, now).await {
                tracing::error!("Failed to post metric point: {}", e);
            }
        }

        abnormal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MonitorConfig, StatsConfig, TargetSpec};
    use crate::monitor::Sample;
    use chrono::TimeZone;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn report_config(url: String) -> ReportConfig {
        ReportConfig {
            url,
            api_key: "secret".to_string(),
            metric_id: 3,
        }
    }

    /// One healthy target and one that drops every probe.
    fn setup() -> (Arc<Registry>, Arc<ConfigHandle>) {
        let specs = vec![
            TargetSpec { id: 1, name: "a".to_string(), address: "10.0.0.1".to_string() },
            TargetSpec { id: 2, name: "b".to_string(), address: "10.0.0.2".to_string() },
        ];
        let registry = Arc::new(Registry::new(specs, now()));
        let cfg = MonitorConfig {
            stats: StatsConfig {
                ping_history: 3,
                ..StatsConfig::default()
            },
            ..MonitorConfig::default()
        };

        for slot in registry.iter() {
            slot.write().online = true;
        }
        for _ in 0..3 {
            registry.get(1).unwrap().write().ingest(Sample::Latency(10.0), now(), &cfg.stats);
            registry.get(2).unwrap().write().ingest(Sample::Failed, now(), &cfg.stats);
        }

        (registry, Arc::new(ConfigHandle::new(cfg)))
    }

    #[tokio::test]
    async fn test_report_posts_abnormal_count() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/metrics/3/points"))
            .and(header("X-Cachet-Token", "secret"))
            .and(body_json(serde_json::json!({"value": 1, "timestamp": now().timestamp()})))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let (registry, config) = setup();
        let status = StatusReporter::new(report_config(server.uri())).unwrap();
        let reporter =
            Reporter::new(registry, config, Duration::from_secs(60)).with_status_page(status);

        assert_eq!(reporter.report(now()).await, 1);
    }

    #[tokio::test]
    async fn test_report_without_status_page() {
        let (registry, config) = setup();
        let reporter = Reporter::new(registry, config, Duration::from_secs(60));
        assert_eq!(reporter.report(now()).await, 1);
    }

    #[tokio::test]
    async fn test_post_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let status = StatusReporter::new(report_config(server.uri())).unwrap();
        let err = status.post(0, now()).await.unwrap_err();
        assert!(matches!(err, ReportError::Status(401)));
    }
}
