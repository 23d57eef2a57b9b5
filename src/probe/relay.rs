//! HTTP ping-relay client.
//!
//! A relay answers `GET http://<relay>/PING/<dst>` with
//! `{"err": bool, "ms": int, "ttl": int}`.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use super::{ProbeError, ProbeOutcome, Prober};

#[derive(Debug, Deserialize)]
struct RelayResponse {
    err: bool,
    #[serde(default)]
    ms: Option<f64>,
    #[serde(default)]
    ttl: Option<i64>,
}

/// [`Prober`] backed by `reqwest`.
#[derive(Clone)]
pub struct HttpProber {
    client: reqwest::Client,
}

impl HttpProber {
    pub fn new() -> Result<Self, ProbeError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| ProbeError::Transport(e.to_string()))?;

        Ok(Self { client })
    }
}

/// Normalize a target address into a base URL without trailing slash.
pub fn base_url(address: &str) -> String {
    let url = if address.starts_with("http://") || address.starts_with("https://") {
        address.to_string()
    } else {
        format!("http://{}", address)
    };

    url.trim_end_matches('/').to_string()
}

pub fn relay_url(src: &str, dst: &str) -> String {
    format!("{}/PING/{}", base_url(src), dst)
}

fn transport_error(e: reqwest::Error, timeout: Duration) -> ProbeError {
    if e.is_timeout() {
        ProbeError::Timeout(timeout)
    } else {
        ProbeError::Transport(e.to_string())
    }
}

#[async_trait]
impl Prober for HttpProber {
    async fn reachable(&self, address: &str, timeout: Duration) -> Result<(), ProbeError> {
        let url = format!("{}/", base_url(address));

        let response = self
            .client
            .get(&url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| transport_error(e, timeout))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProbeError::Protocol {
                status: status.as_u16(),
            });
        }

        Ok(())
    }

    async fn measure(
        &self,
        src: &str,
        dst: &str,
        timeout: Duration,
    ) -> Result<ProbeOutcome, ProbeError> {
        let url = relay_url(src, dst);

        let response = match self.client.get(&url).timeout(timeout).send().await {
            Ok(r) => r,
            Err(e) => {
                tracing::debug!("Relay request {} failed: {}", url, transport_error(e, timeout));
                return Ok(ProbeOutcome::Failed);
            }
        };

        let status = response.status();
        if !status.is_success() {
            return Err(ProbeError::Protocol {
                status: status.as_u16(),
            });
        }

        let body: RelayResponse = match response.json().await {
            Ok(body) => body,
            Err(e) if e.is_decode() => return Err(ProbeError::Decode(e.to_string())),
            Err(e) => {
                tracing::debug!(
                    "Relay response {} interrupted: {}",
                    url,
                    transport_error(e, timeout)
                );
                return Ok(ProbeOutcome::Failed);
            }
        };

        if body.err {
            return Ok(ProbeOutcome::Failed);
        }

        match (body.ms, body.ttl) {
            (Some(ms), Some(ttl)) => Ok(ProbeOutcome::Measured { ms, ttl }),
            _ => Err(ProbeError::Decode(
                "successful reply without ms/ttl".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const TIMEOUT: Duration = Duration::from_secs(2);

    async fn relay_replying(template: ResponseTemplate) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/PING/10.0.0.1"))
            .respond_with(template)
            .mount(&server)
            .await;
        server
    }

    #[test]
    fn test_urls() {
        assert_eq!(base_url("10.0.0.2:8000"), "http://10.0.0.2:8000");
        assert_eq!(base_url("https://relay.example.com/"), "https://relay.example.com");
        assert_eq!(relay_url("10.0.0.2", "8.8.8.8"), "http://10.0.0.2/PING/8.8.8.8");
    }

    #[tokio::test]
    async fn test_measure_success() {
        let server = relay_replying(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({"err": false, "ms": 23, "ttl": 54})),
        )
        .await;

        let prober = HttpProber::new().unwrap();
        let outcome = prober.measure(&server.uri(), "10.0.0.1", TIMEOUT).await.unwrap();
        assert_eq!(outcome, ProbeOutcome::Measured { ms: 23.0, ttl: 54 });
    }

    #[tokio::test]
    async fn test_measure_err_flag_is_failed_sample() {
        let server = relay_replying(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({"err": true})),
        )
        .await;

        let prober = HttpProber::new().unwrap();
        let outcome = prober.measure(&server.uri(), "10.0.0.1", TIMEOUT).await.unwrap();
        assert_eq!(outcome, ProbeOutcome::Failed);
    }

    #[tokio::test]
    async fn test_measure_bad_status_is_protocol_error() {
        let server = relay_replying(ResponseTemplate::new(500)).await;

        let prober = HttpProber::new().unwrap();
        let err = prober
            .measure(&server.uri(), "10.0.0.1", TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::Protocol { status: 500 }));
        assert!(err.is_protocol());
    }

    #[tokio::test]
    async fn test_measure_malformed_body() {
        let server = relay_replying(ResponseTemplate::new(200).set_body_string("pong")).await;

        let prober = HttpProber::new().unwrap();
        let err = prober
            .measure(&server.uri(), "10.0.0.1", TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::Decode(_)));
    }

    #[tokio::test]
    async fn test_measure_timeout_is_failed_sample() {
        let server = relay_replying(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({"err": false, "ms": 1, "ttl": 1}))
                .set_delay(Duration::from_millis(500)),
        )
        .await;

        let prober = HttpProber::new().unwrap();
        let outcome = prober
            .measure(&server.uri(), "10.0.0.1", Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(outcome, ProbeOutcome::Failed);
    }

    #[tokio::test]
    async fn test_measure_unreachable_relay_is_failed_sample() {
        let prober = HttpProber::new().unwrap();
        let outcome = prober
            .measure("127.0.0.1:1", "10.0.0.1", Duration::from_millis(200))
            .await
            .unwrap();
        assert_eq!(outcome, ProbeOutcome::Failed);
    }

    #[tokio::test]
    async fn test_reachable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let prober = HttpProber::new().unwrap();
        assert!(prober.reachable(&server.uri(), TIMEOUT).await.is_ok());
    }

    #[tokio::test]
    async fn test_unreachable_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let prober = HttpProber::new().unwrap();
        let err = prober.reachable(&server.uri(), TIMEOUT).await.unwrap_err();
        assert!(matches!(err, ProbeError::Protocol { status: 503 }));
    }
}
