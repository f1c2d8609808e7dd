//! Delivery of processor payloads to the telemetry API
//!
//! Processors only see the [`Transport`] trait. [`HttpTransport`] is the
//! production implementation; tests substitute a recording fake.

use crate::config::ApiConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use once_cell::sync::OnceCell;
use reqwest::StatusCode;
use std::time::Duration;

/// Shared HTTP client for connection pooling across transports
static HTTP_CLIENT: OnceCell<reqwest::Client> = OnceCell::new();

fn http_client() -> Result<&'static reqwest::Client> {
    HTTP_CLIENT.get_or_try_init(|| {
        reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(5)
            .build()
            .context("Failed to create HTTP client")
    })
}

/// One request body addressed to an API path (e.g. `/v1/metrics`)
#[derive(Debug, Clone, PartialEq)]
pub struct Payload {
    pub endpoint: String,
    pub body: serde_json::Value,
}

impl Payload {
    pub fn new(endpoint: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            endpoint: endpoint.into(),
            body,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendOutcome {
    pub success: bool,
    pub message: String,
}

impl SendOutcome {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver `payload`. Never errors; failures are reported in the outcome.
    async fn send(&self, payload: &Payload) -> SendOutcome;
}

/// Authenticated JSON POSTs with a fixed retry schedule
#[derive(Debug, Clone)]
pub struct HttpTransport {
    base_url: String,
    token: Option<String>,
    cookies: Option<String>,
    client_id: String,
    timeout: Duration,
    retry_delays: Vec<Duration>,
}

impl HttpTransport {
    pub fn new(config: &ApiConfig) -> Self {
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            cookies: config.cookies.clone(),
            client_id: config.client_id.clone(),
            timeout: config.timeout(),
            retry_delays: config.retry_delays(),
        }
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/{}", self.base_url, endpoint.trim_start_matches('/'))
    }

    async fn attempt(&self, client: &reqwest::Client, payload: &Payload) -> Attempt {
        let mut request = client
            .post(self.url(&payload.endpoint))
            .timeout(self.timeout)
            .header("User-Agent", &self.client_id)
            .header("X-Client-Id", &self.client_id)
            .json(&payload.body);
        if let Some(token) = &self.token {
            request = request.header("Authorization", format!("Bearer {}", token));
        }
        if let Some(cookies) = &self.cookies {
            request = request.header("Cookie", cookies);
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    Attempt::Delivered(status)
                } else if is_retryable(status) {
                    Attempt::Retry(format!("API error: {}", status))
                } else {
                    let body = response.text().await.unwrap_or_default();
                    Attempt::Rejected(format!("API error: {} {}", status, body.trim()))
                }
            }
            Err(e) => Attempt::Retry(format!("Request failed: {}", e)),
        }
    }
}

enum Attempt {
    Delivered(StatusCode),
    Retry(String),
    Rejected(String),
}

/// Server errors and rate limiting are worth retrying; other 4xx are not.
pub fn is_retryable(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, payload: &Payload) -> SendOutcome {
        let client = match http_client() {
            Ok(c) => c,
            Err(e) => return SendOutcome::failed(format!("{:#}", e)),
        };

        let mut last_error = String::new();
        for attempt in 0..=self.retry_delays.len() {
            if attempt > 0 {
                tokio::time::sleep(self.retry_delays[attempt - 1]).await;
            }
            match self.attempt(client, payload).await {
                Attempt::Delivered(status) => {
                    return SendOutcome::ok(format!("Delivered ({})", status));
                }
                Attempt::Rejected(message) => {
                    tracing::warn!(endpoint = %payload.endpoint, "{}", message);
                    return SendOutcome::failed(message);
                }
                Attempt::Retry(message) => {
                    tracing::debug!(
                        endpoint = %payload.endpoint,
                        attempt = attempt + 1,
                        "{}",
                        message
                    );
                    last_error = message;
                }
            }
        }

        tracing::warn!(
            endpoint = %payload.endpoint,
            attempts = self.retry_delays.len() + 1,
            "Giving up: {}",
            last_error
        );
        SendOutcome::failed(last_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(is_retryable(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(is_retryable(StatusCode::BAD_GATEWAY));
        assert!(is_retryable(StatusCode::TOO_MANY_REQUESTS));
        assert!(!is_retryable(StatusCode::BAD_REQUEST));
        assert!(!is_retryable(StatusCode::UNAUTHORIZED));
        assert!(!is_retryable(StatusCode::NOT_FOUND));
    }

    #[test]
    fn test_url_joining() {
        let transport = HttpTransport::new(&ApiConfig {
            base_url: "https://api.example.com/".to_string(),
            ..Default::default()
        });
        assert_eq!(
            transport.url("/v1/metrics"),
            "https://api.example.com/v1/metrics"
        );
    }

    #[tokio::test]
    async fn test_unreachable_host_fails_after_retries() {
        let transport = HttpTransport::new(&ApiConfig {
            base_url: "http://127.0.0.1:1".to_string(),
            retry_delays_ms: vec![1, 1],
            timeout_secs: 2,
            ..Default::default()
        });

        let outcome = transport
            .send(&Payload::new("/v1/metrics", serde_json::json!({})))
            .await;

        assert!(!outcome.success);
        assert!(outcome.message.starts_with("Request failed"));
    }
}
