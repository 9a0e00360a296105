// Copyright (C) 2025 The Kraken CI Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP client for the server's agent backend.
//!
//! Every call posts one [`AgentRequest`] to `<server>/backend`. Transport
//! failures and 5xx answers are retried with exponential backoff up to
//! [`RetryPolicy::max_attempts`]; anything else is returned at once.

use std::time::Duration;

use kraken_protocol::{AgentMessage, AgentRequest, AgentResponse, HostInfo, StepResult};
use tracing::{debug, warn};
use url::Url;

use crate::error::{Error, Result};

/// Per-request timeout.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Backoff schedule for server requests.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Delay after failed attempt `attempt` (1-based): `base * 2^(attempt - 1)`, capped.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Client bound to one server and one agent address.
#[derive(Debug, Clone)]
pub struct ServerClient {
    http: reqwest::Client,
    endpoint: Url,
    address: String,
    retry: RetryPolicy,
}

impl ServerClient {
    pub fn new(server: &str, address: impl Into<String>) -> Result<Self> {
        let mut base = server.trim().to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        let endpoint = Url::parse(&base)
            .and_then(|u| u.join("backend"))
            .map_err(|e| Error::Config(format!("invalid server URL '{}': {}", server, e)))?;
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            endpoint,
            address: address.into(),
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Send a message, retrying transient failures.
    pub async fn send(&self, message: AgentMessage) -> Result<AgentResponse> {
        let request = AgentRequest::new(self.address.clone(), message);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.send_once(&request).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_transient() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(
                        msg = request.message.kind(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Server request failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) if e.is_transient() => {
                    return Err(Error::Unreachable {
                        attempts: attempt,
                        last: e.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn send_once(&self, request: &AgentRequest) -> Result<AgentResponse> {
        debug!(msg = request.message.kind(), endpoint = %self.endpoint, "Sending to server");
        let response = self
            .http
            .post(self.endpoint.clone())
            .json(request)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Server {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json::<AgentResponse>().await?)
    }

    pub async fn report_host_info(&self, info: HostInfo) -> Result<AgentResponse> {
        self.send(AgentMessage::SysInfo { info }).await
    }

    pub async fn get_job(&self) -> Result<AgentResponse> {
        self.send(AgentMessage::GetJob).await
    }

    pub async fn report_step_result(
        &self,
        job_id: i64,
        step_idx: i32,
        result: StepResult,
    ) -> Result<AgentResponse> {
        self.send(AgentMessage::StepResult {
            job_id,
            step_idx,
            result,
        })
        .await
    }

    pub async fn dispatch_tests(
        &self,
        job_id: i64,
        step_idx: i32,
        tests: Vec<String>,
    ) -> Result<AgentResponse> {
        self.send(AgentMessage::DispatchTests {
            job_id,
            step_idx,
            tests,
        })
        .await
    }

    pub async fn keep_alive(&self, job_id: Option<i64>) -> Result<AgentResponse> {
        self.send(AgentMessage::KeepAlive { job_id }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
        }
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(8));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(60));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_secs(60));
    }

    #[test]
    fn test_endpoint_is_backend_under_server() {
        let c = ServerClient::new("http://kraken:6363", "a").unwrap();
        assert_eq!(c.endpoint().as_str(), "http://kraken:6363/backend");
        let c = ServerClient::new("https://ci.example.com/kraken/", "a").unwrap();
        assert_eq!(c.endpoint().as_str(), "https://ci.example.com/kraken/backend");
        assert!(ServerClient::new("not a url", "a").is_err());
    }

    #[tokio::test]
    async fn test_step_result_envelope() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/backend"))
            .and(body_partial_json(json!({
                "address": "10.0.0.7",
                "msg": "step-result",
                "job_id": 5,
                "step_idx": 1,
                "result": {"status": "done"}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"cancel": true})))
            .expect(1)
            .mount(&server)
            .await;

        let client = ServerClient::new(&server.uri(), "10.0.0.7").unwrap();
        let rsp = client
            .report_step_result(5, 1, StepResult::done())
            .await
            .unwrap();
        assert!(rsp.cancel);
    }

    #[tokio::test]
    async fn test_retries_5xx_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/backend"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/backend"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"agent_id": 3})))
            .mount(&server)
            .await;

        let client = ServerClient::new(&server.uri(), "a")
            .unwrap()
            .with_retry(fast_retry(3));
        let rsp = client.report_host_info(HostInfo::default()).await.unwrap();
        assert_eq!(rsp.agent_id, Some(3));
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(3)
            .mount(&server)
            .await;

        let client = ServerClient::new(&server.uri(), "a")
            .unwrap()
            .with_retry(fast_retry(3));
        match client.get_job().await {
            Err(Error::Unreachable { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad msg"))
            .expect(1)
            .mount(&server)
            .await;

        let client = ServerClient::new(&server.uri(), "a")
            .unwrap()
            .with_retry(fast_retry(5));
        match client.keep_alive(None).await {
            Err(Error::Server { status, body }) => {
                assert_eq!(status, 400);
                assert_eq!(body, "bad msg");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_empty_job_object_is_no_job() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"msg": "get-job"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"job": {}})))
            .mount(&server)
            .await;

        let client = ServerClient::new(&server.uri(), "a").unwrap();
        let rsp = client.get_job().await.unwrap();
        assert!(rsp.job.is_none());
        assert!(!rsp.unauthorized);
    }
}
