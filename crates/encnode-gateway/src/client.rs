//! Gateway client implementation.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use tracing::{debug, info};
use url::Url;

use encnode_models::{JobDescription, JobId, JobResult};

use crate::error::{GatewayError, GatewayResult};
use crate::metrics::record_request;
use crate::retry::{with_retry, RetryConfig};
use crate::signer::{RequestSigner, StaticTokenSigner};
use crate::types::{
    AcceptRequest, CompleteRequest, FailRequest, NextJobRequest, NextJobResponse, ProgressRequest,
};

/// Job hand-out and reporting operations offered by the gateway.
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Ask for the next job. `None` when the gateway has nothing queued.
    async fn poll_next_job(&self) -> GatewayResult<Option<JobDescription>>;

    /// Confirm this worker takes a polled job.
    async fn accept_job(&self, id: &JobId) -> GatewayResult<()>;

    async fn report_progress(&self, id: &JobId, percent: u8) -> GatewayResult<()>;

    async fn report_complete(&self, id: &JobId, result: &JobResult) -> GatewayResult<()>;

    async fn report_failed(&self, id: &JobId, reason: &str) -> GatewayResult<()>;
}

/// Gateway client configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Gateway API root
    pub base_url: Url,
    /// Identity reported with every call
    pub worker_id: String,
    /// Request timeout
    pub timeout: Duration,
    /// Connect timeout
    pub connect_timeout: Duration,
    /// Retry policy for report calls
    pub retry: RetryConfig,
}

impl GatewayConfig {
    pub fn new(base_url: Url, worker_id: impl Into<String>) -> Self {
        Self {
            base_url,
            worker_id: worker_id.into(),
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
            retry: RetryConfig::default(),
        }
    }

    /// Create config from environment variables. `None` when `GATEWAY_URL` is unset.
    pub fn from_env(worker_id: &str) -> GatewayResult<Option<Self>> {
        let Some(raw) = std::env::var("GATEWAY_URL").ok().filter(|s| !s.is_empty()) else {
            return Ok(None);
        };
        let base_url = Url::parse(&raw)
            .map_err(|e| GatewayError::NotConfigured(format!("GATEWAY_URL '{}': {}", raw, e)))?;

        let timeout_secs: u64 = std::env::var("GATEWAY_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(30);

        Ok(Some(Self {
            timeout: Duration::from_secs(timeout_secs),
            retry: RetryConfig::from_env(),
            ..Self::new(base_url, worker_id)
        }))
    }
}

/// HTTP gateway client.
#[derive(Clone)]
pub struct GatewayClient {
    http: Client,
    config: GatewayConfig,
    signer: Arc<dyn RequestSigner>,
}

impl GatewayClient {
    /// Create a new gateway client.
    pub fn new(config: GatewayConfig, signer: Arc<dyn RequestSigner>) -> GatewayResult<Self> {
        let http = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .user_agent(concat!("encnode-gateway/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(GatewayError::Network)?;

        Ok(Self {
            http,
            config,
            signer,
        })
    }

    /// Create from environment variables, signing with `GATEWAY_TOKEN`.
    pub fn from_env(worker_id: &str) -> GatewayResult<Option<Self>> {
        let Some(config) = GatewayConfig::from_env(worker_id)? else {
            return Ok(None);
        };
        let token = std::env::var("GATEWAY_TOKEN")
            .map_err(|_| GatewayError::NotConfigured("GATEWAY_TOKEN not set".to_string()))?;
        let signer = Arc::new(StaticTokenSigner::new(token)?);
        Self::new(config, signer).map(Some)
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    fn endpoint(&self, segments: &[&str]) -> GatewayResult<Url> {
        let base = &self.config.base_url;
        let mut url = base.clone();
        url.path_segments_mut()
            .map_err(|_| GatewayError::NotConfigured(format!("cannot-be-a-base URL {}", base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Sign and POST a JSON body.
    async fn post_json<B: Serialize + ?Sized>(
        &self,
        operation: &str,
        url: Url,
        body: &B,
    ) -> GatewayResult<reqwest::Response> {
        let payload = serde_json::to_vec(body)?;
        let token = self.signer.sign(&payload)?;
        let started = Instant::now();

        let result = self
            .http
            .post(url.clone())
            .bearer_auth(token)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(payload)
            .send()
            .await;

        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        match result {
            Ok(response) => {
                record_request(operation, response.status().as_str(), latency_ms);
                Ok(response)
            }
            Err(e) if e.is_timeout() => {
                record_request(operation, "timeout", latency_ms);
                Err(GatewayError::Timeout(format!("{} {}", operation, url)))
            }
            Err(e) => {
                record_request(operation, "network_error", latency_ms);
                Err(GatewayError::Network(e))
            }
        }
    }

    async fn expect_success(response: reqwest::Response) -> GatewayResult<()> {
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(GatewayError::from_http_status(status.as_u16(), body))
    }
}

#[async_trait]
impl Gateway for GatewayClient {
    async fn poll_next_job(&self) -> GatewayResult<Option<JobDescription>> {
        let url = self.endpoint(&["jobs", "next"])?;
        let body = NextJobRequest {
            worker_id: &self.config.worker_id,
        };
        let response = self.post_json("poll_next_job", url, &body).await?;

        match response.status() {
            StatusCode::NO_CONTENT => Ok(None),
            StatusCode::OK => {
                let text = response.text().await?;
                if text.trim().is_empty() {
                    return Ok(None);
                }
                let parsed: NextJobResponse = serde_json::from_str(&text).map_err(|e| {
                    GatewayError::InvalidResponse(format!("next job payload: {}", e))
                })?;
                if let Some(job) = &parsed.job {
                    debug!(job_id = %job.id, "Gateway offered job");
                }
                Ok(parsed.job)
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(GatewayError::from_http_status(status.as_u16(), body))
            }
        }
    }

    async fn accept_job(&self, id: &JobId) -> GatewayResult<()> {
        let url = self.endpoint(&["jobs", id.as_str(), "accept"])?;
        let body = AcceptRequest {
            worker_id: &self.config.worker_id,
        };
        with_retry(&self.config.retry, "accept_job", || async {
            let response = self.post_json("accept_job", url.clone(), &body).await?;
            Self::expect_success(response).await
        })
        .await?;
        info!(job_id = %id, "Accepted job via gateway");
        Ok(())
    }

    async fn report_progress(&self, id: &JobId, percent: u8) -> GatewayResult<()> {
        let url = self.endpoint(&["jobs", id.as_str(), "progress"])?;
        let body = ProgressRequest {
            worker_id: &self.config.worker_id,
            percent: percent.min(100),
        };
        // Progress is advisory: one attempt, the next update supersedes it.
        let response = self.post_json("report_progress", url, &body).await?;
        Self::expect_success(response).await
    }

    async fn report_complete(&self, id: &JobId, result: &JobResult) -> GatewayResult<()> {
        let url = self.endpoint(&["jobs", id.as_str(), "complete"])?;
        let body = CompleteRequest {
            worker_id: &self.config.worker_id,
            result,
        };
        with_retry(&self.config.retry, "report_complete", || async {
            let response = self.post_json("report_complete", url.clone(), &body).await?;
            Self::expect_success(response).await
        })
        .await
    }

    async fn report_failed(&self, id: &JobId, reason: &str) -> GatewayResult<()> {
        let url = self.endpoint(&["jobs", id.as_str(), "fail"])?;
        let body = FailRequest {
            worker_id: &self.config.worker_id,
            reason,
        };
        with_retry(&self.config.retry, "report_failed", || async {
            let response = self.post_json("report_failed", url.clone(), &body).await?;
            Self::expect_success(response).await
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use encnode_models::{ContentAddress, JobSource};
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> GatewayClient {
        let mut config = GatewayConfig::new(Url::parse(&server.uri()).unwrap(), "worker-1");
        config.retry = RetryConfig {
            max_retries: 2,
            base_delay_ms: 1,
            max_delay_ms: 5,
        };
        config.timeout = Duration::from_secs(2);
        let signer = Arc::new(StaticTokenSigner::new("secret").unwrap());
        GatewayClient::new(config, signer).unwrap()
    }

    fn job() -> JobDescription {
        JobDescription::new(
            JobId::from_string("J1"),
            "ipfs://QmSource",
            JobSource::Gateway {
                owner: "alice".into(),
                permlink: "clip".into(),
                short: false,
            },
        )
    }

    #[test]
    fn test_endpoint_appends_to_base_path() {
        let config = GatewayConfig::new(Url::parse("http://gateway.local/api/v1/").unwrap(), "worker-1");
        let signer = Arc::new(StaticTokenSigner::new("secret").unwrap());
        let client = GatewayClient::new(config, signer).unwrap();

        let url = client.endpoint(&["jobs", "J1", "accept"]).unwrap();
        assert_eq!(url.as_str(), "http://gateway.local/api/v1/jobs/J1/accept");
    }

    #[tokio::test]
    async fn test_poll_returns_job_with_auth() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/jobs/next"))
            .and(header("authorization", "Bearer secret"))
            .and(body_partial_json(serde_json::json!({"worker_id": "worker-1"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "job": job()
            })))
            .expect(1)
            .mount(&server)
            .await;

        let polled = client(&server).poll_next_job().await.unwrap();
        assert_eq!(polled.map(|j| j.id), Some(JobId::from_string("J1")));
    }

    #[tokio::test]
    async fn test_poll_no_content_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/jobs/next"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        assert!(client(&server).poll_next_job().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_poll_server_error_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/jobs/next"))
            .respond_with(ResponseTemplate::new(502))
            .expect(1)
            .mount(&server)
            .await;

        let err = client(&server).poll_next_job().await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_report_complete_retries_server_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/jobs/J1/complete"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/jobs/J1/complete"))
            .and(body_partial_json(serde_json::json!({
                "result": {"content_address": "QmOut"}
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let result = JobResult::new(ContentAddress::parse("QmOut").unwrap(), 1);
        client(&server)
            .report_complete(&JobId::from_string("J1"), &result)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_accept_conflict_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/jobs/J1/accept"))
            .respond_with(ResponseTemplate::new(409).set_body_string("already assigned"))
            .expect(1)
            .mount(&server)
            .await;

        let err = client(&server)
            .accept_job(&JobId::from_string("J1"))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Conflict(_)));
    }
}
