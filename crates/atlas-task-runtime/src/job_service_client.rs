use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;

use crate::task_registry::TaskStatus;

/// Wire token the job service uses instead of an HTTP 404 when a status
/// query names a task it no longer tracks.
const STATUS_TOKEN_NOT_FOUND: &str = "not_found";

#[derive(Debug, Error)]
pub enum JobServiceError {
    /// The service no longer knows the task. This is the reconciliation
    /// signal: the local record must be pruned, not retried.
    #[error("job service does not know the task")]
    TaskUnknown,
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("job service returned non-success status {status}: {body}")]
    HttpStatus { status: u16, body: String },
    #[error("invalid job service response: {0}")]
    InvalidResponse(String),
}

impl JobServiceError {
    /// Returns true when the error means the task should be pruned locally.
    /// Every other variant is transient and retried on the next poll tick.
    pub fn is_task_unknown(&self) -> bool {
        matches!(self, Self::TaskUnknown)
    }
}

/// Successful job-start acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartedJob {
    pub task_id: String,
}

/// One authoritative status snapshot for a launched job. `logs` is always
/// the full current tail, never a delta.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStatusReport {
    pub status: TaskStatus,
    pub logs: Vec<String>,
}

#[async_trait]
/// Trait contract for the external job-execution service.
pub trait JobServiceApi: Send + Sync {
    /// Starts a job of kind `slug` with a job-specific parameter payload.
    async fn start_job(&self, slug: &str, params: Value) -> Result<StartedJob, JobServiceError>;

    /// Fetches the current status and full log tail for a launched job.
    async fn fetch_status(&self, task_id: &str) -> Result<JobStatusReport, JobServiceError>;

    /// Requests a stop. Acknowledgement only; the job keeps its own pace and
    /// the next successful poll is the only place "stopped" becomes true.
    async fn request_stop(&self, task_id: &str) -> Result<(), JobServiceError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Connection settings for [`HttpJobServiceClient`].
pub struct JobServiceConfig {
    pub api_base: String,
    pub request_timeout_ms: u64,
}

impl Default for JobServiceConfig {
    fn default() -> Self {
        Self {
            api_base: "http://localhost:8000".to_string(),
            request_timeout_ms: 10_000,
        }
    }
}

/// HTTP client for the job-execution service's run/status/stop endpoints.
#[derive(Debug, Clone)]
pub struct HttpJobServiceClient {
    client: reqwest::Client,
    config: JobServiceConfig,
}

#[derive(Debug, Deserialize)]
struct StartJobResponse {
    #[serde(default)]
    task_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JobStatusResponse {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    logs: Option<Vec<String>>,
}

impl HttpJobServiceClient {
    pub fn new(config: JobServiceConfig) -> Result<Self, JobServiceError> {
        if config.api_base.trim().is_empty() {
            return Err(JobServiceError::InvalidResponse(
                "job service api base cannot be empty".to_string(),
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(
                config.request_timeout_ms.max(1),
            ))
            .build()?;
        Ok(Self { client, config })
    }

    fn api_base(&self) -> &str {
        self.config.api_base.trim_end_matches('/')
    }

    fn run_url(&self) -> String {
        format!("{}/etl/run", self.api_base())
    }

    fn status_url(&self, task_id: &str) -> String {
        format!("{}/etl/status/{task_id}", self.api_base())
    }

    fn stop_url(&self, task_id: &str) -> String {
        format!("{}/etl/stop/{task_id}", self.api_base())
    }
}

#[async_trait]
impl JobServiceApi for HttpJobServiceClient {
    async fn start_job(&self, slug: &str, params: Value) -> Result<StartedJob, JobServiceError> {
        let response = self
            .client
            .post(self.run_url())
            .json(&json!({ "slug": slug, "params": params }))
            .send()
            .await?;
        let status = response.status();
        let raw = response.text().await?;
        if !status.is_success() {
            return Err(JobServiceError::HttpStatus {
                status: status.as_u16(),
                body: raw,
            });
        }
        let parsed: StartJobResponse = serde_json::from_str(&raw)
            .map_err(|error| JobServiceError::InvalidResponse(error.to_string()))?;
        let task_id = parsed
            .task_id
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| {
                JobServiceError::InvalidResponse("run response missing task_id".to_string())
            })?;
        Ok(StartedJob { task_id })
    }

    async fn fetch_status(&self, task_id: &str) -> Result<JobStatusReport, JobServiceError> {
        let response = self.client.get(self.status_url(task_id)).send().await?;
        let status = response.status();
        if status.as_u16() == 404 {
            return Err(JobServiceError::TaskUnknown);
        }
        let raw = response.text().await?;
        if !status.is_success() {
            return Err(JobServiceError::HttpStatus {
                status: status.as_u16(),
                body: raw,
            });
        }
        let parsed: JobStatusResponse = serde_json::from_str(&raw)
            .map_err(|error| JobServiceError::InvalidResponse(error.to_string()))?;
        let token = parsed.status.unwrap_or_default();
        if token.trim().eq_ignore_ascii_case(STATUS_TOKEN_NOT_FOUND) {
            return Err(JobServiceError::TaskUnknown);
        }
        let task_status = TaskStatus::parse(token.as_str()).ok_or_else(|| {
            JobServiceError::InvalidResponse(format!("unrecognized status token '{token}'"))
        })?;
        Ok(JobStatusReport {
            status: task_status,
            logs: parsed.logs.unwrap_or_default(),
        })
    }

    async fn request_stop(&self, task_id: &str) -> Result<(), JobServiceError> {
        let response = self.client.post(self.stop_url(task_id)).send().await?;
        let status = response.status();
        if status.as_u16() == 404 {
            return Err(JobServiceError::TaskUnknown);
        }
        if !status.is_success() {
            let body = response.text().await?;
            return Err(JobServiceError::HttpStatus {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}
