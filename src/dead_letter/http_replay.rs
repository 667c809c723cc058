//! HTTP replay of dead-lettered webhook and API calls

use super::models::DeadLetterJob;
use super::strategies::JobReplayer;
use crate::error::{ApplicationError, ErrorCategory, ErrorCode, ResilienceError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

/// Request description stored as a job's `job_data`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayRequest {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<serde_json::Value>,
}

fn default_method() -> String {
    "POST".to_string()
}

/// Replays jobs by re-sending their recorded HTTP request
pub struct HttpReplayer {
    client: reqwest::Client,
}

impl HttpReplayer {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl JobReplayer for HttpReplayer {
    async fn replay(&self, job: &DeadLetterJob) -> Result<()> {
        let request: ReplayRequest = serde_json::from_value(job.job_data.clone()).map_err(|e| {
            ResilienceError::validation(format!("job {} has no replayable request: {e}", job.id))
        })?;

        let method = reqwest::Method::from_bytes(request.method.to_uppercase().as_bytes())
            .map_err(|_| ResilienceError::validation(format!("invalid HTTP method '{}'", request.method)))?;

        debug!(job_id = %job.id, %method, url = %request.url, "Replaying HTTP request");

        let mut builder = self.client.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        let status = response.status();
        if status.is_success() {
            info!(job_id = %job.id, status = status.as_u16(), "HTTP replay succeeded");
            return Ok(());
        }

        let code = if status.as_u16() == 429 {
            ErrorCode::RateLimitExceeded
        } else if status.as_u16() == 503 {
            ErrorCode::ServiceUnavailable
        } else {
            ErrorCode::ExternalServiceError
        };
        Err(ApplicationError::new(code, format!("replay of job {} returned {status}", job.id))
            .with_category(ErrorCategory::ExternalService)
            .with_status_code(status.as_u16())
            .retryable(status.is_server_error() || status.as_u16() == 429)
            .into())
    }
}
