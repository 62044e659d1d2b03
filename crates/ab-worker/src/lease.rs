//! Job-lease protocol and the other small worker-facing endpoints.

use std::sync::Arc;

use ab_core::{DownloadDestinationSet, Job, JobStatus, LeaseResult, Model};
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::metrics::Metric;
use crate::transport::{expect_success, parse_json_opt, Auth, Body, Transport};

/// Server-side matching criteria; passed through as given.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct LeaseFilters {
    pub status: Option<JobStatus>,
    pub include_models: Option<Vec<Model>>,
    pub exclude_models: Option<Vec<Model>>,
}

impl LeaseFilters {
    /// Pending jobs for any of `models`.
    pub fn pending_for(models: Vec<Model>) -> Self {
        Self {
            status: Some(JobStatus::Pending),
            include_models: Some(models),
            exclude_models: None,
        }
    }
}

#[derive(Serialize)]
struct ProcessImageRequest<'a> {
    #[serde(flatten)]
    filters: &'a LeaseFilters,
    peek: bool,
}

/// Per-worker settings managed from the admin console.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct WorkerSettings {
    #[serde(default)]
    pub model: Option<Model>,
    #[serde(default)]
    pub pool_assignment: Option<String>,
}

pub struct JobLeaseClient {
    transport: Arc<Transport>,
}

impl JobLeaseClient {
    pub fn new(transport: Arc<Transport>) -> Self {
        Self { transport }
    }

    /// Ask for the next matching job.
    ///
    /// With `peek = false` the server hands the job out and marks it
    /// `processing`. With `peek = true` the job is only shown, so a worker can
    /// warm up the right backend without taking it from anyone else.
    ///
    /// An unreachable backend or an HTTP error is an idle cycle, not an error.
    /// Only a response that cannot be parsed is returned as `Err`.
    pub async fn lease_or_peek(
        &self,
        filters: &LeaseFilters,
        peek: bool,
    ) -> Result<LeaseResult, TransportError> {
        let body = serde_json::to_value(ProcessImageRequest { filters, peek })
            .map_err(|e| TransportError::MalformedResponse(e.to_string()))?;

        let request = self
            .transport
            .send("/process-image", Method::PUT, Body::Json(body), Auth::Bearer);
        let response = match request.await {
            Ok(response) => response,
            Err(e) => {
                warn!(peek, error = %e, "Lease request failed, treating as idle");
                return Ok(LeaseResult::Empty);
            }
        };

        let response = match expect_success(response).await {
            Ok(response) => response,
            Err(e) => {
                warn!(peek, error = %e, "Lease request rejected, treating as idle");
                return Ok(LeaseResult::Empty);
            }
        };

        let job: Option<Job> = parse_json_opt(response).await?;
        let result = LeaseResult::from_response(job, peek);
        if let Some(job) = result.job() {
            debug!(job_id = %job.id, model = %job.model, peek, "Lease returned a job");
        }
        Ok(result)
    }

    /// Report liveness. Failures are logged and otherwise ignored.
    pub async fn heartbeat(&self) {
        match self.transport.send("/worker-ping", Method::POST, Body::None, Auth::Bearer).await {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => warn!(status = %response.status(), "Heartbeat rejected"),
            Err(e) => warn!(error = %e, "Heartbeat failed"),
        }
    }

    pub async fn worker_config(&self, worker_id: &str) -> Result<WorkerSettings, TransportError> {
        self.transport
            .send_json(&format!("/workers/{worker_id}/config"), Method::GET, Body::None)
            .await
    }

    /// Submit a batch of metrics. Failures are logged and the batch dropped.
    pub async fn add_metrics(&self, metrics: &[Metric]) {
        if metrics.is_empty() {
            return;
        }
        let body = Body::Json(json!({ "metrics": metrics }));
        match self.transport.send("/metrics", Method::POST, body, Auth::Bearer).await {
            Ok(response) if response.status().is_success() => {
                debug!(count = metrics.len(), "Metrics submitted");
            }
            Ok(response) => warn!(status = %response.status(), "Metrics rejected"),
            Err(e) => warn!(error = %e, "Metrics submission failed"),
        }
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Option<Job>, TransportError> {
        let response = self
            .transport
            .send(&format!("/images/{job_id}"), Method::GET, Body::None, Auth::Bearer)
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        parse_json_opt(expect_success(response).await?).await
    }

    pub async fn download_urls(
        &self,
        job_id: &str,
    ) -> Result<DownloadDestinationSet, TransportError> {
        self.transport
            .send_json(&format!("/images/{job_id}/download-urls"), Method::GET, Body::None)
            .await
    }

    /// Unauthenticated GET of a presigned URL. Anything but 200 is `None`.
    pub async fn fetch_bytes(&self, url: &str) -> Result<Option<Vec<u8>>, TransportError> {
        let response = self.transport.send(url, Method::GET, Body::None, Auth::None).await?;
        if response.status() != StatusCode::OK {
            info!(status = %response.status(), "Presigned download returned no data");
            return Ok(None);
        }
        let bytes = response.bytes().await.map_err(|e| TransportError::Unavailable {
            attempts: 1,
            last_error: e.to_string(),
        })?;
        Ok(Some(bytes.to_vec()))
    }
}
