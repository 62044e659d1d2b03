//! Result submission: binary payloads go straight to storage through presigned
//! URLs, metadata goes to the API.
//!
//! The metadata PATCH is the authoritative completion signal. It is always
//! sent, always last, and never skipped because a storage step failed.

use std::sync::Arc;

use ab_core::{Job, JobStatus, UploadDestinationSet};
use reqwest::{Method, StatusCode};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::error::TransportError;
use crate::transport::{expect_success, parse_json_opt, Auth, Body, Transport};

/// Fields sent with `PATCH /images/{id}`.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ResultMetadata {
    pub status: JobStatus,
    pub score: Option<f64>,
    pub negative_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nsfw: Option<bool>,
    #[serde(skip_serializing_if = "is_zero")]
    pub current_iterations: u32,
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

impl ResultMetadata {
    pub fn completed(score: f64, negative_score: Option<f64>) -> Self {
        Self {
            status: JobStatus::Completed,
            score: Some(score),
            negative_score,
            nsfw: Some(false),
            current_iterations: 0,
        }
    }

    pub fn failed() -> Self {
        Self {
            status: JobStatus::Error,
            score: None,
            negative_score: None,
            nsfw: None,
            current_iterations: 0,
        }
    }

    pub fn with_iterations(mut self, iterations: u32) -> Self {
        self.current_iterations = iterations;
        self
    }
}

pub struct UploadPipeline {
    transport: Arc<Transport>,
}

impl UploadPipeline {
    pub fn new(transport: Arc<Transport>) -> Self {
        Self { transport }
    }

    /// Push a job's result back to the backend.
    ///
    /// 1. If any payload is present, fetch fresh presigned URLs. On failure
    ///    the payloads are skipped.
    /// 2. PUT each present payload to its URL. Failures are logged only.
    /// 3. PATCH the metadata, exactly once.
    ///
    /// Returns the job as the backend reports it after the PATCH.
    pub async fn submit_result(
        &self,
        job_id: &str,
        image: Option<Vec<u8>>,
        thumbnail: Option<Vec<u8>>,
        metadata: ResultMetadata,
    ) -> Result<Option<Job>, TransportError> {
        if image.is_some() || thumbnail.is_some() {
            match self.upload_urls(job_id).await {
                Ok(urls) => {
                    if let Some(bytes) = image {
                        self.put_object(job_id, "image", &urls.image_url, bytes).await;
                    }
                    if let Some(bytes) = thumbnail {
                        self.put_object(job_id, "thumbnail", &urls.thumbnail_url, bytes).await;
                    }
                }
                Err(e) => {
                    error!(job_id, error = %e, "Failed to get upload urls, skipping image upload")
                }
            }
        }

        info!(
            job_id,
            status = metadata.status.as_str(),
            score = ?metadata.score,
            "Submitting result"
        );
        let body = serde_json::to_value(&metadata)
            .map_err(|e| TransportError::MalformedResponse(e.to_string()))?;
        let response = self
            .transport
            .send(&format!("/images/{job_id}"), Method::PATCH, Body::Json(body), Auth::Bearer)
            .await?;
        parse_json_opt(expect_success(response).await?).await
    }

    pub async fn upload_urls(&self, job_id: &str) -> Result<UploadDestinationSet, TransportError> {
        self.transport
            .send_json(&format!("/images/{job_id}/upload-urls"), Method::GET, Body::None)
            .await
    }

    /// Unauthenticated PNG upload to a presigned URL. Returns whether storage
    /// accepted it.
    async fn put_object(&self, job_id: &str, kind: &str, url: &str, bytes: Vec<u8>) -> bool {
        let size = bytes.len();
        match self.transport.send(url, Method::PUT, Body::png(bytes), Auth::None).await {
            Ok(response) if response.status().is_success() => {
                info!(job_id, kind, size, "Uploaded to storage");
                true
            }
            Ok(response) => {
                warn!(job_id, kind, status = %response.status(), "Storage rejected upload");
                false
            }
            Err(e) => {
                warn!(job_id, kind, error = %e, "Storage upload failed");
                false
            }
        }
    }

    /// Authenticated upload of a progress video; the backend answers 204.
    pub async fn upload_video(&self, job_id: &str, video: Vec<u8>) -> Result<bool, TransportError> {
        let body = Body::Raw {
            bytes: video,
            mime: "video/mp4".into(),
        };
        let response = self
            .transport
            .send(&format!("/images/{job_id}.mp4"), Method::PUT, body, Auth::Bearer)
            .await?;
        if response.status() != StatusCode::NO_CONTENT {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            warn!(job_id, %status, body = %text, "Error updating video data");
            return Ok(false);
        }
        Ok(true)
    }
}
