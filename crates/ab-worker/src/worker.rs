//! The worker loop: lease, compute, upload, report, repeat.
//!
//! One job is handled end to end before the next lease. A cycle with nothing
//! to do sleeps for the idle backoff instead of spinning. Parallelism comes
//! from running more worker processes against the same backend.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use ab_core::protocol::RankRequest;
use ab_core::{Job, JobStatus, LeaseResult, Model};
use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::compute::{Launcher, Ranker};
use crate::error::{ComputeError, Result, WorkerError};
use crate::lease::{JobLeaseClient, LeaseFilters, WorkerSettings};
use crate::metrics::{Metric, MetricsBuffer};
use crate::thumbnail::{make_thumbnail, THUMBNAIL_SIDE};
use crate::upload::{ResultMetadata, UploadPipeline};

#[derive(Debug, Clone)]
pub struct LoopSettings {
    /// Models this worker is able to serve
    pub models: Vec<Model>,
    /// Scratch space for images exchanged with the compute child
    pub work_dir: PathBuf,
    pub idle_backoff: Duration,
}

/// What one pass through the loop did.
#[derive(Debug, Clone, PartialEq)]
pub enum Cycle {
    Processed { job_id: String, status: JobStatus },
    WarmedUp(Model),
    Idle,
}

struct ComputeOutcome {
    score: f64,
    negative_score: Option<f64>,
    image: Option<Vec<u8>>,
}

pub struct WorkerLoop {
    lease: JobLeaseClient,
    uploader: UploadPipeline,
    launcher: Box<dyn Launcher>,
    settings: LoopSettings,
    active: Option<Box<dyn Ranker>>,
    failed: HashSet<Model>,
    metrics: MetricsBuffer,
}

impl WorkerLoop {
    pub fn new(
        lease: JobLeaseClient,
        uploader: UploadPipeline,
        launcher: Box<dyn Launcher>,
        settings: LoopSettings,
    ) -> Self {
        Self {
            lease,
            uploader,
            launcher,
            settings,
            active: None,
            failed: HashSet::new(),
            metrics: MetricsBuffer::default(),
        }
    }

    pub fn active_model(&self) -> Option<&Model> {
        self.active.as_ref().map(|ranker| ranker.model())
    }

    pub fn failed_models(&self) -> &HashSet<Model> {
        &self.failed
    }

    /// Configured models whose backend has not been lost.
    pub fn usable_models(&self) -> Vec<Model> {
        self.settings
            .models
            .iter()
            .filter(|m| !self.failed.contains(*m))
            .cloned()
            .collect()
    }

    /// Preload the backend named in the server-side worker settings.
    pub async fn apply_settings(&mut self, settings: &WorkerSettings) -> Result<()> {
        let Some(model) = &settings.model else {
            return Ok(());
        };
        if !self.settings.models.contains(model) {
            warn!(%model, "Worker settings name a model this worker is not configured for");
            return Ok(());
        }
        self.warm_up(model.clone()).await;
        Ok(())
    }

    /// Make `model` the loaded backend, shutting down the previous one.
    /// Returns whether the backend is now loaded.
    pub async fn warm_up(&mut self, model: Model) -> bool {
        if self.active_model() == Some(&model) {
            return true;
        }
        if let Some(mut previous) = self.active.take() {
            info!(from = %previous.model(), to = %model, "Swapping compute backend");
            previous.shutdown().await;
        }

        match self.launcher.launch(&model).await {
            Ok(ranker) => {
                info!(%model, "Compute backend loaded");
                self.active = Some(ranker);
                true
            }
            Err(e) => {
                error!(%model, error = %e, "Failed to launch compute backend");
                self.failed.insert(model);
                false
            }
        }
    }

    /// Run cycles until `shutdown` turns true or no backend is usable.
    ///
    /// The signal is checked between cycles; a compute call in progress is
    /// never interrupted.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        tokio::fs::create_dir_all(&self.settings.work_dir).await?;
        info!(models = ?self.settings.models, "Worker loop started");

        let result = loop {
            if *shutdown.borrow() {
                info!("Shutdown requested");
                break Ok(());
            }
            match self.run_once().await {
                Ok(Cycle::Idle) => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.settings.idle_backoff) => {}
                        Ok(()) = shutdown.changed() => {}
                    }
                }
                Ok(cycle) => debug!(?cycle, "Cycle finished"),
                Err(e) => break Err(e),
            }
        };

        self.shutdown().await;
        result
    }

    /// One cycle, including the idle sleep when nothing happened.
    pub async fn tick(&mut self) -> Result<Cycle> {
        let cycle = self.run_once().await?;
        if cycle == Cycle::Idle {
            tokio::time::sleep(self.settings.idle_backoff).await;
        }
        Ok(cycle)
    }

    /// One cycle without the idle sleep: lease or warm up, then report.
    pub async fn run_once(&mut self) -> Result<Cycle> {
        if self.usable_models().is_empty() {
            return Err(WorkerError::NoComputeBackends);
        }

        let cycle = self.step().await;

        self.lease.heartbeat().await;
        self.lease.add_metrics(&self.metrics.take()).await;

        if self.usable_models().is_empty() {
            return Err(WorkerError::NoComputeBackends);
        }
        Ok(cycle)
    }

    pub async fn shutdown(&mut self) {
        if let Some(mut ranker) = self.active.take() {
            ranker.shutdown().await;
        }
    }

    async fn step(&mut self) -> Cycle {
        if let Some(model) = self.active_model().cloned() {
            match self.lease.lease_or_peek(&LeaseFilters::pending_for(vec![model]), false).await {
                Ok(LeaseResult::Leased { job, warmup: false }) => return self.process(job).await,
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Lease response unusable, idling"),
            }
        }

        // Nothing for the loaded backend: look at demand for the others
        // without taking it away from workers that already have them loaded.
        let active = self.active_model().cloned();
        let candidates: Vec<Model> = self
            .usable_models()
            .into_iter()
            .filter(|m| Some(m) != active.as_ref())
            .collect();
        if candidates.is_empty() {
            return Cycle::Idle;
        }

        match self.lease.lease_or_peek(&LeaseFilters::pending_for(candidates.clone()), true).await {
            Ok(LeaseResult::Leased { job, .. }) if candidates.contains(&job.model) => {
                debug!(job_id = %job.id, model = %job.model, "Peeked job, warming up");
                if self.warm_up(job.model.clone()).await {
                    Cycle::WarmedUp(job.model)
                } else {
                    Cycle::Idle
                }
            }
            Ok(LeaseResult::Leased { job, .. }) => {
                warn!(
                    job_id = %job.id,
                    model = %job.model,
                    "Peek returned a job for a model outside the filter"
                );
                Cycle::Idle
            }
            Ok(LeaseResult::Empty) => Cycle::Idle,
            Err(e) => {
                warn!(error = %e, "Peek response unusable, idling");
                Cycle::Idle
            }
        }
    }

    async fn process(&mut self, job: Job) -> Cycle {
        let started = Instant::now();
        let model = job.model.clone();
        info!(job_id = %job.id, %model, prompt = %job.prompt(), "Processing job");

        if let Err(e) = tokio::fs::create_dir_all(&self.settings.work_dir).await {
            let work_dir = self.settings.work_dir.display();
            warn!(%work_dir, error = %e, "Could not create work dir");
        }
        let init_image = self.fetch_init_image(&job).await;
        let work_dir = &self.settings.work_dir;
        let outcome = match self.active.as_mut() {
            Some(ranker) => compute(ranker.as_mut(), &job, work_dir, init_image.as_deref()).await,
            None => Err(ComputeError::Terminated(model.id().to_string())),
        };

        let (metadata, image, thumbnail) = match outcome {
            Ok(outcome) => {
                let thumbnail = outcome.image.as_deref().and_then(|png| {
                    match make_thumbnail(png, THUMBNAIL_SIDE) {
                        Ok(thumb) => Some(thumb),
                        Err(e) => {
                            warn!(job_id = %job.id, error = %e, "Could not build thumbnail");
                            None
                        }
                    }
                });
                let metadata = ResultMetadata::completed(outcome.score, outcome.negative_score)
                    .with_iterations(job.iterations);
                (metadata, outcome.image, thumbnail)
            }
            Err(e) => {
                if e.is_fatal() {
                    error!(
                        job_id = %job.id,
                        %model,
                        error = %e,
                        "Compute backend lost, not dispatching to it again"
                    );
                    self.failed.insert(model.clone());
                    if let Some(mut ranker) = self.active.take() {
                        ranker.shutdown().await;
                    }
                } else {
                    warn!(job_id = %job.id, %model, error = %e, "Compute failed for job");
                }
                (ResultMetadata::failed(), None, None)
            }
        };

        if let Some(path) = init_image {
            let _ = tokio::fs::remove_file(path).await;
        }

        let status = metadata.status;
        match self.uploader.submit_result(&job.id, image, thumbnail, metadata).await {
            Ok(Some(updated)) if !updated.status.is_terminal() => {
                let reported = updated.status.as_str();
                warn!(job_id = %job.id, status = reported, "Backend did not close the job");
            }
            Ok(_) => {}
            Err(e) => error!(job_id = %job.id, error = %e, "Result submission failed"),
        }

        let counter = match status {
            JobStatus::Completed => "worker.jobs.completed",
            _ => "worker.jobs.failed",
        };
        self.metrics.push(Metric::count(counter, 1.0).with_attribute("model", model.id()));
        self.metrics.push(
            Metric::gauge("worker.job.duration_ms", started.elapsed().as_millis() as f64)
                .with_attribute("model", model.id()),
        );

        Cycle::Processed { job_id: job.id, status }
    }

    /// Jobs derived from another image get that image as their starting point.
    async fn fetch_init_image(&self, job: &Job) -> Option<PathBuf> {
        let parent = job.parent.as_deref()?;
        let urls = match self.lease.download_urls(parent).await {
            Ok(urls) => urls,
            Err(e) => {
                warn!(job_id = %job.id, parent, error = %e, "Could not get parent download urls");
                return None;
            }
        };
        let bytes = match self.lease.fetch_bytes(&urls.image_url).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(e) => {
                warn!(job_id = %job.id, parent, error = %e, "Could not download parent image");
                return None;
            }
        };

        let path = self.settings.work_dir.join(format!("{}.init.png", job.id));
        match tokio::fs::write(&path, bytes).await {
            Ok(()) => Some(path),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Could not write init image");
                None
            }
        }
    }
}

async fn compute(
    ranker: &mut dyn Ranker,
    job: &Job,
    work_dir: &Path,
    init_image: Option<&Path>,
) -> std::result::Result<ComputeOutcome, ComputeError> {
    let output_path = work_dir.join(format!("{}.png", job.id));
    let _ = tokio::fs::remove_file(&output_path).await;

    let mut request = RankRequest {
        prompt: job.prompt(),
        negative_prompt: job.negative_prompt(),
        output_path: Some(output_path.display().to_string()),
        ..Default::default()
    }
    .with_param("job_id", job.id.as_str())
    .with_param("model", job.model.id())
    .with_param("label", job.label.as_str())
    .with_param("iterations", job.iterations)
    .with_param("width", job.geometry.width)
    .with_param("height", job.geometry.height);
    if let Some(init) = init_image {
        request = request.with_param("init_image", init.display().to_string());
    }
    if let (Some(x), Some(y)) = (job.geometry.crop_x, job.geometry.crop_y) {
        request = request.with_param("uncrop_offset", json!([x, y]));
    }

    let score = ranker.rank(&request).await?;
    let image = tokio::fs::read(&output_path).await.ok();

    // The image stays on disk while it is ranked against the negative prompt.
    let negative_score = match (job.negative_prompt(), &image) {
        (Some(negative), Some(_)) => {
            let mut negative_request =
                RankRequest::new(negative).with_param("job_id", job.id.as_str());
            negative_request.image_path = Some(output_path.display().to_string());
            Some(ranker.rank(&negative_request).await)
        }
        _ => None,
    };
    let _ = tokio::fs::remove_file(&output_path).await;

    Ok(ComputeOutcome {
        score,
        negative_score: negative_score.transpose()?,
        image,
    })
}
