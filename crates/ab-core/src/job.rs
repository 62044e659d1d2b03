use serde::{Deserialize, Deserializer, Serialize};

use crate::Model;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Error,
    Saved,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Saved)
    }

    /// Status only ever moves forward: `pending -> processing -> completed | error`,
    /// and a completed image may later be saved by its owner.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Processing)
                | (Self::Processing, Self::Completed)
                | (Self::Processing, Self::Error)
                | (Self::Completed, Self::Saved)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Saved => "saved",
        }
    }
}

/// Output dimensions plus the optional offsets used when uncropping.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Geometry {
    #[serde(default = "Geometry::default_side", deserialize_with = "side_or_default")]
    pub width: u32,
    #[serde(default = "Geometry::default_side", deserialize_with = "side_or_default")]
    pub height: u32,
    #[serde(default, rename = "uncrop_offset_x", skip_serializing_if = "Option::is_none")]
    pub crop_x: Option<i32>,
    #[serde(default, rename = "uncrop_offset_y", skip_serializing_if = "Option::is_none")]
    pub crop_y: Option<i32>,
}

impl Geometry {
    fn default_side() -> u32 {
        256
    }
}

fn side_or_default<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
    Ok(Option::deserialize(deserializer)?.unwrap_or_else(Geometry::default_side))
}

impl Default for Geometry {
    fn default() -> Self {
        Self {
            width: Self::default_side(),
            height: Self::default_side(),
            crop_x: None,
            crop_y: None,
        }
    }
}

/// `null` on the wire reads as the type's default, same as a missing key.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// A unit of generation work as the backend reports it.
///
/// Fields the worker does not use are ignored on parse.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Job {
    pub id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub phrases: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub negative_phrases: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub label: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub iterations: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_iterations: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub model: Model,
    #[serde(default, deserialize_with = "null_as_default")]
    pub status: JobStatus,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub negative_score: Option<f64>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub nsfw: bool,
    #[serde(flatten)]
    pub geometry: Geometry,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoded_image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoded_mask: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoded_npy: Option<String>,
}

impl Job {
    /// Prompt text sent to the compute child; phrases are `|`-separated.
    pub fn prompt(&self) -> String {
        self.phrases.join("|")
    }

    pub fn negative_prompt(&self) -> Option<String> {
        if self.negative_phrases.is_empty() {
            None
        } else {
            Some(self.negative_phrases.join("|"))
        }
    }
}

/// Answer to a lease request.
///
/// `warmup` is set by the client from the `peek` flag it sent; the server
/// never reports it. A warm-up job is not owned and must never be submitted.
#[derive(Debug, Clone, PartialEq)]
pub enum LeaseResult {
    Empty,
    Leased { job: Job, warmup: bool },
}

impl LeaseResult {
    pub fn from_response(job: Option<Job>, peek: bool) -> Self {
        match job {
            Some(job) => Self::Leased { job, warmup: peek },
            None => Self::Empty,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    pub fn job(&self) -> Option<&Job> {
        match self {
            Self::Leased { job, .. } => Some(job),
            Self::Empty => None,
        }
    }

    pub fn is_warmup(&self) -> bool {
        matches!(self, Self::Leased { warmup: true, .. })
    }
}

/// Presigned upload targets for one `submit_result` call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UploadDestinationSet {
    pub image_url: String,
    pub thumbnail_url: String,
}

/// Presigned download target for an existing image. Other URLs the backend
/// sends (thumbnail, mask) are ignored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DownloadDestinationSet {
    pub image_url: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_moves_forward_only() {
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Processing));
        assert!(JobStatus::Processing.can_transition_to(JobStatus::Completed));
        assert!(JobStatus::Processing.can_transition_to(JobStatus::Error));
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Processing));
        assert!(!JobStatus::Error.can_transition_to(JobStatus::Completed));
        assert!(!JobStatus::Pending.can_transition_to(JobStatus::Completed));
    }

    #[test]
    fn test_partial_job_parses_and_ignores_extras() {
        let json = r#"{
            "id": "img-1",
            "phrases": ["a red cube"],
            "model": "stable_diffusion",
            "status": "pending",
            "width": 512,
            "uncrop_offset_x": 64,
            "created_by": "someone",
            "deleted_at": null
        }"#;
        let job: Job = serde_json::from_str(json).unwrap();
        assert_eq!(job.id, "img-1");
        assert_eq!(job.model, Model::StableDiffusion);
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.geometry.width, 512);
        assert_eq!(job.geometry.height, 256);
        assert_eq!(job.geometry.crop_x, Some(64));
        assert_eq!(job.score, None);
    }

    #[test]
    fn test_null_fields_read_as_defaults() {
        let json = r#"{
            "id": "img-2",
            "phrases": null,
            "negative_phrases": null,
            "label": null,
            "iterations": null,
            "model": null,
            "status": null,
            "nsfw": null,
            "width": null,
            "height": 384
        }"#;
        let job: Job = serde_json::from_str(json).unwrap();
        assert!(job.phrases.is_empty());
        assert_eq!(job.negative_prompt(), None);
        assert_eq!(job.label, "");
        assert_eq!(job.iterations, 0);
        assert_eq!(job.model, Model::default());
        assert_eq!(job.status, JobStatus::Pending);
        assert!(!job.nsfw);
        assert_eq!((job.geometry.width, job.geometry.height), (256, 384));
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Error.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
    }

    #[test]
    fn test_prompts() {
        let job = Job {
            id: "x".into(),
            phrases: vec!["a cat".into(), "oil painting".into()],
            ..Default::default()
        };
        assert_eq!(job.prompt(), "a cat|oil painting");
        assert_eq!(job.negative_prompt(), None);
    }

    #[test]
    fn test_lease_result_annotation() {
        let job = Job { id: "a".into(), ..Default::default() };
        assert!(LeaseResult::from_response(Some(job.clone()), true).is_warmup());
        assert!(!LeaseResult::from_response(Some(job), false).is_warmup());
        assert!(LeaseResult::from_response(None, true).is_empty());
    }
}
