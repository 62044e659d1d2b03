pub mod error;
pub mod job;
pub mod protocol;
mod model_types;

pub use job::{DownloadDestinationSet, Geometry, Job, JobStatus, LeaseResult, UploadDestinationSet};
pub use model_types::Model;
