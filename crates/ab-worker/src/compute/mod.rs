//! Compute backends: long-lived child processes that own a GPU context.
//!
//! - [`ComputeSupervisor`]: spawns one child per model/device and speaks the
//!   line protocol from [`ab_core::protocol`] with it
//! - [`Ranker`] / [`Launcher`]: the seams the worker loop depends on, so it
//!   can be driven without real processes

mod supervisor;

use std::time::Duration;

use ab_core::Model;
use ab_core::protocol::RankRequest;
use async_trait::async_trait;

use crate::error::ComputeError;

pub use supervisor::{ComputeSupervisor, SupervisorState};

/// Program and argument template for a compute child.
///
/// `{model}` and `{device}` in the arguments are replaced with the model tag
/// and device id. Without a `{device}` placeholder the device is appended as
/// the last argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputeCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl ComputeCommand {
    pub fn new(
        program: impl Into<String>,
        args: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    pub fn resolve_args(&self, model: &Model, device: &str) -> Vec<String> {
        let mut has_device = false;
        let mut args: Vec<String> = self
            .args
            .iter()
            .map(|arg| {
                has_device |= arg.contains("{device}");
                arg.replace("{model}", model.id()).replace("{device}", device)
            })
            .collect();
        if !has_device {
            args.push(device.to_string());
        }
        args
    }
}

/// Something that turns a request into a score, one call at a time.
#[async_trait]
pub trait Ranker: Send {
    fn model(&self) -> &Model;

    async fn rank(&mut self, request: &RankRequest) -> Result<f64, ComputeError>;

    /// Tear the backend down. Further `rank` calls fail.
    async fn shutdown(&mut self);
}

/// Starts rankers for a model on this worker's device.
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(&self, model: &Model) -> Result<Box<dyn Ranker>, ComputeError>;
}

/// Launches [`ComputeSupervisor`] children from a command template.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    command: ComputeCommand,
    device: String,
    rank_timeout: Option<Duration>,
}

impl ProcessLauncher {
    pub fn new(command: ComputeCommand, device: impl Into<String>) -> Self {
        Self {
            command,
            device: device.into(),
            rank_timeout: None,
        }
    }

    pub fn with_rank_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.rank_timeout = timeout;
        self
    }
}

#[async_trait]
impl Launcher for ProcessLauncher {
    async fn launch(&self, model: &Model) -> Result<Box<dyn Ranker>, ComputeError> {
        let mut supervisor =
            ComputeSupervisor::new(model.clone(), self.device.clone(), self.command.clone())
                .with_rank_timeout(self.rank_timeout);
        supervisor.start()?;
        Ok(Box::new(supervisor))
    }
}
