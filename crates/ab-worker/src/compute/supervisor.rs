//! Supervisor for one compute child process.
//!
//! The child reads one JSON request per line on stdin and answers on stdout
//! with diagnostic chatter followed by a single `RESULT:<float>` or
//! `EXCEPTION` line. Its stderr is inherited so its logs land next to ours.
//!
//! A child that exits, closes its pipes or times out is never restarted:
//! the supervisor moves to [`SupervisorState::Terminated`] and every later
//! call fails.

use std::process::Stdio;
use std::time::Duration;

use ab_core::Model;
use ab_core::protocol::{self, Frame, RankRequest};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, error, info, warn};

use super::{ComputeCommand, Ranker};
use crate::error::ComputeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    NotStarted,
    Running,
    /// At least one call has completed
    Ready,
    Terminated,
}

pub struct ComputeSupervisor {
    model: Model,
    device: String,
    command: ComputeCommand,
    rank_timeout: Option<Duration>,
    state: SupervisorState,
    process: Option<Child>,
    stdin: Option<ChildStdin>,
    stdout: Option<BufReader<ChildStdout>>,
}

impl ComputeSupervisor {
    pub fn new(model: Model, device: impl Into<String>, command: ComputeCommand) -> Self {
        Self {
            model,
            device: device.into(),
            command,
            rank_timeout: None,
            state: SupervisorState::NotStarted,
            process: None,
            stdin: None,
            stdout: None,
        }
    }

    /// Upper bound for a single call; expiry terminates the child.
    pub fn with_rank_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.rank_timeout = timeout;
        self
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(Child::id)
    }

    /// Spawn the child process. Must be called from within a tokio runtime.
    pub fn start(&mut self) -> Result<(), ComputeError> {
        match self.state {
            SupervisorState::NotStarted => {}
            SupervisorState::Terminated => {
                return Err(ComputeError::Terminated(self.model.id().to_string()));
            }
            SupervisorState::Running | SupervisorState::Ready => return Ok(()),
        }

        let args = self.command.resolve_args(&self.model, &self.device);
        info!(
            model = %self.model,
            device = %self.device,
            program = %self.command.program,
            ?args,
            "Starting compute process"
        );

        let mut child = Command::new(&self.command.program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                self.state = SupervisorState::Terminated;
                ComputeError::Spawn(e)
            })?;

        self.stdin = child.stdin.take();
        self.stdout = child.stdout.take().map(BufReader::new);
        info!(pid = ?child.id(), model = %self.model, "Compute process spawned");

        self.process = Some(child);
        self.state = SupervisorState::Running;
        Ok(())
    }

    /// Send one request and wait for its terminal line.
    ///
    /// Takes `&mut self`: the pipe has no request ids, so only one call may be
    /// in flight.
    pub async fn rank(&mut self, request: &RankRequest) -> Result<f64, ComputeError> {
        match self.state {
            SupervisorState::NotStarted => self.start()?,
            SupervisorState::Terminated => {
                return Err(ComputeError::Terminated(self.model.id().to_string()));
            }
            SupervisorState::Running | SupervisorState::Ready => {}
        }

        let result = match self.rank_timeout {
            Some(limit) => match tokio::time::timeout(limit, self.exchange(request)).await {
                Ok(result) => result,
                Err(_) => Err(ComputeError::Timeout(limit)),
            },
            None => self.exchange(request).await,
        };

        match &result {
            Ok(score) => {
                debug!(model = %self.model, score, "Compute call finished");
                self.state = SupervisorState::Ready;
            }
            Err(e) if e.is_fatal() => {
                error!(model = %self.model, error = %e, "Compute process lost");
                self.terminate().await;
            }
            Err(e) => warn!(model = %self.model, error = %e, "Compute call failed"),
        }
        result
    }

    async fn exchange(&mut self, request: &RankRequest) -> Result<f64, ComputeError> {
        let line = protocol::encode_request(request)?;

        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| ComputeError::Crashed("stdin is closed".into()))?;
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| ComputeError::Crashed(format!("write to compute process failed: {e}")))?;
        stdin
            .flush()
            .await
            .map_err(|e| ComputeError::Crashed(format!("flush to compute process failed: {e}")))?;

        // Lines are raw bytes: progress bars and stray output need not be UTF-8.
        let mut buf = Vec::new();
        loop {
            buf.clear();
            let read = match self.stdout.as_mut() {
                Some(out) => out.read_until(b'\n', &mut buf).await?,
                None => 0,
            };
            if read == 0 {
                return Err(ComputeError::Crashed(self.exit_description()));
            }

            let line = String::from_utf8_lossy(&buf);
            match protocol::decode_line(&line)? {
                Frame::Result(score) => return Ok(score),
                Frame::Exception => return Err(ComputeError::Exception),
                Frame::Diagnostic(text) => debug!(model = %self.model, "{text}"),
            }
        }
    }

    fn exit_description(&mut self) -> String {
        match self.process.as_mut().map(Child::try_wait) {
            Some(Ok(Some(status))) => status.to_string(),
            _ => "stdout closed".to_string(),
        }
    }

    async fn terminate(&mut self) {
        self.stdin = None;
        self.stdout = None;
        if let Some(mut child) = self.process.take() {
            if let Err(e) = child.kill().await {
                warn!(model = %self.model, error = %e, "Failed to kill compute process");
            }
        }
        self.state = SupervisorState::Terminated;
    }

    /// Kill the child and wait for it to exit. There is no graceful handshake.
    pub async fn shutdown(&mut self) {
        if self.process.is_some() {
            info!(model = %self.model, pid = ?self.pid(), "Stopping compute process");
        }
        self.terminate().await;
    }
}

#[async_trait]
impl Ranker for ComputeSupervisor {
    fn model(&self) -> &Model {
        &self.model
    }

    async fn rank(&mut self, request: &RankRequest) -> Result<f64, ComputeError> {
        ComputeSupervisor::rank(self, request).await
    }

    async fn shutdown(&mut self) {
        ComputeSupervisor::shutdown(self).await
    }
}

impl Drop for ComputeSupervisor {
    fn drop(&mut self) {
        // Not awaited: Drop cannot block.
        if let Some(child) = self.process.as_mut() {
            debug!(model = %self.model, pid = ?child.id(), "Dropping compute supervisor");
            let _ = child.start_kill();
        }
    }
}
