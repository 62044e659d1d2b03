use std::env;
use std::path::PathBuf;
use std::time::Duration;

use ab_core::Model;

use crate::compute::ComputeCommand;
use crate::error::{Result, WorkerError};
use crate::transport::{RetryPolicy, TransportConfig};

const DEFAULT_DEVICE: &str = "cuda:0";
const DEFAULT_COMPUTE_PROGRAM: &str = "python";
const DEFAULT_COMPUTE_ARGS: &str = "model_process.py --model {model} {device}";
const DEFAULT_IDLE_BACKOFF_MS: u64 = 1_000;

/// Everything the worker needs at startup, read from the environment.
///
/// A `.env` file in the working directory is loaded first when present.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub transport: TransportConfig,
    pub token: Option<String>,
    pub login_code: Option<String>,
    pub worker_id: String,
    pub device: String,
    pub models: Vec<Model>,
    pub compute: ComputeCommand,
    pub work_dir: PathBuf,
    pub idle_backoff: Duration,
    pub rank_timeout: Option<Duration>,
}

impl WorkerConfig {
    pub fn load() -> Result<Self> {
        match dotenvy::dotenv() {
            Ok(path) => tracing::debug!(path = %path.display(), "Loaded .env"),
            Err(e) if e.not_found() => {}
            Err(e) => return Err(WorkerError::Config(format!(".env: {e}"))),
        }

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a config from any key lookup; `load` uses the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let api_base = var("AIBRUSH_API_URL")
            .ok_or_else(|| WorkerError::Config("AIBRUSH_API_URL must be set".into()))?;

        let token = var("AIBRUSH_TOKEN");
        let login_code = var("AIBRUSH_LOGIN_CODE");
        if token.is_none() && login_code.is_none() {
            return Err(WorkerError::Config(
                "one of AIBRUSH_TOKEN or AIBRUSH_LOGIN_CODE must be set".into(),
            ));
        }

        let models = match var("AIBRUSH_MODELS") {
            Some(list) => list
                .split(',')
                .map(str::trim)
                .filter(|m| !m.is_empty())
                .map(|m| Model::from(m.to_string()))
                .collect(),
            None => Model::all().to_vec(),
        };
        if models.is_empty() {
            return Err(WorkerError::Config("AIBRUSH_MODELS lists no models".into()));
        }

        let compute_args =
            var("AIBRUSH_COMPUTE_ARGS").unwrap_or_else(|| DEFAULT_COMPUTE_ARGS.into());

        let mut retry = RetryPolicy::default();
        if let Some(ms) = parse_u64(&var, "AIBRUSH_RETRY_BACKOFF_MS")? {
            retry.initial_backoff = Duration::from_millis(ms);
        }

        Ok(Self {
            transport: TransportConfig {
                retry,
                ..TransportConfig::new(api_base)
            },
            token,
            login_code,
            worker_id: var("AIBRUSH_WORKER_ID").unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            device: var("AIBRUSH_DEVICE").unwrap_or_else(|| DEFAULT_DEVICE.into()),
            models,
            compute: ComputeCommand {
                program: var("AIBRUSH_COMPUTE_PROGRAM")
                    .unwrap_or_else(|| DEFAULT_COMPUTE_PROGRAM.into()),
                args: compute_args.split_whitespace().map(String::from).collect(),
            },
            work_dir: var("AIBRUSH_WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| env::temp_dir().join("ab-worker")),
            idle_backoff: Duration::from_millis(
                parse_u64(&var, "AIBRUSH_IDLE_BACKOFF_MS")?.unwrap_or(DEFAULT_IDLE_BACKOFF_MS),
            ),
            rank_timeout: parse_u64(&var, "AIBRUSH_RANK_TIMEOUT_SECS")?.map(Duration::from_secs),
        })
    }
}

fn parse_u64<F>(var: &F, key: &str) -> Result<Option<u64>>
where
    F: Fn(&str) -> Option<String>,
{
    var(key)
        .map(|raw| {
            raw.parse::<u64>()
                .map_err(|_| WorkerError::Config(format!("{key} must be a number, got {raw:?}")))
        })
        .transpose()
}
