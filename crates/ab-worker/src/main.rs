use std::sync::Arc;

use ab_worker::compute::ProcessLauncher;
use ab_worker::config::WorkerConfig;
use ab_worker::lease::JobLeaseClient;
use ab_worker::session::Session;
use ab_worker::transport::Transport;
use ab_worker::upload::UploadPipeline;
use ab_worker::{LoopSettings, WorkerLoop};
use tokio::sync::watch;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let config = WorkerConfig::load()?;
    info!(
        worker_id = %config.worker_id,
        device = %config.device,
        api = %config.transport.api_base,
        "Starting AIBrush worker"
    );

    let session = Arc::new(Session::new(config.token.clone(), config.login_code.clone()));
    let transport = Arc::new(Transport::new(config.transport.clone(), session));
    transport.ensure_authenticated().await?;

    let lease = JobLeaseClient::new(transport.clone());
    let settings = match lease.worker_config(&config.worker_id).await {
        Ok(settings) => Some(settings),
        Err(e) => {
            warn!(error = %e, "Could not fetch worker settings, using local configuration");
            None
        }
    };

    let launcher = ProcessLauncher::new(config.compute.clone(), config.device.clone())
        .with_rank_timeout(config.rank_timeout);
    let mut worker = WorkerLoop::new(
        lease,
        UploadPipeline::new(transport),
        Box::new(launcher),
        LoopSettings {
            models: config.models.clone(),
            work_dir: config.work_dir.clone(),
            idle_backoff: config.idle_backoff,
        },
    );
    if let Some(settings) = settings {
        worker.apply_settings(&settings).await?;
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received ctrl-c, finishing current cycle");
            let _ = shutdown_tx.send(true);
        }
    });

    worker.run(shutdown_rx).await?;
    info!("Worker stopped");
    Ok(())
}
