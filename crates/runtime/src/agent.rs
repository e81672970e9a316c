use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{Mutex, watch};
use tracing::info;

use tagrelay_config::AppConfig;
use tagrelay_queue::EventQueue;

use crate::backend::BackendClient;
use crate::poller::CommandPoller;
use crate::relay::{DrainReport, Relay};
use crate::retry::RetryPolicy;
use crate::supervisor::{RestartPolicy, Supervisor, SupervisorError, WorkerLauncher};

/// Open the queue named in `config` and build a relay around it.
pub fn build_relay(config: &AppConfig) -> Result<Arc<Relay>> {
    let queue = EventQueue::open(&config.queue.path)
        .with_context(|| format!("opening event queue at {}", config.queue.path))?;
    let backend = BackendClient::new(&config.backend.base_url, &config.backend.secret, config.http_timeout())?;
    Ok(Arc::new(Relay::new(
        backend,
        RetryPolicy::from(&config.relay),
        Arc::new(Mutex::new(queue)),
    )))
}

/// Run the whole agent until `shutdown` flips.
///
/// Returns the supervisor's verdict: `Ok` on a requested shutdown,
/// [`SupervisorError::RestartCeiling`] when the worker could not be kept up.
pub async fn run_agent(
    config: &AppConfig,
    launcher: WorkerLauncher,
    shutdown: watch::Receiver<bool>,
) -> Result<Result<(), SupervisorError>> {
    let relay = build_relay(config)?;
    let backend = BackendClient::new(&config.backend.base_url, &config.backend.secret, config.http_timeout())?;
    let poller = Arc::new(CommandPoller::new(backend, Arc::clone(&relay)));
    let queued = relay.queue_size().await;
    info!(backend = %config.backend.base_url, queued, "agent starting");

    let drain_loop = tokio::spawn(Arc::clone(&relay).run_drain_loop(config.drain_interval(), shutdown.clone()));
    let poll_loop = tokio::spawn(Arc::clone(&poller).run(config.poll_interval(), shutdown.clone()));

    let supervisor = Supervisor::new(
        launcher,
        Arc::clone(&relay),
        poller,
        RestartPolicy::from(&config.supervisor),
        config.shutdown_timeout(),
    );
    let outcome = supervisor.run(shutdown).await;

    drain_loop.abort();
    poll_loop.abort();
    let queued = relay.queue_size().await;
    info!(queued, "agent stopped");
    Ok(outcome)
}

/// One drain pass against the configured backend.
pub async fn drain_once(config: &AppConfig) -> Result<DrainReport> {
    let relay = build_relay(config)?;
    Ok(relay.drain().await.unwrap_or_default())
}
