//! The agent's main process: relay, command poller and worker supervisor.

mod agent;
pub mod backend;
pub mod poller;
pub mod relay;
pub mod retry;
pub mod supervisor;

#[cfg(test)]
mod testing;

use tokio::sync::watch;

pub use agent::{build_relay, drain_once, run_agent};
pub use backend::{AttemptError, BackendClient};
pub use poller::{CommandPoller, TickOutcome};
pub use relay::{Delivery, DeliveryError, DrainReport, Relay};
pub use retry::RetryPolicy;
pub use supervisor::{Supervisor, SupervisorError, WorkerLauncher};

/// Resolves once `shutdown` reads `true`. A dropped sender never resolves.
pub(crate) async fn shutdown_signalled(shutdown: &mut watch::Receiver<bool>) {
    let closed = shutdown.wait_for(|stop| *stop).await.is_err();
    if closed {
        std::future::pending::<()>().await;
    }
}
