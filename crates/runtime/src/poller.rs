use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use tagrelay_protocol::{SupervisorMessage, WriteResult};

use crate::backend::{AttemptError, BackendClient};
use crate::relay::Relay;
use crate::shutdown_signalled;

/// Inbound channel of the currently running worker.
pub type WorkerHandle = mpsc::UnboundedSender<SupervisorMessage>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// A command is already in flight.
    Busy,
    NoWorker,
    Idle,
    Armed { command_id: String },
    FetchFailed,
}

#[derive(Default)]
struct PollerState {
    active_command_id: Option<String>,
    worker: Option<WorkerHandle>,
}

/// Fetches remote write commands and hands them to the worker one at a time.
pub struct CommandPoller {
    backend: BackendClient,
    relay: Arc<Relay>,
    state: Mutex<PollerState>,
    /// Set while a tick is waiting on the pending-command listing.
    fetching: AtomicBool,
    /// Command results still on their way to the backend.
    reports: Mutex<JoinSet<()>>,
}

struct FetchGuard<'a>(&'a AtomicBool);

impl Drop for FetchGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl CommandPoller {
    pub fn new(backend: BackendClient, relay: Arc<Relay>) -> Self {
        Self {
            backend,
            relay,
            state: Mutex::new(PollerState::default()),
            fetching: AtomicBool::new(false),
            reports: Mutex::new(JoinSet::new()),
        }
    }

    pub async fn attach_worker(&self, handle: WorkerHandle) {
        self.state.lock().await.worker = Some(handle);
    }

    /// Forget the worker. A command it was working on is reported as failed.
    pub async fn detach_worker(&self, reason: &str) {
        let orphaned = {
            let mut state = self.state.lock().await;
            state.worker = None;
            state.active_command_id.take()
        };
        if let Some(command_id) = orphaned {
            warn!(command_id = %command_id, reason, "worker went away mid-command");
            let result = WriteResult::failure("", None, format!("worker exited: {reason}"));
            self.report(command_id, result).await;
        }
    }

    /// Send a command result in the background; [`Self::flush_reports`] waits for it.
    async fn report(&self, command_id: String, result: WriteResult) {
        let relay = Arc::clone(&self.relay);
        let mut reports = self.reports.lock().await;
        while reports.try_join_next().is_some() {}
        reports.spawn(async move {
            relay.send_command_result(&command_id, &result).await;
        });
    }

    /// Wait for every command result handed off so far.
    pub async fn flush_reports(&self) {
        let mut reports = std::mem::take(&mut *self.reports.lock().await);
        while let Some(joined) = reports.join_next().await {
            if let Err(err) = joined {
                warn!(error = %err, "command result task failed");
            }
        }
    }

    pub async fn active_command(&self) -> Option<String> {
        self.state.lock().await.active_command_id.clone()
    }

    pub async fn has_worker(&self) -> bool {
        self.state.lock().await.worker.is_some()
    }

    pub async fn tick(&self) -> TickOutcome {
        {
            let state = self.state.lock().await;
            if state.active_command_id.is_some() {
                return TickOutcome::Busy;
            }
            if state.worker.is_none() {
                return TickOutcome::NoWorker;
            }
            // Claimed under the lock so two ticks cannot arm two commands.
            if self.fetching.swap(true, Ordering::AcqRel) {
                return TickOutcome::Busy;
            }
        }
        let _guard = FetchGuard(&self.fetching);

        let commands = match self.backend.pending_commands().await {
            Ok(commands) => commands,
            Err(err @ AttemptError::Unreachable(_)) => {
                debug!(error = %err, "pending command poll failed");
                return TickOutcome::FetchFailed;
            }
            Err(err) => {
                warn!(error = %err, "pending command poll failed");
                return TickOutcome::FetchFailed;
            }
        };

        let Some(command) = commands.into_iter().next() else {
            return TickOutcome::Idle;
        };
        let mut state = self.state.lock().await;
        let Some(worker) = state.worker.as_ref() else {
            debug!(command_id = %command.id, "worker left during the poll; command left pending");
            return TickOutcome::NoWorker;
        };
        if worker.send(SupervisorMessage::WriteRequest { url: command.url.clone() }).is_err() {
            warn!(command_id = %command.id, "worker channel closed; command left pending");
            state.worker = None;
            return TickOutcome::NoWorker;
        }
        info!(command_id = %command.id, url = %command.url, "write command armed");
        state.active_command_id = Some(command.id.clone());
        TickOutcome::Armed { command_id: command.id }
    }

    /// Close out the active command with the worker's result. The slot is
    /// free on return; the report itself goes out in the background.
    pub async fn on_write_complete(&self, result: WriteResult) {
        let Some(command_id) = self.state.lock().await.active_command_id.take() else {
            debug!(uid = %result.uid, "write completed with no active command");
            return;
        };
        self.report(command_id, result).await;
    }

    pub async fn run(self: Arc<Self>, every: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick().await;
                }
                _ = shutdown_signalled(&mut shutdown) => break,
            }
        }
    }
}
