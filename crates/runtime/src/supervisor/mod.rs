//! Keeps one hardware worker process alive and routes its messages.
//!
//! The worker speaks newline-delimited JSON on stdout and listens on stdin.
//! Everything it reports becomes an [`Event`] handed to a single forwarder
//! task, so events reach the relay in the order the worker produced them.

mod launcher;
mod restart;

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use tagrelay_protocol::{Event, SupervisorMessage, WorkerMessage, decode_line, encode_line};

use crate::poller::{CommandPoller, WorkerHandle};
use crate::relay::Relay;
use crate::shutdown_signalled;

pub use launcher::WorkerLauncher;
pub use restart::{RestartDecision, RestartPolicy, RestartTracker};

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("worker crashed {0} times in a row; giving up")]
    RestartCeiling(u32),
}

enum WorkerExit {
    Crashed(String),
    Shutdown,
}

pub struct Supervisor {
    launcher: WorkerLauncher,
    relay: Arc<Relay>,
    poller: Arc<CommandPoller>,
    policy: RestartPolicy,
    shutdown_timeout: Duration,
}

impl Supervisor {
    pub fn new(
        launcher: WorkerLauncher,
        relay: Arc<Relay>,
        poller: Arc<CommandPoller>,
        policy: RestartPolicy,
        shutdown_timeout: Duration,
    ) -> Self {
        Self {
            launcher,
            relay,
            poller,
            policy,
            shutdown_timeout,
        }
    }

    /// Supervise workers until `shutdown` flips or the restart ceiling is hit.
    /// Either way command results and pending events are flushed and one
    /// last drain runs.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), SupervisorError> {
        let relay = Arc::clone(&self.relay);
        tokio::spawn(async move {
            relay.drain().await;
        });

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);
        let forwarder = tokio::spawn(forward_events(Arc::clone(&self.relay), events_rx, stop_rx));

        let mut tracker = RestartTracker::new(self.policy);
        let outcome = loop {
            let stopping = *shutdown.borrow();
            if stopping {
                break Ok(());
            }
            match self.run_worker(&mut tracker, &events_tx, &mut shutdown).await {
                WorkerExit::Shutdown => break Ok(()),
                WorkerExit::Crashed(reason) => {
                    self.poller.detach_worker(&reason).await;
                    let _ = events_tx.send(Event::error(format!("hardware worker exited: {reason}")));
                    match tracker.on_crash() {
                        RestartDecision::GiveUp { crashes } => {
                            error!(crashes, "worker keeps crashing; giving up");
                            break Err(SupervisorError::RestartCeiling(crashes));
                        }
                        RestartDecision::Restart { delay, attempt } => {
                            warn!(attempt, delay_ms = delay.as_millis() as u64, reason = %reason, "worker crashed; restarting");
                            tokio::select! {
                                _ = tokio::time::sleep(delay) => {}
                                _ = shutdown_signalled(&mut shutdown) => break Ok(()),
                            }
                        }
                    }
                }
            }
        };

        self.poller.detach_worker("agent shutting down").await;
        if tokio::time::timeout(self.shutdown_timeout, self.poller.flush_reports())
            .await
            .is_err()
        {
            warn!("command results still unsent at shutdown");
        }
        let _ = stop_tx.send(true);
        drop(events_tx);
        if let Err(err) = forwarder.await {
            error!(error = %err, "event forwarder failed");
        }
        if let Some(report) = self.relay.drain().await {
            info!(remaining = report.remaining, "final drain finished");
        }
        outcome
    }

    async fn run_worker(
        &self,
        tracker: &mut RestartTracker,
        events: &mpsc::UnboundedSender<Event>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> WorkerExit {
        let mut child = match self.launcher.spawn() {
            Ok(child) => child,
            Err(err) => return WorkerExit::Crashed(format!("{err:#}")),
        };
        info!(pid = ?child.id(), program = %self.launcher.program().display(), "worker spawned");

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill().await;
            return WorkerExit::Crashed("worker stdio unavailable".into());
        };
        let (to_worker, inbound) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_to_worker(stdin, inbound));
        let mut lines = BufReader::new(stdout).lines();

        let requested = loop {
            tokio::select! {
                line = lines.next_line() => match line {
                    Ok(Some(line)) => self.dispatch(&line, tracker, &to_worker, events).await,
                    Ok(None) => break false,
                    Err(err) => {
                        warn!(error = %err, "reading worker output failed");
                        break false;
                    }
                },
                _ = shutdown_signalled(shutdown) => break true,
            }
        };

        let exit = if requested {
            info!("stopping worker");
            let _ = to_worker.send(SupervisorMessage::Terminate);
            self.wind_down(&mut child, &mut lines, tracker, &to_worker, events).await;
            WorkerExit::Shutdown
        } else {
            WorkerExit::Crashed(self.reap(&mut child).await)
        };
        writer.abort();
        exit
    }

    /// Relay whatever the worker still says until it exits or time runs out.
    async fn wind_down(
        &self,
        child: &mut Child,
        lines: &mut Lines<BufReader<ChildStdout>>,
        tracker: &mut RestartTracker,
        to_worker: &WorkerHandle,
        events: &mpsc::UnboundedSender<Event>,
    ) {
        let graceful = tokio::time::timeout(self.shutdown_timeout, async {
            while let Ok(Some(line)) = lines.next_line().await {
                self.dispatch(&line, tracker, to_worker, events).await;
            }
            child.wait().await
        })
        .await;
        match graceful {
            Ok(Ok(status)) => info!(%status, "worker stopped"),
            Ok(Err(err)) => warn!(error = %err, "waiting for worker failed"),
            Err(_) => {
                warn!(timeout_ms = self.shutdown_timeout.as_millis() as u64, "worker ignored terminate; killing");
                let _ = child.kill().await;
            }
        }
    }

    /// Called once stdout closed; the process should be gone or about to be.
    async fn reap(&self, child: &mut Child) -> String {
        match tokio::time::timeout(self.shutdown_timeout, child.wait()).await {
            Ok(Ok(status)) => status.to_string(),
            Ok(Err(err)) => format!("wait failed: {err}"),
            Err(_) => {
                let _ = child.kill().await;
                "closed its output and was killed".into()
            }
        }
    }

    async fn dispatch(
        &self,
        line: &str,
        tracker: &mut RestartTracker,
        to_worker: &WorkerHandle,
        events: &mpsc::UnboundedSender<Event>,
    ) {
        let message: WorkerMessage = match decode_line(line) {
            Ok(message) => message,
            Err(err) => {
                warn!(error = %err, line, "unreadable worker message");
                return;
            }
        };

        match &message {
            WorkerMessage::Ready => {
                info!("worker ready");
                tracker.on_ready();
                self.poller.attach_worker(to_worker.clone()).await;
            }
            WorkerMessage::InitFailed { data } => {
                error!(detail = %data, "worker could not open the reader");
            }
            WorkerMessage::WriteComplete(result) => {
                info!(uid = %result.uid, success = result.write_success, "tag write finished");
                self.poller.on_write_complete(result.clone()).await;
            }
            WorkerMessage::Error { message } => warn!(detail = %message, "worker reported an error"),
            other => debug!(?other, "worker message"),
        }

        if let Some(event) = message.to_event() {
            let _ = events.send(event);
        }
    }
}

async fn write_to_worker(mut stdin: ChildStdin, mut inbound: mpsc::UnboundedReceiver<SupervisorMessage>) {
    while let Some(message) = inbound.recv().await {
        let mut line = match encode_line(&message) {
            Ok(line) => line,
            Err(err) => {
                error!(error = %err, "could not encode worker message");
                continue;
            }
        };
        line.push('\n');
        if let Err(err) = stdin.write_all(line.as_bytes()).await {
            debug!(error = %err, "worker stdin closed");
            break;
        }
        let _ = stdin.flush().await;
    }
}

/// Sends events one at a time. Once `stop` flips, the in-flight send is
/// abandoned and everything left goes straight to the queue.
async fn forward_events(relay: Arc<Relay>, mut events: mpsc::UnboundedReceiver<Event>, mut stop: watch::Receiver<bool>) {
    while let Some(event) = events.recv().await {
        let stopped = *stop.borrow();
        if stopped {
            relay.enqueue(event).await;
            continue;
        }
        let pending = event.clone();
        tokio::select! {
            _ = relay.send_event(event) => {}
            _ = shutdown_signalled(&mut stop) => relay.enqueue(pending).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use serde_json::Value;
    use tokio::sync::Mutex;

    use super::*;
    use crate::poller::TickOutcome;
    use crate::retry::RetryPolicy;
    use crate::testing::{FakeBackend, eventually};
    use tagrelay_queue::EventQueue;

    struct Harness {
        fake: FakeBackend,
        relay: Arc<Relay>,
        poller: Arc<CommandPoller>,
        _dir: tempfile::TempDir,
    }

    async fn harness() -> Harness {
        let fake = FakeBackend::start().await;
        let dir = tempfile::tempdir().unwrap();
        let queue = EventQueue::open(dir.path().join("queue.jsonl")).unwrap();
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            jitter: Duration::ZERO,
            max_retries: 2,
        };
        let relay = Arc::new(Relay::new(fake.client(), policy, Arc::new(Mutex::new(queue))));
        let poller = Arc::new(CommandPoller::new(fake.client(), Arc::clone(&relay)));
        Harness {
            fake,
            relay,
            poller,
            _dir: dir,
        }
    }

    fn shell(script: &str) -> WorkerLauncher {
        WorkerLauncher::new("/bin/sh", ["-c", script])
    }

    fn supervisor(h: &Harness, launcher: WorkerLauncher, max_restarts: u32) -> Supervisor {
        let policy = RestartPolicy {
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            max_restarts,
        };
        Supervisor::new(
            launcher,
            Arc::clone(&h.relay),
            Arc::clone(&h.poller),
            policy,
            Duration::from_secs(2),
        )
    }

    fn events_of(fake: &FakeBackend, kind: &str) -> Vec<Value> {
        fake.events().into_iter().filter(|e| e["type"] == kind).collect()
    }

    async fn wait_for_worker(poller: &CommandPoller) {
        for _ in 0..500 {
            if poller.has_worker().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("worker never became ready");
    }

    fn spawn_count(path: &Path) -> usize {
        std::fs::read_to_string(path).map(|s| s.lines().count()).unwrap_or(0)
    }

    #[tokio::test]
    async fn crash_loop_hits_the_ceiling() {
        let h = harness().await;
        let counter = h._dir.path().join("spawns");
        let script = format!("echo spawn >> '{}'; exit 3", counter.display());
        let sup = supervisor(&h, shell(&script), 3);
        let (_stop_tx, stop_rx) = watch::channel(false);

        let outcome = sup.run(stop_rx).await;
        assert!(matches!(outcome, Err(SupervisorError::RestartCeiling(3))));
        assert_eq!(spawn_count(&counter), 3);
        assert_eq!(h.relay.queue_size().await, 0);
        let errors = events_of(&h.fake, "error");
        assert!(errors.len() >= 3);
        assert!(errors[0]["data"]["message"].as_str().unwrap().contains("exit status"));
    }

    #[tokio::test]
    async fn init_failure_is_relayed_and_restarted() {
        let h = harness().await;
        let script = r#"echo '{"type":"init-failed","data":"no reader service"}'; exit 1"#;
        let sup = supervisor(&h, shell(script), 2);
        let (_stop_tx, stop_rx) = watch::channel(false);

        assert!(sup.run(stop_rx).await.is_err());
        let init = events_of(&h.fake, "error")
            .into_iter()
            .filter(|e| e["data"]["stage"] == "init")
            .count();
        assert!(init >= 2);
    }

    #[tokio::test]
    async fn relays_worker_events_and_stops_cleanly() {
        let h = harness().await;
        let script = r#"
            echo '{"type":"ready"}'
            echo '{"type":"reader:connect","name":"ACS ACR122U"}'
            echo '{"type":"card","reader":"ACS ACR122U","uid":"04A1B2C3","atr":"3B8F8001"}'
            while read line; do
                case "$line" in *terminate*) exit 0;; esac
            done
        "#;
        let sup = Arc::new(supervisor(&h, shell(script), 3));
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn({
            let sup = Arc::clone(&sup);
            async move { sup.run(stop_rx).await }
        });

        assert!(eventually(|| events_of(&h.fake, "card").len() == 1).await);
        let card = &events_of(&h.fake, "card")[0];
        assert_eq!(card["data"]["uid"], "04A1B2C3");
        assert_eq!(card["data"]["reader"], "ACS ACR122U");
        assert_eq!(events_of(&h.fake, "reader:connect").len(), 1);
        assert!(h.poller.has_worker().await);

        stop_tx.send(true).unwrap();
        assert!(task.await.unwrap().is_ok());
        assert!(events_of(&h.fake, "error").is_empty());
        assert!(!h.poller.has_worker().await);
    }

    #[tokio::test]
    async fn write_request_round_trip() {
        let h = harness().await;
        h.fake.add_pending("c1", "https://vet.test/p/1");
        let script = r#"
            echo '{"type":"ready"}'
            while read line; do
                case "$line" in
                    *write-request*)
                        echo '{"type":"write:progress","uid":"04A1B2","page":4,"written":1,"total":1}'
                        echo '{"type":"card:write-complete","uid":"04A1B2","writeSuccess":true,"url":"https://vet.test/p/1"}'
                        ;;
                    *terminate*) exit 0;;
                esac
            done
        "#;
        let sup = Arc::new(supervisor(&h, shell(script), 3));
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn({
            let sup = Arc::clone(&sup);
            async move { sup.run(stop_rx).await }
        });

        wait_for_worker(&h.poller).await;
        assert_eq!(h.poller.tick().await, TickOutcome::Armed { command_id: "c1".into() });
        h.fake.clear_pending();

        assert!(eventually(|| h.fake.results().len() == 1).await);
        let (id, body) = &h.fake.results()[0];
        assert_eq!(id, "c1");
        assert_eq!(body["writeSuccess"], true);
        assert!(eventually(|| events_of(&h.fake, "card:write-complete").len() == 1).await);
        assert_eq!(events_of(&h.fake, "write:progress")[0]["data"]["page"], 4);
        assert_eq!(h.poller.active_command().await, None);

        stop_tx.send(true).unwrap();
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn stubborn_worker_is_killed_on_shutdown() {
        let h = harness().await;
        let script = r#"echo '{"type":"ready"}'; while true; do sleep 1; done"#;
        let policy = RestartPolicy {
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            max_restarts: 3,
        };
        let sup = Supervisor::new(
            shell(script),
            Arc::clone(&h.relay),
            Arc::clone(&h.poller),
            policy,
            Duration::from_millis(200),
        );
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(async move { sup.run(stop_rx).await });

        wait_for_worker(&h.poller).await;
        stop_tx.send(true).unwrap();
        let outcome = tokio::time::timeout(Duration::from_secs(5), task).await;
        assert!(outcome.unwrap().unwrap().is_ok());
    }

    #[tokio::test]
    async fn slow_result_report_does_not_delay_the_restart() {
        let h = harness().await;
        h.fake.add_pending("c1", "https://vet.test/p/1");
        h.fake.set_result_delay(Duration::from_millis(1500));
        let counter = h._dir.path().join("spawns");
        let script = format!(
            r#"echo spawn >> '{}'; echo '{{"type":"ready"}}'; read line; case "$line" in *terminate*) exit 0;; esac; exit 1"#,
            counter.display()
        );
        let sup = Arc::new(supervisor(&h, shell(&script), 5));
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn({
            let sup = Arc::clone(&sup);
            async move { sup.run(stop_rx).await }
        });

        wait_for_worker(&h.poller).await;
        assert_eq!(h.poller.tick().await, TickOutcome::Armed { command_id: "c1".into() });
        let armed_at = tokio::time::Instant::now();
        h.fake.clear_pending();

        assert!(eventually(|| spawn_count(&counter) == 2).await);
        assert!(armed_at.elapsed() < Duration::from_secs(1));
        assert!(eventually(|| !events_of(&h.fake, "error").is_empty()).await);

        assert!(eventually(|| h.fake.results().len() == 1).await);
        assert_eq!(h.fake.results()[0].0, "c1");
        assert_eq!(h.fake.results()[0].1["writeSuccess"], false);

        stop_tx.send(true).unwrap();
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn write_finished_during_shutdown_is_reported_as_success() {
        let h = harness().await;
        h.fake.add_pending("c1", "https://vet.test/p/1");
        let script = r#"
            echo '{"type":"ready"}'
            while read line; do
                case "$line" in
                    *terminate*)
                        echo '{"type":"card:write-complete","uid":"04A1B2","writeSuccess":true,"url":"https://vet.test/p/1"}'
                        exit 0
                        ;;
                esac
            done
        "#;
        let sup = Arc::new(supervisor(&h, shell(script), 3));
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn({
            let sup = Arc::clone(&sup);
            async move { sup.run(stop_rx).await }
        });

        wait_for_worker(&h.poller).await;
        assert_eq!(h.poller.tick().await, TickOutcome::Armed { command_id: "c1".into() });
        h.fake.clear_pending();

        stop_tx.send(true).unwrap();
        assert!(task.await.unwrap().is_ok());
        let results = h.fake.results();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, "c1");
        assert_eq!(results[0].1["writeSuccess"], true);
        assert_eq!(h.poller.active_command().await, None);
    }
}
