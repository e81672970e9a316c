//! Outbound delivery to the backend.
//!
//! Events go out in order, at least once. A delivery that exhausts its
//! retries lands in the [`EventQueue`]; while anything is queued, new events
//! line up behind the backlog instead of overtaking it. [`Relay::drain`]
//! works the backlog oldest-first and stops at the first retryable failure.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info, warn};

use tagrelay_protocol::{Event, WriteResult};
use tagrelay_queue::EventQueue;

use crate::backend::{AttemptError, BackendClient};
use crate::retry::RetryPolicy;
use crate::shutdown_signalled;

#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The backend refused the payload; it is dropped.
    #[error("rejected by backend: {0}")]
    Rejected(#[source] AttemptError),
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        #[source]
        last: AttemptError,
    },
}

/// What happened to an event handed to [`Relay::send_event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    Queued,
    Dropped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub delivered: usize,
    /// Queued events the backend rejected outright.
    pub dropped: usize,
    pub remaining: usize,
}

pub struct Relay {
    backend: BackendClient,
    policy: RetryPolicy,
    queue: Arc<Mutex<EventQueue>>,
    draining: AtomicBool,
}

/// Clears the drain flag however the drain ends, including cancellation.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Relay {
    pub fn new(backend: BackendClient, policy: RetryPolicy, queue: Arc<Mutex<EventQueue>>) -> Self {
        Self {
            backend,
            policy,
            queue,
            draining: AtomicBool::new(false),
        }
    }

    pub async fn queue_size(&self) -> usize {
        self.queue.lock().await.size()
    }

    /// Deliver `event` now, or queue it if the backend cannot be reached.
    ///
    /// A successful delivery also kicks off a background drain, since it
    /// proves the backend is reachable again.
    pub async fn send_event(self: &Arc<Self>, event: Event) -> Delivery {
        if self.queue_size().await > 0 {
            debug!(id = %event.id, kind = %event.kind, "backlog present; queueing behind it");
            self.enqueue(event).await;
            self.spawn_drain();
            return Delivery::Queued;
        }

        match self.post_with_retry(&self.backend.events_url(), &event).await {
            Ok(()) => {
                debug!(id = %event.id, kind = %event.kind, "event delivered");
                self.spawn_drain();
                Delivery::Delivered
            }
            Err(DeliveryError::Rejected(err)) => {
                error!(id = %event.id, kind = %event.kind, error = %err, "event rejected by backend; dropping");
                Delivery::Dropped
            }
            Err(err @ DeliveryError::Exhausted { .. }) => {
                warn!(id = %event.id, kind = %event.kind, error = %err, "event delivery failed; queueing");
                self.enqueue(event).await;
                Delivery::Queued
            }
        }
    }

    /// Report a write outcome. Never queued: the command itself lives on the
    /// backend and will be polled again.
    pub async fn send_command_result(&self, command_id: &str, result: &WriteResult) -> bool {
        let url = self.backend.command_result_url(command_id);
        match self.post_with_retry(&url, result).await {
            Ok(()) => {
                info!(command_id, success = result.write_success, "command result reported");
                true
            }
            Err(err) => {
                error!(command_id, error = %err, "failed to report command result");
                false
            }
        }
    }

    /// Put `event` straight into the backlog without trying to send it.
    pub async fn enqueue(&self, event: Event) {
        let mut queue = self.queue.lock().await;
        queue.push(event).await;
        debug!(size = queue.size(), "event queued");
    }

    fn spawn_drain(self: &Arc<Self>) {
        let relay = Arc::clone(self);
        tokio::spawn(async move {
            relay.drain().await;
        });
    }

    /// Deliver queued events oldest-first. Returns `None` when another drain
    /// is already running.
    pub async fn drain(&self) -> Option<DrainReport> {
        if self
            .draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("drain already in progress");
            return None;
        }
        let _guard = DrainGuard(&self.draining);

        let mut report = DrainReport::default();
        loop {
            // Only a drain pops, so the head cannot change under us.
            let head = self.queue.lock().await.peek().cloned();
            let Some(event) = head else {
                break;
            };

            match self.post_with_retry(&self.backend.events_url(), &event).await {
                Ok(()) => {
                    self.queue.lock().await.pop().await;
                    report.delivered += 1;
                }
                Err(DeliveryError::Rejected(err)) => {
                    error!(id = %event.id, kind = %event.kind, error = %err, "queued event rejected by backend; dropping");
                    self.queue.lock().await.pop().await;
                    report.dropped += 1;
                }
                Err(err) => {
                    debug!(id = %event.id, error = %err, "drain stopped; backend still unavailable");
                    break;
                }
            }
        }

        report.remaining = self.queue_size().await;
        if report.delivered > 0 || report.dropped > 0 {
            info!(
                delivered = report.delivered,
                dropped = report.dropped,
                remaining = report.remaining,
                "queue drained"
            );
        }
        Some(report)
    }

    /// Drain on a fixed interval until `shutdown` flips.
    pub async fn run_drain_loop(self: Arc<Self>, every: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.drain().await;
                }
                _ = shutdown_signalled(&mut shutdown) => break,
            }
        }
    }

    async fn post_with_retry<T: Serialize + ?Sized>(&self, url: &str, body: &T) -> Result<(), DeliveryError> {
        let mut retry = 0;
        loop {
            match self.backend.post(url, body).await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_terminal() => return Err(DeliveryError::Rejected(err)),
                Err(err) if retry >= self.policy.max_retries => {
                    return Err(DeliveryError::Exhausted {
                        attempts: retry + 1,
                        last: err,
                    });
                }
                Err(err) => {
                    let delay = self.policy.delay(retry);
                    debug!(url, retry, delay_ms = delay.as_millis() as u64, error = %err, "delivery failed; backing off");
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
            }
        }
    }
}
