//! The hardware worker: exclusive owner of the reader.
//!
//! [`serve`] speaks the line protocol from `tagrelay_protocol` over any
//! async reader/writer pair. In production those are the worker process's
//! stdin and stdout; tests use in-memory pipes.
//!
//! Two tasks cooperate:
//!
//! - a blocking thread owns the [`ReaderDriver`], turns reader events into
//!   [`WorkerMessage`]s and performs armed writes;
//! - the async side reads [`SupervisorMessage`]s and arms or stops the thread.
//!
//! Outbound messages funnel through one writer task so lines never interleave.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, info, warn};

use tagrelay_protocol::{SupervisorMessage, WorkerMessage, WriteResult, decode_line, encode_line};

use crate::HardwareError;
use crate::driver::{ReaderDriver, ReaderEvent};
use crate::write::{TagLayout, write_url};

#[derive(Debug, Clone, Copy)]
pub struct WorkerOptions {
    /// Upper bound on one driver wait; also how quickly a stop is noticed.
    pub poll_timeout: Duration,
    pub layout: TagLayout,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_millis(250),
            layout: TagLayout::default(),
        }
    }
}

/// Run the worker until the supervisor says `terminate`, closes the channel,
/// or the driver fails fatally.
///
/// `open` runs first. If it fails, `init-failed` is sent and the error is
/// returned without retrying; restarting is the supervisor's job.
pub async fn serve<R, W, F>(open: F, input: R, output: W, options: WorkerOptions) -> Result<(), HardwareError>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
    F: FnOnce() -> Result<Box<dyn ReaderDriver>, HardwareError> + Send + 'static,
{
    let (out_tx, out_rx) = mpsc::unbounded_channel::<WorkerMessage>();
    let writer = tokio::spawn(write_messages(output, out_rx));

    let opened = tokio::task::spawn_blocking(open)
        .await
        .unwrap_or_else(|join_err| Err(HardwareError::Unavailable(format!("driver init panicked: {join_err}"))));
    let driver = match opened {
        Ok(driver) => driver,
        Err(err) => {
            error!(error = %err, "reader driver init failed");
            let _ = out_tx.send(WorkerMessage::InitFailed { data: err.to_string() });
            drop(out_tx);
            let _ = writer.await;
            return Err(err);
        }
    };

    info!("reader driver ready");
    let _ = out_tx.send(WorkerMessage::Ready);

    let armed: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
    let stop = Arc::new(AtomicBool::new(false));
    let mut hardware = {
        let armed = Arc::clone(&armed);
        let stop = Arc::clone(&stop);
        let out = out_tx.clone();
        tokio::task::spawn_blocking(move || hardware_loop(driver, armed, stop, out, options))
    };

    let mut lines = BufReader::new(input).lines();
    let mut finished = None;
    loop {
        tokio::select! {
            joined = &mut hardware => {
                finished = Some(joined);
                break;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => match decode_line::<SupervisorMessage>(&line) {
                    Ok(SupervisorMessage::WriteRequest { url }) => {
                        let mut slot = armed.lock().await;
                        if let Some(previous) = slot.replace(url.clone()) {
                            warn!(%previous, %url, "write request replaced an unconsumed one");
                        }
                        info!(%url, "armed for next tag");
                    }
                    Ok(SupervisorMessage::Terminate) => {
                        info!("terminate requested");
                        break;
                    }
                    Err(err) => warn!(error = %err, "ignoring malformed supervisor message"),
                },
                Ok(None) => {
                    debug!("supervisor channel closed");
                    break;
                }
                Err(err) => {
                    warn!(error = %err, "supervisor channel read failed");
                    break;
                }
            }
        }
    }

    stop.store(true, Ordering::Relaxed);
    let joined = match finished {
        Some(joined) => joined,
        None => hardware.await,
    };
    drop(out_tx);
    let _ = writer.await;

    match joined {
        Ok(result) => result,
        Err(join_err) => Err(HardwareError::Driver {
            message: format!("hardware thread panicked: {join_err}"),
            fatal: true,
        }),
    }
}

async fn write_messages<W: AsyncWrite + Unpin>(mut output: W, mut rx: mpsc::UnboundedReceiver<WorkerMessage>) {
    while let Some(message) = rx.recv().await {
        let mut line = match encode_line(&message) {
            Ok(line) => line,
            Err(err) => {
                error!(error = %err, "failed to encode worker message");
                continue;
            }
        };
        line.push('\n');
        if let Err(err) = output.write_all(line.as_bytes()).await {
            // Supervisor is gone; nothing left to tell.
            warn!(error = %err, "worker output closed");
            return;
        }
        let _ = output.flush().await;
    }
}

fn hardware_loop(
    mut driver: Box<dyn ReaderDriver>,
    armed: Arc<Mutex<Option<String>>>,
    stop: Arc<AtomicBool>,
    out: mpsc::UnboundedSender<WorkerMessage>,
    options: WorkerOptions,
) -> Result<(), HardwareError> {
    while !stop.load(Ordering::Relaxed) {
        let events = match driver.wait_for_events(options.poll_timeout) {
            Ok(events) => events,
            Err(err) if err.is_fatal() => {
                error!(error = %err, "reader driver failed");
                let _ = out.send(WorkerMessage::Error { message: err.to_string() });
                return Err(err);
            }
            Err(err) => {
                warn!(error = %err, "reader poll failed");
                let _ = out.send(WorkerMessage::Error { message: err.to_string() });
                std::thread::sleep(options.poll_timeout);
                continue;
            }
        };

        for event in events {
            let message = match event {
                ReaderEvent::ReaderAttached { name } => WorkerMessage::ReaderConnect { name },
                ReaderEvent::ReaderDetached { name } => WorkerMessage::ReaderDisconnect { name },
                ReaderEvent::TagRemoved { reader, uid } => WorkerMessage::CardRemove { reader, uid },
                ReaderEvent::Fault { message } => WorkerMessage::Error { message },
                ReaderEvent::TagPresented { reader, uid, atr } => match take_armed(&armed) {
                    Some(url) => {
                        let result = perform_write(driver.as_mut(), &reader, &uid, &url, options.layout, &out);
                        WorkerMessage::WriteComplete(result)
                    }
                    None => WorkerMessage::Card {
                        reader,
                        uid,
                        atr: hex::encode_upper(&atr),
                    },
                },
            };
            if out.send(message).is_err() {
                return Ok(());
            }
        }
    }
    Ok(())
}

fn take_armed(armed: &Mutex<Option<String>>) -> Option<String> {
    armed.blocking_lock().take()
}

fn perform_write(
    driver: &mut dyn ReaderDriver,
    reader: &str,
    uid: &str,
    url: &str,
    layout: TagLayout,
    out: &mpsc::UnboundedSender<WorkerMessage>,
) -> WriteResult {
    info!(reader, uid, url, "writing URL to tag");
    let outcome = write_url(driver, reader, uid, url, layout, |progress| {
        let _ = out.send(WorkerMessage::WriteProgress(progress));
    });
    match outcome {
        Ok(pages) => {
            info!(uid, pages, "tag write complete");
            WriteResult::success(uid, url)
        }
        Err(err) => {
            warn!(uid, error = %err, "tag write failed");
            WriteResult::failure(uid, Some(url.to_string()), err.to_string())
        }
    }
}
