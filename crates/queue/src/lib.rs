//! Durable FIFO of events awaiting delivery.
//!
//! Every record is one JSON line in a single file. The file is appended to on
//! [`EventQueue::push`] and rewritten in full on [`EventQueue::pop`], so the
//! on-disk sequence is always the in-memory sequence or a stale superset of
//! it (when a rewrite failed). Disk failures are logged and never fatal: the
//! queue degrades to in-memory for the affected records.

mod file;

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use anyhow::Result;
use tracing::{debug, error, warn};

use tagrelay_protocol::Event;

use crate::file::QueueFile;

#[derive(Debug)]
pub struct EventQueue {
    file: QueueFile,
    entries: VecDeque<Event>,
}

impl EventQueue {
    /// Open (or create lazily) the queue at `path`, loading every existing
    /// record before returning.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let file = QueueFile::new(path);
        let entries: VecDeque<Event> = file.load()?.into();
        if !entries.is_empty() {
            debug!(count = entries.len(), path = %file.path().display(), "restored queued events");
        }
        Ok(Self { file, entries })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub async fn push(&mut self, event: Event) {
        if let Err(err) = self.file.append(&event).await {
            warn!(error = %err, id = %event.id, "queue append failed; rewriting whole file");
            let rewritten = self
                .file
                .overwrite(self.entries.iter().chain(std::iter::once(&event)))
                .await;
            if let Err(err) = rewritten {
                error!(
                    error = %err,
                    id = %event.id,
                    path = %self.path().display(),
                    "queue persistence failed; event held in memory only"
                );
            }
        }
        self.entries.push_back(event);
    }

    pub fn peek(&self) -> Option<&Event> {
        self.entries.front()
    }

    pub async fn pop(&mut self) -> Option<Event> {
        let event = self.entries.pop_front()?;
        if let Err(err) = self.file.overwrite(&self.entries).await {
            error!(
                error = %err,
                path = %self.path().display(),
                "queue rewrite after pop failed; file lags memory until next rewrite"
            );
        }
        Some(event)
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
