use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;
use tracing::warn;

use tagrelay_protocol::Event;

/// Newline-delimited JSON backing file for the queue, plus its two siblings:
/// `<name>.tmp` for rewrites and `<name>.corrupt` for unreadable records.
#[derive(Debug, Clone)]
pub(crate) struct QueueFile {
    path: PathBuf,
    staging: PathBuf,
    quarantine: PathBuf,
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

fn encode(event: &Event, out: &mut Vec<u8>) -> Result<()> {
    serde_json::to_writer(&mut *out, event)?;
    out.push(b'\n');
    Ok(())
}

/// Write `bytes` to `path` and wait until they are on disk.
async fn write_durably(path: &Path, bytes: &[u8], append: bool) -> Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .append(append)
        .truncate(!append)
        .open(path)
        .await
        .with_context(|| format!("opening {}", path.display()))?;
    file.write_all(bytes).await?;
    file.flush().await?;
    file.sync_all().await?;
    Ok(())
}

impl QueueFile {
    pub(crate) fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            staging: sibling(&path, ".tmp"),
            quarantine: sibling(&path, ".corrupt"),
            path,
        }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    async fn ensure_parent(&self) -> Result<()> {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display())),
            _ => Ok(()),
        }
    }

    pub(crate) async fn append(&self, event: &Event) -> Result<()> {
        self.ensure_parent().await?;
        let mut line = Vec::new();
        encode(event, &mut line)?;
        // One write per record: a torn tail is at worst one unparseable line.
        write_durably(&self.path, &line, true).await
    }

    /// Replace the file with `events`. Readers see either the old content or
    /// the new, never a mix.
    pub(crate) async fn overwrite<'a>(&self, events: impl IntoIterator<Item = &'a Event>) -> Result<()> {
        let mut body = Vec::new();
        for event in events {
            encode(event, &mut body)?;
        }
        self.ensure_parent().await?;

        let replaced = match write_durably(&self.staging, &body, false).await {
            Ok(()) => tokio::fs::rename(&self.staging, &self.path)
                .await
                .with_context(|| format!("renaming over {}", self.path.display())),
            Err(err) => Err(err),
        };
        if replaced.is_err() {
            let _ = tokio::fs::remove_file(&self.staging).await;
        }
        replaced
    }

    /// Read every record in file order. Unparseable lines are dropped from
    /// the result and copied to the quarantine file.
    pub(crate) fn load(&self) -> Result<Vec<Event>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err).with_context(|| format!("reading {}", self.path.display())),
        };

        let mut events = Vec::new();
        let mut rejected = String::new();
        for (number, line) in content.lines().enumerate().filter(|(_, l)| !l.trim().is_empty()) {
            match serde_json::from_str::<Event>(line) {
                Ok(event) => events.push(event),
                Err(err) => {
                    warn!(line = number + 1, error = %err, path = %self.path.display(), "unreadable queue record");
                    rejected.push_str(line);
                    rejected.push('\n');
                }
            }
        }

        if !rejected.is_empty() {
            let kept = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.quarantine)
                .and_then(|mut file| std::io::Write::write_all(&mut file, rejected.as_bytes()));
            match kept {
                Ok(()) => warn!(path = %self.quarantine.display(), "unreadable queue records moved aside"),
                Err(err) => warn!(error = %err, path = %self.quarantine.display(), "unreadable queue records lost"),
            }
        }
        Ok(events)
    }
}
