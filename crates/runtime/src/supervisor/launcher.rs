use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;

use anyhow::{Context, Result};
use tokio::process::{Child, Command};

/// How to start a hardware worker process.
#[derive(Debug, Clone)]
pub struct WorkerLauncher {
    program: PathBuf,
    args: Vec<OsString>,
}

impl WorkerLauncher {
    pub fn new(program: impl Into<PathBuf>, args: impl IntoIterator<Item = impl Into<OsString>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// This executable, re-run with the hidden `worker` subcommand.
    pub fn current_exe() -> Result<Self> {
        let exe = std::env::current_exe().context("locating agent executable")?;
        Ok(Self::new(exe, ["worker"]))
    }

    pub fn program(&self) -> &PathBuf {
        &self.program
    }

    /// stdin/stdout carry the message channel; stderr is the worker's log.
    pub fn spawn(&self) -> Result<Child> {
        Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawning worker {}", self.program.display()))
    }
}
