mod queue_cmds;
mod telemetry;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info, warn};

use tagrelay_config::AppConfig;
use tagrelay_hardware::WorkerOptions;
use tagrelay_queue::EventQueue;
use tagrelay_runtime::{SupervisorError, WorkerLauncher, run_agent};

const DEFAULT_CONFIG_PATH: &str = "config/agent.toml";

#[derive(Debug, Parser)]
#[command(
    name = "tagrelay",
    version,
    about = "Bridges a local NFC reader to the clinic backend"
)]
struct Cli {
    /// TOML configuration file. `TAGRELAY_*` environment variables win over it.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the agent (default).
    Run,
    /// The supervised hardware worker. Started by `run`, not by hand.
    #[command(hide = true)]
    Worker,
    /// Inspect or flush the offline event queue.
    Queue {
        #[command(subcommand)]
        command: QueueCommands,
    },
    /// Print the effective configuration with the secret masked.
    Doctor,
}

#[derive(Debug, Subcommand)]
enum QueueCommands {
    /// Count queued events and show the oldest.
    Stats,
    /// Try once to deliver everything queued.
    Drain,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = match AppConfig::load_from(&cli.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("tagrelay: invalid configuration: {err:#}");
            return ExitCode::FAILURE;
        }
    };

    let command = cli.command.unwrap_or(Commands::Run);
    if let Commands::Worker = command {
        if let Err(err) = telemetry::init_worker(&config.telemetry.log_level) {
            eprintln!("tagrelay worker: logging unavailable: {err:#}");
        }
        let code = run_worker().await;
        // A blocked stdin read would otherwise keep the runtime from shutting down.
        std::process::exit(code);
    }

    let _log_guard = match telemetry::init(&config.telemetry) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("tagrelay: logging unavailable: {err:#}");
            None
        }
    };

    let result = match command {
        Commands::Run | Commands::Worker => run(config).await,
        Commands::Queue { command: QueueCommands::Stats } => queue_cmds::stats(&config),
        Commands::Queue { command: QueueCommands::Drain } => queue_cmds::drain(&config).await,
        Commands::Doctor => doctor(&config, &cli.config),
    };
    match result {
        Ok(code) => code,
        Err(err) => {
            error!(error = %format!("{err:#}"), "tagrelay failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: AppConfig) -> Result<ExitCode> {
    if let Err(err) = config.validate() {
        error!(error = %err, "cannot start");
        return Ok(ExitCode::FAILURE);
    }
    let launcher = WorkerLauncher::current_exe()?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match wait_for_signal().await {
            Ok(()) => {
                info!("shutdown requested");
                let _ = shutdown_tx.send(true);
            }
            Err(err) => {
                warn!(error = %err, "signal handling unavailable; stop the agent by killing it");
                // Keep the sender alive so the agent keeps running.
                std::future::pending::<()>().await;
                drop(shutdown_tx);
            }
        }
    });

    match run_agent(&config, launcher, shutdown_rx).await? {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(err @ SupervisorError::RestartCeiling(_)) => {
            error!(error = %err, "hardware worker could not be kept running");
            Ok(ExitCode::FAILURE)
        }
    }
}

/// Worker side of the process split: reader on one thread, protocol on stdio.
async fn run_worker() -> i32 {
    // Ctrl-C hits the whole process group; the supervisor decides when we stop.
    tokio::spawn(async {
        while tokio::signal::ctrl_c().await.is_ok() {
            info!("ignoring interrupt; waiting for terminate");
        }
    });

    match tagrelay_hardware::serve(
        tagrelay_hardware::open_default,
        tokio::io::stdin(),
        tokio::io::stdout(),
        WorkerOptions::default(),
    )
    .await
    {
        Ok(()) => 0,
        Err(err) => {
            error!(error = %err, "worker stopped");
            1
        }
    }
}

async fn wait_for_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        tokio::select! {
            _ = sigterm.recv() => {},
            _ = sigint.recv() => {},
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await?;
    Ok(())
}

fn doctor(config: &AppConfig, config_path: &Path) -> Result<ExitCode> {
    println!("tagrelay doctor");
    let source = if config_path.exists() { "found" } else { "not found, using defaults" };
    println!("- config file: {} ({source})", config_path.display());
    match EventQueue::open(&config.queue.path) {
        Ok(queue) => println!("- queue: {} ({} queued)", config.queue.path, queue.size()),
        Err(err) => println!("- queue: {} (unreadable: {err:#})", config.queue.path),
    }
    let reader = if cfg!(feature = "pcsc") {
        "pcsc"
    } else {
        "unavailable (built without the pcsc feature)"
    };
    println!("- reader driver: {reader}");
    let valid = config.validate();
    match &valid {
        Ok(()) => println!("- configuration: ok"),
        Err(err) => println!("- configuration: {err}"),
    }
    println!();
    print!("{}", config.redacted().to_toml()?);
    Ok(if valid.is_ok() { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}
