use std::process::ExitCode;

use anyhow::Result;

use tagrelay_config::AppConfig;
use tagrelay_queue::EventQueue;

pub(crate) fn stats(config: &AppConfig) -> Result<ExitCode> {
    let queue = EventQueue::open(&config.queue.path)?;
    for line in stats_lines(&queue) {
        println!("{line}");
    }
    Ok(ExitCode::SUCCESS)
}

fn stats_lines(queue: &EventQueue) -> Vec<String> {
    let mut lines = vec![
        format!("queue: {}", queue.path().display()),
        format!("- queued events: {}", queue.size()),
    ];
    if let Some(oldest) = queue.peek() {
        lines.push(format!(
            "- oldest: {} {} ({})",
            oldest.kind,
            oldest.id,
            oldest.timestamp.to_rfc3339()
        ));
    }
    lines
}

/// Exits non-zero when events are left behind.
pub(crate) async fn drain(config: &AppConfig) -> Result<ExitCode> {
    config.validate()?;
    let report = tagrelay_runtime::drain_once(config).await?;
    println!(
        "delivered {}, dropped {}, remaining {}",
        report.delivered, report.dropped, report.remaining
    );
    Ok(if report.remaining == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
