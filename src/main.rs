//! Workflow Monitor CLI
//!
//! Observes one workflow run: tails the local process's stdout (when a
//! command is given) and polls the persistent store, printing the merged
//! activity log.

// Allow pedantic clippy warnings that don't add value for this codebase
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::manual_let_else)]
#![allow(clippy::default_trait_access)]

use mimalloc::MiMalloc;

/// Global allocator for improved performance (M-MIMALLOC-APPS).
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::process::Stdio;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use dotenvy::dotenv;
use futures::StreamExt;
use tokio::io::BufReader;
use tokio::process::{Child, Command};
use tracing::info;
use uuid::Uuid;

use workflow_monitor::clock::{SharedClock, SystemClock};
use workflow_monitor::config::{AppConfig, Cli};
use workflow_monitor::display::{DisplayEntry, EntryStatus, format_duration_ms};
use workflow_monitor::{WorkflowMonitor, store, telemetry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env (if present)
    let _ = dotenv();

    let cli = Cli::parse();
    let config = AppConfig::from_cli(&cli).context("failed to load configuration")?;
    telemetry::init(&config.telemetry);

    let correlation_id = cli
        .correlation_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let clock: SharedClock = Arc::new(SystemClock);
    let store = store::from_config(&config.store, Arc::clone(&clock))
        .context("failed to open event store")?;

    info!(
        name: "monitor.started",
        correlation_id = %correlation_id,
        provider = %config.store.provider,
        table = %config.store.table_name,
        region = %config.store.region,
        "Observing workflow run"
    );

    let monitor = WorkflowMonitor::from_config(store, &config, clock);
    let mut entries = std::pin::pin!(monitor.subscribe_entries());
    let mut errors = std::pin::pin!(monitor.subscribe_errors());
    monitor
        .observe(correlation_id.as_str())
        .context("failed to start observing")?;

    let mut child = match &cli.command {
        Some(program) => Some(spawn_workflow(
            &monitor,
            program,
            &cli.command_args,
            &correlation_id,
        )?),
        None => None,
    };

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            entry = entries.next() => {
                let Some(entry) = entry else { break };
                print_entry(&entry);
                if monitor.is_terminal() {
                    break;
                }
            }
            error = errors.next() => {
                if let Some(error) = error {
                    let retry_ms = u64::try_from(error.retry_in.as_millis()).unwrap_or(u64::MAX);
                    eprintln!(
                        "poll failed ({} in a row), retrying in {}: {}",
                        error.consecutive_failures,
                        format_duration_ms(retry_ms),
                        error.message
                    );
                }
            }
        }
    }

    print_summary(&monitor);
    monitor.dispose();

    if let Some(child) = child.as_mut() {
        if let Err(e) = child.kill().await {
            tracing::debug!(error = %e, "Workflow process already exited");
        }
    }
    Ok(())
}

fn spawn_workflow(
    monitor: &WorkflowMonitor,
    program: &str,
    args: &[String],
    correlation_id: &str,
) -> anyhow::Result<Child> {
    let mut child = Command::new(program)
        .args(args)
        .env("CORRELATION_ID", correlation_id)
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("failed to spawn workflow command '{program}'"))?;

    let stdout = child
        .stdout
        .take()
        .context("workflow command has no stdout")?;
    monitor.attach_realtime(BufReader::new(stdout));
    info!(program = %program, "Tailing workflow process output");
    Ok(child)
}

fn print_entry(entry: &DisplayEntry) {
    let time = chrono::DateTime::from_timestamp_millis(entry.timestamp())
        .map(|t| t.format("%H:%M:%S%.3f").to_string())
        .unwrap_or_else(|| entry.timestamp().to_string());
    let marker = match entry.status() {
        EntryStatus::Neutral => "·",
        EntryStatus::Success => "✓",
        EntryStatus::Error => "✗",
    };
    println!("{time} {marker} [{}] {}", entry.actor_name(), entry.summary());
}

fn print_summary(monitor: &WorkflowMonitor) {
    let turns = monitor.turns();
    if !turns.is_empty() {
        println!();
        println!("Turns:");
        for attributed in &turns {
            let span = match attributed.turn.end_timestamp {
                Some(end) => format_duration_ms(
                    u64::try_from(end - attributed.turn.start_timestamp).unwrap_or(0),
                ),
                None => "open".to_string(),
            };
            println!("  {} ({span})", attributed.turn.actor_name);
            for paired in &attributed.operations {
                let duration = paired
                    .duration_ms
                    .map(format_duration_ms)
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "    {} → {} [{:?}] {duration}",
                    paired.operation.subject, paired.operation.action, paired.operation.status
                );
            }
        }
    }

    let shared = monitor.shared_tools();
    if !shared.is_empty() {
        println!();
        println!("Shared tools:");
        for usage in shared {
            let actors: Vec<&str> = usage.actors.iter().map(String::as_str).collect();
            println!(
                "  {} ({} calls, {} failed) used by {}",
                usage.label(),
                usage.invocations,
                usage.failures,
                actors.join(", ")
            );
        }
    }
}
