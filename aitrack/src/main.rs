//! aitrack - capture AI chat pages and deliver them to a signed webhook
//!
//! This tool provides commands for:
//! - Checking delivery configuration and queue status
//! - Capturing single pages or a stream of page visits
//! - Replaying batches that failed to deliver
//! - Clearing the capture history and failure queue
//!
//! Uses XDG Base Directory specification for file locations:
//! - Database: $XDG_DATA_HOME/aitrack/data.db (~/.local/share/aitrack/data.db)
//! - Config: $XDG_CONFIG_HOME/aitrack/config.toml (~/.config/aitrack/config.toml)
//! - Logs: $XDG_STATE_HOME/aitrack/ (~/.local/state/aitrack/)

use std::sync::Arc;
use std::time::Duration;

use aitrack_core::capture::{Connectivity, HttpTransport};
use aitrack_core::classify::classify;
use aitrack_core::config::ConfigFileSettings;
use aitrack_core::{
    CaptureEvent, CapturePipeline, Config, Database, DeliveryOutcome, PipelineOptions, QueueState,
    Submission,
};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};

/// How long shutdown waits for in-progress deliveries
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Captures listed by `status`
const RECENT_CAPTURES: usize = 5;

#[derive(Parser)]
#[command(name = "aitrack")]
#[command(about = "Capture AI chat pages and deliver them to a signed webhook")]
#[command(version)]
struct Args {
    /// Log at debug level instead of the configured level
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show delivery configuration and queue status
    Status,

    /// Capture a single page and deliver it
    Capture {
        /// Page URL
        #[arg(long)]
        url: String,

        /// Page title
        #[arg(long, default_value = "")]
        title: String,

        /// Free-form notes attached to the row
        #[arg(long)]
        notes: Option<String>,
    },

    /// Read page visits from stdin until EOF or Ctrl-C
    ///
    /// Each line is either a JSON capture event or `<url><TAB><title>`.
    /// The lines `online` and `offline` report connectivity changes.
    Watch {
        /// Start in the offline state
        #[arg(long)]
        offline: bool,
    },

    /// Retry every batch in the failure queue now
    Flush,

    /// List batches waiting in the failure queue
    Queue,

    /// Clear the capture history and/or the failure queue
    Clear {
        /// Forget captured pages so they can be sent again
        #[arg(long)]
        captures: bool,

        /// Discard batches waiting in the failure queue
        #[arg(long)]
        failed: bool,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = Config::load().context("failed to load configuration")?;

    // Keep the guard alive for the whole run so buffered logs are flushed
    let level_override = args.verbose.then_some("debug");
    let _log_guard = match aitrack_core::logging::init(&config.logging, level_override) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Warning: file logging disabled: {}", e);
            None
        }
    };

    match args.command {
        Command::Status => cmd_status(&config),
        Command::Capture { url, title, notes } => cmd_capture(&config, &url, &title, notes).await,
        Command::Watch { offline } => cmd_watch(&config, !offline).await,
        Command::Flush => cmd_flush(&config).await,
        Command::Queue => cmd_queue(),
        Command::Clear { captures, failed } => cmd_clear(captures, failed),
    }
}

fn open_database() -> Result<Arc<Database>> {
    let db_path = Config::database_path();
    let db = Database::open(&db_path)
        .with_context(|| format!("failed to open database at {}", db_path.display()))?;
    db.migrate().context("failed to run database migrations")?;
    Ok(Arc::new(db))
}

async fn start_pipeline(config: &Config, connectivity: Connectivity) -> Result<CapturePipeline> {
    let transport =
        HttpTransport::from_config(&config.delivery).context("failed to create HTTP client")?;
    CapturePipeline::start(
        open_database()?,
        Arc::new(ConfigFileSettings::default_path()),
        Arc::new(transport),
        connectivity,
        PipelineOptions::from_config(&config.delivery),
    )
    .await
    .context("failed to start capture pipeline")
}

fn describe_outcome(outcome: &DeliveryOutcome) -> String {
    match outcome {
        DeliveryOutcome::Delivered { batch_id, rows } => {
            format!("Delivered {} row(s) (batch {})", rows, batch_id)
        }
        DeliveryOutcome::Queued { batch_id, error } => {
            format!("Queued batch {} for retry: {}", batch_id, error)
        }
        DeliveryOutcome::Dropped { rows, reason } => {
            format!("Dropped {} row(s): {}", rows, reason)
        }
        DeliveryOutcome::Deferred { rows, reason } => {
            format!("Holding {} row(s) until settings can be read: {}", rows, reason)
        }
    }
}

fn cmd_status(config: &Config) -> Result<()> {
    println!("aitrack Delivery Configuration");
    println!("==============================");
    println!();

    let delivery = &config.delivery;
    let settings = delivery.settings();

    println!(
        "Endpoint:        {}",
        settings.endpoint.as_deref().unwrap_or("<not set>")
    );
    println!(
        "Secret:          {}",
        if settings.secret.is_some() {
            "<set>"
        } else {
            "<not set>"
        }
    );
    println!("Debounce:        {}ms", delivery.debounce_ms);
    println!("Timeout:         {}s", delivery.timeout_secs);
    println!("Max Retries:     {}", delivery.max_retries);
    println!("Backoff Base:    {}ms", delivery.backoff_base_ms);
    let log_dir = Config::state_dir();
    match aitrack_core::logging::latest_log_file(&log_dir) {
        Some(path) => println!("Log File:        {}", path.display()),
        None => println!("Log Directory:   {}", log_dir.display()),
    }

    println!();
    if settings.endpoint.is_some() && settings.secret.is_some() {
        println!("Status: Ready to deliver");
    } else {
        println!("Status: Not ready (missing endpoint or secret)");
        println!();
        println!("Configure delivery in {}:", Config::config_path().display());
        println!();
        println!("  [delivery]");
        println!("  endpoint = \"https://script.google.com/macros/s/XXXX/exec\"");
        println!("  secret = \"shared-hmac-secret\"");
    }

    let db_path = Config::database_path();
    if db_path.exists() {
        let db = open_database()?;
        let stats = db.queue_stats()?;

        println!();
        println!("Captured Pages:  {}", stats.captured_count);
        println!(
            "Failed Batches:  {} ({} row(s))",
            stats.failed_batches, stats.queued_rows
        );
        if stats.in_flight_batches > 0 {
            println!("In Flight:       {}", stats.in_flight_batches);
        }
        if let Some(oldest) = stats
            .oldest_enqueued_at_ms
            .and_then(aitrack_core::millis_to_datetime)
        {
            println!("Oldest Queued:   {}", oldest.format("%Y-%m-%d %H:%M:%S UTC"));
        }
        if let Some(error) = &stats.last_error {
            println!("Last Error:      {}", error);
        }

        let recent = db.recent_captures(RECENT_CAPTURES)?;
        if !recent.is_empty() {
            println!();
            println!("Recent Captures:");
            for (key, record) in &recent {
                let at = aitrack_core::millis_to_datetime(record.captured_at_ms)
                    .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_default();
                println!("  {}  {}  {}", at, key, record.title);
            }
        }

        if stats.failed_batches > 0 {
            println!();
            println!("Run 'aitrack flush' to retry failed batches.");
        }
    }

    Ok(())
}

async fn cmd_capture(
    config: &Config,
    url: &str,
    title: &str,
    notes: Option<String>,
) -> Result<()> {
    let Some(mut event) = classify(url, title) else {
        println!("Not a recognized page: {}", url);
        return Ok(());
    };
    if let Some(notes) = notes {
        event = event.with_notes(notes);
    }

    let pipeline = start_pipeline(config, Connectivity::new(true)).await?;
    pipeline.wait_for_recovery().await;

    println!(
        "{} {} {} \"{}\"",
        event.platform, event.kind, event.id, event.title
    );
    match pipeline.submit(Some(event))? {
        Submission::Queued => match pipeline.flush().await? {
            Some(outcome) => println!("{}", describe_outcome(&outcome)),
            None => println!("Nothing to deliver"),
        },
        Submission::Duplicate => println!("Already captured"),
        Submission::Ignored => println!("Nothing to capture"),
    }

    pipeline.shutdown(SHUTDOWN_GRACE).await;
    Ok(())
}

/// Parse one stdin line into a classifier result
fn parse_watch_line(line: &str) -> Result<Option<CaptureEvent>> {
    if line.starts_with('{') {
        let event: CaptureEvent =
            serde_json::from_str(line).context("invalid capture event JSON")?;
        return Ok(Some(event.normalized()));
    }
    let (url, title) = line.split_once('\t').unwrap_or((line, ""));
    Ok(classify(url.trim(), title))
}

async fn cmd_watch(config: &Config, online: bool) -> Result<()> {
    let pipeline = start_pipeline(config, Connectivity::new(online)).await?;

    let mut outcomes = pipeline.outcomes();
    let printer = tokio::spawn(async move {
        while let Ok(outcome) = outcomes.recv().await {
            println!("{}", describe_outcome(&outcome));
        }
    });

    if let Some(report) = pipeline.wait_for_recovery().await {
        if report.attempted > 0 {
            println!(
                "Recovered {} of {} queued batch(es)",
                report.delivered, report.attempted
            );
        }
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("failed to read stdin")?,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, shutting down");
                None
            }
        };
        let Some(line) = line else { break };
        let line = line.trim();

        match line {
            "" => continue,
            "online" => {
                pipeline.set_online(true);
                continue;
            }
            "offline" => {
                pipeline.set_online(false);
                continue;
            }
            _ => {}
        }

        let event = match parse_watch_line(line) {
            Ok(event) => event,
            Err(e) => {
                eprintln!("Skipping line: {:#}", e);
                continue;
            }
        };
        match pipeline.submit(event) {
            Ok(Submission::Queued) => {}
            Ok(Submission::Duplicate) => println!("Already captured: {}", line),
            Ok(Submission::Ignored) => println!("Not a recognized page: {}", line),
            Err(e) => eprintln!("Capture failed: {}", e),
        }
    }

    pipeline.shutdown(SHUTDOWN_GRACE).await;
    let stats = pipeline.stats();

    // Dropping the pipeline closes the outcome channel and ends the printer
    drop(pipeline);
    let _ = printer.await;

    println!(
        "Sent {} event(s) in {} batch(es); {} failed, {} dropped, {} deferred, {} duplicate(s)",
        stats.events_sent,
        stats.batches_sent,
        stats.batches_failed,
        stats.batches_dropped,
        stats.batches_deferred,
        stats.duplicates
    );
    Ok(())
}

async fn cmd_flush(config: &Config) -> Result<()> {
    if config.delivery.settings().endpoint.is_none() {
        println!("Delivery is not configured. Run 'status' for details.");
        return Ok(());
    }

    let pipeline = start_pipeline(config, Connectivity::new(true)).await?;
    println!("Retrying failed batches...");

    match pipeline.wait_for_recovery().await {
        Some(report) if report.attempted == 0 => println!("Nothing to retry"),
        Some(report) => println!(
            "Delivered {} of {} batch(es), {} still queued",
            report.delivered, report.attempted, report.failed
        ),
        None => println!("Retry did not complete; see logs for details"),
    }

    pipeline.shutdown(SHUTDOWN_GRACE).await;
    Ok(())
}

fn cmd_queue() -> Result<()> {
    let db_path = Config::database_path();
    if !db_path.exists() {
        println!("No queued batches");
        return Ok(());
    }

    let db = open_database()?;
    let batches = db.list_failed_batches(None)?;
    if batches.is_empty() {
        println!("No queued batches");
        return Ok(());
    }

    println!(
        "{:<36}  {:<9}  {:>4}  {:>8}  {:<19}  LAST ERROR",
        "BATCH", "STATE", "ROWS", "ATTEMPTS", "ENQUEUED"
    );
    for batch in &batches {
        let enqueued = batch
            .enqueued_at()
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_default();
        let state = match batch.state {
            QueueState::Failed => "failed",
            QueueState::InFlight => "in flight",
        };
        println!(
            "{:<36}  {:<9}  {:>4}  {:>8}  {:<19}  {}",
            batch.id(),
            state,
            batch.batch().rows.len(),
            batch.attempts,
            enqueued,
            batch.last_error.as_deref().unwrap_or("")
        );
    }

    Ok(())
}

fn cmd_clear(captures: bool, failed: bool) -> Result<()> {
    // No flags means both
    let (captures, failed) = if captures || failed {
        (captures, failed)
    } else {
        (true, true)
    };

    let db = open_database()?;
    if captures {
        let removed = db.clear_captures()?;
        println!("Cleared {} captured page(s)", removed);
    }
    if failed {
        let removed = db.clear_failed_batches()?;
        println!("Cleared {} queued batch(es)", removed);
    }
    Ok(())
}
