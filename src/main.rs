//! CLI entry point for workshop-dl.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};
use workshop_dl::{
    CliInstanceRunner, Config, Event, PassController, load_failed_ids, load_identifiers,
    run_with_shutdown, write_outputs,
};

mod cli;

use cli::Args;

/// Exit code for configuration and pre-flight failures
const EXIT_FATAL: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(args.default_log_level()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    debug!(?args, "CLI arguments parsed");

    match run(args).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("{e:#}");
            ExitCode::from(EXIT_FATAL)
        }
    }
}

async fn run(args: Args) -> Result<u8> {
    let mut config = match &args.config {
        Some(path) => Config::from_json_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => Config::default(),
    };
    args.apply(&mut config);
    config.validate()?;

    // Pre-flight
    let runner = CliInstanceRunner::from_config(&config.tool)?;
    info!(binary = %runner.binary_path().display(), "using steamcmd");
    if !args.ids.is_file() {
        bail!("item list {} not found", args.ids.display());
    }
    let ids = load_identifiers(&args.ids).await?;
    if ids.is_empty() {
        bail!("no workshop IDs found in {}", args.ids.display());
    }
    info!(count = ids.len(), source = %args.ids.display(), "loaded unique workshop IDs");

    let previously_failed = load_failed_ids(&config.layout.failed_ids_file).await?;
    if !previously_failed.is_empty() {
        info!(
            count = previously_failed.len(),
            only_failed = config.run.only_previously_failed,
            "previously failed IDs found"
        );
    }

    let report_file = config.layout.report_file.clone();
    let failed_ids_file = config.layout.failed_ids_file.clone();
    let log_dir = config.layout.log_dir.clone();

    let controller = PassController::new(config, Arc::new(runner))?;
    let logger = tokio::spawn(log_events(controller.subscribe()));

    let summary = run_with_shutdown(&controller, &ids, &previously_failed).await?;
    // the event channel closes once the controller is gone
    drop(controller);
    if let Err(e) = logger.await {
        warn!(error = %e, "event logger failed");
    }

    write_outputs(&summary, &report_file, &failed_ids_file).await?;

    let c = &summary.counts;
    info!(
        success = c.success,
        skipped = c.skipped,
        failed = c.failed(),
        timeout = c.timeout,
        error = c.generic_error,
        rate_limited = c.rate_limited,
        lock_failed = c.lock_contended,
        validation_failed = c.validation_failed,
        elapsed_secs = summary.elapsed_secs,
        "Download complete"
    );
    if summary.has_failures() {
        warn!(
            count = summary.failed.len(),
            file = %failed_ids_file.display(),
            "failed IDs written"
        );
    }
    info!(
        report = %report_file.display(),
        logs = %log_dir.display(),
        cancelled = summary.cancelled,
        "report written"
    );

    Ok(u8::try_from(summary.exit_code()).unwrap_or(1))
}

async fn log_events(mut events: tokio::sync::broadcast::Receiver<Event>) {
    let mut last_processed = None;
    loop {
        match events.recv().await {
            Ok(Event::Progress {
                pass,
                processed,
                total,
                counts,
            }) => {
                if last_processed != Some(processed) {
                    last_processed = Some(processed);
                    info!(
                        pass,
                        processed,
                        total,
                        success = counts.success,
                        failed = counts.failed(),
                        "progress"
                    );
                }
            }
            Ok(event) => debug!(?event, "event"),
            Err(RecvError::Lagged(skipped)) => debug!(skipped, "event logger lagged"),
            Err(RecvError::Closed) => break,
        }
    }
}
