//! # workshop-dl
//!
//! Concurrent Steam Workshop downloader built on isolated steamcmd instances.
//!
//! ## How a run works
//!
//! - The item list is split into contiguous chunks, one per worker slot
//! - Every slot owns its own steamcmd install root, so instances never fight
//!   over patch-state or lock files
//! - Each instance's log is classified into per-item outcomes
//! - Finished items are moved into one shared destination; the filesystem,
//!   not the log, decides what succeeded
//! - Failed items are retried over a bounded number of passes with fewer
//!   instances, backing off when Steam throttles
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use workshop_dl::{CliInstanceRunner, Config, PassController, load_identifiers};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::default();
//!     let runner = Arc::new(CliInstanceRunner::from_config(&config.tool)?);
//!     let controller = PassController::new(config, runner)?;
//!
//!     // Subscribe to events
//!     let mut events = controller.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     let ids = load_identifiers("ImportedSkins.json".as_ref()).await?;
//!     let summary = controller.run(&ids, &[]).await?;
//!     println!("{} failed", summary.failed.len());
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Log classification
pub mod classifier;
/// Configuration types
pub mod config;
/// Pass orchestration
pub mod controller;
/// Error types
pub mod error;
/// Per-slot isolation directories
pub mod isolation;
/// Item lists
pub mod item_source;
/// Chunking of the work set
pub mod partition;
/// Moving results into the shared destination
pub mod reconcile;
/// Run summary and report
pub mod report;
/// Backoff between retry passes
pub mod retry;
/// Shared result store
pub mod store;
/// External tool instances
pub mod tool;
/// Core types and events
pub mod types;
/// Instance worker
pub mod worker;

// Re-export commonly used types
pub use classifier::{ClassifiedLog, classify};
pub use config::{Config, LayoutConfig, RetryConfig, RunConfig, ToolConfig};
pub use controller::PassController;
pub use error::{Error, Result};
pub use item_source::{load_failed_ids, load_identifiers, write_failed_ids};
pub use report::{RunSummary, render_report, write_outputs};
pub use store::ResultStore;
pub use tool::{CliInstanceRunner, InstanceRunner};
pub use types::{Event, ItemId, Outcome, OutcomeCounts, Signals};

use tracing::warn;

/// Run the controller until it finishes or a shutdown signal arrives
///
/// On SIGTERM or SIGINT (Ctrl+C on Windows) the run is cancelled: running
/// instances are killed, no further pass starts, and the summary of what
/// finished so far is returned with `cancelled` set.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use workshop_dl::{CliInstanceRunner, Config, PassController, run_with_shutdown};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = Config::default();
///     let runner = Arc::new(CliInstanceRunner::from_config(&config.tool)?);
///     let controller = PassController::new(config, runner)?;
///     let ids = workshop_dl::load_identifiers("ImportedSkins.json".as_ref()).await?;
///
///     let summary = run_with_shutdown(&controller, &ids, &[]).await?;
///     std::process::exit(summary.exit_code());
/// }
/// ```
pub async fn run_with_shutdown(
    controller: &PassController,
    ids: &[ItemId],
    previously_failed: &[ItemId],
) -> Result<RunSummary> {
    let token = controller.cancellation_token();
    let watcher = tokio::spawn(async move {
        wait_for_signal().await;
        warn!("shutdown requested, stopping running instances");
        token.cancel();
    });

    let result = controller.run(ids, previously_failed).await;
    watcher.abort();
    result
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Set up signal handlers - these may fail in restricted environments (containers, tests)
    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM signal");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT signal (Ctrl+C)");
                }
            }
        }
        (Err(e), _) | (_, Err(e)) => {
            tracing::warn!(error = %e, "Could not register signal handlers, using ctrl_c fallback");
            tokio::signal::ctrl_c().await.ok();
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received Ctrl+C signal");
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
        }
    }
}
