//! Run summary and the text report rendered from it

use crate::error::Result;
use crate::item_source::write_failed_ids;
use crate::types::{ItemId, Outcome, OutcomeCounts};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::Path;

/// An item that did not end up in the shared destination
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedItem {
    /// Item ID
    pub id: ItemId,
    /// Last outcome; `Unknown` if the run was cancelled before it was judged
    pub outcome: Outcome,
}

/// A success claim that never materialized
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscrepancyRecord {
    /// Item ID
    pub id: ItemId,
    /// Pass in which the claim was made
    pub pass: u32,
}

/// Everything a caller needs to know once a run is over
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunSummary {
    /// When the run started
    pub started_at: DateTime<Utc>,
    /// Unique IDs read from the item source
    pub total_ids: usize,
    /// IDs dispatched to pass 1 (the rest were skipped)
    pub dispatched: usize,
    /// Final counters
    pub counts: OutcomeCounts,
    /// Items not settled at the end of the run, in source order
    pub failed: Vec<FailedItem>,
    /// Every success claim contradicted by the filesystem
    pub discrepancies: Vec<DiscrepancyRecord>,
    /// Passes executed
    pub passes: u32,
    /// Wall-clock duration in seconds
    pub elapsed_secs: u64,
    /// The run was stopped before it could finish
    pub cancelled: bool,
}

impl RunSummary {
    /// Whether any item still needs a retry
    pub fn has_failures(&self) -> bool {
        !self.failed.is_empty()
    }

    /// Process exit code: 0 when everything settled, 1 when failures remain
    pub fn exit_code(&self) -> i32 {
        i32::from(self.has_failures())
    }

    /// IDs for the persisted retry list
    pub fn failed_ids(&self) -> Vec<ItemId> {
        self.failed.iter().map(|f| f.id.clone()).collect()
    }
}

/// Render the human-readable report
pub fn render_report(summary: &RunSummary) -> String {
    let c = &summary.counts;
    let mut out = String::new();
    // writing to a String cannot fail
    let _ = writeln!(out, "=== Workshop Download Report ===");
    let _ = writeln!(
        out,
        "Date:                {}",
        summary.started_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    let _ = writeln!(out);
    let _ = writeln!(out, "Total IDs:           {}", summary.total_ids);
    let _ = writeln!(out, "Skipped:             {}", c.skipped);
    let _ = writeln!(out, "Success:             {}", c.success);
    let _ = writeln!(out, "Failed (total):      {}", c.failed());
    for outcome in [
        Outcome::Timeout,
        Outcome::GenericError,
        Outcome::RateLimited,
        Outcome::LockContended,
        Outcome::ValidationFailed,
    ] {
        let label = format!("{}:", outcome.label());
        let _ = writeln!(out, "  {label:<18} {}", c.get(outcome));
    }
    let _ = writeln!(out, "Passes:              {}", summary.passes);
    let _ = writeln!(
        out,
        "Elapsed:             {}m {}s",
        summary.elapsed_secs / 60,
        summary.elapsed_secs % 60
    );
    if summary.cancelled {
        let _ = writeln!(out, "Run was cancelled before completion");
    }

    let _ = writeln!(out);
    let _ = writeln!(out, "--- Failed item IDs ---");
    for item in &summary.failed {
        let _ = writeln!(out, "{}  [{}]", item.id, item.outcome.label());
    }

    if !summary.discrepancies.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "--- Reported success, no files found ---");
        for d in &summary.discrepancies {
            let _ = writeln!(out, "{}  (pass {})", d.id, d.pass);
        }
    }
    out
}

/// Write the report and the retry list
pub async fn write_outputs(
    summary: &RunSummary,
    report_file: &Path,
    failed_ids_file: &Path,
) -> Result<()> {
    tokio::fs::write(report_file, render_report(summary)).await?;
    write_failed_ids(failed_ids_file, &summary.failed_ids()).await?;
    Ok(())
}
