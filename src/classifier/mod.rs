//! Outcome classification of captured tool output
//!
//! A pure pass over one finished instance's log. The result is advisory:
//! [`reconcile`](crate::reconcile) has the final word based on what actually
//! landed on disk.
//!
//! ## Contextless lines
//!
//! Some failure lines carry no item id. They are attributed to the last item
//! id seen in the log, but only if that item is still `Unknown` or
//! `GenericError`, so a late generic line never clobbers an earlier specific
//! classification. When the last-seen item already finished and the failure
//! actually belongs to the next item, the failure is misattributed; this is a
//! known limitation of the log format.

mod rules;

use crate::types::{ItemId, Outcome, Signals};
use rules::{Tally, Verdict};
use std::collections::HashMap;
use std::path::Path;
use tracing::{trace, warn};

/// Classification of one instance's log
#[must_use]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassifiedLog {
    /// Outcome per chunk item; items never mentioned stay `Unknown`
    pub per_item: HashMap<ItemId, Outcome>,
    /// Process-wide signals raised anywhere in the log
    pub signals: Signals,
    /// Lines reporting a per-item success
    pub success_lines: usize,
    /// Lines reporting a per-item failure
    pub failure_lines: usize,
}

impl ClassifiedLog {
    fn seeded(chunk: &[ItemId]) -> Self {
        Self {
            per_item: chunk
                .iter()
                .map(|id| (id.clone(), Outcome::Unknown))
                .collect(),
            ..Default::default()
        }
    }

    /// Classified outcome of an item, `Unknown` if it is not part of the chunk
    pub fn outcome(&self, id: &ItemId) -> Outcome {
        self.per_item.get(id).copied().unwrap_or(Outcome::Unknown)
    }
}

/// Classify a captured log against the chunk it was produced for
///
/// Lines naming items outside the chunk still raise signals and move the
/// last-seen context, but never add entries to the per-item map.
pub fn classify(log: &str, chunk: &[ItemId]) -> ClassifiedLog {
    let mut result = ClassifiedLog::seeded(chunk);
    let mut last_seen: Option<ItemId> = None;

    for line in log.lines() {
        let Some((rule, verdict)) = rules::match_line(line) else {
            continue;
        };
        trace!(rule, line, "classifier match");

        match verdict {
            Verdict::Item {
                id,
                outcome,
                signals,
                tally,
                sets_context,
            } => {
                result.signals.merge(signals);
                match tally {
                    Tally::Success => result.success_lines += 1,
                    Tally::Failure => result.failure_lines += 1,
                    Tally::None => {}
                }
                if let Some(current) = result.per_item.get_mut(&id) {
                    *current = outcome;
                }
                if sets_context {
                    last_seen = Some(id);
                }
            }
            Verdict::Contextless { outcome, signals } => {
                result.signals.merge(signals);
                if let Some(id) = &last_seen
                    && let Some(current) = result.per_item.get_mut(id)
                    && current.is_refinable()
                {
                    *current = outcome;
                }
            }
            Verdict::Signal(signals) => result.signals.merge(signals),
        }
    }

    result
}

/// Read and classify a log file
///
/// steamcmd output is not guaranteed to be UTF-8, so invalid bytes are
/// replaced. An unreadable log classifies every item as `Unknown`.
pub async fn classify_log_file(path: &Path, chunk: &[ItemId]) -> ClassifiedLog {
    match tokio::fs::read(path).await {
        Ok(bytes) => classify(&String::from_utf8_lossy(&bytes), chunk),
        Err(e) => {
            warn!(log = %path.display(), error = %e, "could not open log for classification");
            ClassifiedLog::seeded(chunk)
        }
    }
}
