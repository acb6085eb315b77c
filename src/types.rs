//! Core types for workshop-dl

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Workshop item identifier (numeric string, 6-12 digits in practice)
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(String);

impl ItemId {
    /// Create a new ItemId
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identifier as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ItemId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ItemId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl AsRef<str> for ItemId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Authoritative per-item result
///
/// `Unknown` only exists between dispatch and reconciliation. `Skipped` is
/// only ever assigned before dispatch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Item is present in the shared destination
    Success,
    /// Not dispatched (already present, or excluded by policy)
    Skipped,
    /// The tool or the instance ran out of time
    Timeout,
    /// Server-side throttling
    RateLimited,
    /// Cross-instance or patch-state file contention
    LockContended,
    /// Staged-file corruption, or claimed success without files
    ValidationFailed,
    /// Failure without a more specific reason
    GenericError,
    /// Dispatched, not yet classified
    Unknown,
}

impl Outcome {
    /// Every outcome that has a counter in the result store, in report order
    pub const COUNTED: [Outcome; 7] = [
        Outcome::Success,
        Outcome::Skipped,
        Outcome::Timeout,
        Outcome::RateLimited,
        Outcome::LockContended,
        Outcome::ValidationFailed,
        Outcome::GenericError,
    ];

    /// Label used in reports and the console summary
    pub fn label(self) -> &'static str {
        match self {
            Outcome::Success => "Success",
            Outcome::Skipped => "Skipped",
            Outcome::Timeout => "Timeout",
            Outcome::RateLimited => "RateLimit",
            Outcome::LockContended => "LockFailed",
            Outcome::ValidationFailed => "ValidationFailed",
            Outcome::GenericError => "Error",
            Outcome::Unknown => "Unknown",
        }
    }

    /// Counter slot in the result store, `None` for `Unknown`
    pub(crate) fn counter_index(self) -> Option<usize> {
        Outcome::COUNTED.iter().position(|o| *o == self)
    }

    /// Whether the item is finished and must not be retried
    pub fn is_settled(self) -> bool {
        matches!(self, Outcome::Success | Outcome::Skipped)
    }

    /// Whether the item counts as a failure in the summary
    pub fn is_failure(self) -> bool {
        !self.is_settled() && self != Outcome::Unknown
    }

    /// Whether a contextless log line may still refine this outcome
    pub fn is_refinable(self) -> bool {
        matches!(self, Outcome::GenericError | Outcome::Unknown)
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Process-wide signals raised by one instance's log or lifecycle
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signals {
    /// Throttling detected somewhere in the output
    pub rate_limited: bool,
    /// A timeout was reported by the tool or enforced by the worker
    pub timed_out: bool,
    /// A lock-contention failure was reported
    pub lock_contended: bool,
    /// A staged-file validation failure was reported
    pub validation_failed: bool,
}

impl Signals {
    /// Merge another set of signals into this one
    pub fn merge(&mut self, other: Signals) {
        self.rate_limited |= other.rate_limited;
        self.timed_out |= other.timed_out;
        self.lock_contended |= other.lock_contended;
        self.validation_failed |= other.validation_failed;
    }

    /// Whether any signal fired
    pub fn any(&self) -> bool {
        self.rate_limited || self.timed_out || self.lock_contended || self.validation_failed
    }
}

/// Point-in-time copy of the result store counters
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeCounts {
    /// Items in the shared destination
    pub success: usize,
    /// Items not dispatched
    pub skipped: usize,
    /// Timed out items
    pub timeout: usize,
    /// Rate-limited items
    pub rate_limited: usize,
    /// Lock-contended items
    pub lock_contended: usize,
    /// Validation failures
    pub validation_failed: usize,
    /// Unclassified failures
    pub generic_error: usize,
}

impl OutcomeCounts {
    /// Build from counters laid out in [`Outcome::COUNTED`] order
    pub(crate) fn from_array(values: [usize; 7]) -> Self {
        let [success, skipped, timeout, rate_limited, lock_contended, validation_failed, generic_error] =
            values;
        Self {
            success,
            skipped,
            timeout,
            rate_limited,
            lock_contended,
            validation_failed,
            generic_error,
        }
    }

    /// Count for a single outcome (`Unknown` always reads 0)
    pub fn get(&self, outcome: Outcome) -> usize {
        match outcome {
            Outcome::Success => self.success,
            Outcome::Skipped => self.skipped,
            Outcome::Timeout => self.timeout,
            Outcome::RateLimited => self.rate_limited,
            Outcome::LockContended => self.lock_contended,
            Outcome::ValidationFailed => self.validation_failed,
            Outcome::GenericError => self.generic_error,
            Outcome::Unknown => 0,
        }
    }

    /// Sum of all failure categories
    pub fn failed(&self) -> usize {
        self.timeout
            + self.rate_limited
            + self.lock_contended
            + self.validation_failed
            + self.generic_error
    }

    /// Items with any non-`Unknown` outcome
    pub fn total(&self) -> usize {
        self.success + self.skipped + self.failed()
    }
}

/// Event emitted during a run
///
/// Subscribers get every event through a broadcast channel; a lagging
/// subscriber loses events but never slows the engine down.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A pass is about to dispatch its chunks
    PassStarted {
        /// Pass number, starting at 1
        pass: u32,
        /// Total passes allowed
        total_passes: u32,
        /// Items dispatched in this pass
        items: usize,
        /// Instances used in this pass
        instances: usize,
    },

    /// A tool instance was spawned
    WorkerStarted {
        /// Pass number
        pass: u32,
        /// Worker slot
        slot: usize,
        /// Items in the chunk
        items: usize,
        /// Log file receiving the tool output
        log_path: PathBuf,
    },

    /// A tool instance ended and its chunk was reconciled
    WorkerFinished {
        /// Pass number
        pass: u32,
        /// Worker slot
        slot: usize,
        /// Whether the worker had to kill the instance
        hard_timeout: bool,
        /// Signals raised by the instance
        signals: Signals,
        /// Wall-clock run time of the instance
        #[serde(with = "crate::config::duration_millis_serde")]
        elapsed: Duration,
    },

    /// A chunk could not be started and stays pending for the next pass
    ChunkAbandoned {
        /// Pass number
        pass: u32,
        /// Worker slot
        slot: usize,
        /// Items left `Unknown`
        items: usize,
        /// Why the chunk was abandoned
        error: String,
    },

    /// An item received its authoritative outcome for this pass
    ItemFinalized {
        /// Item ID
        id: ItemId,
        /// Final outcome
        outcome: Outcome,
    },

    /// The tool claimed success but no files materialized
    Discrepancy {
        /// Item ID
        id: ItemId,
        /// Pass number
        pass: u32,
    },

    /// Sleeping before a retry pass because of throttling
    RateLimitBackoff {
        /// Delay before the next pass
        #[serde(with = "crate::config::duration_millis_serde")]
        delay: Duration,
    },

    /// Periodic sample of the result store
    Progress {
        /// Pass number
        pass: u32,
        /// Items of this pass that already have a final outcome
        processed: usize,
        /// Items dispatched in this pass
        total: usize,
        /// Counter snapshot
        counts: OutcomeCounts,
    },

    /// A pass finished reconciling
    PassFinished {
        /// Pass number
        pass: u32,
        /// Items that still need a retry
        remaining: usize,
        /// Merged signals of every instance in the pass
        signals: Signals,
    },

    /// The run is over
    RunFinished {
        /// Final counter snapshot
        counts: OutcomeCounts,
        /// Passes executed
        passes: u32,
    },
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_has_no_counter() {
        assert_eq!(Outcome::Unknown.counter_index(), None);
        for (i, outcome) in Outcome::COUNTED.iter().enumerate() {
            assert_eq!(outcome.counter_index(), Some(i));
        }
    }

    #[test]
    fn settled_and_failure_partition_the_counted_outcomes() {
        for outcome in Outcome::COUNTED {
            assert_ne!(
                outcome.is_settled(),
                outcome.is_failure(),
                "{outcome:?} must be exactly one of settled/failure"
            );
        }
        assert!(!Outcome::Unknown.is_settled());
        assert!(!Outcome::Unknown.is_failure());
    }

    #[test]
    fn only_generic_and_unknown_are_refinable() {
        let refinable: Vec<_> = [Outcome::Unknown]
            .into_iter()
            .chain(Outcome::COUNTED)
            .filter(|o| o.is_refinable())
            .collect();
        assert_eq!(refinable, vec![Outcome::Unknown, Outcome::GenericError]);
    }

    #[test]
    fn labels_match_report_vocabulary() {
        assert_eq!(Outcome::LockContended.label(), "LockFailed");
        assert_eq!(Outcome::RateLimited.label(), "RateLimit");
        assert_eq!(Outcome::GenericError.to_string(), "Error");
    }

    #[test]
    fn counts_totals() {
        let counts = OutcomeCounts::from_array([5, 2, 1, 1, 1, 1, 1]);
        assert_eq!(counts.failed(), 5);
        assert_eq!(counts.total(), 12);
        assert_eq!(counts.get(Outcome::Skipped), 2);
        assert_eq!(counts.get(Outcome::Unknown), 0);
    }

    #[test]
    fn signals_merge_is_a_union() {
        let mut a = Signals {
            rate_limited: true,
            ..Default::default()
        };
        assert!(a.any());
        a.merge(Signals {
            lock_contended: true,
            ..Default::default()
        });
        assert!(a.rate_limited && a.lock_contended);
        assert!(!a.timed_out && !a.validation_failed);
        assert!(!Signals::default().any());
    }

    #[test]
    fn event_serializes_with_type_tag() {
        let event = Event::Discrepancy {
            id: ItemId::from("1234567"),
            pass: 2,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "discrepancy");
        assert_eq!(json["id"], "1234567");
    }

    #[test]
    fn event_durations_serialize_as_milliseconds() {
        let event = Event::RateLimitBackoff {
            delay: Duration::from_secs(90),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "rate_limit_backoff");
        assert_eq!(json["delay"], 90_000);

        let back: Event = serde_json::from_value(json).unwrap();
        assert!(matches!(back, Event::RateLimitBackoff { delay } if delay == Duration::from_secs(90)));
    }
}
