//! Ordered line rules for steamcmd output
//!
//! Line shapes seen in practice:
//!
//! ```text
//! [AppID 252490] Download item 3511955902 result : Locking Failed
//! [AppID 252490] Download item 492051023 result : Failure
//! [AppID 252490] Update canceled: Staged file validation failed (13 missing...)
//! [AppID 252490] Update canceled: Failed to write patch state file (File locked)
//! Success. Downloaded item 1234567 to "..." (1048576 bytes)
//! ERROR! Download item 1234567 failed (Timeout).
//! Timeout downloading item 1234567
//! ```
//!
//! [`RULES`] is evaluated top to bottom and the first match consumes the line,
//! so the table order is the precedence order.

use crate::types::{ItemId, Outcome, Signals};
use regex::{Captures, Regex};
use std::sync::LazyLock;

/// How a matched line counts toward the per-instance tallies
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Tally {
    Success,
    Failure,
    None,
}

/// What a single log line says
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Verdict {
    /// The line names an item
    Item {
        id: ItemId,
        outcome: Outcome,
        signals: Signals,
        tally: Tally,
        /// Whether later contextless lines refer to this item
        sets_context: bool,
    },
    /// The line carries no item id and applies to the last item seen
    Contextless { outcome: Outcome, signals: Signals },
    /// The line only raises process-wide signals
    Signal(Signals),
}

/// One entry of the precedence table
pub(crate) struct Rule {
    pub(crate) name: &'static str,
    regex: Regex,
    interpret: fn(&Captures<'_>) -> Verdict,
}

impl Rule {
    fn new(name: &'static str, pattern: &str, interpret: fn(&Captures<'_>) -> Verdict) -> Self {
        #[allow(clippy::expect_used)]
        let regex = Regex::new(pattern).expect("classifier regex is valid"); // Static pattern, safe to panic
        Self {
            name,
            regex,
            interpret,
        }
    }

    fn apply(&self, line: &str) -> Option<Verdict> {
        self.regex.captures(line).map(|caps| (self.interpret)(&caps))
    }
}

const RATE_LIMIT: Signals = Signals {
    rate_limited: true,
    timed_out: false,
    lock_contended: false,
    validation_failed: false,
};

const TIMEOUT: Signals = Signals {
    rate_limited: false,
    timed_out: true,
    lock_contended: false,
    validation_failed: false,
};

const LOCK: Signals = Signals {
    rate_limited: false,
    timed_out: false,
    lock_contended: true,
    validation_failed: false,
};

const VALIDATION: Signals = Signals {
    rate_limited: false,
    timed_out: false,
    lock_contended: false,
    validation_failed: true,
};

const NONE: Signals = Signals {
    rate_limited: false,
    timed_out: false,
    lock_contended: false,
    validation_failed: false,
};

fn capture<'h>(caps: &Captures<'h>, group: usize) -> &'h str {
    caps.get(group).map_or("", |m| m.as_str()).trim()
}

fn mentions_rate(reason: &str) -> bool {
    reason.contains("rate") || reason.contains("Rate")
}

/// Reason of a `result :` line
fn result_reason(reason: &str) -> (Outcome, Signals) {
    if reason == "OK" || reason.contains("Success") {
        (Outcome::Success, NONE)
    } else if reason.contains("Locking Failed") || reason.contains("locked") {
        (Outcome::LockContended, LOCK)
    } else if reason.contains("Timeout") {
        (Outcome::Timeout, TIMEOUT)
    } else if mentions_rate(reason) {
        (Outcome::RateLimited, RATE_LIMIT)
    } else {
        (Outcome::GenericError, NONE)
    }
}

/// Reason in parentheses of an `ERROR!` line
fn error_reason(reason: &str) -> (Outcome, Signals) {
    if reason.contains("Timeout") {
        (Outcome::Timeout, TIMEOUT)
    } else if mentions_rate(reason) {
        (Outcome::RateLimited, RATE_LIMIT)
    } else {
        (Outcome::GenericError, NONE)
    }
}

fn tally_for(outcome: Outcome) -> Tally {
    if outcome == Outcome::Success {
        Tally::Success
    } else {
        Tally::Failure
    }
}

fn result_line(caps: &Captures<'_>) -> Verdict {
    let (outcome, signals) = result_reason(capture(caps, 2));
    Verdict::Item {
        id: ItemId::from(capture(caps, 1)),
        outcome,
        signals,
        tally: tally_for(outcome),
        sets_context: true,
    }
}

fn staged_validation_with_item(caps: &Captures<'_>) -> Verdict {
    Verdict::Item {
        id: ItemId::from(capture(caps, 1)),
        outcome: Outcome::ValidationFailed,
        signals: VALIDATION,
        tally: Tally::None,
        sets_context: false,
    }
}

fn staged_validation(_: &Captures<'_>) -> Verdict {
    Verdict::Contextless {
        outcome: Outcome::ValidationFailed,
        signals: VALIDATION,
    }
}

fn patch_state_lock(_: &Captures<'_>) -> Verdict {
    Verdict::Contextless {
        outcome: Outcome::LockContended,
        signals: LOCK,
    }
}

fn success_line(caps: &Captures<'_>) -> Verdict {
    Verdict::Item {
        id: ItemId::from(capture(caps, 1)),
        outcome: Outcome::Success,
        signals: NONE,
        tally: Tally::Success,
        sets_context: true,
    }
}

fn error_line(caps: &Captures<'_>) -> Verdict {
    let (outcome, signals) = error_reason(capture(caps, 2));
    Verdict::Item {
        id: ItemId::from(capture(caps, 1)),
        outcome,
        signals,
        tally: Tally::Failure,
        sets_context: true,
    }
}

fn timeout_line(caps: &Captures<'_>) -> Verdict {
    Verdict::Item {
        id: ItemId::from(capture(caps, 1)),
        outcome: Outcome::Timeout,
        signals: TIMEOUT,
        tally: Tally::Failure,
        sets_context: true,
    }
}

fn rate_limit_keyword(_: &Captures<'_>) -> Verdict {
    Verdict::Signal(RATE_LIMIT)
}

/// Precedence table, most specific first
pub(crate) static RULES: LazyLock<Vec<Rule>> = LazyLock::new(|| {
    vec![
        Rule::new(
            "item-result",
            r"\[AppID \d+\] Download item (\d+) result : (.+)",
            result_line,
        ),
        Rule::new(
            "staged-validation-item",
            r"(?i)Staged file validation failed.*?item (\d+)",
            staged_validation_with_item,
        ),
        Rule::new(
            "staged-validation",
            r"Staged file validation failed|Missing update files",
            staged_validation,
        ),
        Rule::new(
            "patch-state-lock",
            r"(?i)Failed to write patch state file \(File locked\)",
            patch_state_lock,
        ),
        Rule::new(
            "download-success",
            r"Success\. Downloaded item (\d+)",
            success_line,
        ),
        Rule::new(
            "download-error",
            r"ERROR! Download item (\d+) failed \(([^)]+)\)",
            error_line,
        ),
        Rule::new(
            "download-timeout",
            r"Timeout downloading item (\d+)",
            timeout_line,
        ),
        Rule::new(
            "rate-limit-keyword",
            r"(?i)rate.?limit|too many requests|throttled",
            rate_limit_keyword,
        ),
    ]
});

/// First rule matching `line`, with its verdict
pub(crate) fn match_line(line: &str) -> Option<(&'static str, Verdict)> {
    RULES
        .iter()
        .find_map(|rule| rule.apply(line).map(|verdict| (rule.name, verdict)))
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn rule_name(line: &str) -> Option<&'static str> {
        match_line(line).map(|(name, _)| name)
    }

    #[test]
    fn every_documented_line_shape_hits_its_rule() {
        let cases = [
            (
                "[AppID 252490] Download item 3511955902 result : Locking Failed",
                "item-result",
            ),
            (
                "[AppID 252490] Update canceled: Staged file validation failed for item 492051023",
                "staged-validation-item",
            ),
            (
                "[AppID 252490] Update canceled: Staged file validation failed (13 missing, 0 mismatch)",
                "staged-validation",
            ),
            ("Missing update files", "staged-validation"),
            (
                "[AppID 252490] Update canceled: Failed to write patch state file (File locked)",
                "patch-state-lock",
            ),
            (
                "Success. Downloaded item 1234567 to \"/x\" (5 bytes)",
                "download-success",
            ),
            (
                "ERROR! Download item 1234567 failed (Timeout).",
                "download-error",
            ),
            ("Timeout downloading item 1234567", "download-timeout"),
            ("HTTP 429 Too Many Requests", "rate-limit-keyword"),
            ("server throttled the connection", "rate-limit-keyword"),
        ];
        for (line, expected) in cases {
            assert_eq!(rule_name(line), Some(expected), "line: {line}");
        }
    }

    #[test]
    fn capture_trims_and_defaults_missing_groups() {
        let re = Regex::new(r"item (\d+)( extra)?:(.*)").unwrap();
        let caps = re.captures("item 42:  Locking Failed  ").unwrap();
        assert_eq!(capture(&caps, 1), "42");
        assert_eq!(capture(&caps, 2), "", "unmatched optional group");
        assert_eq!(capture(&caps, 3), "Locking Failed");
    }

    #[test]
    fn unrelated_lines_do_not_match() {
        assert_eq!(rule_name("Loading Steam API...OK"), None);
        assert_eq!(rule_name("Logging in user 'anonymous' to Steam Public...OK"), None);
        assert_eq!(rule_name(""), None);
    }

    #[test]
    fn result_line_beats_rate_keyword_on_the_same_line() {
        let (_, verdict) =
            match_line("[AppID 252490] Download item 1234567 result : Rate Limit Exceeded").unwrap();
        match verdict {
            Verdict::Item {
                outcome, signals, ..
            } => {
                assert_eq!(outcome, Outcome::RateLimited);
                assert!(signals.rate_limited);
            }
            other => panic!("expected item verdict, got {other:?}"),
        }
    }

    #[test]
    fn result_reasons_map_to_outcomes() {
        let cases = [
            ("OK", Outcome::Success),
            ("Success", Outcome::Success),
            ("Locking Failed", Outcome::LockContended),
            ("file locked", Outcome::LockContended),
            ("Timeout", Outcome::Timeout),
            ("rate limited", Outcome::RateLimited),
            ("Failure", Outcome::GenericError),
            ("No Connection", Outcome::GenericError),
        ];
        for (reason, expected) in cases {
            assert_eq!(result_reason(reason).0, expected, "reason: {reason}");
        }
    }

    #[test]
    fn error_reasons_ignore_lock_wording() {
        // ERROR! lines only distinguish timeouts and throttling
        assert_eq!(error_reason("Timeout").0, Outcome::Timeout);
        assert_eq!(error_reason("Rate Limit").0, Outcome::RateLimited);
        assert_eq!(error_reason("Locking Failed").0, Outcome::GenericError);
    }

    #[test]
    fn trailing_carriage_return_is_trimmed_from_reason() {
        let (_, verdict) =
            match_line("[AppID 252490] Download item 1234567 result : OK\r").unwrap();
        assert!(matches!(
            verdict,
            Verdict::Item {
                outcome: Outcome::Success,
                ..
            }
        ));
    }
}
