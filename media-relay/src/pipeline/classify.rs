//! Maps extractor diagnostic text onto structured failures.
//!
//! Matching is a case-insensitive substring search over an ordered table.
//! Rules are checked top to bottom and the first hit wins, so a message like
//! "Unsupported URL: private playlist" is reported as an unsupported source.

use axum::http::StatusCode;

use crate::error::ErrorKind;

/// One row of the classification table.
struct Rule {
    /// Lowercase fragments; any of them selects this rule.
    fragments: &'static [&'static str],
    kind: ErrorKind,
}

/// Priority-ordered classification table.
const RULES: &[Rule] = &[
    Rule {
        fragments: &["unsupported url"],
        kind: ErrorKind::UnsupportedSource,
    },
    Rule {
        fragments: &["private"],
        kind: ErrorKind::PrivateContent,
    },
    Rule {
        fragments: &["unavailable", "not found"],
        kind: ErrorKind::ContentUnavailable,
    },
    Rule {
        fragments: &["timeout", "timed out"],
        kind: ErrorKind::UpstreamTimeout,
    },
];

/// Message used when the extractor failed without printing anything.
pub const NO_DIAGNOSTICS_MESSAGE: &str = "extractor failed without diagnostic output";

/// Result of classifying a diagnostic text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub kind: ErrorKind,
    pub status: StatusCode,
}

impl Classification {
    fn of(kind: ErrorKind) -> Self {
        Self {
            kind,
            status: kind.status(),
        }
    }
}

/// Classify raw extractor diagnostics. Total: unknown or empty text is an
/// `UpstreamError`.
pub fn classify(diagnostics: &str) -> Classification {
    let haystack = diagnostics.to_lowercase();
    RULES
        .iter()
        .find(|rule| rule.fragments.iter().any(|f| haystack.contains(f)))
        .map(|rule| Classification::of(rule.kind))
        .unwrap_or_else(|| Classification::of(ErrorKind::UpstreamError))
}

/// Build the message reported to clients for a failed extractor run.
pub fn failure_message(diagnostics: &str) -> String {
    let trimmed = diagnostics.trim();
    if trimmed.is_empty() {
        NO_DIAGNOSTICS_MESSAGE.to_string()
    } else {
        trimmed.to_string()
    }
}
