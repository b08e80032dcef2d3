//! Log-text phase classification
//!
//! An ordered rule table evaluated top-down; the first matching rule wins.
//! Several markers accumulate in the same log tail, so table order is the
//! priority order.

use regex::Regex;
use std::sync::LazyLock;

/// Coarse startup stage inferred from backend logs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Startup,
    Migrations,
    MigrationsDone,
    Optimization,
    Ready,
}

/// Result of classifying a log tail.
///
/// `message` and `progress` are `None` when the counts tracked by the
/// init runner are the better source for them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub phase: Phase,
    pub message: Option<&'static str>,
    pub progress: Option<u8>,
}

struct Haystack<'a> {
    raw: &'a str,
    lower: String,
}

struct Rule {
    name: &'static str,
    matches: fn(&Haystack<'_>) -> bool,
    phase: Phase,
    message: Option<&'static str>,
    progress: Option<u8>,
}

static COMPLETED_ITEM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d{4}_\d{2}_\d{2}_\d+_\w+.*DONE").unwrap());

const RULES: &[Rule] = &[
    Rule {
        name: "services-running",
        matches: |h| h.lower.matches("entered running state").count() >= 2,
        phase: Phase::Ready,
        message: Some("Services started"),
        progress: Some(99),
    },
    Rule {
        name: "optimizing",
        matches: |h| h.lower.contains("optimizing filament"),
        phase: Phase::Optimization,
        message: Some("Optimizing application..."),
        progress: Some(92),
    },
    Rule {
        name: "caching",
        matches: |h| h.lower.contains("caching filament"),
        phase: Phase::Optimization,
        message: Some("Warming caches..."),
        progress: Some(94),
    },
    Rule {
        name: "migrations-running",
        matches: |h| h.lower.contains("running migrations") || COMPLETED_ITEM.is_match(h.raw),
        phase: Phase::Migrations,
        message: None,
        progress: None,
    },
    Rule {
        name: "nothing-to-migrate",
        matches: |h| h.lower.contains("nothing to migrate"),
        phase: Phase::MigrationsDone,
        message: Some("Database up to date"),
        progress: Some(85),
    },
    Rule {
        name: "preparing-database",
        matches: |h| {
            h.lower.contains("preparing database") || h.lower.contains("creating migration table")
        },
        phase: Phase::Migrations,
        message: Some("Preparing database..."),
        progress: Some(8),
    },
    Rule {
        name: "migrating-database",
        matches: |h| h.lower.contains("migrating database"),
        phase: Phase::Migrations,
        message: Some("Starting migrations..."),
        progress: Some(10),
    },
    Rule {
        name: "generating-key",
        matches: |h| h.lower.contains("generating key") || h.lower.contains("generated app key"),
        phase: Phase::Startup,
        message: Some("Generating application key..."),
        progress: Some(5),
    },
    Rule {
        name: "early-startup",
        matches: |h| h.lower.contains("external vars"),
        phase: Phase::Startup,
        message: Some("Initializing..."),
        progress: Some(2),
    },
];

const DEFAULT: Classification = Classification {
    phase: Phase::Startup,
    message: Some("Starting container..."),
    progress: Some(3),
};

/// Classify a log tail. Pure and deterministic.
pub fn classify(logs: &str) -> Classification {
    let haystack = Haystack {
        raw: logs,
        lower: logs.to_lowercase(),
    };

    RULES
        .iter()
        .find(|rule| (rule.matches)(&haystack))
        .map(|rule| {
            tracing::trace!(rule = rule.name, "Classified backend logs");
            Classification {
                phase: rule.phase,
                message: rule.message,
                progress: rule.progress,
            }
        })
        .unwrap_or(DEFAULT)
}
