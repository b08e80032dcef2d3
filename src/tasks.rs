//! Completed-task tracking for the init command output

use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;

/// `<identifier> <dots> <duration><unit> DONE`
static COMPLETED_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d{4}_\d{2}_\d{2}_\d+_\w+)\s+\.+\s+[\d.]+\s*(?:ms|s)\s+DONE").unwrap()
});

static TIMESTAMP_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{4}_\d{2}_\d{2}_\d+_").unwrap());

/// One completed unit of init work
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRecord {
    /// Full structured id, e.g. `2024_01_15_120000_create_users_table`
    pub identifier: String,
    /// Display name, e.g. `create_users_table`
    pub name: String,
    /// Zero-based discovery order
    pub order: usize,
}

/// Parse a completed-task line into `(identifier, display name)`
pub fn parse_completed(line: &str) -> Option<(String, String)> {
    let caps = COMPLETED_LINE.captures(line)?;
    let identifier = caps.get(1)?.as_str().to_string();
    let name = TIMESTAMP_PREFIX.replace(&identifier, "").into_owned();
    Some((identifier, name))
}

/// Deduplicating ledger of completed tasks with an adaptive total
#[derive(Debug, Clone)]
pub struct TaskLedger {
    estimate: u32,
    total: u32,
    seen: HashSet<String>,
    records: Vec<TaskRecord>,
}

impl TaskLedger {
    pub fn new(estimate: u32) -> Self {
        let estimate = estimate.max(1);
        Self {
            estimate,
            total: estimate,
            seen: HashSet::new(),
            records: Vec::new(),
        }
    }

    /// Record a completed task. Returns `false` if the identifier was already seen.
    ///
    /// Once `done` comes within 10 of the built-in estimate the total becomes
    /// at least `done + 20`. The threshold stays anchored to the built-in
    /// estimate rather than the grown total, so every further record keeps
    /// the total 20 ahead instead of letting it catch up in steps.
    pub fn record(&mut self, identifier: &str, name: &str) -> bool {
        if !self.seen.insert(identifier.to_string()) {
            return false;
        }
        self.records.push(TaskRecord {
            identifier: identifier.to_string(),
            name: name.to_string(),
            order: self.records.len(),
        });

        // Anchored to the built-in estimate, not the current total
        let done = self.done();
        if done + 10 > self.estimate {
            self.total = self.total.max(done + 20);
        }
        true
    }

    /// Parse and record a line of init output. Returns the new record, if any.
    pub fn observe_line(&mut self, line: &str) -> Option<&TaskRecord> {
        let (identifier, name) = parse_completed(line)?;
        if self.record(&identifier, &name) {
            self.records.last()
        } else {
            None
        }
    }

    pub fn done(&self) -> u32 {
        self.records.len() as u32
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    /// `10 + 80 * done / total`, clamped to 10..=90
    pub fn progress(&self) -> u8 {
        let scaled = 10 + (80 * u64::from(self.done())) / u64::from(self.total);
        scaled.clamp(10, 90) as u8
    }

    /// Display names in completion order
    pub fn names(&self) -> Vec<String> {
        self.records.iter().map(|r| r.name.clone()).collect()
    }

    pub fn records(&self) -> &[TaskRecord] {
        &self.records
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(i: usize) -> String {
        format!("  2024_01_01_{:06}_create_table_{} ........ 3.21ms DONE", i, i)
    }

    #[test]
    fn test_parse_completed_line() {
        let parsed =
            parse_completed("  2024_01_15_120000_create_users_table ...... 12.5ms DONE").unwrap();
        assert_eq!(parsed.0, "2024_01_15_120000_create_users_table");
        assert_eq!(parsed.1, "create_users_table");
    }

    #[test]
    fn test_parse_seconds_unit() {
        let parsed = parse_completed("2023_11_02_000001_add_index .... 1.02s DONE").unwrap();
        assert_eq!(parsed.1, "add_index");
    }

    #[test]
    fn test_parse_rejects_other_lines() {
        assert!(parse_completed("INFO  Running migrations.").is_none());
        assert!(parse_completed("2024_01_15_120000_create_users_table ... RUNNING").is_none());
        assert!(parse_completed("").is_none());
    }

    #[test]
    fn test_duplicate_lines_counted_once() {
        let mut ledger = TaskLedger::new(222);
        for _ in 0..5 {
            ledger.observe_line(&line(1));
        }
        assert_eq!(ledger.done(), 1);
        assert_eq!(ledger.names(), vec!["create_table_1"]);
    }

    #[test]
    fn test_dedup_is_by_identifier() {
        let mut ledger = TaskLedger::new(222);
        assert!(ledger.record("2024_01_01_000001_create_users", "create_users"));
        assert!(ledger.record("2024_02_01_000001_create_users", "create_users"));
        assert!(!ledger.record("2024_01_01_000001_create_users", "create_users"));
        assert_eq!(ledger.done(), 2);
        assert_eq!(ledger.records()[1].order, 1);
    }

    #[test]
    fn test_adaptive_total() {
        let mut ledger = TaskLedger::new(222);
        for i in 0..212 {
            ledger.observe_line(&line(i));
        }
        assert_eq!(ledger.total(), 222);

        for i in 212..215 {
            ledger.observe_line(&line(i));
        }
        assert_eq!(ledger.done(), 215);
        assert!(ledger.total() >= 235);
        assert!(ledger.progress() < 90);
    }

    #[test]
    fn test_total_stays_ahead_after_threshold() {
        let mut ledger = TaskLedger::new(222);
        for i in 0..213 {
            ledger.observe_line(&line(i));
        }
        assert_eq!(ledger.total(), 233);

        // Past the first growth the total keeps moving with every record
        ledger.observe_line(&line(213));
        assert_eq!(ledger.total(), 234);
        ledger.observe_line(&line(214));
        assert_eq!(ledger.total(), 235);

        // Duplicates do not grow it
        ledger.observe_line(&line(214));
        assert_eq!(ledger.total(), 235);
    }

    #[test]
    fn test_progress_bounds() {
        let mut ledger = TaskLedger::new(100);
        assert_eq!(ledger.progress(), 10);

        for i in 0..50 {
            ledger.observe_line(&line(i));
        }
        assert_eq!(ledger.progress(), 50);

        for i in 50..400 {
            ledger.observe_line(&line(i));
        }
        assert!(ledger.progress() <= 90);
    }
}
