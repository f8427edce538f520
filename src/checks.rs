use std::sync::Mutex;

use hashbrown::HashMap;

pub const STATUS_IS_101: &str = "status is 101";

/// Named pass/fail assertions, aggregated over every iteration of every VU.
#[derive(Debug, Default)]
pub struct Checks {
    counts: Mutex<HashMap<&'static str, CheckCounts>>,
}

#[derive(Debug, Default, Clone, Copy)]
struct CheckCounts {
    passes: u64,
    fails: u64,
}

impl Checks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, name: &'static str, passed: bool) {
        // Counts are plain integers, so they stay consistent even if a VU panicked holding the lock.
        let mut counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
        let entry = counts.entry(name).or_default();
        if passed {
            entry.passes += 1;
        } else {
            entry.fails += 1;
        }
        tracing::trace!(check = name, passed, "Check recorded");
    }

    pub fn summary(&self) -> Vec<CheckSummary> {
        let counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
        let mut summary = counts
            .iter()
            .map(|(name, counts)| CheckSummary {
                name: *name,
                passes: counts.passes,
                fails: counts.fails,
            })
            .collect::<Vec<_>>();
        summary.sort_by_key(|check| check.name);
        summary
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckSummary {
    pub name: &'static str,
    pub passes: u64,
    pub fails: u64,
}

impl CheckSummary {
    pub fn total(&self) -> u64 {
        self.passes + self.fails
    }

    pub fn rate(&self) -> f64 {
        match self.total() {
            0 => 0.0,
            total => self.passes as f64 / total as f64,
        }
    }
}

impl std::fmt::Display for CheckSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mark = if self.fails == 0 { '✓' } else { '✗' };
        write!(
            f,
            "{} {}: {:.2}% ({} passed, {} failed)",
            mark,
            self.name,
            self.rate() * 100.0,
            self.passes,
            self.fails
        )
    }
}
