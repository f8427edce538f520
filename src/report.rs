use std::sync::atomic::{AtomicU64, Ordering};

use tokio::time::Duration;

use crate::checks::CheckSummary;
use crate::scenario::{Ending, Outcome};

/// Run-wide counters, updated by every VU after each iteration.
#[derive(Debug, Default)]
pub struct RunStats {
    iterations: AtomicU64,
    completed: AtomicU64,
    closed_by_peer: AtomicU64,
    interrupted: AtomicU64,
    failed: AtomicU64,
    frames_sent: AtomicU64,
    echoes_received: AtomicU64,
}

impl RunStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, outcome: &Outcome) {
        self.iterations.fetch_add(1, Ordering::Relaxed);
        let counter = match outcome.ending {
            Ending::Completed => &self.completed,
            Ending::ClosedByPeer => &self.closed_by_peer,
            Ending::Interrupted => &self.interrupted,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.frames_sent
            .fetch_add(outcome.sent as u64, Ordering::Relaxed);
        self.echoes_received
            .fetch_add(outcome.received as u64, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.iterations.fetch_add(1, Ordering::Relaxed);
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, elapsed: Duration, checks: Vec<CheckSummary>) -> Summary {
        Summary {
            elapsed,
            iterations: self.iterations.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            closed_by_peer: self.closed_by_peer.load(Ordering::Relaxed),
            interrupted: self.interrupted.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            echoes_received: self.echoes_received.load(Ordering::Relaxed),
            checks,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Summary {
    pub elapsed: Duration,
    pub iterations: u64,
    pub completed: u64,
    pub closed_by_peer: u64,
    pub interrupted: u64,
    pub failed: u64,
    pub frames_sent: u64,
    pub echoes_received: u64,
    pub checks: Vec<CheckSummary>,
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Ran {} iterations in {:.1}s: {} completed, {} closed by server, {} interrupted, {} failed. \
             Sent {} frames, received {} echoes",
            self.iterations,
            self.elapsed.as_secs_f64(),
            self.completed,
            self.closed_by_peer,
            self.interrupted,
            self.failed,
            self.frames_sent,
            self.echoes_received
        )
    }
}
