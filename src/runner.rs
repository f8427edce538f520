use std::sync::Arc;

use tokio::task::JoinSet;
use tokio::time::{Duration, Instant};
use tokio_stream::wrappers::IntervalStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::checks::Checks;
use crate::config::{Config, Stage};
use crate::report::{RunStats, Summary};
use crate::scenario::Scenario;
use crate::session::RunCounter;

const TICK: Duration = Duration::from_millis(100);

// Drives VUs through the configured stages, ramping their number up and down.
// Every VU is a task running iterations of the shared scenario back to back. Two tokens
// control them: a per-VU retire token, which lets the VU finish its current iteration before
// exiting, and the run-wide interrupt token, which abandons in-flight iterations at once.
pub struct Runner {
    stages: Vec<Stage>,
    total: Duration,
    start_vus: usize,
    graceful_stop: Duration,
    scenario: Arc<Scenario>,
    checks: Arc<Checks>,
    stats: Arc<RunStats>,
    stop: CancellationToken,
    interrupt: CancellationToken,
}

impl Runner {
    pub fn new(config: &Config) -> Self {
        let checks = Arc::new(Checks::new());
        let scenario = Scenario::new(config, Arc::new(RunCounter::new()), checks.clone());
        Self {
            stages: config.stages(),
            total: config.total_duration(),
            start_vus: config.start_vus,
            graceful_stop: config.graceful_stop,
            scenario: Arc::new(scenario),
            checks,
            stats: Arc::new(RunStats::new()),
            stop: CancellationToken::new(),
            interrupt: CancellationToken::new(),
        }
    }

    /// Handle for ending the run from outside, e.g. on ctrl-c.
    pub fn shutdown(&self) -> Shutdown {
        Shutdown {
            stop: self.stop.clone(),
            interrupt: self.interrupt.clone(),
        }
    }

    pub async fn run(self) -> anyhow::Result<Summary> {
        tracing::info!(
            "Starting run [stages={}, duration={:?}, graceful_stop={:?}]",
            self.stages.len(),
            self.total,
            self.graceful_stop
        );

        let started = Instant::now();
        let mut vus = JoinSet::new();
        // Retire tokens of the VUs that still take part in the ramp, oldest first. Ramping
        // down retires the newest ones.
        let mut active: Vec<CancellationToken> = Vec::new();
        let mut next_id = 0usize;
        let mut ticker = IntervalStream::new(tokio::time::interval(TICK));

        loop {
            // In each loop turn, we wait for either the stop signal, the next tick or a VU
            // task finishing, whichever comes first.
            tokio::select! {
                // If the run is stopped from outside, we leave the stages right away and go
                // through the same graceful stop as a run that reached its end.
                _ = self.stop.cancelled() => {
                    tracing::info!("Stop requested, ending stages early");
                    break;
                },
                // On every tick we compare the number of active VUs with what the stages ask
                // for at this point, and spawn or retire VUs to match it.
                _ = ticker.next() => {
                    let elapsed = started.elapsed();
                    if elapsed >= self.total {
                        break;
                    }
                    let desired = target_at(&self.stages, self.start_vus, elapsed);
                    if desired != active.len() {
                        tracing::debug!("Adjusting VUs [from={}, to={}]", active.len(), desired);
                    }
                    while active.len() < desired {
                        let retire = CancellationToken::new();
                        vus.spawn(vu(
                            next_id,
                            self.scenario.clone(),
                            self.stats.clone(),
                            retire.clone(),
                            self.interrupt.clone(),
                        ));
                        active.push(retire);
                        next_id += 1;
                    }
                    while active.len() > desired {
                        if let Some(retire) = active.pop() {
                            retire.cancel();
                        }
                    }
                },
                // Retired VUs finish on their own. We reap them here so the JoinSet only holds
                // tasks that are still running.
                Some(res) = vus.join_next(), if !vus.is_empty() => {
                    if let Err(err) = res {
                        tracing::error!("VU task failed: {}", err);
                    }
                },
            }
        }

        // Retiring every VU lets them finish the iteration they are in. Whatever is still
        // running once graceful_stop elapses (or a second stop signal arrives) is interrupted,
        // and then we wait for those tasks to wind down as well.
        for retire in active.drain(..) {
            retire.cancel();
        }
        tracing::info!(
            "Stages finished, waiting up to {:?} for {} VUs",
            self.graceful_stop,
            vus.len()
        );
        let graceful = tokio::select! {
            res = tokio::time::timeout(self.graceful_stop, drain(&mut vus)) => res.is_ok(),
            _ = self.interrupt.cancelled() => false,
        };
        if !graceful {
            tracing::warn!("Interrupting {} VUs", vus.len());
            self.interrupt.cancel();
            drain(&mut vus).await;
        }

        let summary = self.stats.snapshot(started.elapsed(), self.checks.summary());
        Ok(summary)
    }
}

/// Ends a run from outside. The first signal ends the stages and starts the graceful stop,
/// any further signal interrupts the running iterations right away.
#[derive(Clone)]
pub struct Shutdown {
    stop: CancellationToken,
    interrupt: CancellationToken,
}

impl Shutdown {
    pub fn signal(&self) {
        if self.stop.is_cancelled() {
            tracing::info!("Second stop signal, interrupting running iterations");
            self.interrupt.cancel();
        } else {
            self.stop.cancel();
        }
    }
}

async fn drain(vus: &mut JoinSet<()>) {
    while let Some(res) = vus.join_next().await {
        if let Err(err) = res {
            tracing::error!("VU task failed: {}", err);
        }
    }
}

async fn vu(
    id: usize,
    scenario: Arc<Scenario>,
    stats: Arc<RunStats>,
    retire: CancellationToken,
    interrupt: CancellationToken,
) {
    tracing::debug!(vu = id, "VU started");
    // The retire token is only checked between iterations; the interrupt token is handed to
    // the iteration itself so it can drop the connection midway.
    while !retire.is_cancelled() && !interrupt.is_cancelled() {
        match scenario.iteration(&interrupt).await {
            Ok(outcome) => stats.record(&outcome),
            Err(err) => {
                // An iteration error only ends that iteration; the VU moves on to the next one.
                stats.record_error();
                tracing::warn!(vu = id, "Iteration failed: {:#}", err);
            }
        }
    }
    tracing::debug!(vu = id, "VU finished");
}

/// Number of VUs the stages ask for `elapsed` into the run.
///
/// Inside a stage the count moves linearly from the previous target (`start_vus` for
/// the first stage) to the stage target. After the last stage it stays at the last target.
pub fn target_at(stages: &[Stage], start_vus: usize, elapsed: Duration) -> usize {
    let mut from = start_vus;
    let mut stage_start = Duration::ZERO;
    for stage in stages {
        let stage_end = stage_start + stage.duration;
        if elapsed < stage_end {
            let progress = (elapsed - stage_start).as_secs_f64() / stage.duration.as_secs_f64();
            let (from, to) = (from as f64, stage.target as f64);
            return (from + (to - from) * progress).round() as usize;
        }
        from = stage.target;
        stage_start = stage_end;
    }
    from
}
