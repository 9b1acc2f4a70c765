//! Per-stage logging handle and outcome counters.
//!
//! A [`StageContext`] is created when a stage begins and consumed when it
//! ends. Components log through [`StageContext::target`] so every line carries
//! the stage name, and bump the shared counters as work items settle.

use log::info;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Logging target plus success/failure tallies for one stage run.
#[derive(Debug)]
pub struct StageContext {
    stage: &'static str,
    started: Instant,
    succeeded: AtomicUsize,
    failed: AtomicUsize,
    skipped: AtomicUsize,
}

impl StageContext {
    /// Starts a stage, logging the transition.
    pub fn begin(stage: &'static str) -> Self {
        info!(target: stage, "starting {stage}");
        Self {
            stage,
            started: Instant::now(),
            succeeded: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            skipped: AtomicUsize::new(0),
        }
    }

    /// Log target for messages emitted on behalf of this stage.
    pub fn target(&self) -> &'static str {
        self.stage
    }

    /// Counts one finished unit of work.
    pub fn record_success(&self) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts one failed unit of work.
    pub fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts one unit of work that needed nothing done.
    pub fn record_skip(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// Successes so far.
    pub fn succeeded(&self) -> usize {
        self.succeeded.load(Ordering::Relaxed)
    }

    /// Failures so far.
    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::Relaxed)
    }

    /// Skips so far.
    pub fn skipped(&self) -> usize {
        self.skipped.load(Ordering::Relaxed)
    }

    /// Ends the stage: logs the totals and flushes the sink.
    pub fn finish(self) -> StageReport {
        let report = StageReport {
            stage: self.stage,
            elapsed: self.started.elapsed(),
            succeeded: self.succeeded(),
            failed: self.failed(),
            skipped: self.skipped(),
        };
        info!(
            target: self.stage,
            "{} finished: {} succeeded, {} failed, {} skipped",
            report.stage,
            report.succeeded,
            report.failed,
            report.skipped
        );
        log::logger().flush();
        report
    }
}

/// Final tallies for a stage run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageReport {
    /// Stage name.
    pub stage: &'static str,
    /// Wall-clock duration.
    pub elapsed: Duration,
    /// Units finished.
    pub succeeded: usize,
    /// Units failed.
    pub failed: usize,
    /// Units that were already done.
    pub skipped: usize,
}

impl StageReport {
    /// Prints the report block to stdout.
    pub fn print(&self) {
        let secs = self.elapsed.as_secs_f32().max(f32::EPSILON);
        println!("--- {} report ({secs:.2}s) ---", self.stage);
        println!("succeeded: {}", self.succeeded);
        println!("failed: {}", self.failed);
        println!("skipped: {}", self.skipped);
        println!(
            "throughput/sec: {:.2}",
            (self.succeeded + self.failed) as f32 / secs
        );
    }
}
