//! The per-iteration state machine composing collector, requester, guard,
//! applier, and decision engine.
//!
//! One iteration: measure baseline, request a candidate, validate it, apply
//! it, measure again, decide, keep or revert. Request/validate/apply failures
//! leave the tree untouched and mark the iteration skipped; only a failed
//! revert is fatal, because it leaves the tree in a state the loop can no
//! longer reason about. Cancellation is observed at iteration boundaries so
//! an applied-but-undecided patch is never the last thing left on disk.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::apply::Patcher;
use crate::config::LoopConfig;
use crate::decide::{decide, Decision};
use crate::error::MeasurementError;
use crate::guard;
use crate::metrics::{measure_repeated, MetricsSummary};
use crate::patch::{build_prompt, PatchRequester, PatchService};
use crate::record::{IterationRecord, Outcome, RecordLog};
use crate::server::PreviewServer;
use crate::util::{run_with_timeout, split_command};

/// Phases of one iteration, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    BaselineMeasure,
    PatchRequest,
    PatchValidate,
    PatchApply,
    CandidateBuild,
    CandidateMeasure,
    Decide,
    Keep,
    Revert,
    Done,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::BaselineMeasure => "baseline-measure",
            Phase::PatchRequest => "patch-request",
            Phase::PatchValidate => "patch-validate",
            Phase::PatchApply => "patch-apply",
            Phase::CandidateBuild => "candidate-build",
            Phase::CandidateMeasure => "candidate-measure",
            Phase::Decide => "decide",
            Phase::Keep => "keep",
            Phase::Revert => "revert",
            Phase::Done => "done",
        };
        write!(f, "{}", name)
    }
}

/// Tally of outcomes across the loop's lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoopSummary {
    pub iterations_run: usize,
    pub kept: usize,
    pub reverted: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl LoopSummary {
    fn tally(&mut self, outcome: Outcome) {
        self.iterations_run += 1;
        match outcome {
            Outcome::Kept => self.kept += 1,
            Outcome::Reverted => self.reverted += 1,
            Outcome::Skipped => self.skipped += 1,
            Outcome::Failed => self.failed += 1,
        }
    }
}

/// Capability interface over a measurement phase, so the orchestrator's
/// routing is exercisable without a browser or a build toolchain.
pub trait Measurer: Send + Sync {
    fn measure<'a>(
        &'a self,
        config: &'a LoopConfig,
        iteration: usize,
        label: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<MetricsSummary, MeasurementError>> + Send + 'a>>;
}

/// The production measurer: build, serve, drive the browser.
pub struct BuildServeMeasurer;

impl Measurer for BuildServeMeasurer {
    fn measure<'a>(
        &'a self,
        config: &'a LoopConfig,
        iteration: usize,
        label: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<MetricsSummary, MeasurementError>> + Send + 'a>> {
        Box::pin(build_serve_measure(config, iteration, label))
    }
}

/// Runs the optimization loop for a fixed number of iterations.
pub struct LoopRunner<S: PatchService, M: Measurer = BuildServeMeasurer> {
    config: LoopConfig,
    patcher: Patcher,
    requester: PatchRequester<S>,
    measurer: M,
    log: RecordLog,
    cancel: Arc<AtomicBool>,
}

impl<S: PatchService> LoopRunner<S> {
    pub fn new(config: LoopConfig, service: S) -> anyhow::Result<Self> {
        Self::with_measurer(config, service, BuildServeMeasurer)
    }
}

impl<S: PatchService, M: Measurer> LoopRunner<S, M> {
    pub fn with_measurer(config: LoopConfig, service: S, measurer: M) -> anyhow::Result<Self> {
        let patcher = Patcher::new(&config.repo_root);
        let requester =
            PatchRequester::new(service, &config.repo_root, config.generation_attempts);
        let log = RecordLog::create(&config.artifacts_path())?;
        Ok(Self {
            config,
            patcher,
            requester,
            measurer,
            log,
            cancel: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Flag checked at iteration boundaries. Setting it mid-iteration lets
    /// the current iteration still reach keep or revert first.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Run the loop. `Err` is reserved for the fatal class.
    pub async fn run(&mut self) -> anyhow::Result<LoopSummary> {
        let mut summary = LoopSummary::default();

        for index in 0..self.config.iterations {
            if self.cancel.load(Ordering::SeqCst) {
                tracing::info!(index, "cancellation requested, stopping before iteration");
                break;
            }

            let record = self.run_iteration(index).await?;
            summary.tally(record.outcome);
            eprintln!(
                "  iteration {}: {:?}{}",
                index,
                record.outcome,
                record
                    .note
                    .as_deref()
                    .map(|n| format!(" ({})", n))
                    .unwrap_or_default()
            );
            if let Some(decision) = &record.decision {
                for reason in &decision.reasons {
                    eprintln!("    - {}", reason);
                }
            }
            self.log.append(&record)?;
        }

        Ok(summary)
    }

    fn enter(&self, index: usize, phase: Phase) {
        tracing::info!(iteration = index, phase = %phase, "entering phase");
    }

    async fn run_iteration(&self, index: usize) -> anyhow::Result<IterationRecord> {
        self.enter(index, Phase::BaselineMeasure);
        let baseline = match self.build_and_measure(index, "baseline").await {
            Ok(summary) => summary,
            Err(err) => {
                // The tree was never mutated; the failure is local to this
                // iteration.
                tracing::warn!(iteration = index, error = %err, "baseline phase failed");
                return Ok(failed_record(index, err.to_string()));
            }
        };
        if !baseline.success {
            return Ok(failed_record(
                index,
                "no baseline sample completed successfully".to_string(),
            ));
        }

        self.enter(index, Phase::PatchRequest);
        let prompt = build_prompt(&baseline, &self.config.policy);
        let candidate = match self.requester.request_patch(&prompt, &self.patcher).await {
            Ok(candidate) => candidate,
            Err(err) => {
                return Ok(skipped_record(index, baseline, err.to_string()));
            }
        };
        tracing::debug!(
            iteration = index,
            provenance = ?candidate.provenance,
            bytes = candidate.diff.len(),
            "candidate obtained"
        );

        self.enter(index, Phase::PatchValidate);
        let validation = guard::validate(&candidate.diff, &self.config.policy);
        if !validation.valid {
            let note = format!("policy violations: {}", validation.reasons().join("; "));
            return Ok(skipped_record(index, baseline, note));
        }

        self.enter(index, Phase::PatchApply);
        if let Err(err) = self.patcher.apply(&candidate.diff) {
            // Apply is transactional: nothing partial landed.
            return Ok(skipped_record(index, baseline, err.to_string()));
        }

        // The tree is mutated from here on; every path below must end in
        // keep or revert.
        self.enter(index, Phase::CandidateBuild);
        let candidate_summary = match self.build_and_measure(index, "candidate").await {
            Ok(summary) => summary,
            Err(err) => {
                // Infrastructure failure is not a separate error path: a
                // failed summary drives a normal revert through the gates.
                tracing::warn!(iteration = index, error = %err, "candidate phase failed");
                MetricsSummary::failed()
            }
        };

        self.enter(index, Phase::Decide);
        let decision = decide(&candidate_summary, &baseline, &self.config.decision);

        let record = if decision.improved {
            self.enter(index, Phase::Keep);
            kept_record(index, baseline, candidate_summary, decision)
        } else {
            self.enter(index, Phase::Revert);
            self.patcher.revert(&candidate.diff)?;
            reverted_record(index, baseline, candidate_summary, decision)
        };

        self.enter(index, Phase::Done);
        Ok(record)
    }

    async fn build_and_measure(
        &self,
        index: usize,
        label: &str,
    ) -> Result<MetricsSummary, MeasurementError> {
        self.measurer.measure(&self.config, index, label).await
    }
}

/// Build the tree, serve the artifact, measure it, and stop the server.
///
/// The server handle brackets the measurement so the port is released on
/// every path out of this function.
pub async fn build_serve_measure(
    config: &LoopConfig,
    iteration: usize,
    label: &str,
) -> Result<MetricsSummary, MeasurementError> {
    build_tree(config).await.map_err(|message| MeasurementError {
        message: format!("{} build failed: {}", label, message),
    })?;

    let server = PreviewServer::start(
        &config.serve_command,
        &config.repo_root,
        &config.dist_path(),
        config.port,
        Duration::from_secs(config.ready_timeout_secs),
    )
    .await
    .map_err(|e| MeasurementError {
        message: format!("{} server failed: {}", label, e),
    })?;

    if label == "candidate" {
        tracing::info!(iteration, phase = %Phase::CandidateMeasure, "entering phase");
    }

    let url = config.url.clone().unwrap_or_else(|| server.url());
    let summary = measure_url(config, &url, iteration, label).await?;

    server.stop();
    Ok(summary)
}

/// Measure an already-reachable URL without building or serving anything.
pub async fn measure_url(
    config: &LoopConfig,
    url: &str,
    iteration: usize,
    label: &str,
) -> Result<MetricsSummary, MeasurementError> {
    let url = url.to_string();
    let measure_config = config.measure_config(iteration, label);
    let repeats = config.repeats;

    // The browser driver is synchronous; keep it off the async runtime.
    tokio::task::spawn_blocking(move || measure_repeated(&url, &measure_config, repeats))
        .await
        .map_err(|e| MeasurementError {
            message: format!("measurement task panicked: {}", e),
        })
}

async fn build_tree(config: &LoopConfig) -> Result<(), String> {
    let (program, args) = split_command(&config.build_command)?;
    let cwd = config.repo_root.clone();
    let timeout = Duration::from_secs(config.build_timeout_secs);

    let outcome = tokio::task::spawn_blocking(move || {
        run_with_timeout(&program, &args, &cwd, timeout)
    })
    .await
    .map_err(|e| format!("build task panicked: {}", e))??;

    if outcome.timed_out {
        return Err("build command timed out".to_string());
    }
    if !outcome.success {
        return Err(outcome.tail(1200));
    }
    Ok(())
}

fn failed_record(index: usize, note: String) -> IterationRecord {
    IterationRecord {
        index,
        baseline: MetricsSummary::failed(),
        candidate: None,
        outcome: Outcome::Failed,
        decision: None,
        note: Some(note),
    }
}

fn skipped_record(index: usize, baseline: MetricsSummary, note: String) -> IterationRecord {
    IterationRecord {
        index,
        baseline,
        candidate: None,
        outcome: Outcome::Skipped,
        decision: None,
        note: Some(note),
    }
}

fn kept_record(
    index: usize,
    baseline: MetricsSummary,
    candidate: MetricsSummary,
    decision: Decision,
) -> IterationRecord {
    IterationRecord {
        index,
        baseline,
        candidate: Some(candidate),
        outcome: Outcome::Kept,
        decision: Some(decision),
        note: None,
    }
}

fn reverted_record(
    index: usize,
    baseline: MetricsSummary,
    candidate: MetricsSummary,
    decision: Decision,
) -> IterationRecord {
    IterationRecord {
        index,
        baseline,
        candidate: Some(candidate),
        outcome: Outcome::Reverted,
        decision: Some(decision),
        note: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_tally() {
        let mut summary = LoopSummary::default();
        summary.tally(Outcome::Kept);
        summary.tally(Outcome::Skipped);
        summary.tally(Outcome::Skipped);
        summary.tally(Outcome::Reverted);
        assert_eq!(summary.iterations_run, 4);
        assert_eq!(summary.kept, 1);
        assert_eq!(summary.skipped, 2);
        assert_eq!(summary.reverted, 1);
        assert_eq!(summary.failed, 0);
    }

    #[test]
    fn test_phase_display_names() {
        assert_eq!(Phase::BaselineMeasure.to_string(), "baseline-measure");
        assert_eq!(Phase::Revert.to_string(), "revert");
    }
}
