//! Decision engine: turns two metrics summaries into keep-or-revert.
//!
//! Hard gates run before the scalar score comparison, because a weighted sum
//! can mask an unacceptable regression in a single dimension. Every failing
//! gate appends a human-readable reason; both raw scores are always carried
//! for the audit record.

use serde::{Deserialize, Serialize};

use crate::metrics::MetricsSummary;

/// Fixed score weights. The score is strictly monotone in each dimension
/// (more FPS up to the target ceiling, less load time, smaller bundle, fewer
/// console errors) holding the others fixed.
const W_FPS: f64 = 30.0;
const W_LOAD: f64 = 25.0;
const W_BUNDLE: f64 = 20.0;
const CLEAN_CONSOLE_BONUS: f64 = 25.0;
const ERROR_PENALTY: f64 = 5.0;

/// FPS above this ceiling earns nothing extra, so one extreme run can't
/// dominate the score.
const FPS_TARGET: f64 = 60.0;

/// Thresholds for accepting a candidate over a baseline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecisionConfig {
    /// Allowed relative load-time regression (0.1 = +10%).
    pub load_tolerance: f64,
    /// Allowed relative bundle-size regression.
    pub bundle_tolerance: f64,
    /// Minimum score improvement a candidate must show to be kept.
    pub minimum_gain: f64,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            load_tolerance: 0.10,
            bundle_tolerance: 0.10,
            minimum_gain: 0.1,
        }
    }
}

/// Accept/reject verdict with explicit reasons and both raw scores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub improved: bool,
    pub reasons: Vec<String>,
    pub baseline_score: f64,
    pub candidate_score: f64,
}

/// Scalar quality score with fixed weights.
pub fn score(metrics: &MetricsSummary) -> f64 {
    let fps_term = W_FPS * (metrics.fps.min(FPS_TARGET) / FPS_TARGET);
    let load_term = W_LOAD * (1000.0 / (1000.0 + metrics.load_ms));
    let bundle_term = W_BUNDLE * (1000.0 / (1000.0 + metrics.bundle_kb));
    let error_term = if metrics.console_error_count == 0.0 {
        CLEAN_CONSOLE_BONUS
    } else {
        -ERROR_PENALTY * metrics.console_error_count
    };
    fps_term + load_term + bundle_term + error_term
}

/// Decide whether `candidate` is a genuine improvement over `baseline`.
pub fn decide(
    candidate: &MetricsSummary,
    baseline: &MetricsSummary,
    config: &DecisionConfig,
) -> Decision {
    let baseline_score = score(baseline);
    let candidate_score = score(candidate);
    let mut reasons = Vec::new();

    // Hard gates. A summary with zero successful samples is never evidence
    // of improvement, regardless of what its zeroed fields would score.
    if !candidate.success {
        reasons.push("candidate measurement did not complete successfully".to_string());
    }
    if candidate.console_error_count > 0.0 {
        reasons.push(format!(
            "candidate has console errors (median {:.1})",
            candidate.console_error_count
        ));
    }
    let load_ceiling = baseline.load_ms * (1.0 + config.load_tolerance);
    if candidate.load_ms > load_ceiling {
        reasons.push(format!(
            "load time regressed: {:.0}ms > {:.0}ms (+{:.0}% tolerance)",
            candidate.load_ms,
            load_ceiling,
            config.load_tolerance * 100.0
        ));
    }
    let bundle_ceiling = baseline.bundle_kb * (1.0 + config.bundle_tolerance);
    if candidate.bundle_kb > bundle_ceiling {
        reasons.push(format!(
            "bundle size regressed: {:.1}kb > {:.1}kb (+{:.0}% tolerance)",
            candidate.bundle_kb,
            bundle_ceiling,
            config.bundle_tolerance * 100.0
        ));
    }

    // Soft gate, last: the score must clear the baseline by the minimum gain.
    if candidate_score < baseline_score + config.minimum_gain {
        reasons.push(format!(
            "score did not improve enough: {:.2} vs {:.2} (need +{:.2})",
            candidate_score, baseline_score, config.minimum_gain
        ));
    }

    Decision {
        improved: reasons.is_empty(),
        reasons,
        baseline_score,
        candidate_score,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(load_ms: f64, fps: f64, errors: f64, bundle_kb: f64) -> MetricsSummary {
        MetricsSummary {
            success: true,
            all_successful: true,
            samples: 3,
            load_ms,
            fps,
            console_error_count: errors,
            bundle_kb,
        }
    }

    #[test]
    fn test_score_monotone_in_each_dimension() {
        let base = summary(800.0, 50.0, 0.0, 500.0);

        let faster = summary(800.0, 55.0, 0.0, 500.0);
        assert!(score(&faster) > score(&base));

        let quicker_load = summary(700.0, 50.0, 0.0, 500.0);
        assert!(score(&quicker_load) > score(&base));

        let smaller = summary(800.0, 50.0, 0.0, 450.0);
        assert!(score(&smaller) > score(&base));

        let errored = summary(800.0, 50.0, 2.0, 500.0);
        assert!(score(&errored) < score(&base));
        let more_errored = summary(800.0, 50.0, 3.0, 500.0);
        assert!(score(&more_errored) < score(&errored));
    }

    #[test]
    fn test_score_fps_capped_at_target() {
        let at_target = summary(800.0, 60.0, 0.0, 500.0);
        let beyond = summary(800.0, 240.0, 0.0, 500.0);
        assert_eq!(score(&at_target), score(&beyond));
    }

    #[test]
    fn test_console_errors_always_reject() {
        // Superior in every other dimension, still rejected.
        let baseline = summary(1000.0, 30.0, 0.0, 800.0);
        let candidate = summary(400.0, 60.0, 1.0, 300.0);
        let decision = decide(&candidate, &baseline, &DecisionConfig::default());
        assert!(!decision.improved);
        assert!(decision.reasons.iter().any(|r| r.contains("console errors")));
    }

    #[test]
    fn test_load_regression_gate() {
        let baseline = summary(1000.0, 60.0, 0.0, 500.0);
        // 1101ms is past the 10% tolerance even with better FPS and bundle.
        let candidate = summary(1101.0, 60.0, 0.0, 400.0);
        let decision = decide(&candidate, &baseline, &DecisionConfig::default());
        assert!(!decision.improved);
        assert!(decision
            .reasons
            .iter()
            .any(|r| r.contains("load time regressed")));
    }

    #[test]
    fn test_failed_candidate_never_improves() {
        let baseline = summary(800.0, 60.0, 0.0, 500.0);
        let decision = decide(
            &MetricsSummary::failed(),
            &baseline,
            &DecisionConfig::default(),
        );
        assert!(!decision.improved);
        assert!(decision
            .reasons
            .iter()
            .any(|r| r.contains("did not complete successfully")));
    }

    #[test]
    fn test_smaller_bundle_accepted() {
        let baseline = summary(800.0, 60.0, 0.0, 500.0);
        let candidate = summary(800.0, 60.0, 0.0, 480.0);
        let decision = decide(&candidate, &baseline, &DecisionConfig::default());
        assert!(decision.improved, "reasons: {:?}", decision.reasons);
        assert!(decision.candidate_score > decision.baseline_score);
    }

    #[test]
    fn test_insufficient_gain_rejected() {
        let baseline = summary(800.0, 60.0, 0.0, 500.0);
        // A hair smaller: positive but below the minimum gain.
        let candidate = summary(800.0, 60.0, 0.0, 499.5);
        let decision = decide(&candidate, &baseline, &DecisionConfig::default());
        assert!(!decision.improved);
        assert!(decision
            .reasons
            .iter()
            .any(|r| r.contains("did not improve enough")));
    }

    #[test]
    fn test_scores_carried_even_on_rejection() {
        let baseline = summary(800.0, 60.0, 0.0, 500.0);
        let candidate = summary(2000.0, 60.0, 0.0, 500.0);
        let decision = decide(&candidate, &baseline, &DecisionConfig::default());
        assert!(!decision.improved);
        assert!(decision.baseline_score > 0.0);
        assert!(decision.candidate_score > 0.0);
    }
}
