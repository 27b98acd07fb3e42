//! Cycle diagnostics: timing, the verdict summary, and a human-readable
//! report.
//!
//! Every call to [`Pipeline::run`](crate::Pipeline::run) produces an
//! [`InspectionRun`] carrying per-stage results alongside the final image.
//! Timing goes through the [`Clock`] trait so tests can substitute a
//! deterministic clock.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::result::{StageOutcome, StageResult, StageStatus};
use crate::types::Frame;

/// Source of elapsed-time measurements.
pub trait Clock {
    /// Opaque point in time.
    type Instant;

    /// The current instant.
    fn now(&self) -> Self::Instant;

    /// Time elapsed since `since`.
    fn elapsed(&self, since: &Self::Instant) -> Duration;
}

/// [`Clock`] implementation backed by [`std::time::Instant`].
#[derive(Debug, Clone, Copy, Default)]
pub struct StdClock;

impl Clock for StdClock {
    type Instant = std::time::Instant;

    fn now(&self) -> Self::Instant {
        std::time::Instant::now()
    }

    fn elapsed(&self, since: &Self::Instant) -> Duration {
        since.elapsed()
    }
}

/// Everything one inspection cycle produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InspectionRun {
    /// Stage results in pipeline order.
    pub results: Vec<StageResult>,
    /// Working image after every filter stage.
    pub final_image: Frame,
    /// Counts, verdict, and timing.
    pub summary: Summary,
}

/// Aggregate counts and the verdict for one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    /// Number of stages run.
    pub total_stages: usize,
    /// Stages with status success.
    pub succeeded: usize,
    /// Stages with status error.
    pub failed: usize,
    /// Stages that contribute to the verdict.
    pub pass_fail_stages: usize,
    /// Verdict stages that passed.
    pub passed_count: usize,
    /// `true` when every verdict stage passed (vacuously with none).
    pub overall_pass: bool,
    /// Wall-clock time of the whole cycle.
    pub total_time_ms: f64,
    /// Sum of per-stage times.
    pub stages_time_ms: f64,
    /// `total_time_ms - stages_time_ms`, floored at zero.
    pub overhead_ms: f64,
}

impl Summary {
    /// Summarize `results` for a cycle that took `total`.
    #[must_use]
    pub fn from_results(results: &[StageResult], total: Duration) -> Self {
        let succeeded = results
            .iter()
            .filter(|r| r.status == StageStatus::Success)
            .count();
        let pass_fail_stages = results.iter().filter(|r| r.pass.is_some()).count();
        let passed_count = results.iter().filter(|r| r.pass == Some(true)).count();
        let total_time_ms = duration_ms(total);
        let stages_time_ms: f64 = results.iter().map(|r| r.processing_time_ms).sum();
        Self {
            total_stages: results.len(),
            succeeded,
            failed: results.len() - succeeded,
            pass_fail_stages,
            passed_count,
            overall_pass: passed_count == pass_fail_stages,
            total_time_ms,
            stages_time_ms,
            overhead_ms: (total_time_ms - stages_time_ms).max(0.0),
        }
    }
}

impl InspectionRun {
    /// Format the run as a human-readable report.
    #[must_use]
    pub fn report(&self) -> String {
        let s = &self.summary;
        let mut lines = Vec::new();

        lines.push(format!("Inspection Report\n{}", "=".repeat(60)));
        lines.push(format!(
            "Image: {}x{} ({} channel{})",
            self.final_image.width(),
            self.final_image.height(),
            self.final_image.channels(),
            if self.final_image.channels() == 1 { "" } else { "s" },
        ));
        lines.push(format!(
            "Total duration: {:.3}ms (stages {:.3}ms, overhead {:.3}ms)",
            s.total_time_ms, s.stages_time_ms, s.overhead_ms,
        ));
        lines.push(String::new());

        lines.push(format!(
            "{:<20} {:<11} {:<7} {:>10} {:>8}  {}",
            "Stage", "Type", "Status", "Duration", "% Total", "Details"
        ));
        lines.push("-".repeat(88));

        for r in &self.results {
            let pct = if s.total_time_ms > 0.0 {
                r.processing_time_ms / s.total_time_ms * 100.0
            } else {
                0.0
            };
            let status = match r.status {
                StageStatus::Success => "ok",
                StageStatus::Error => "error",
            };
            lines.push(format!(
                "{:<20} {:<11} {:<7} {:>8.3}ms {:>7.1}%  {}",
                truncate(&r.stage_name, 20),
                r.stage_type.as_str(),
                status,
                r.processing_time_ms,
                pct,
                format_details(r),
            ));
        }

        lines.push(String::new());
        lines.push(format!(
            "Stages: {} ok / {} failed  |  Verdict: {} ({}/{} pass/fail stages passed)",
            s.succeeded,
            s.failed,
            if s.overall_pass { "PASS" } else { "FAIL" },
            s.passed_count,
            s.pass_fail_stages,
        ));

        lines.join("\n")
    }
}

/// Convert a `Duration` to milliseconds as `f64`.
#[must_use]
pub fn duration_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

fn truncate(name: &str, width: usize) -> String {
    if name.chars().count() <= width {
        name.to_owned()
    } else {
        let mut out: String = name.chars().take(width.saturating_sub(1)).collect();
        out.push('~');
        out
    }
}

/// Compact detail string for one result.
fn format_details(r: &StageResult) -> String {
    let mut details = match &r.outcome {
        StageOutcome::Filter { error: None, .. } => "image modified".to_owned(),
        StageOutcome::Filter {
            error: Some(message),
            ..
        } => format!("kept input: {message}"),
        StageOutcome::Blob(m) => format!(
            "{} blobs, area={:.1} of {} px",
            m.blob_count, m.total_area, m.roi_area
        ),
        StageOutcome::Locate(m) => m.located().map_or_else(
            || "no edge".to_owned(),
            |e| format!("edge ({:.1}, {:.1}) {:.1}deg", e.x, e.y, e.angle_deg),
        ),
        StageOutcome::Math(m) => format!("{:?} = {:.4}", m.operation, m.value),
        StageOutcome::Error { message } => message.clone(),
    };
    if let Some(roi) = r.effective_roi {
        details.push_str(&format!(
            "  roi=({},{} {}x{})",
            roi.x, roi.y, roi.width, roi.height
        ));
    }
    if r.roi_degenerate {
        details.push_str("  roi=degenerate");
    }
    match r.pass {
        Some(true) => details.push_str("  [pass]"),
        Some(false) => details.push_str("  [FAIL]"),
        None => {}
    }
    details
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use image::GrayImage;

    use super::*;
    use crate::config::StageKind;
    use crate::result::StageKey;

    fn result(index: usize, status: StageStatus, pass: Option<bool>, ms: f64) -> StageResult {
        StageResult {
            stage_id: StageKey::Index(index),
            stage_index: index,
            stage_name: format!("stage {index}"),
            stage_type: StageKind::Threshold,
            status,
            processing_time_ms: ms,
            effective_roi: None,
            roi_degenerate: false,
            applied_offset: None,
            pass,
            outcome: StageOutcome::Filter {
                image_modified: true,
                error: (status == StageStatus::Error).then(|| "bad".to_owned()),
            },
        }
    }

    #[test]
    fn duration_ms_converts_correctly() {
        let d = Duration::from_millis(1234);
        assert!((duration_ms(d) - 1234.0).abs() < 0.01);
    }

    #[test]
    fn no_verdict_stages_pass_vacuously() {
        let s = Summary::from_results(&[], Duration::from_millis(2));
        assert!(s.overall_pass);
        assert_eq!(s.total_stages, 0);
        assert!((s.overhead_ms - 2.0).abs() < 1e-9);
    }

    #[test]
    fn verdict_ignores_unflagged_failures() {
        let results = [
            result(0, StageStatus::Error, None, 1.0),
            result(1, StageStatus::Success, Some(true), 2.0),
        ];
        let s = Summary::from_results(&results, Duration::from_millis(10));
        assert_eq!(s.succeeded, 1);
        assert_eq!(s.failed, 1);
        assert_eq!(s.pass_fail_stages, 1);
        assert!(s.overall_pass);
        assert!((s.stages_time_ms - 3.0).abs() < 1e-9);
        assert!((s.overhead_ms - 7.0).abs() < 1e-9);
    }

    #[test]
    fn any_failed_verdict_stage_fails_the_cycle() {
        let results = [
            result(0, StageStatus::Success, Some(true), 0.0),
            result(1, StageStatus::Error, Some(false), 0.0),
        ];
        assert!(!Summary::from_results(&results, Duration::ZERO).overall_pass);
    }

    #[test]
    fn report_lists_every_stage() {
        let results = vec![
            result(0, StageStatus::Success, None, 1.0),
            result(1, StageStatus::Error, Some(false), 1.0),
        ];
        let run = InspectionRun {
            summary: Summary::from_results(&results, Duration::from_millis(4)),
            results,
            final_image: Frame::Gray(GrayImage::new(8, 6)),
        };
        let report = run.report();
        assert!(report.contains("Inspection Report"));
        assert!(report.contains("8x6 (1 channel)"));
        assert!(report.contains("stage 0"));
        assert!(report.contains("kept input: bad"));
        assert!(report.contains("Verdict: FAIL"));
    }

    #[test]
    fn long_names_are_truncated() {
        assert_eq!(truncate("short", 20), "short");
        assert_eq!(truncate("abcdefghij", 5), "abcd~");
    }
}
