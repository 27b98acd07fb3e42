//! The inspection orchestrator.
//!
//! A [`Pipeline`] owns an ordered list of validated [`Stage`]s and runs them
//! strictly in sequence over one working image per cycle:
//!
//! ```rust
//! # use vigil_pipeline::{Frame, Pipeline, PipelineError};
//! # fn run(frame: Frame) -> Result<(), PipelineError> {
//! let pipeline = Pipeline::from_json(
//!     r#"[
//!         {"id": 1, "type": "grayscale", "method": "luminance"},
//!         {"id": 2, "type": "threshold", "mode": "binary", "min": 128, "max": 255},
//!         {"id": 3, "type": "blob", "affects_verdict": true,
//!          "area_min": 10, "blob_count_test": true, "test_blob_count_min": 1}
//!     ]"#,
//! )?;
//! let run = pipeline.run(&frame)?;
//! println!("{}", run.report());
//! # Ok(())
//! # }
//! ```
//!
//! For every stage the orchestrator asks transform propagation for the
//! cumulative offset, resolves the stage's ROI, hands the sub-image to the
//! stage, and writes filter output back through the ROI mask. A failing
//! stage is recorded and the cycle continues; nothing but an empty input
//! image escapes [`Pipeline::run`].

use tracing::{debug, info, warn};

use crate::config::{self, StageConfig, StageKind};
use crate::diagnostics::{Clock, InspectionRun, StdClock, Summary, duration_ms};
use crate::result::{StageOutcome, StageResult, StageStatus};
use crate::roi::{self, Region};
use crate::stage::{Context, Output, Stage};
use crate::types::{BoundingBox, ConfigError, Frame, PipelineError, StageError};

/// Gray output of the previous stage, kept for an immediately following
/// Blob stage over the same box.
struct GrayCache {
    bbox: BoundingBox,
    frame: Frame,
}

/// A validated, ready-to-run stage list.
#[derive(Debug, Clone)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

// ───────────────────────── Construction ──────────────────────────────

impl Pipeline {
    /// Build a pipeline from stage configurations in execution order.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`]: invalid parameters, duplicate
    /// ids, Math references that do not point strictly backward, or
    /// formulas that do not parse.
    pub fn from_config(configs: Vec<StageConfig>) -> Result<Self, ConfigError> {
        config::validate(&configs)?;
        let stages = configs
            .into_iter()
            .enumerate()
            .map(|(index, config)| Stage::from_config(index, config))
            .collect::<Result<Vec<_>, _>>()?;
        debug!(stages = stages.len(), "pipeline configured");
        Ok(Self { stages })
    }

    /// Build a pipeline from a JSON stage list.
    ///
    /// # Errors
    ///
    /// See [`config::from_json`] and [`Pipeline::from_config`].
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Self::from_config(config::from_json(json)?)
    }

    /// Re-check every stage configuration without running any data.
    #[must_use]
    pub fn validate(&self) -> bool {
        self.check().is_ok()
    }

    /// Like [`validate`](Self::validate), but reports what is wrong.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn check(&self) -> Result<(), ConfigError> {
        let configs: Vec<StageConfig> = self.stages.iter().map(|s| s.config().clone()).collect();
        config::validate(&configs)
    }
}

// ───────────────────────── Lookup ────────────────────────────────────

impl Pipeline {
    /// Stages in execution order.
    #[must_use]
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Number of stages.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.stages.len()
    }

    /// Returns `true` if the pipeline has no stages.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// The stage configured with `id`.
    #[must_use]
    pub fn stage_by_id(&self, id: i64) -> Option<&Stage> {
        self.stages.iter().find(|s| s.config().id == Some(id))
    }

    /// All stages of `kind`, in execution order.
    pub fn stages_of_kind(&self, kind: StageKind) -> impl Iterator<Item = &Stage> {
        self.stages.iter().filter(move |s| s.kind() == kind)
    }
}

// ───────────────────────── Execution ─────────────────────────────────

impl Pipeline {
    /// Run one inspection cycle over `image`.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::EmptyImage`] if `image` has no pixels.
    /// Stage failures are recorded in the returned run instead.
    pub fn run(&self, image: &Frame) -> Result<InspectionRun, PipelineError> {
        self.run_with_clock(image, &StdClock)
    }

    /// [`run`](Self::run) with a caller-supplied clock.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::EmptyImage`] if `image` has no pixels.
    pub fn run_with_clock<C: Clock>(
        &self,
        image: &Frame,
        clock: &C,
    ) -> Result<InspectionRun, PipelineError> {
        if image.is_empty() {
            return Err(PipelineError::EmptyImage);
        }
        let cycle_start = clock.now();
        let dimensions = image.dimensions();
        let mut working = image.clone();
        let mut results: Vec<StageResult> = Vec::with_capacity(self.stages.len());
        let mut gray_cache: Option<GrayCache> = None;

        for stage in &self.stages {
            let started = clock.now();
            let configured = stage.config().roi.as_ref();
            let offset = configured.and(crate::transform::cumulative_offset(stage.index(), &results));

            let mut region = roi::resolve(configured, offset.as_ref(), dimensions);
            let degenerate = region.is_degenerate();
            if degenerate {
                warn!(
                    stage = stage.name(),
                    roi = ?configured,
                    "ROI resolves to no pixels, running on the whole image"
                );
                region = Region::full(dimensions);
            }

            let cached = gray_cache
                .take()
                .filter(|c| stage.kind() == StageKind::Blob && c.bbox == region.bbox);
            if cached.is_some() {
                debug!(stage = stage.name(), "reusing grayscale output");
            }
            let sub = cached.map_or_else(|| working.crop(region.bbox), |c| c.frame);

            debug!(
                stage = stage.name(),
                kind = %stage.kind(),
                bbox = ?region.bbox,
                "running stage"
            );
            let ctx = Context {
                bbox: region.bbox,
                image: dimensions,
                results: &results,
            };
            let processed = stage.process(&sub, ctx);
            let (status, pass, outcome) = match processed {
                Ok(Output::Image(out)) => {
                    let keep = (stage.kind() == StageKind::Grayscale && region.mask.is_none())
                        .then(|| out.clone());
                    match roi::apply(&mut working, out, region.bbox, region.mask.as_ref()) {
                        Ok(()) => {
                            gray_cache = keep.map(|frame| GrayCache {
                                bbox: region.bbox,
                                frame,
                            });
                            (
                                StageStatus::Success,
                                None,
                                StageOutcome::Filter {
                                    image_modified: true,
                                    error: None,
                                },
                            )
                        }
                        Err(e) => filter_failure(stage, &e),
                    }
                }
                Ok(Output::Blob(m)) => (
                    StageStatus::Success,
                    verdict(stage, || m.test_outcomes.overall_pass),
                    StageOutcome::Blob(m),
                ),
                Ok(Output::Locate(m)) => (
                    StageStatus::Success,
                    verdict(stage, || true),
                    StageOutcome::Locate(m),
                ),
                Ok(Output::Math(m)) => (
                    StageStatus::Success,
                    verdict(stage, || m.operation.passes(m.value)),
                    StageOutcome::Math(m),
                ),
                Err(e) if stage.kind().is_filter() => filter_failure(stage, &e),
                Err(e) => {
                    warn!(stage = stage.name(), error = %e, "stage failed");
                    (
                        StageStatus::Error,
                        verdict(stage, || false),
                        StageOutcome::Error {
                            message: e.to_string(),
                        },
                    )
                }
            };

            let processing_time_ms = duration_ms(clock.elapsed(&started));
            debug!(
                stage = stage.name(),
                ?status,
                ?pass,
                ms = processing_time_ms,
                "stage finished"
            );
            results.push(StageResult {
                stage_id: stage.key(),
                stage_index: stage.index(),
                stage_name: stage.name().to_owned(),
                stage_type: stage.kind(),
                status,
                processing_time_ms,
                effective_roi: (configured.is_some() && !degenerate).then_some(region.bbox),
                roi_degenerate: degenerate,
                applied_offset: offset,
                pass,
                outcome,
            });
        }

        let summary = Summary::from_results(&results, clock.elapsed(&cycle_start));
        info!(
            stages = summary.total_stages,
            failed = summary.failed,
            overall_pass = summary.overall_pass,
            ms = summary.total_time_ms,
            "inspection cycle complete"
        );
        Ok(InspectionRun {
            results,
            final_image: working,
            summary,
        })
    }
}

/// `Some(pass())` for verdict stages, `None` otherwise.
fn verdict(stage: &Stage, pass: impl FnOnce() -> bool) -> Option<bool> {
    stage.config().affects_verdict.then(pass)
}

/// Outcome of a filter that fell back to its input.
fn filter_failure(stage: &Stage, error: &StageError) -> (StageStatus, Option<bool>, StageOutcome) {
    warn!(stage = stage.name(), error = %error, "filter failed, keeping input");
    (
        StageStatus::Error,
        verdict(stage, || false),
        StageOutcome::Filter {
            image_modified: true,
            error: Some(error.to_string()),
        },
    )
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::cell::Cell;
    use std::time::Duration;

    use image::{GrayImage, Luma, Rgb, RgbImage};

    use super::*;
    use crate::blob::BlobParams;
    use crate::blur::BlurParams;
    use crate::config::StageParams;
    use crate::grayscale::GrayscaleParams;
    use crate::math::{MathOperation, MathParams};
    use crate::roi::Roi;
    use crate::threshold::ThresholdParams;

    /// Advances one millisecond every time it is read.
    struct TickClock(Cell<u64>);

    impl Clock for TickClock {
        type Instant = u64;

        fn now(&self) -> u64 {
            let t = self.0.get() + 1;
            self.0.set(t);
            t
        }

        fn elapsed(&self, since: &u64) -> Duration {
            Duration::from_millis(self.now() - since)
        }
    }

    fn squares() -> Frame {
        Frame::Gray(GrayImage::from_fn(40, 40, |x, y| {
            let inside = |x0: u32, y0: u32| (x0..x0 + 8).contains(&x) && (y0..y0 + 8).contains(&y);
            Luma([if inside(4, 4) || inside(24, 24) { 220 } else { 20 }])
        }))
    }

    fn blob(affects: bool) -> StageConfig {
        let config = StageConfig::new(
            "blobs",
            StageParams::Blob(BlobParams {
                th_min: 128,
                blob_count_test: true,
                test_blob_count_min: 2,
                test_blob_count_max: Some(2),
                ..BlobParams::default()
            }),
        )
        .with_id(10);
        if affects { config.affecting_verdict() } else { config }
    }

    #[test]
    fn empty_pipeline_is_identity() {
        let pipeline = Pipeline::from_config(Vec::new()).unwrap();
        assert!(pipeline.is_empty());
        let input = squares();
        let run = pipeline.run(&input).unwrap();
        assert!(run.summary.overall_pass);
        assert_eq!(run.final_image, input);
        assert!(run.results.is_empty());
    }

    #[test]
    fn empty_image_is_rejected() {
        let pipeline = Pipeline::from_config(vec![blob(false)]).unwrap();
        let err = pipeline.run(&Frame::Gray(GrayImage::new(0, 0))).unwrap_err();
        assert!(matches!(err, PipelineError::EmptyImage));
    }

    #[test]
    fn blob_verdict_drives_overall_pass() {
        let run = Pipeline::from_config(vec![blob(true)])
            .unwrap()
            .run(&squares())
            .unwrap();
        let r = &run.results[0];
        assert_eq!(r.pass, Some(true));
        let StageOutcome::Blob(m) = &r.outcome else {
            unreachable!("expected blob outcome");
        };
        assert_eq!(m.blob_count, 2);
        assert!(run.summary.overall_pass);
        assert_eq!(run.summary.pass_fail_stages, 1);
    }

    #[test]
    fn failing_math_stage_is_isolated() {
        // Reference is a filter, which has no total_area.
        let configs = vec![
            StageConfig::new("gray", StageParams::Grayscale(GrayscaleParams::default())).with_id(1),
            StageConfig::new(
                "ratio",
                StageParams::Math(MathParams {
                    operation: MathOperation::AreaRatio,
                    formula: None,
                    reference_stage_id: Some(1),
                }),
            )
            .with_id(2)
            .affecting_verdict(),
            blob(false),
        ];
        let run = Pipeline::from_config(configs).unwrap().run(&squares()).unwrap();
        assert_eq!(run.results.len(), 3);
        assert_eq!(run.results[1].status, StageStatus::Error);
        assert_eq!(run.results[1].pass, Some(false));
        assert!(run.results[1].is_error());
        assert_eq!(run.results[2].status, StageStatus::Success);
        assert!(!run.summary.overall_pass);
        assert_eq!(run.summary.failed, 1);
    }

    #[test]
    fn degenerate_roi_falls_back_to_whole_image() {
        let config = blob(false).with_roi(Roi::Rect {
            x: 5,
            y: 5,
            w: 0,
            h: 10,
        });
        let run = Pipeline::from_config(vec![config]).unwrap().run(&squares()).unwrap();
        let r = &run.results[0];
        assert!(r.roi_degenerate);
        assert_eq!(r.effective_roi, None);
        let StageOutcome::Blob(m) = &r.outcome else {
            unreachable!("expected blob outcome");
        };
        assert_eq!(m.roi_area, 1600);
        assert_eq!(m.blob_count, 2);
    }

    #[test]
    fn filter_writes_back_only_inside_roi() {
        let configs = vec![
            StageConfig::new("bin", StageParams::Threshold(ThresholdParams::default())).with_roi(
                Roi::Rect {
                    x: 0,
                    y: 0,
                    w: 20,
                    h: 20,
                },
            ),
        ];
        let input = squares();
        let run = Pipeline::from_config(configs).unwrap().run(&input).unwrap();
        let Frame::Gray(out) = &run.final_image else {
            unreachable!("gray in, gray out");
        };
        assert_eq!(out.get_pixel(5, 5).0[0], 255);
        assert_eq!(out.get_pixel(0, 0).0[0], 0);
        // Outside the ROI the original values survive.
        assert_eq!(out.get_pixel(30, 30).0[0], 20);
        assert_eq!(out.get_pixel(25, 25).0[0], 220);
        assert_eq!(run.results[0].effective_roi, Some(BoundingBox::new(0, 0, 20, 20)));
    }

    #[test]
    fn color_image_keeps_its_channels() {
        let input = Frame::Color(RgbImage::from_pixel(10, 10, Rgb([200, 100, 50])));
        let configs = vec![StageConfig::new(
            "gray",
            StageParams::Grayscale(GrayscaleParams {
                normalize: false,
                ..GrayscaleParams::default()
            }),
        )];
        let run = Pipeline::from_config(configs).unwrap().run(&input).unwrap();
        assert_eq!(run.final_image.channels(), 3);
        let Frame::Color(out) = &run.final_image else {
            unreachable!("color in, color out");
        };
        let [r, g, b] = out.get_pixel(3, 3).0;
        assert_eq!((r, g), (g, b));
    }

    #[test]
    fn gray_cache_does_not_change_blob_results() {
        let input = squares();
        let with_gray = Pipeline::from_config(vec![
            StageConfig::new(
                "gray",
                StageParams::Grayscale(GrayscaleParams {
                    normalize: false,
                    ..GrayscaleParams::default()
                }),
            ),
            blob(false),
        ])
        .unwrap()
        .run(&input)
        .unwrap();
        let alone = Pipeline::from_config(vec![blob(false)]).unwrap().run(&input).unwrap();
        assert_eq!(with_gray.results[1].outcome, alone.results[0].outcome);
    }

    #[test]
    fn timing_comes_from_the_clock() {
        let clock = TickClock(Cell::new(0));
        let run = Pipeline::from_config(vec![blob(false)])
            .unwrap()
            .run_with_clock(&squares(), &clock)
            .unwrap();
        assert!((run.results[0].processing_time_ms - 1.0).abs() < 1e-9);
        assert!((run.summary.total_time_ms - 3.0).abs() < 1e-9);
        assert!((run.summary.overhead_ms - 2.0).abs() < 1e-9);
    }

    #[test]
    fn lookup_helpers() {
        let pipeline = Pipeline::from_config(vec![
            StageConfig::new("gray", StageParams::Grayscale(GrayscaleParams::default())).with_id(1),
            blob(false),
        ])
        .unwrap();
        assert_eq!(pipeline.len(), 2);
        assert!(pipeline.validate());
        assert_eq!(pipeline.stage_by_id(10).map(Stage::name), Some("blobs"));
        assert!(pipeline.stage_by_id(99).is_none());
        assert_eq!(pipeline.stages_of_kind(StageKind::Grayscale).count(), 1);
        assert_eq!(pipeline.stages_of_kind(StageKind::Math).count(), 0);
    }

    #[test]
    fn filter_failure_keeps_input_and_fails_verdict() {
        let config = StageConfig::new("smooth", StageParams::Blur(BlurParams::default()))
            .affecting_verdict();
        let stage = Stage::from_config(0, config).unwrap();
        let (status, pass, outcome) =
            filter_failure(&stage, &StageError::InvalidInput("bad sigma".to_owned()));
        assert_eq!(status, StageStatus::Error);
        assert_eq!(pass, Some(false));
        assert!(matches!(
            outcome,
            StageOutcome::Filter {
                image_modified: true,
                error: Some(_)
            }
        ));
    }
}
