//! vigil-pipeline: configurable machine-vision inspection pipeline
//! (sans-IO).
//!
//! Turns one captured image plus a declarative stage list into a pass/fail
//! verdict and per-stage measurements:
//!
//! - **ROI engine** ([`roi`]): rectangles, circles and rotated ellipses
//!   resolved to a clipped box and mask, with masked write-back.
//! - **Transform propagation** ([`transform`]): upstream Locate stages
//!   shift (and optionally rotate) downstream ROIs.
//! - **Filters**: [`grayscale`], [`blur`], [`threshold`], [`morphology`].
//! - **Analysis**: [`blob`] (contours, areas, count tests) and [`locate`]
//!   (edge pose along a sampling arrow).
//! - **Math** ([`math`]): ratios and sandboxed [`formula`]s over an earlier
//!   stage's result.
//! - **Orchestrator** ([`Pipeline`]): sequential execution with per-stage
//!   timing, error isolation, and verdict aggregation.
//!
//! This crate has **no I/O dependencies** beyond in-memory image decoding.
//! Acquisition, transport and persistence are the caller's concern.

pub mod blob;
pub mod blur;
pub mod config;
pub mod contour;
pub mod diagnostics;
pub mod formula;
pub mod grayscale;
pub mod locate;
pub mod math;
pub mod morphology;
pub mod pipeline;
pub mod result;
pub mod roi;
pub mod simplify;
pub mod stage;
pub mod threshold;
pub mod transform;
pub mod types;

pub use config::{StageConfig, StageKind, StageParams};
pub use contour::{ChainApproximation, ContourTracer};
pub use diagnostics::{Clock, InspectionRun, StdClock, Summary};
pub use pipeline::Pipeline;
pub use result::{StageKey, StageOutcome, StageResult, StageStatus};
pub use roi::{Region, Roi};
pub use stage::{Filter, Stage};
pub use types::{
    BoundingBox, ConfigError, Dimensions, Frame, PipelineError, Point, Pose, PoseOffset,
    StageError,
};

/// Decode `image_bytes` and run one inspection cycle.
///
/// # Errors
///
/// Returns [`PipelineError::EmptyImage`] if `image_bytes` is empty and
/// [`PipelineError::ImageDecode`] if the format is unrecognized.
pub fn inspect(image_bytes: &[u8], pipeline: &Pipeline) -> Result<InspectionRun, PipelineError> {
    let frame = Frame::decode(image_bytes)?;
    pipeline.run(&frame)
}
