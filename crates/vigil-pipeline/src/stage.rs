//! Compiled stages and per-kind dispatch.

use crate::blob::{self, BlobMeasurement};
use crate::blur::{self, BlurParams};
use crate::config::{self, StageConfig, StageKind, StageParams};
use crate::formula::Formula;
use crate::grayscale::{self, GrayscaleParams};
use crate::locate::{self, LocateMeasurement};
use crate::math::{self, MathMeasurement};
use crate::morphology::{self, MorphologyParams};
use crate::result::{StageKey, StageResult};
use crate::threshold::{self, ThresholdParams};
use crate::types::{BoundingBox, ConfigError, Dimensions, Frame, StageError};

/// A stage that replaces its sub-image.
///
/// Filters may return a different channel count than they were given; the
/// ROI engine reconciles it on write-back.
pub trait Filter {
    /// Process `input` into a replacement of the same size.
    ///
    /// # Errors
    ///
    /// Returns a [`StageError`] if the filter cannot run; the orchestrator
    /// then keeps the input unchanged.
    fn filter(&self, input: &Frame) -> Result<Frame, StageError>;
}

impl Filter for GrayscaleParams {
    fn filter(&self, input: &Frame) -> Result<Frame, StageError> {
        grayscale::apply(input, self)
    }
}

impl Filter for BlurParams {
    fn filter(&self, input: &Frame) -> Result<Frame, StageError> {
        blur::apply(input, self)
    }
}

impl Filter for ThresholdParams {
    fn filter(&self, input: &Frame) -> Result<Frame, StageError> {
        threshold::apply(input, self)
    }
}

impl Filter for MorphologyParams {
    fn filter(&self, input: &Frame) -> Result<Frame, StageError> {
        morphology::apply(input, self)
    }
}

/// What running a stage produced.
#[derive(Debug)]
pub enum Output {
    /// Replacement sub-image from a filter.
    Image(Frame),
    /// Blob measurement.
    Blob(BlobMeasurement),
    /// Locate measurement.
    Locate(LocateMeasurement),
    /// Math value.
    Math(MathMeasurement),
}

/// Inputs a stage sees besides its sub-image.
#[derive(Debug, Clone, Copy)]
pub struct Context<'a> {
    /// Where the sub-image sits in the working image.
    pub bbox: BoundingBox,
    /// Working image size.
    pub image: Dimensions,
    /// Results of the stages that already ran this cycle.
    pub results: &'a [StageResult],
}

/// A validated stage ready to run.
#[derive(Debug, Clone)]
pub struct Stage {
    index: usize,
    name: String,
    config: StageConfig,
    formula: Option<Formula>,
}

impl Stage {
    /// Build the stage at pipeline position `index`.
    ///
    /// Checks the stage's own parameters and compiles a custom formula.
    /// Cross-stage references are checked by [`config::validate`].
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidParameter`] or
    /// [`ConfigError::Formula`] for a stage that cannot run.
    pub fn from_config(index: usize, config: StageConfig) -> Result<Self, ConfigError> {
        let name = config::display_name(&config, index);
        config
            .params
            .validate()
            .map_err(|reason| ConfigError::InvalidParameter {
                stage: name.clone(),
                reason,
            })?;
        let formula = match &config.params {
            StageParams::Math(params) => params.compile(&name)?,
            _ => None,
        };
        Ok(Self {
            index,
            name,
            config,
            formula,
        })
    }

    /// Pipeline position.
    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }

    /// Result lookup key.
    #[must_use]
    pub fn key(&self) -> StageKey {
        StageKey::new(self.config.id, self.index)
    }

    /// Display name (configured, or derived from type and position).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stage kind.
    #[must_use]
    pub const fn kind(&self) -> StageKind {
        self.config.kind()
    }

    /// The configuration this stage was built from.
    #[must_use]
    pub const fn config(&self) -> &StageConfig {
        &self.config
    }

    /// Run the stage on `input`.
    ///
    /// # Errors
    ///
    /// Returns the filter's error, or a [`StageError`] when a Math stage's
    /// reference cannot be resolved or evaluated.
    pub fn process(&self, input: &Frame, ctx: Context<'_>) -> Result<Output, StageError> {
        match &self.config.params {
            StageParams::Grayscale(p) => p.filter(input).map(Output::Image),
            StageParams::Blur(p) => p.filter(input).map(Output::Image),
            StageParams::Threshold(p) => p.filter(input).map(Output::Image),
            StageParams::Morphology(p) => p.filter(input).map(Output::Image),
            StageParams::Blob(p) => Ok(Output::Blob(blob::analyze(input, p))),
            StageParams::Locate(p) => Ok(Output::Locate(locate::analyze(
                input, ctx.bbox, ctx.image, p,
            ))),
            StageParams::Math(p) => {
                let id = p
                    .reference_stage_id
                    .ok_or_else(|| StageError::Reference("<none>".to_owned()))?;
                let key = StageKey::Id(id);
                let reference = ctx
                    .results
                    .iter()
                    .find(|r| r.stage_id == key)
                    .ok_or_else(|| StageError::Reference(key.to_string()))?;
                math::evaluate(p.operation, self.formula.as_ref(), reference).map(Output::Math)
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use image::GrayImage;

    use super::*;
    use crate::math::{MathOperation, MathParams};

    fn ctx(results: &[StageResult]) -> Context<'_> {
        Context {
            bbox: BoundingBox::new(0, 0, 4, 4),
            image: Dimensions {
                width: 4,
                height: 4,
            },
            results,
        }
    }

    #[test]
    fn filters_dispatch_to_their_module() {
        let stage = Stage::from_config(
            0,
            StageConfig::new("bin", StageParams::Threshold(ThresholdParams::default())),
        )
        .unwrap();
        let input = Frame::Gray(GrayImage::from_fn(4, 4, |x, _| image::Luma([if x < 2 { 10 } else { 200 }])));
        let Output::Image(Frame::Gray(out)) = stage.process(&input, ctx(&[])).unwrap() else {
            unreachable!("threshold returns a gray image");
        };
        assert_eq!(out.get_pixel(0, 0).0[0], 0);
        assert_eq!(out.get_pixel(3, 0).0[0], 255);
    }

    #[test]
    fn derived_name_and_key() {
        let stage = Stage::from_config(
            3,
            StageConfig::new("", StageParams::Blur(BlurParams::default())),
        )
        .unwrap();
        assert_eq!(stage.name(), "blur_3");
        assert_eq!(stage.key(), StageKey::Index(3));
        assert!(stage.kind().is_filter());
    }

    #[test]
    fn math_without_reference_result_fails() {
        let stage = Stage::from_config(
            1,
            StageConfig::new(
                "ratio",
                StageParams::Math(MathParams {
                    operation: MathOperation::AreaRatio,
                    formula: None,
                    reference_stage_id: Some(5),
                }),
            ),
        )
        .unwrap();
        let input = Frame::Gray(GrayImage::new(4, 4));
        let err = stage.process(&input, ctx(&[])).unwrap_err();
        assert_eq!(err, StageError::Reference("5".to_owned()));
    }

    #[test]
    fn formula_is_compiled_up_front() {
        let err = Stage::from_config(
            0,
            StageConfig::new(
                "f",
                StageParams::Math(MathParams {
                    operation: MathOperation::CustomFormula,
                    formula: Some("1 +".to_owned()),
                    reference_stage_id: Some(0),
                }),
            ),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Formula { .. }));
    }
}
