//! Math stage: arithmetic over an earlier stage's result.

use std::ops::RangeInclusive;

use serde::{Deserialize, Serialize};

use crate::formula::Formula;
use crate::result::{StageKey, StageResult};
use crate::types::{ConfigError, StageError};

/// Pass band for [`MathOperation::AreaRatio`].
pub const AREA_RATIO_BAND: RangeInclusive<f64> = 0.1..=0.9;

/// Pass band for [`MathOperation::BlobDensity`].
pub const BLOB_DENSITY_BAND: RangeInclusive<f64> = 0.01..=0.1;

/// What a Math stage computes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MathOperation {
    /// `total_area / roi_area`.
    #[default]
    AreaRatio,
    /// `blob_count / roi_area`.
    BlobDensity,
    /// User formula over the reference result's numeric fields.
    CustomFormula,
}

impl MathOperation {
    /// Whether `value` passes this operation's fixed band.
    ///
    /// Custom formulas always pass.
    #[must_use]
    pub fn passes(self, value: f64) -> bool {
        match self {
            Self::AreaRatio => AREA_RATIO_BAND.contains(&value),
            Self::BlobDensity => BLOB_DENSITY_BAND.contains(&value),
            Self::CustomFormula => true,
        }
    }
}

/// Parameters of a Math stage.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MathParams {
    /// Operation to evaluate.
    pub operation: MathOperation,
    /// Expression for [`MathOperation::CustomFormula`].
    pub formula: Option<String>,
    /// Id of the earlier stage whose result is read.
    #[serde(alias = "referenceStageId")]
    pub reference_stage_id: Option<i64>,
}

impl MathParams {
    /// Parse the formula, if this is a custom-formula stage.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidParameter`] when a custom formula is
    /// missing and [`ConfigError::Formula`] when it does not parse.
    pub fn compile(&self, stage: &str) -> Result<Option<Formula>, ConfigError> {
        if self.operation != MathOperation::CustomFormula {
            return Ok(None);
        }
        match self.formula.as_deref().map(str::trim) {
            None | Some("") => Err(ConfigError::InvalidParameter {
                stage: stage.to_owned(),
                reason: "custom_formula requires a formula".to_owned(),
            }),
            Some(text) => Formula::parse(text)
                .map(Some)
                .map_err(|source| ConfigError::Formula {
                    stage: stage.to_owned(),
                    source,
                }),
        }
    }
}

/// Measurement produced by a Math stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MathMeasurement {
    /// Evaluated operation.
    pub operation: MathOperation,
    /// Computed value.
    pub value: f64,
    /// Stage whose result was read.
    pub reference: StageKey,
    /// Formula text for custom formulas.
    pub formula: Option<String>,
}

/// Evaluate `operation` against `reference`.
///
/// `formula` must be the compiled formula for custom-formula stages.
///
/// # Errors
///
/// Returns [`StageError::Reference`] when the reference stage failed,
/// [`StageError::MissingField`] when its result lacks a needed field, and
/// [`StageError::Formula`] when formula evaluation fails.
pub fn evaluate(
    operation: MathOperation,
    formula: Option<&Formula>,
    reference: &StageResult,
) -> Result<MathMeasurement, StageError> {
    if reference.is_error() {
        return Err(StageError::Reference(reference.stage_id.to_string()));
    }
    let fields = reference.numeric_fields();
    let field = |name: &'static str| fields.get(name).copied().ok_or(StageError::MissingField(name));

    let value = match operation {
        MathOperation::AreaRatio => ratio(field("total_area")?, field("roi_area")?),
        MathOperation::BlobDensity => ratio(field("blob_count")?, field("roi_area")?),
        MathOperation::CustomFormula => {
            let formula = formula.ok_or(StageError::MissingField("formula"))?;
            formula.evaluate(&fields)?
        }
    };

    Ok(MathMeasurement {
        operation,
        value,
        reference: reference.stage_id,
        formula: formula.map(|f| f.source().to_owned()),
    })
}

/// `numerator / roi_area`, or 0 for an empty ROI.
fn ratio(numerator: f64, roi_area: f64) -> f64 {
    if roi_area == 0.0 { 0.0 } else { numerator / roi_area }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::blob::{BlobMeasurement, TestOutcomes};
    use crate::config::StageKind;
    use crate::formula::FormulaError;
    use crate::result::{StageOutcome, StageStatus};

    fn blob_result(blob_count: usize, total_area: f64, roi_area: u64) -> StageResult {
        StageResult {
            stage_id: StageKey::Id(1),
            stage_index: 0,
            stage_name: "blobs".to_owned(),
            stage_type: StageKind::Blob,
            status: StageStatus::Success,
            processing_time_ms: 2.0,
            effective_roi: None,
            roi_degenerate: false,
            applied_offset: None,
            pass: None,
            outcome: StageOutcome::Blob(BlobMeasurement {
                blobs: Vec::new(),
                blob_count,
                total_area,
                roi_area,
                test_outcomes: TestOutcomes {
                    total_area: None,
                    blob_count: None,
                    overall_pass: true,
                },
            }),
        }
    }

    #[test]
    fn area_ratio_with_empty_roi_is_zero() {
        let m = evaluate(MathOperation::AreaRatio, None, &blob_result(1, 50.0, 0)).unwrap();
        assert!(m.value.abs() < f64::EPSILON);
        assert_eq!(m.reference, StageKey::Id(1));
    }

    #[test]
    fn area_ratio_and_density() {
        let r = blob_result(4, 25.0, 100);
        let ratio = evaluate(MathOperation::AreaRatio, None, &r).unwrap();
        assert!((ratio.value - 0.25).abs() < 1e-12);
        assert!(MathOperation::AreaRatio.passes(ratio.value));

        let density = evaluate(MathOperation::BlobDensity, None, &r).unwrap();
        assert!((density.value - 0.04).abs() < 1e-12);
        assert!(MathOperation::BlobDensity.passes(density.value));
        assert!(!MathOperation::BlobDensity.passes(0.5));
    }

    #[test]
    fn custom_formula_sees_reference_fields() {
        let params = MathParams {
            operation: MathOperation::CustomFormula,
            formula: Some("total_area / blob_count + 1".to_owned()),
            reference_stage_id: Some(1),
        };
        let formula = params.compile("m").unwrap();
        let m = evaluate(MathOperation::CustomFormula, formula.as_ref(), &blob_result(4, 40.0, 100))
            .unwrap();
        assert!((m.value - 11.0).abs() < 1e-12);
        assert_eq!(m.formula.as_deref(), Some("total_area / blob_count + 1"));
        assert!(MathOperation::CustomFormula.passes(-1e9));
    }

    #[test]
    fn formula_division_by_zero_is_stage_error() {
        let formula = Formula::parse("total_area / blob_count").unwrap();
        let err = evaluate(MathOperation::CustomFormula, Some(&formula), &blob_result(0, 40.0, 100))
            .unwrap_err();
        assert_eq!(err, StageError::Formula(FormulaError::DivisionByZero));
    }

    #[test]
    fn missing_field_is_reported() {
        let mut r = blob_result(1, 1.0, 1);
        r.outcome = StageOutcome::Filter {
            image_modified: true,
            error: None,
        };
        let err = evaluate(MathOperation::AreaRatio, None, &r).unwrap_err();
        assert_eq!(err, StageError::MissingField("total_area"));
    }

    #[test]
    fn errored_reference_is_rejected() {
        let mut r = blob_result(1, 1.0, 1);
        r.outcome = StageOutcome::Error {
            message: "failed".to_owned(),
        };
        let err = evaluate(MathOperation::AreaRatio, None, &r).unwrap_err();
        assert_eq!(err, StageError::Reference("1".to_owned()));
    }

    #[test]
    fn custom_formula_requires_text() {
        let params = MathParams {
            operation: MathOperation::CustomFormula,
            formula: Some("   ".to_owned()),
            reference_stage_id: Some(1),
        };
        assert!(matches!(
            params.compile("m").unwrap_err(),
            ConfigError::InvalidParameter { .. }
        ));
        let bad = MathParams {
            formula: Some("total_area +".to_owned()),
            ..params
        };
        assert!(matches!(bad.compile("m").unwrap_err(), ConfigError::Formula { .. }));
        assert!(MathParams::default().compile("m").unwrap().is_none());
    }
}
