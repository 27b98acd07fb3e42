//! Declarative stage configuration.
//!
//! A pipeline is an ordered list of [`StageConfig`]s, usually loaded from
//! the JSON an orchestrator pushes:
//!
//! ```json
//! [
//!   {"id": 1, "name": "gray", "type": "grayscale", "method": "luminance"},
//!   {"id": 2, "name": "parts", "type": "blob", "affects_verdict": true,
//!    "roi": {"shape": "rect", "x": 0, "y": 0, "w": 100, "h": 100},
//!    "area_min": 10, "blob_count_test": true, "test_blob_count_max": 5},
//!   {"id": 3, "name": "fill", "type": "math", "operation": "area_ratio",
//!    "reference_stage_id": 2}
//! ]
//! ```
//!
//! Each object carries the common fields plus its type's parameters in the
//! same object.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::blob::BlobParams;
use crate::blur::BlurParams;
use crate::grayscale::GrayscaleParams;
use crate::locate::LocateParams;
use crate::math::MathParams;
use crate::morphology::MorphologyParams;
use crate::roi::Roi;
use crate::threshold::ThresholdParams;
use crate::types::ConfigError;

/// The kinds of stage a pipeline can contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// Color to gray conversion.
    Grayscale,
    /// Smoothing.
    Blur,
    /// Binarization.
    Threshold,
    /// Opening and closing.
    Morphology,
    /// Contour and area analysis.
    Blob,
    /// Edge localization.
    Locate,
    /// Cross-stage arithmetic.
    Math,
}

impl StageKind {
    /// Every stage kind, in declaration order.
    pub const ALL: [Self; 7] = [
        Self::Grayscale,
        Self::Blur,
        Self::Threshold,
        Self::Morphology,
        Self::Blob,
        Self::Locate,
        Self::Math,
    ];

    /// The `type` string used in configurations.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Grayscale => "grayscale",
            Self::Blur => "blur",
            Self::Threshold => "threshold",
            Self::Morphology => "morphology",
            Self::Blob => "blob",
            Self::Locate => "locate",
            Self::Math => "math",
        }
    }

    /// Parse a `type` string.
    #[must_use]
    pub fn from_type_str(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == s)
    }

    /// Returns `true` for stages that replace their sub-image.
    #[must_use]
    pub const fn is_filter(self) -> bool {
        matches!(
            self,
            Self::Grayscale | Self::Blur | Self::Threshold | Self::Morphology
        )
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Type-specific parameters, selected by the `type` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StageParams {
    /// Grayscale filter.
    Grayscale(GrayscaleParams),
    /// Blur filter.
    Blur(BlurParams),
    /// Threshold filter.
    Threshold(ThresholdParams),
    /// Morphology filter.
    Morphology(MorphologyParams),
    /// Blob analysis.
    Blob(BlobParams),
    /// Edge localization.
    Locate(LocateParams),
    /// Cross-stage arithmetic.
    Math(MathParams),
}

impl StageParams {
    /// The kind these parameters belong to.
    #[must_use]
    pub const fn kind(&self) -> StageKind {
        match self {
            Self::Grayscale(_) => StageKind::Grayscale,
            Self::Blur(_) => StageKind::Blur,
            Self::Threshold(_) => StageKind::Threshold,
            Self::Morphology(_) => StageKind::Morphology,
            Self::Blob(_) => StageKind::Blob,
            Self::Locate(_) => StageKind::Locate,
            Self::Math(_) => StageKind::Math,
        }
    }

    /// Check parameter ranges. Math references and formulas are checked by
    /// [`validate`].
    ///
    /// # Errors
    ///
    /// Returns a description of the first invalid parameter.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::Grayscale(p) => p.validate(),
            Self::Blur(p) => p.validate(),
            Self::Blob(p) => p.validate(),
            Self::Locate(p) => p.validate(),
            Self::Threshold(_) | Self::Morphology(_) | Self::Math(_) => Ok(()),
        }
    }
}

/// One configured stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageConfig {
    /// Stable identifier; Math stages refer to other stages by it.
    #[serde(default)]
    pub id: Option<i64>,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Region the stage operates on; `None` is the whole image.
    #[serde(default)]
    pub roi: Option<Roi>,
    /// Whether this stage's pass/fail contributes to the verdict.
    #[serde(default, alias = "affectsVerdict")]
    pub affects_verdict: bool,
    /// Type tag and parameters.
    #[serde(flatten)]
    pub params: StageParams,
}

impl StageConfig {
    /// Create a configuration with default common fields.
    #[must_use]
    pub fn new(name: impl Into<String>, params: StageParams) -> Self {
        Self {
            id: None,
            name: name.into(),
            roi: None,
            affects_verdict: false,
            params,
        }
    }

    /// Set the id.
    #[must_use]
    pub const fn with_id(mut self, id: i64) -> Self {
        self.id = Some(id);
        self
    }

    /// Set the ROI.
    #[must_use]
    pub fn with_roi(mut self, roi: Roi) -> Self {
        self.roi = Some(roi);
        self
    }

    /// Mark the stage as contributing to the verdict.
    #[must_use]
    pub const fn affecting_verdict(mut self) -> Self {
        self.affects_verdict = true;
        self
    }

    /// The stage kind.
    #[must_use]
    pub const fn kind(&self) -> StageKind {
        self.params.kind()
    }
}

/// Parse a stage list from JSON.
///
/// The `type` of every entry is checked before typed deserialization, so an
/// unsupported stage type is reported as such rather than as a generic
/// parse failure.
///
/// # Errors
///
/// Returns [`ConfigError::Parse`] for malformed JSON or parameters and
/// [`ConfigError::UnknownStageType`] for an unrecognized `type`.
pub fn from_json(json: &str) -> Result<Vec<StageConfig>, ConfigError> {
    let value: serde_json::Value =
        serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
    from_value(value)
}

/// Parse a stage list from an already-decoded JSON value.
///
/// # Errors
///
/// See [`from_json`].
pub fn from_value(value: serde_json::Value) -> Result<Vec<StageConfig>, ConfigError> {
    let serde_json::Value::Array(entries) = value else {
        return Err(ConfigError::Parse("stage list must be a JSON array".to_owned()));
    };

    entries
        .into_iter()
        .enumerate()
        .map(|(index, entry)| {
            let found = entry.get("type").and_then(serde_json::Value::as_str);
            match found {
                None => {
                    return Err(ConfigError::Parse(format!(
                        "stage {index}: missing string field `type`"
                    )));
                }
                Some(t) if StageKind::from_type_str(t).is_none() => {
                    return Err(ConfigError::UnknownStageType {
                        index,
                        found: t.to_owned(),
                    });
                }
                Some(_) => {}
            }
            serde_json::from_value(entry)
                .map_err(|e| ConfigError::Parse(format!("stage {index}: {e}")))
        })
        .collect()
}

/// Check a stage list as a whole.
///
/// Verifies every stage's parameters, that ids are unique, and that each
/// Math stage references a strictly earlier stage and has a parseable
/// formula.
///
/// # Errors
///
/// Returns the first [`ConfigError`] found, in pipeline order.
pub fn validate(configs: &[StageConfig]) -> Result<(), ConfigError> {
    let mut positions: HashMap<i64, usize> = HashMap::new();
    for (index, config) in configs.iter().enumerate() {
        if let Some(id) = config.id
            && positions.insert(id, index).is_some()
        {
            return Err(ConfigError::DuplicateStageId(id));
        }
    }

    for (index, config) in configs.iter().enumerate() {
        let stage = display_name(config, index);
        config
            .params
            .validate()
            .map_err(|reason| ConfigError::InvalidParameter {
                stage: stage.clone(),
                reason,
            })?;

        if let StageParams::Math(math) = &config.params {
            let reference = math
                .reference_stage_id
                .ok_or_else(|| ConfigError::MissingReference {
                    stage: stage.clone(),
                })?;
            match positions.get(&reference) {
                None => return Err(ConfigError::UnknownReference { stage, reference }),
                Some(&at) if at >= index => {
                    return Err(ConfigError::ForwardReference { stage, reference });
                }
                Some(_) => {}
            }
            math.compile(&stage)?;
        }
    }
    Ok(())
}

/// The configured name, or `"{type}_{index}"` when it is blank.
#[must_use]
pub fn display_name(config: &StageConfig, index: usize) -> String {
    if config.name.trim().is_empty() {
        format!("{}_{index}", config.kind())
    } else {
        config.name.clone()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::math::MathOperation;
    use crate::threshold::ThresholdMode;

    fn math(reference: Option<i64>) -> StageParams {
        StageParams::Math(MathParams {
            operation: MathOperation::AreaRatio,
            formula: None,
            reference_stage_id: reference,
        })
    }

    fn blob() -> StageParams {
        StageParams::Blob(BlobParams::default())
    }

    #[test]
    fn parses_flattened_parameters() {
        let configs = from_json(
            r#"[
                {"id": 1, "name": "bin", "type": "threshold", "mode": "range", "min": 40, "max": 90},
                {"id": 2, "type": "blob", "affects_verdict": true,
                 "roi": {"shape": "circle", "cx": 50, "cy": 50, "r": 20},
                 "area_min": 10, "area_max": 500}
            ]"#,
        )
        .unwrap();
        assert_eq!(configs.len(), 2);
        let StageParams::Threshold(t) = &configs[0].params else {
            unreachable!("expected threshold params");
        };
        assert_eq!(t.mode, ThresholdMode::Range);
        assert_eq!((t.min, t.max), (40, 90));

        assert!(configs[1].affects_verdict);
        assert_eq!(
            configs[1].roi,
            Some(Roi::Circle {
                cx: 50,
                cy: 50,
                r: 20
            })
        );
        let StageParams::Blob(b) = &configs[1].params else {
            unreachable!("expected blob params");
        };
        assert!((b.area_min - 10.0).abs() < f64::EPSILON);
        assert_eq!(b.area_max, Some(500.0));
    }

    #[test]
    fn unknown_type_is_named() {
        let err = from_json(r#"[{"type": "grayscale"}, {"type": "ocr"}]"#).unwrap_err();
        assert_eq!(
            err,
            ConfigError::UnknownStageType {
                index: 1,
                found: "ocr".to_owned()
            }
        );
    }

    #[test]
    fn missing_type_and_non_array_are_parse_errors() {
        assert!(matches!(from_json(r#"[{"name": "x"}]"#), Err(ConfigError::Parse(_))));
        assert!(matches!(from_json(r#"{"type": "blur"}"#), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn math_must_reference_an_earlier_stage() {
        let ok = [
            StageConfig::new("blobs", blob()).with_id(1),
            StageConfig::new("ratio", math(Some(1))).with_id(2),
        ];
        assert_eq!(validate(&ok), Ok(()));

        let forward = [
            StageConfig::new("ratio", math(Some(2))).with_id(1),
            StageConfig::new("blobs", blob()).with_id(2),
        ];
        assert!(matches!(
            validate(&forward),
            Err(ConfigError::ForwardReference { reference: 2, .. })
        ));

        let own = [StageConfig::new("ratio", math(Some(1))).with_id(1)];
        assert!(matches!(validate(&own), Err(ConfigError::ForwardReference { .. })));

        let unknown = [StageConfig::new("ratio", math(Some(9)))];
        assert!(matches!(
            validate(&unknown),
            Err(ConfigError::UnknownReference { reference: 9, .. })
        ));

        let missing = [StageConfig::new("ratio", math(None))];
        assert!(matches!(validate(&missing), Err(ConfigError::MissingReference { .. })));
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let configs = [
            StageConfig::new("a", blob()).with_id(4),
            StageConfig::new("b", blob()).with_id(4),
        ];
        assert_eq!(validate(&configs), Err(ConfigError::DuplicateStageId(4)));
    }

    #[test]
    fn invalid_parameters_name_the_stage() {
        let configs = [StageConfig::new(
            "",
            StageParams::Blob(BlobParams {
                th_min: 200,
                th_max: 100,
                ..BlobParams::default()
            }),
        )];
        let err = validate(&configs).unwrap_err();
        let ConfigError::InvalidParameter { stage, .. } = err else {
            unreachable!("expected invalid parameter, got {err:?}");
        };
        assert_eq!(stage, "blob_0");
    }

    #[test]
    fn bad_formula_is_a_config_error() {
        let configs = [
            StageConfig::new("blobs", blob()).with_id(1),
            StageConfig::new(
                "f",
                StageParams::Math(MathParams {
                    operation: MathOperation::CustomFormula,
                    formula: Some("total_area * (".to_owned()),
                    reference_stage_id: Some(1),
                }),
            ),
        ];
        assert!(matches!(validate(&configs), Err(ConfigError::Formula { .. })));
    }

    #[test]
    fn kind_strings_round_trip() {
        for kind in StageKind::ALL {
            assert_eq!(StageKind::from_type_str(kind.as_str()), Some(kind));
        }
        assert_eq!(StageKind::from_type_str("ocr"), None);
    }
}
