//! Per-stage results recorded by the orchestrator.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::blob::BlobMeasurement;
use crate::config::StageKind;
use crate::locate::LocateMeasurement;
use crate::math::MathMeasurement;
use crate::types::{BoundingBox, PoseOffset};

/// Identity of a stage within one pipeline.
///
/// The configured id when there is one, otherwise the pipeline position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKey {
    /// Configured stage id.
    Id(i64),
    /// Pipeline position of an id-less stage.
    Index(usize),
}

impl StageKey {
    /// Key for a stage with optional `id` at `index`.
    #[must_use]
    pub fn new(id: Option<i64>, index: usize) -> Self {
        id.map_or(Self::Index(index), Self::Id)
    }
}

impl fmt::Display for StageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "{id}"),
            Self::Index(index) => write!(f, "idx_{index}"),
        }
    }
}

/// Whether a stage ran to completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// The stage produced its output.
    Success,
    /// The stage failed; see the outcome for the message.
    Error,
}

/// What a stage produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StageOutcome {
    /// A filter ran. On failure `error` is set and the image was left as is.
    Filter {
        /// Always `true`; filters are reported as having touched the image.
        image_modified: bool,
        /// Failure message when the filter fell back to its input.
        error: Option<String>,
    },
    /// Blob analysis measurement.
    Blob(BlobMeasurement),
    /// Edge localization measurement.
    Locate(LocateMeasurement),
    /// Cross-stage arithmetic value.
    Math(MathMeasurement),
    /// An analysis or math stage failed.
    Error {
        /// Failure message.
        message: String,
    },
}

/// Everything recorded about one stage in one cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    /// Lookup key.
    pub stage_id: StageKey,
    /// Pipeline position.
    pub stage_index: usize,
    /// Configured name.
    pub stage_name: String,
    /// Stage type.
    pub stage_type: StageKind,
    /// Completion status.
    pub status: StageStatus,
    /// Wall-clock time spent in the stage.
    pub processing_time_ms: f64,
    /// Clipped box the stage operated on; `None` for the whole image.
    pub effective_roi: Option<BoundingBox>,
    /// The configured ROI resolved to nothing and the whole image was used.
    pub roi_degenerate: bool,
    /// Offset applied to the ROI from upstream Locate stages.
    pub applied_offset: Option<PoseOffset>,
    /// Verdict contribution; `None` when the stage does not affect the
    /// verdict.
    pub pass: Option<bool>,
    /// Stage output.
    pub outcome: StageOutcome,
}

impl StageResult {
    /// Returns `true` for an error outcome of an analysis or math stage.
    ///
    /// Fail-soft filter errors still leave a usable image and are not
    /// counted here.
    #[must_use]
    pub const fn is_error(&self) -> bool {
        matches!(self.outcome, StageOutcome::Error { .. })
    }

    /// Numeric fields a Math formula may refer to.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn numeric_fields(&self) -> BTreeMap<&'static str, f64> {
        let mut fields = BTreeMap::new();
        fields.insert("processing_time_ms", self.processing_time_ms);
        match &self.outcome {
            StageOutcome::Blob(m) => {
                fields.insert("blob_count", m.blob_count as f64);
                fields.insert("total_area", m.total_area);
                fields.insert("roi_area", m.roi_area as f64);
            }
            StageOutcome::Locate(m) => {
                fields.insert("edge_count", m.edge_count as f64);
                if let Some(edge) = m.located() {
                    fields.insert("x", edge.x);
                    fields.insert("y", edge.y);
                    fields.insert("angle_deg", edge.angle_deg);
                }
                if let Some(offset) = m.offset {
                    fields.insert("offset_x", offset.x);
                    fields.insert("offset_y", offset.y);
                    fields.insert("offset_angle_deg", offset.angle_deg);
                }
            }
            StageOutcome::Math(m) => {
                fields.insert("value", m.value);
            }
            StageOutcome::Filter { .. } | StageOutcome::Error { .. } => {}
        }
        fields
    }
}
