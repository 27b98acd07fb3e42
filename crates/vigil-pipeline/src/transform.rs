//! Transform propagation: the cumulative ROI offset contributed by upstream
//! Locate stages.
//!
//! Offsets compose additively in global image coordinates. Each upstream
//! stage's displacement is assumed to be measured in the same frame, not in
//! a frame already rotated by an earlier correction.

use crate::result::{StageOutcome, StageResult};
use crate::types::PoseOffset;

/// Sum the offsets of every Locate stage before `stage_index` that set
/// `apply_transform`.
///
/// A stage contributes its explicit `offset`, or `result - reference` when
/// only the poses are present; stages with neither are skipped. `dx` and
/// `dy` always add up; `dtheta_deg` only collects contributions from stages
/// whose own `rotate` flag is set, and the returned `rotate` is `true` if
/// any such stage exists.
///
/// Returns `None` when the total is zero, meaning ROIs are used as
/// configured.
#[must_use]
pub fn cumulative_offset(stage_index: usize, results: &[StageResult]) -> Option<PoseOffset> {
    let mut total = PoseOffset::default();

    for result in results.iter().filter(|r| r.stage_index < stage_index) {
        let StageOutcome::Locate(m) = &result.outcome else {
            continue;
        };
        if !m.apply_transform {
            continue;
        }
        let (dx, dy, dtheta) = match (m.offset, m.reference, m.result) {
            (Some(o), _, _) => (o.x, o.y, o.angle_deg),
            (None, Some(r), Some(cur)) => (cur.x - r.x, cur.y - r.y, cur.angle_deg - r.angle_deg),
            _ => continue,
        };
        total.dx += dx;
        total.dy += dy;
        if m.rotate {
            total.dtheta_deg += dtheta;
            total.rotate = true;
        }
    }

    let moved = total.dx != 0.0 || total.dy != 0.0 || total.dtheta_deg != 0.0;
    moved.then_some(total)
}
