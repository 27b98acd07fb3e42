//! Contour tracing: extract closed external boundaries from a binary image.
//!
//! This module defines the [`ContourTracer`] trait for boundary extraction
//! and the [`ChainApproximation`] enum for selecting how densely the traced
//! boundary is sampled.
//!
//! # Strategy pattern
//!
//! Every approximation starts from the same Suzuki-Abe border following
//! (`imageproc::contours::find_contours`) and differs only in which
//! boundary pixels it keeps. The compressed variants trade polygon fidelity
//! for fewer vertices; area and centroid computed from them stay exact for
//! axis-aligned shapes.

use image::GrayImage;
use imageproc::contours::BorderType;
use serde::{Deserialize, Serialize};

use crate::types::PixelPoint;

/// Selects how much of the traced boundary is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainApproximation {
    /// Every boundary pixel.
    None,
    /// Drop pixels in the middle of horizontal, vertical and diagonal runs.
    #[default]
    Simple,
    /// Teh-Chin dominant points using discrete chain-code curvature.
    #[serde(rename = "tc89_l1")]
    Tc89L1,
    /// Teh-Chin dominant points using the k-cosine curvature measure.
    #[serde(rename = "tc89_kcos")]
    Tc89Kcos,
}

/// Trait for contour tracing strategies.
///
/// Input: a binary image (non-zero pixels = foreground).
/// Output: one closed polygon per external (outermost) boundary. The
/// polygon is implicitly closed; the first point is not repeated.
pub trait ContourTracer {
    /// Trace external contours in the given binary image.
    fn trace(&self, binary: &GrayImage) -> Vec<Vec<PixelPoint>>;
}

impl ContourTracer for ChainApproximation {
    fn trace(&self, binary: &GrayImage) -> Vec<Vec<PixelPoint>> {
        trace_external(binary)
            .into_iter()
            .map(|boundary| self.approximate(boundary))
            .collect()
    }
}

impl ChainApproximation {
    /// Reduce a full boundary to this approximation's vertex set.
    #[must_use]
    pub fn approximate(self, boundary: Vec<PixelPoint>) -> Vec<PixelPoint> {
        match self {
            Self::None => boundary,
            Self::Simple => compress_runs(&boundary),
            Self::Tc89L1 => teh_chin(&boundary, Curvature::ChainCode),
            Self::Tc89Kcos => teh_chin(&boundary, Curvature::KCosine),
        }
    }
}

/// Suzuki-Abe border following, keeping only outermost borders.
#[allow(clippy::cast_possible_wrap)]
fn trace_external(binary: &GrayImage) -> Vec<Vec<PixelPoint>> {
    let contours: Vec<imageproc::contours::Contour<u32>> =
        imageproc::contours::find_contours(binary);

    contours
        .into_iter()
        .filter(|c| c.border_type == BorderType::Outer && c.parent.is_none())
        .filter(|c| !c.points.is_empty())
        .map(|c| {
            c.points
                .into_iter()
                .map(|p| PixelPoint::new(p.x as i32, p.y as i32))
                .collect()
        })
        .collect()
}

/// Keep only the points where the step direction changes.
fn compress_runs(points: &[PixelPoint]) -> Vec<PixelPoint> {
    let n = points.len();
    if n < 3 {
        return points.to_vec();
    }
    let kept: Vec<PixelPoint> = (0..n)
        .filter(|&i| {
            let prev = points[(i + n - 1) % n];
            let cur = points[i];
            let next = points[(i + 1) % n];
            step(prev, cur) != step(cur, next)
        })
        .map(|i| points[i])
        .collect();
    if kept.is_empty() {
        // Every step identical: a degenerate back-and-forth trace.
        points.to_vec()
    } else {
        kept
    }
}

fn step(a: PixelPoint, b: PixelPoint) -> (i32, i32) {
    ((b.x - a.x).signum(), (b.y - a.y).signum())
}

/// Freeman chain code (0 = east, counter-clockwise in image space).
fn chain_code(a: PixelPoint, b: PixelPoint) -> u8 {
    match step(a, b) {
        (1, 0) => 0,
        (1, -1) => 1,
        (0, -1) => 2,
        (-1, -1) => 3,
        (-1, 0) => 4,
        (-1, 1) => 5,
        (0, 1) => 6,
        _ => 7,
    }
}

#[derive(Clone, Copy)]
enum Curvature {
    ChainCode,
    KCosine,
}

/// Teh-Chin dominant point detection.
///
/// 1. Determine each point's region of support from chord lengths and
///    chord distances.
/// 2. Measure curvature (chain-code turn or k-cosine).
/// 3. Keep points that are curvature maxima within half their region, then
///    drop the weaker of any two kept neighbours.
///
/// Falls back to [`compress_runs`] when fewer than three points survive.
fn teh_chin(points: &[PixelPoint], curvature: Curvature) -> Vec<PixelPoint> {
    let n = points.len();
    if n < 5 {
        return compress_runs(points);
    }

    let at = |i: isize| -> PixelPoint {
        #[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]
        let idx = i.rem_euclid(n as isize) as usize;
        points[idx]
    };

    let max_k = (n - 1) / 2;
    let regions: Vec<usize> = (0..n)
        .map(|i| region_of_support(&at, i, max_k))
        .collect();

    let strength: Vec<f64> = (0..n)
        .map(|i| {
            #[allow(clippy::cast_possible_wrap)]
            let ii = i as isize;
            match curvature {
                Curvature::ChainCode => {
                    let c_in = chain_code(at(ii - 1), at(ii));
                    let c_out = chain_code(at(ii), at(ii + 1));
                    let turn = (8 + c_out - c_in) % 8;
                    f64::from(turn.min(8 - turn))
                }
                Curvature::KCosine => {
                    #[allow(clippy::cast_possible_wrap)]
                    let k = regions[i] as isize;
                    k_cosine(at(ii - k), at(ii), at(ii + k))
                }
            }
        })
        .collect();

    let mut kept: Vec<usize> = (0..n)
        .filter(|&i| {
            if strength[i] <= f64::EPSILON {
                return false;
            }
            let half = regions[i] / 2;
            (1..=half).all(|d| {
                strength[(i + d) % n] <= strength[i] && strength[(i + n - d) % n] <= strength[i]
            })
        })
        .collect();

    let mut pruned = Vec::with_capacity(kept.len());
    let mut idx = 0;
    while idx < kept.len() {
        let cur = kept[idx];
        if let Some(&next) = kept.get(idx + 1)
            && next == cur + 1
        {
            pruned.push(if strength[next] > strength[cur] { next } else { cur });
            idx += 2;
            continue;
        }
        pruned.push(cur);
        idx += 1;
    }
    kept = pruned;

    if kept.len() < 3 {
        return compress_runs(points);
    }
    kept.into_iter().map(|i| points[i]).collect()
}

const RATIO_TOLERANCE: f64 = 1e-9;

/// Largest `k` for which the chord `p[i-k]..p[i+k]` keeps lengthening and
/// its relative distance from `p[i]` keeps growing.
fn region_of_support(at: &impl Fn(isize) -> PixelPoint, i: usize, max_k: usize) -> usize {
    #[allow(clippy::cast_possible_wrap)]
    let ii = i as isize;
    let chord = |k: usize| -> (f64, f64) {
        #[allow(clippy::cast_possible_wrap)]
        let k = k as isize;
        let (a, p, b) = (at(ii - k), at(ii), at(ii + k));
        let (dx, dy) = (f64::from(b.x - a.x), f64::from(b.y - a.y));
        let len = dx.hypot(dy);
        let cross = dx.mul_add(f64::from(a.y - p.y), -(dy * f64::from(a.x - p.x)));
        let dist = if len > 0.0 { cross.abs() / len } else { 0.0 };
        (len, dist)
    };

    let mut k = 1;
    while k < max_k {
        let (l0, d0) = chord(k);
        let (l1, d1) = chord(k + 1);
        let stop = l0 >= l1 - RATIO_TOLERANCE
            || (d0 > 0.0 && l0 > 0.0 && d0 / l0 >= d1 / l1 - RATIO_TOLERANCE);
        if stop {
            break;
        }
        k += 1;
    }
    k
}

/// `1 + cos(angle at p)`: 0 for a straight run, growing with sharpness.
fn k_cosine(a: PixelPoint, p: PixelPoint, b: PixelPoint) -> f64 {
    let (ax, ay) = (f64::from(a.x - p.x), f64::from(a.y - p.y));
    let (bx, by) = (f64::from(b.x - p.x), f64::from(b.y - p.y));
    let norm = ax.hypot(ay) * bx.hypot(by);
    if norm <= 0.0 {
        return 0.0;
    }
    1.0 + ax.mul_add(bx, ay * by) / norm
}
