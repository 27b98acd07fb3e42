//! Locate analysis: find one edge along a directed segment and report its
//! pose.
//!
//! The sub-image is sampled along the arrow at roughly one-pixel spacing,
//! the 1-D profile is smoothed, and candidate edges are found by intensity
//! level crossings (preferred) or gradient peaks. One candidate is selected
//! and its orientation measured with a 2-D Sobel operator at that pixel.
//! When a reference pose is configured the measurement also carries the
//! offset from it, which downstream stages can consume through
//! [`crate::transform::cumulative_offset`].

use image::GrayImage;
use serde::{Deserialize, Serialize};

use crate::types::{BoundingBox, Dimensions, Frame, Point, Pose};

/// Minimum number of profile samples.
const MIN_SAMPLES: usize = 10;

/// Minimum index distance between two reported gradient peaks.
const PEAK_WINDOW: usize = 2;

/// Directed sampling segment in working-image coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Arrow {
    /// Start point.
    pub p0: Point,
    /// End point.
    pub p1: Point,
}

/// How the gradient threshold is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeThresholdMode {
    /// `max(1, threshold)`.
    #[default]
    Fixed,
    /// `max(1, mean + k * std)` of the polarity-filtered gradient.
    Adaptive,
}

/// Intensity transition direction along the arrow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Polarity {
    /// Intensity rises.
    DarkToLight,
    /// Intensity falls.
    LightToDark,
    /// Either direction.
    #[default]
    Any,
}

/// Which candidate edge is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeSelect {
    /// Lowest sample index.
    First,
    /// Nearest the middle of the arrow.
    #[serde(alias = "closestToMid")]
    ClosestToMid,
    /// Largest gradient magnitude.
    #[default]
    Strongest,
}

/// Parameters of a Locate stage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocateParams {
    /// Sampling segment; `None` uses a horizontal line through the ROI.
    pub arrow: Option<Arrow>,
    /// Gradient threshold strategy.
    pub threshold_mode: EdgeThresholdMode,
    /// Intensity level for crossings and the fixed gradient threshold.
    #[serde(alias = "th_min")]
    pub threshold: f64,
    /// `k` in `mean + k * std` for adaptive thresholds.
    pub adaptive_k: f64,
    /// Accepted transition direction.
    #[serde(alias = "polaridade")]
    pub polarity: Polarity,
    /// Candidate selection policy.
    pub edge_select: EdgeSelect,
    /// 1-D Gaussian kernel size for the profile.
    pub smooth_ksize: u32,
    /// Sobel aperture for the orientation (1, 3, 5 or 7).
    pub grad_kernel: u32,
    /// Report the angle difference in the offset instead of the reference
    /// angle.
    pub rotate: bool,
    /// Offer this stage's offset to later stages' ROIs.
    pub apply_transform: bool,
    /// Expected pose; enables `result` and `offset` in the measurement.
    pub reference: Option<Pose>,
}

impl Default for LocateParams {
    fn default() -> Self {
        Self {
            arrow: None,
            threshold_mode: EdgeThresholdMode::default(),
            threshold: 20.0,
            adaptive_k: 1.0,
            polarity: Polarity::default(),
            edge_select: EdgeSelect::default(),
            smooth_ksize: 5,
            grad_kernel: 3,
            rotate: false,
            apply_transform: false,
            reference: None,
        }
    }
}

impl LocateParams {
    /// Check parameter consistency.
    ///
    /// # Errors
    ///
    /// Returns a description of the first non-finite parameter.
    pub fn validate(&self) -> Result<(), String> {
        if !self.threshold.is_finite() {
            return Err(format!("threshold must be finite, got {}", self.threshold));
        }
        if !self.adaptive_k.is_finite() {
            return Err(format!("adaptive_k must be finite, got {}", self.adaptive_k));
        }
        if let Some(r) = self.reference
            && !(r.x.is_finite() && r.y.is_finite() && r.angle_deg.is_finite())
        {
            return Err("reference pose must be finite".to_owned());
        }
        Ok(())
    }
}

/// One located edge.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    /// Column in working-image coordinates.
    pub x: f64,
    /// Row in working-image coordinates.
    pub y: f64,
    /// Edge direction (gradient direction + 90°), in `(-180, 180]`.
    pub angle_deg: f64,
    /// Transition direction at the edge.
    pub polarity: Polarity,
    /// Absolute profile gradient at the edge.
    pub strength: f64,
    /// Position along the arrow, 0 at `p0` and 1 at `p1`.
    pub t: f64,
}

/// Measurement produced by a Locate stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocateMeasurement {
    /// Selected edge, if any (at most one).
    pub edges: Vec<Edge>,
    /// Number of entries in `edges`.
    pub edge_count: usize,
    /// Segment actually sampled, clamped to the image.
    pub arrow: Arrow,
    /// Echo of the configured reference pose.
    pub reference: Option<Pose>,
    /// Pose of the located edge.
    pub result: Option<Pose>,
    /// `result - reference`; see [`LocateParams::rotate`] for the angle.
    pub offset: Option<Pose>,
    /// Echo of [`LocateParams::rotate`].
    pub rotate: bool,
    /// Echo of [`LocateParams::apply_transform`].
    pub apply_transform: bool,
}

impl LocateMeasurement {
    /// The selected edge.
    #[must_use]
    pub fn located(&self) -> Option<&Edge> {
        self.edges.first()
    }
}

/// Normalize an angle in degrees to `(-180, 180]`.
#[must_use]
pub fn normalize_angle(deg: f64) -> f64 {
    let a = (deg + 180.0).rem_euclid(360.0) - 180.0;
    if a <= -180.0 { a + 360.0 } else { a }
}

/// Run edge localization on a sub-image.
///
/// `bbox` is where the sub-image sits in the working image (used to convert
/// between global and local coordinates) and `image` is the working
/// image's size (used to clamp the arrow).
#[must_use]
pub fn analyze(
    input: &Frame,
    bbox: BoundingBox,
    image: Dimensions,
    params: &LocateParams,
) -> LocateMeasurement {
    let gray = input.to_gray();
    let arrow = resolve_arrow(params.arrow, bbox, image);
    let origin = Point::new(f64::from(bbox.x), f64::from(bbox.y));
    let local = Arrow {
        p0: Point::new(arrow.p0.x - origin.x, arrow.p0.y - origin.y),
        p1: Point::new(arrow.p1.x - origin.x, arrow.p1.y - origin.y),
    };

    let profile = sample_profile(&gray, local);
    let smoothed = smooth(&profile.values, params.smooth_ksize);
    let gradient = central_gradient(&smoothed);

    let level = params.threshold.clamp(0.0, 255.0);
    let crossings = level_crossings(&smoothed, level, params.polarity);
    let peaks = gradient_peaks(&gradient, params);

    let candidates = if crossings.is_empty() { peaks } else { crossings };
    let edges: Vec<Edge> = select(&candidates, &gradient, params.edge_select)
        .map(|idx| {
            let sample = profile.points[idx];
            let (gx, gy) = sobel_at(&gray, sample, params.grad_kernel);
            let grad_angle = gy.atan2(gx).to_degrees();
            #[allow(clippy::cast_precision_loss)]
            let last = (smoothed.len().saturating_sub(1)).max(1) as f64;
            #[allow(clippy::cast_precision_loss)]
            let t = idx as f64 / last;
            Edge {
                x: sample.x + origin.x,
                y: sample.y + origin.y,
                angle_deg: normalize_angle(grad_angle + 90.0),
                polarity: polarity_at(gradient[idx], params.polarity),
                strength: gradient[idx].abs(),
                t,
            }
        })
        .into_iter()
        .collect();

    let result = edges.first().map(|e| Pose::new(e.x, e.y, e.angle_deg));
    let reference = params
        .reference
        .map(|r| Pose::new(r.x, r.y, normalize_angle(r.angle_deg)));
    let offset = result.zip(reference).map(|(cur, r)| {
        let angle = if params.rotate {
            normalize_angle(cur.angle_deg - r.angle_deg)
        } else {
            r.angle_deg
        };
        Pose::new(cur.x - r.x, cur.y - r.y, angle)
    });

    LocateMeasurement {
        edge_count: edges.len(),
        edges,
        arrow,
        reference,
        result,
        offset,
        rotate: params.rotate,
        apply_transform: params.apply_transform,
    }
}

// ─── Arrow and sampling ──────────────────────────────────────────────

fn resolve_arrow(arrow: Option<Arrow>, bbox: BoundingBox, image: Dimensions) -> Arrow {
    let arrow = arrow.unwrap_or_else(|| {
        let (bx, by) = (f64::from(bbox.x), f64::from(bbox.y));
        let (bw, bh) = (f64::from(bbox.width), f64::from(bbox.height));
        Arrow {
            p0: Point::new(0.1f64.mul_add(bw, bx), 0.5f64.mul_add(bh, by)),
            p1: Point::new(0.9f64.mul_add(bw, bx), 0.5f64.mul_add(bh, by)),
        }
    });
    let max_x = f64::from(image.width.saturating_sub(1));
    let max_y = f64::from(image.height.saturating_sub(1));
    let clamp = |p: Point| Point::new(p.x.clamp(0.0, max_x), p.y.clamp(0.0, max_y));
    Arrow {
        p0: clamp(arrow.p0),
        p1: clamp(arrow.p1),
    }
}

struct Profile {
    /// Sub-pixel sample positions in local coordinates.
    points: Vec<Point>,
    values: Vec<f64>,
}

#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
fn sample_profile(gray: &GrayImage, arrow: Arrow) -> Profile {
    let (dx, dy) = (arrow.p1.x - arrow.p0.x, arrow.p1.y - arrow.p0.y);
    let length = dx.hypot(dy).max(1.0);
    let count = (length.round() as usize).max(MIN_SAMPLES);
    let max_x = f64::from(gray.width().saturating_sub(1));
    let max_y = f64::from(gray.height().saturating_sub(1));

    let points: Vec<Point> = (0..count)
        .map(|i| {
            let t = i as f64 / (count - 1) as f64;
            Point::new(t.mul_add(dx, arrow.p0.x), t.mul_add(dy, arrow.p0.y))
        })
        .collect();
    let values = points
        .iter()
        .map(|p| {
            let xi = p.x.round().clamp(0.0, max_x) as u32;
            let yi = p.y.round().clamp(0.0, max_y) as u32;
            f64::from(gray.get_pixel(xi, yi).0[0])
        })
        .collect();
    Profile { points, values }
}

// ─── 1-D signal processing ───────────────────────────────────────────

/// Reflect an out-of-range index back into `0..len` without repeating the
/// border sample.
#[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]
fn reflect101(i: isize, len: usize) -> usize {
    if len == 1 {
        return 0;
    }
    let period = 2 * (len as isize - 1);
    let m = i.rem_euclid(period);
    (if m >= len as isize { period - m } else { m }) as usize
}

/// Gaussian taps for an odd kernel size, with sigma derived from the size.
///
/// Sizes up to 7 use the fixed binomial-like tables conventional for small
/// smoothing kernels.
fn gaussian_kernel(size: usize) -> Vec<f64> {
    match size {
        1 => vec![1.0],
        3 => vec![0.25, 0.5, 0.25],
        5 => vec![0.0625, 0.25, 0.375, 0.25, 0.0625],
        7 => vec![0.03125, 0.109_375, 0.218_75, 0.281_25, 0.218_75, 0.109_375, 0.03125],
        _ => {
            #[allow(clippy::cast_precision_loss)]
            let k = size as f64;
            let sigma = 0.3f64.mul_add((k - 1.0).mul_add(0.5, -1.0), 0.8);
            let r = (size / 2) as f64;
            #[allow(clippy::cast_precision_loss)]
            let taps: Vec<f64> = (0..size)
                .map(|i| {
                    let x = i as f64 - r;
                    (-(x * x) / (2.0 * sigma * sigma)).exp()
                })
                .collect();
            let sum: f64 = taps.iter().sum();
            taps.into_iter().map(|t| t / sum).collect()
        }
    }
}

#[allow(clippy::cast_possible_wrap)]
fn smooth(signal: &[f64], ksize: u32) -> Vec<f64> {
    let k = (ksize | 1) as usize;
    if k < 3 || signal.is_empty() {
        return signal.to_vec();
    }
    let taps = gaussian_kernel(k);
    let r = (k / 2) as isize;
    (0..signal.len())
        .map(|i| {
            taps.iter()
                .enumerate()
                .map(|(j, w)| w * signal[reflect101(i as isize + j as isize - r, signal.len())])
                .sum()
        })
        .collect()
}

/// Central differences inside, one-sided differences at the ends.
fn central_gradient(signal: &[f64]) -> Vec<f64> {
    let n = signal.len();
    if n < 2 {
        return vec![0.0; n];
    }
    (0..n)
        .map(|i| match i {
            0 => signal[1] - signal[0],
            i if i == n - 1 => signal[n - 1] - signal[n - 2],
            i => (signal[i + 1] - signal[i - 1]) / 2.0,
        })
        .collect()
}

/// Indices of the sample just after each crossing of `level`.
fn level_crossings(signal: &[f64], level: f64, polarity: Polarity) -> Vec<usize> {
    signal
        .windows(2)
        .enumerate()
        .filter(|(_, w)| {
            let rising = w[0] < level && w[1] >= level;
            let falling = w[0] > level && w[1] <= level;
            match polarity {
                Polarity::DarkToLight => rising,
                Polarity::LightToDark => falling,
                Polarity::Any => rising || falling,
            }
        })
        .map(|(i, _)| i + 1)
        .collect()
}

/// Gradient filtered by polarity: the signed component that counts.
fn directional(g: f64, polarity: Polarity) -> f64 {
    match polarity {
        Polarity::DarkToLight => g,
        Polarity::LightToDark => -g,
        Polarity::Any => g.abs(),
    }
}

#[allow(clippy::cast_precision_loss)]
fn gradient_threshold(gradient: &[f64], params: &LocateParams) -> f64 {
    match params.threshold_mode {
        EdgeThresholdMode::Fixed => params.threshold.max(1.0),
        EdgeThresholdMode::Adaptive => adaptive_threshold(gradient, params),
    }
}

#[allow(clippy::cast_precision_loss)]
fn adaptive_threshold(gradient: &[f64], params: &LocateParams) -> f64 {
    if gradient.is_empty() {
        return 1.0;
    }
    let g: Vec<f64> = gradient
        .iter()
        .map(|&v| directional(v, params.polarity).max(0.0))
        .collect();
    let n = g.len() as f64;
    let mean = g.iter().sum::<f64>() / n;
    let var = g.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    params.adaptive_k.mul_add(var.sqrt(), mean).max(1.0)
}

fn gradient_peaks(gradient: &[f64], params: &LocateParams) -> Vec<usize> {
    let max_grad = gradient.iter().fold(0.0f64, |m, g| m.max(g.abs()));
    let mut threshold = gradient_threshold(gradient, params);
    if max_grad > 0.0 && threshold > max_grad {
        threshold = (0.5 * max_grad).max(1.0);
    }

    let peaks = find_peaks(gradient, threshold, params.polarity);
    if peaks.is_empty() && params.threshold_mode == EdgeThresholdMode::Fixed {
        return find_peaks(gradient, adaptive_threshold(gradient, params), params.polarity);
    }
    peaks
}

/// Local maxima of `|gradient|` whose directional value reaches
/// `threshold`, thinned so kept peaks are at least [`PEAK_WINDOW`] apart.
fn find_peaks(gradient: &[f64], threshold: f64, polarity: Polarity) -> Vec<usize> {
    let n = gradient.len();
    let mut out: Vec<usize> = Vec::new();
    for i in 0..n {
        if directional(gradient[i], polarity) < threshold {
            continue;
        }
        let here = gradient[i].abs();
        let left = if i > 0 { gradient[i - 1].abs() } else { f64::NEG_INFINITY };
        let right = gradient.get(i + 1).map_or(f64::NEG_INFINITY, |g| g.abs());
        if here < left || here < right {
            continue;
        }
        if out.last().is_none_or(|&last| i - last >= PEAK_WINDOW) {
            out.push(i);
        }
    }
    out
}

/// Pick one candidate; ties keep the earliest index.
#[allow(clippy::cast_precision_loss)]
fn select(candidates: &[usize], gradient: &[f64], policy: EdgeSelect) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    let mid = (gradient.len().saturating_sub(1)) as f64 / 2.0;
    for &idx in candidates {
        // Lower score wins.
        let score = match policy {
            EdgeSelect::First => idx as f64,
            EdgeSelect::ClosestToMid => (idx as f64 - mid).abs(),
            EdgeSelect::Strongest => -gradient[idx].abs(),
        };
        if best.is_none_or(|(_, s)| score < s) {
            best = Some((idx, score));
        }
    }
    best.map(|(idx, _)| idx)
}

fn polarity_at(g: f64, configured: Polarity) -> Polarity {
    match configured {
        Polarity::Any if g >= 0.0 => Polarity::DarkToLight,
        Polarity::Any => Polarity::LightToDark,
        fixed => fixed,
    }
}

// ─── 2-D orientation ─────────────────────────────────────────────────

/// Separable Sobel `(smoothing, derivative)` taps for an aperture.
fn sobel_kernels(ksize: u32) -> (&'static [f64], &'static [f64]) {
    match ksize {
        3 => (&[1.0, 2.0, 1.0], &[-1.0, 0.0, 1.0]),
        5 => (&[1.0, 4.0, 6.0, 4.0, 1.0], &[-1.0, -2.0, 0.0, 2.0, 1.0]),
        7 => (
            &[1.0, 6.0, 15.0, 20.0, 15.0, 6.0, 1.0],
            &[-1.0, -4.0, -5.0, 0.0, 5.0, 4.0, 1.0],
        ),
        _ => (&[1.0], &[-1.0, 0.0, 1.0]),
    }
}

/// Sobel `(gx, gy)` at the pixel nearest `p`, with reflected borders.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss
)]
fn sobel_at(gray: &GrayImage, p: Point, ksize: u32) -> (f64, f64) {
    let (w, h) = (gray.width() as usize, gray.height() as usize);
    let cx = p.x.round().clamp(0.0, (w - 1) as f64) as isize;
    let cy = p.y.round().clamp(0.0, (h - 1) as f64) as isize;
    let (smooth, deriv) = sobel_kernels(ksize);
    let pixel = |x: isize, y: isize| -> f64 {
        f64::from(gray.get_pixel(reflect101(x, w) as u32, reflect101(y, h) as u32).0[0])
    };

    let rs = (smooth.len() / 2) as isize;
    let rd = (deriv.len() / 2) as isize;
    let mut gx = 0.0;
    let mut gy = 0.0;
    for (j, s) in smooth.iter().enumerate() {
        let off_s = j as isize - rs;
        for (i, d) in deriv.iter().enumerate() {
            let off_d = i as isize - rd;
            gx += s * d * pixel(cx + off_d, cy + off_s);
            gy += s * d * pixel(cx + off_s, cy + off_d);
        }
    }
    (gx, gy)
}
