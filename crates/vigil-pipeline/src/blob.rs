//! Blob analysis: binarize, trace external contours, filter by area, and
//! run the optional count/area tests.
//!
//! All reported geometry is in sub-image (ROI-local) coordinates.

use geo::{Area, Centroid, LineString, Polygon};
use image::GrayImage;
use serde::{Deserialize, Serialize};

use crate::contour::{ChainApproximation, ContourTracer};
use crate::simplify;
use crate::threshold;
use crate::types::{BoundingBox, Frame, PixelPoint};

/// Floor for the simplification tolerance, in pixels.
const MIN_EPSILON: f64 = 0.5;

/// Parameters of a Blob stage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlobParams {
    /// Binarization cut-off: pixels strictly above it are foreground.
    pub th_min: u8,
    /// Foreground value written by binarization.
    pub th_max: u8,
    /// Smallest contour area kept.
    pub area_min: f64,
    /// Largest contour area kept; `None` is unbounded.
    pub area_max: Option<f64>,
    /// Enable the total-area test.
    pub total_area_test: bool,
    /// Total-area test lower bound.
    pub test_total_area_min: f64,
    /// Total-area test upper bound; `None` is unbounded.
    pub test_total_area_max: Option<f64>,
    /// Enable the blob-count test.
    pub blob_count_test: bool,
    /// Blob-count test lower bound.
    pub test_blob_count_min: usize,
    /// Blob-count test upper bound; `None` is unbounded.
    pub test_blob_count_max: Option<usize>,
    /// Contour chain approximation.
    pub contour_chain: ChainApproximation,
    /// Simplification tolerance as a fraction of the contour perimeter;
    /// `0` disables simplification.
    pub approx_epsilon_ratio: f64,
    /// Cap on reported contour vertices; `0` disables the cap.
    pub polygon_max_points: usize,
}

impl Default for BlobParams {
    fn default() -> Self {
        Self {
            th_min: 0,
            th_max: u8::MAX,
            area_min: 0.0,
            area_max: None,
            total_area_test: false,
            test_total_area_min: 0.0,
            test_total_area_max: None,
            blob_count_test: false,
            test_blob_count_min: 0,
            test_blob_count_max: None,
            contour_chain: ChainApproximation::default(),
            approx_epsilon_ratio: 0.01,
            polygon_max_points: 0,
        }
    }
}

impl BlobParams {
    /// Check parameter consistency.
    ///
    /// # Errors
    ///
    /// Returns a description of the first inconsistent bound.
    pub fn validate(&self) -> Result<(), String> {
        if self.th_min >= self.th_max {
            return Err(format!(
                "th_min ({}) must be less than th_max ({})",
                self.th_min, self.th_max
            ));
        }
        if !self.area_min.is_finite() || self.area_min < 0.0 {
            return Err(format!("area_min must be a non-negative number, got {}", self.area_min));
        }
        if let Some(max) = self.area_max
            && max <= self.area_min
        {
            return Err(format!(
                "area_min ({}) must be less than area_max ({max})",
                self.area_min
            ));
        }
        if let Some(max) = self.test_total_area_max
            && max < self.test_total_area_min
        {
            return Err(format!(
                "test_total_area_min ({}) exceeds test_total_area_max ({max})",
                self.test_total_area_min
            ));
        }
        if let Some(max) = self.test_blob_count_max
            && self.test_blob_count_min > max
        {
            return Err(format!(
                "test_blob_count_min ({}) exceeds test_blob_count_max ({max})",
                self.test_blob_count_min
            ));
        }
        if self.approx_epsilon_ratio < 0.0 || !self.approx_epsilon_ratio.is_finite() {
            return Err(format!(
                "approx_epsilon_ratio must be a non-negative number, got {}",
                self.approx_epsilon_ratio
            ));
        }
        Ok(())
    }

    fn area_in_range(&self, area: f64) -> bool {
        self.area_min <= area && self.area_max.is_none_or(|max| area <= max)
    }
}

/// One kept contour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Blob {
    /// Enclosed polygon area in square pixels.
    pub area: f64,
    /// Polygon centroid, truncated; `(0, 0)` for zero-area contours.
    pub centroid: PixelPoint,
    /// Tight box around the traced contour.
    pub bounding_box: BoundingBox,
    /// Closed polygon (first point repeated last).
    pub contour: Vec<PixelPoint>,
}

/// Result of one internal test.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TestOutcome {
    /// Whether `actual` fell within `[min, max]`.
    pub passed: bool,
    /// Lower bound.
    pub min: f64,
    /// Upper bound; `None` is unbounded.
    pub max: Option<f64>,
    /// Measured value.
    pub actual: f64,
}

impl TestOutcome {
    fn check(actual: f64, min: f64, max: Option<f64>) -> Self {
        Self {
            passed: min <= actual && max.is_none_or(|m| actual <= m),
            min,
            max,
            actual,
        }
    }
}

/// Outcomes of every enabled internal test.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TestOutcomes {
    /// Total-area test, when enabled.
    pub total_area: Option<TestOutcome>,
    /// Blob-count test, when enabled.
    pub blob_count: Option<TestOutcome>,
    /// AND of the enabled tests; `true` when none are enabled.
    pub overall_pass: bool,
}

/// Measurement produced by a Blob stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlobMeasurement {
    /// Kept blobs in tracing order.
    pub blobs: Vec<Blob>,
    /// Number of kept blobs.
    pub blob_count: usize,
    /// Sum of kept blob areas.
    pub total_area: f64,
    /// Pixel count of the analyzed sub-image.
    pub roi_area: u64,
    /// Internal test results.
    pub test_outcomes: TestOutcomes,
}

/// Run blob analysis on a sub-image.
#[must_use]
pub fn analyze(input: &Frame, params: &BlobParams) -> BlobMeasurement {
    let gray = input.to_gray();
    let binary = threshold::binary(&gray, params.th_min, params.th_max);
    measure(&binary, params, input.width(), input.height())
}

fn measure(binary: &GrayImage, params: &BlobParams, width: u32, height: u32) -> BlobMeasurement {
    let blobs: Vec<Blob> = params
        .contour_chain
        .trace(binary)
        .into_iter()
        .filter_map(|contour| {
            let area = polygon_area(&contour);
            params
                .area_in_range(area)
                .then(|| build_blob(contour, area, params))
        })
        .collect();

    let total_area: f64 = blobs.iter().map(|b| b.area).sum();
    let blob_count = blobs.len();

    let total_area_outcome = params.total_area_test.then(|| {
        TestOutcome::check(total_area, params.test_total_area_min, params.test_total_area_max)
    });
    #[allow(clippy::cast_precision_loss)]
    let blob_count_outcome = params.blob_count_test.then(|| {
        TestOutcome::check(
            blob_count as f64,
            params.test_blob_count_min as f64,
            params.test_blob_count_max.map(|m| m as f64),
        )
    });
    let overall_pass = [total_area_outcome, blob_count_outcome]
        .iter()
        .flatten()
        .all(|t| t.passed);

    BlobMeasurement {
        blobs,
        blob_count,
        total_area,
        roi_area: u64::from(width) * u64::from(height),
        test_outcomes: TestOutcomes {
            total_area: total_area_outcome,
            blob_count: blob_count_outcome,
            overall_pass,
        },
    }
}

fn build_blob(contour: Vec<PixelPoint>, area: f64, params: &BlobParams) -> Blob {
    let centroid = polygon_centroid(&contour, area);
    let bounding_box = contour_bounds(&contour);

    let mut polygon = contour;
    if params.approx_epsilon_ratio > 0.0 {
        let perimeter = simplify::perimeter_closed(&polygon);
        let epsilon = MIN_EPSILON.max(params.approx_epsilon_ratio * perimeter);
        polygon = simplify::simplify_closed(&polygon, epsilon);
    }
    let polygon = simplify::downsample(&polygon, params.polygon_max_points);

    Blob {
        area,
        centroid,
        bounding_box,
        contour: simplify::close_ring(polygon),
    }
}

fn to_polygon(contour: &[PixelPoint]) -> Polygon<f64> {
    let ring: Vec<(f64, f64)> = contour
        .iter()
        .map(|p| (f64::from(p.x), f64::from(p.y)))
        .collect();
    Polygon::new(LineString::from(ring), vec![])
}

/// Shoelace area of a closed contour.
#[must_use]
pub fn polygon_area(contour: &[PixelPoint]) -> f64 {
    if contour.len() < 3 {
        return 0.0;
    }
    to_polygon(contour).unsigned_area()
}

#[allow(clippy::cast_possible_truncation)]
fn polygon_centroid(contour: &[PixelPoint], area: f64) -> PixelPoint {
    if area <= 0.0 {
        return PixelPoint::new(0, 0);
    }
    to_polygon(contour)
        .centroid()
        .map_or(PixelPoint::new(0, 0), |c| {
            PixelPoint::new(c.x().trunc() as i32, c.y().trunc() as i32)
        })
}

#[allow(clippy::cast_sign_loss)]
fn contour_bounds(contour: &[PixelPoint]) -> BoundingBox {
    let xs = contour.iter().map(|p| p.x);
    let ys = contour.iter().map(|p| p.y);
    match (xs.clone().min(), xs.max(), ys.clone().min(), ys.max()) {
        (Some(x0), Some(x1), Some(y0), Some(y1)) => BoundingBox::new(
            x0.max(0) as u32,
            y0.max(0) as u32,
            (x1 - x0 + 1) as u32,
            (y1 - y0 + 1) as u32,
        ),
        _ => BoundingBox::EMPTY,
    }
}
