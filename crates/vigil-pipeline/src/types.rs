//! Shared types for the vigil inspection pipeline.

use serde::{Deserialize, Serialize};

use crate::formula::FormulaError;

/// Re-export `GrayImage` so downstream crates can build single-channel
/// frames without depending on `image` directly.
pub use image::GrayImage;

/// Re-export `RgbImage` so downstream crates can build color frames
/// without depending on `image` directly.
pub use image::RgbImage;

/// A 2D point in image coordinates with floating-point precision.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    /// Horizontal position (pixels from left edge).
    pub x: f64,
    /// Vertical position (pixels from top edge).
    pub y: f64,
}

impl Point {
    /// Create a new point.
    #[must_use]
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Squared Euclidean distance to another point.
    ///
    /// Avoids the square root for comparison purposes.
    #[must_use]
    pub fn distance_squared(self, other: Self) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        dx.mul_add(dx, dy * dy)
    }

    /// Euclidean distance to another point.
    #[must_use]
    pub fn distance(self, other: Self) -> f64 {
        self.distance_squared(other).sqrt()
    }
}

/// An integer pixel coordinate, used for reported blob geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PixelPoint {
    /// Column.
    pub x: i32,
    /// Row.
    pub y: i32,
}

impl PixelPoint {
    /// Create a new pixel coordinate.
    #[must_use]
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// A sequence of connected points, as produced by contour tracing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Polyline(Vec<Point>);

impl Polyline {
    /// Create a new polyline from a vector of points.
    #[must_use]
    pub const fn new(points: Vec<Point>) -> Self {
        Self(points)
    }

    /// Returns `true` if the polyline has no points.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the number of points in the polyline.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns a slice of all points.
    #[must_use]
    pub fn points(&self) -> &[Point] {
        &self.0
    }

    /// Consumes the polyline and returns the underlying vector of points.
    #[must_use]
    pub fn into_points(self) -> Vec<Point> {
        self.0
    }
}

/// Image dimensions in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

/// An axis-aligned pixel rectangle inside an image.
///
/// A box with zero width or height is *empty*; the ROI engine returns an
/// empty box for degenerate regions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BoundingBox {
    /// Left column.
    pub x: u32,
    /// Top row.
    pub y: u32,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl BoundingBox {
    /// The empty box at the origin.
    pub const EMPTY: Self = Self {
        x: 0,
        y: 0,
        width: 0,
        height: 0,
    };

    /// Create a new bounding box.
    #[must_use]
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// The box covering an entire image.
    #[must_use]
    pub const fn full(dimensions: Dimensions) -> Self {
        Self::new(0, 0, dimensions.width, dimensions.height)
    }

    /// Returns `true` if the box covers no pixels.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Pixel count.
    #[must_use]
    pub const fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Returns `true` if the box lies entirely within `dimensions`.
    #[must_use]
    pub const fn fits_within(&self, dimensions: Dimensions) -> bool {
        self.x as u64 + self.width as u64 <= dimensions.width as u64
            && self.y as u64 + self.height as u64 <= dimensions.height as u64
    }
}

/// A 2D position plus orientation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    /// Horizontal position in image coordinates.
    pub x: f64,
    /// Vertical position in image coordinates.
    pub y: f64,
    /// Orientation in degrees, normalized to `(-180, 180]`.
    #[serde(alias = "angle")]
    pub angle_deg: f64,
}

impl Pose {
    /// Create a new pose.
    #[must_use]
    pub const fn new(x: f64, y: f64, angle_deg: f64) -> Self {
        Self { x, y, angle_deg }
    }
}

/// Cumulative positional/angular correction applied to downstream ROIs.
///
/// Produced by [`crate::transform::cumulative_offset`] from the results of
/// upstream Locate stages that set `apply_transform`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PoseOffset {
    /// Horizontal shift in pixels.
    pub dx: f64,
    /// Vertical shift in pixels.
    pub dy: f64,
    /// Rotation in degrees. Only applied to oriented ROIs when `rotate`.
    pub dtheta_deg: f64,
    /// Whether `dtheta_deg` should rotate oriented ROIs.
    pub rotate: bool,
}

/// An owned image buffer flowing through the pipeline.
///
/// The working image is single-channel or three-channel depending on what
/// the acquisition component delivered. Filters may change the channel count
/// of a sub-image; the ROI engine reconciles it when writing back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// 8-bit single-channel image.
    Gray(GrayImage),
    /// 8-bit RGB image.
    Color(RgbImage),
}

impl Frame {
    /// Width in pixels.
    #[must_use]
    pub fn width(&self) -> u32 {
        match self {
            Self::Gray(img) => img.width(),
            Self::Color(img) => img.width(),
        }
    }

    /// Height in pixels.
    #[must_use]
    pub fn height(&self) -> u32 {
        match self {
            Self::Gray(img) => img.height(),
            Self::Color(img) => img.height(),
        }
    }

    /// Width and height.
    #[must_use]
    pub fn dimensions(&self) -> Dimensions {
        Dimensions {
            width: self.width(),
            height: self.height(),
        }
    }

    /// Number of channels per pixel (1 or 3).
    #[must_use]
    pub const fn channels(&self) -> u8 {
        match self {
            Self::Gray(_) => 1,
            Self::Color(_) => 3,
        }
    }

    /// Returns `true` if the frame has no pixels.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }

    /// Single-channel view: borrowed when already gray, otherwise a
    /// luminance conversion.
    #[must_use]
    pub fn to_gray(&self) -> std::borrow::Cow<'_, GrayImage> {
        match self {
            Self::Gray(img) => std::borrow::Cow::Borrowed(img),
            Self::Color(img) => std::borrow::Cow::Owned(crate::grayscale::luminance(img)),
        }
    }

    /// Three-channel copy; gray values are replicated into R, G and B.
    #[must_use]
    pub fn to_color(&self) -> RgbImage {
        match self {
            Self::Gray(img) => RgbImage::from_fn(img.width(), img.height(), |x, y| {
                let v = img.get_pixel(x, y).0[0];
                image::Rgb([v, v, v])
            }),
            Self::Color(img) => img.clone(),
        }
    }

    /// Convert to the same channel layout as `other`.
    #[must_use]
    pub fn matching(self, other: &Self) -> Self {
        match (self, other) {
            (Self::Gray(img), Self::Color(_)) => Self::Color(Self::Gray(img).to_color()),
            (Self::Color(img), Self::Gray(_)) => Self::Gray(crate::grayscale::luminance(&img)),
            (same, _) => same,
        }
    }

    /// Decode an encoded image (PNG, JPEG, BMP, WebP), keeping single-channel
    /// images single-channel.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::EmptyImage`] if `bytes` is empty or decodes
    /// to zero pixels, and [`PipelineError::ImageDecode`] if the format is
    /// unrecognized or the data is corrupt.
    pub fn decode(bytes: &[u8]) -> Result<Self, PipelineError> {
        if bytes.is_empty() {
            return Err(PipelineError::EmptyImage);
        }
        let frame = Self::from(image::load_from_memory(bytes)?);
        if frame.is_empty() {
            return Err(PipelineError::EmptyImage);
        }
        Ok(frame)
    }

    /// Copy out the pixels under `bbox`.
    ///
    /// The box must lie within the frame; the ROI engine guarantees this for
    /// every box it resolves.
    #[must_use]
    pub fn crop(&self, bbox: BoundingBox) -> Self {
        match self {
            Self::Gray(img) => Self::Gray(
                image::imageops::crop_imm(img, bbox.x, bbox.y, bbox.width, bbox.height).to_image(),
            ),
            Self::Color(img) => Self::Color(
                image::imageops::crop_imm(img, bbox.x, bbox.y, bbox.width, bbox.height).to_image(),
            ),
        }
    }
}

impl From<GrayImage> for Frame {
    fn from(img: GrayImage) -> Self {
        Self::Gray(img)
    }
}

impl From<RgbImage> for Frame {
    fn from(img: RgbImage) -> Self {
        Self::Color(img)
    }
}

impl From<image::DynamicImage> for Frame {
    fn from(img: image::DynamicImage) -> Self {
        match img {
            image::DynamicImage::ImageLuma8(gray) => Self::Gray(gray),
            image::DynamicImage::ImageLumaA8(_) | image::DynamicImage::ImageLuma16(_) => {
                Self::Gray(img.to_luma8())
            }
            other => Self::Color(other.to_rgb8()),
        }
    }
}

/// Serde-compatible proxy for [`Frame`].
///
/// `image::ImageBuffer` does not implement serde traits, so frames are
/// represented as `(width, height, channels, raw_pixel_bytes)` tuples.
#[derive(Serialize, Deserialize)]
struct FrameProxy(u32, u32, u8, Vec<u8>);

impl Serialize for Frame {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let raw = match self {
            Self::Gray(img) => img.as_raw().clone(),
            Self::Color(img) => img.as_raw().clone(),
        };
        FrameProxy(self.width(), self.height(), self.channels(), raw).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Frame {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let FrameProxy(width, height, channels, raw) = FrameProxy::deserialize(deserializer)?;
        match channels {
            1 => GrayImage::from_raw(width, height, raw)
                .map(Self::Gray)
                .ok_or_else(|| serde::de::Error::custom("invalid grayscale frame dimensions")),
            3 => RgbImage::from_raw(width, height, raw)
                .map(Self::Color)
                .ok_or_else(|| serde::de::Error::custom("invalid color frame dimensions")),
            n => Err(serde::de::Error::custom(format!(
                "unsupported channel count {n}"
            ))),
        }
    }
}

/// Structural errors that escape [`crate::Pipeline::run`] or prevent a
/// pipeline from being built.
///
/// Per-stage failures never surface here; they are captured into the
/// stage's [`crate::StageResult`].
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The input frame has no pixels.
    #[error("input image is empty")]
    EmptyImage,

    /// Failed to decode an encoded image.
    #[error("failed to decode image: {0}")]
    ImageDecode(#[from] image::ImageError),

    /// The stage configuration is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Errors detected while building or validating a pipeline.
///
/// Any of these makes the pipeline unusable.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
pub enum ConfigError {
    /// The stage list could not be parsed.
    #[error("failed to parse stage configuration: {0}")]
    Parse(String),

    /// A stage declared a `type` no stage implementation handles.
    #[error("stage {index}: unknown stage type `{found}`")]
    UnknownStageType {
        /// Pipeline position of the offending stage.
        index: usize,
        /// The unrecognized type string.
        found: String,
    },

    /// A stage parameter is out of range or inconsistent.
    #[error("stage `{stage}`: {reason}")]
    InvalidParameter {
        /// Stage name.
        stage: String,
        /// What is wrong.
        reason: String,
    },

    /// A Math stage has no `reference_stage_id`.
    #[error("stage `{stage}`: math stage requires reference_stage_id")]
    MissingReference {
        /// Stage name.
        stage: String,
    },

    /// A Math stage references a stage id that does not exist.
    #[error("stage `{stage}`: reference_stage_id {reference} does not match any stage")]
    UnknownReference {
        /// Stage name.
        stage: String,
        /// The referenced id.
        reference: i64,
    },

    /// A Math stage references itself or a later stage.
    #[error("stage `{stage}`: reference_stage_id {reference} is not an earlier stage")]
    ForwardReference {
        /// Stage name.
        stage: String,
        /// The referenced id.
        reference: i64,
    },

    /// Two stages share the same id.
    #[error("duplicate stage id {0}")]
    DuplicateStageId(i64),

    /// A custom formula failed to parse.
    #[error("stage `{stage}`: {source}")]
    Formula {
        /// Stage name.
        stage: String,
        /// Parser error.
        source: FormulaError,
    },
}

/// Runtime failure inside a single stage.
///
/// Caught by the orchestrator and recorded on the stage's result; never
/// aborts the cycle.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StageError {
    /// The referenced stage has no result, or its result is an error.
    #[error("reference stage {0} has no usable result")]
    Reference(String),

    /// The referenced result lacks a field the operation needs.
    #[error("reference stage result has no numeric field `{0}`")]
    MissingField(&'static str),

    /// Formula evaluation failed.
    #[error(transparent)]
    Formula(#[from] FormulaError),

    /// The stage cannot process the given input.
    #[error("invalid stage input: {0}")]
    InvalidInput(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn point_distance() {
        let a = Point::new(0.0, 0.0);
        let b = Point::new(3.0, 4.0);
        assert!((a.distance_squared(b) - 25.0).abs() < f64::EPSILON);
        assert!((a.distance(b) - 5.0).abs() < f64::EPSILON);
    }

    #[test]
    fn bounding_box_emptiness_and_area() {
        assert!(BoundingBox::EMPTY.is_empty());
        assert!(BoundingBox::new(3, 3, 0, 10).is_empty());
        let b = BoundingBox::new(1, 2, 4, 5);
        assert!(!b.is_empty());
        assert_eq!(b.area(), 20);
    }

    #[test]
    fn bounding_box_fits_within() {
        let dims = Dimensions {
            width: 10,
            height: 10,
        };
        assert!(BoundingBox::new(5, 5, 5, 5).fits_within(dims));
        assert!(!BoundingBox::new(6, 5, 5, 5).fits_within(dims));
    }

    #[test]
    fn frame_channel_reconciliation() {
        let gray = Frame::Gray(GrayImage::from_pixel(2, 2, image::Luma([77])));
        let color = Frame::Color(RgbImage::new(2, 2));

        let as_color = gray.clone().matching(&color);
        assert_eq!(as_color.channels(), 3);
        let Frame::Color(rgb) = &as_color else {
            unreachable!("expected color frame");
        };
        assert_eq!(rgb.get_pixel(1, 1).0, [77, 77, 77]);

        let back = as_color.matching(&gray);
        assert_eq!(back, gray);
    }

    #[test]
    fn frame_crop_copies_region() {
        let img = GrayImage::from_fn(6, 4, |x, y| image::Luma([u8::try_from(x + 10 * y).unwrap_or(0)]));
        let frame = Frame::Gray(img);
        let sub = frame.crop(BoundingBox::new(2, 1, 3, 2));
        assert_eq!(sub.dimensions(), Dimensions { width: 3, height: 2 });
        let Frame::Gray(g) = sub else {
            unreachable!("expected gray frame");
        };
        assert_eq!(g.get_pixel(0, 0).0[0], 12);
        assert_eq!(g.get_pixel(2, 1).0[0], 24);
    }

    #[test]
    fn frame_from_dynamic_image_keeps_gray() {
        let dynamic = image::DynamicImage::ImageLuma8(GrayImage::new(3, 3));
        assert_eq!(Frame::from(dynamic).channels(), 1);
        let dynamic = image::DynamicImage::ImageRgba8(image::RgbaImage::new(3, 3));
        assert_eq!(Frame::from(dynamic).channels(), 3);
    }

    #[test]
    fn pose_accepts_angle_alias() {
        let pose: Pose = serde_json::from_str(r#"{"x":1.0,"y":2.0,"angle":30.0}"#)
            .unwrap_or(Pose::new(0.0, 0.0, 0.0));
        assert!((pose.angle_deg - 30.0).abs() < f64::EPSILON);
    }
}
