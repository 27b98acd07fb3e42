//! Region-of-interest engine.
//!
//! Resolves a declarative [`Roi`] into a pixel [`BoundingBox`] clipped to
//! the working image plus, for round shapes, a binary mask the size of that
//! box. [`apply`] composites a processed sub-image back into the working
//! image through the mask so overlapping round regions never disturb the
//! pixels around them.

use image::{GrayImage, ImageBuffer, Pixel};
use serde::{Deserialize, Serialize};

use crate::types::{BoundingBox, Dimensions, Frame, PoseOffset, StageError};

/// Mask value for pixels inside the region.
const INSIDE: u8 = u8::MAX;

/// A region description in working-image coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum Roi {
    /// Axis-aligned rectangle with top-left corner `(x, y)`.
    Rect {
        /// Left column.
        x: i32,
        /// Top row.
        y: i32,
        /// Width.
        w: i32,
        /// Height.
        h: i32,
    },
    /// Filled circle.
    Circle {
        /// Centre column.
        cx: i32,
        /// Centre row.
        cy: i32,
        /// Radius.
        r: i32,
    },
    /// Filled ellipse rotated by `angle_deg` (clockwise on screen).
    Ellipse {
        /// Centre column.
        cx: i32,
        /// Centre row.
        cy: i32,
        /// Semi-axis along the ellipse's own x direction.
        rx: i32,
        /// Semi-axis along the ellipse's own y direction.
        ry: i32,
        /// Rotation in degrees.
        #[serde(default, alias = "angle")]
        angle_deg: f64,
    },
}

impl Roi {
    /// Copy of this ROI moved by `offset`.
    ///
    /// Translated coordinates are rounded to the nearest pixel. The angle
    /// channel only rotates ellipses, and only when `offset.rotate` is set.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn offset_by(&self, offset: &PoseOffset) -> Self {
        let shift = |v: i32, d: f64| (f64::from(v) + d).round() as i32;
        match *self {
            Self::Rect { x, y, w, h } => Self::Rect {
                x: shift(x, offset.dx),
                y: shift(y, offset.dy),
                w,
                h,
            },
            Self::Circle { cx, cy, r } => Self::Circle {
                cx: shift(cx, offset.dx),
                cy: shift(cy, offset.dy),
                r,
            },
            Self::Ellipse {
                cx,
                cy,
                rx,
                ry,
                angle_deg,
            } => Self::Ellipse {
                cx: shift(cx, offset.dx),
                cy: shift(cy, offset.dy),
                rx,
                ry,
                angle_deg: if offset.rotate {
                    angle_deg + offset.dtheta_deg
                } else {
                    angle_deg
                },
            },
        }
    }

    /// Returns `true` if the shape has a non-positive size.
    #[must_use]
    pub const fn is_degenerate(&self) -> bool {
        match *self {
            Self::Rect { w, h, .. } => w <= 0 || h <= 0,
            Self::Circle { r, .. } => r <= 0,
            Self::Ellipse { rx, ry, .. } => rx <= 0 || ry <= 0,
        }
    }
}

/// A resolved region: the clipped box and an optional mask of the same size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region {
    /// Pixels the stage operates on.
    pub bbox: BoundingBox,
    /// Non-zero where the shape covers the pixel; `None` means the whole box.
    pub mask: Option<GrayImage>,
}

impl Region {
    /// The whole image, unmasked.
    #[must_use]
    pub const fn full(dimensions: Dimensions) -> Self {
        Self {
            bbox: BoundingBox::full(dimensions),
            mask: None,
        }
    }

    /// Returns `true` if the region covers no pixels.
    #[must_use]
    pub const fn is_degenerate(&self) -> bool {
        self.bbox.is_empty()
    }
}

/// Resolve an ROI against an image of size `dimensions`.
///
/// `None` means the whole image. When `offset` is given it moves the ROI
/// before clipping. A shape with non-positive size, or one lying entirely
/// off the image, resolves to an empty box; the caller decides how to fall
/// back.
#[must_use]
pub fn resolve(roi: Option<&Roi>, offset: Option<&PoseOffset>, dimensions: Dimensions) -> Region {
    let Some(roi) = roi else {
        return Region::full(dimensions);
    };
    let roi = offset.map_or_else(|| roi.clone(), |o| roi.offset_by(o));
    if roi.is_degenerate() {
        return Region {
            bbox: BoundingBox::EMPTY,
            mask: None,
        };
    }

    match roi {
        Roi::Rect { x, y, w, h } => Region {
            bbox: clip(i64::from(x), i64::from(y), i64::from(w), i64::from(h), dimensions),
            mask: None,
        },
        Roi::Circle { cx, cy, r } => {
            let (cx, cy, r) = (i64::from(cx), i64::from(cy), i64::from(r));
            let bbox = clip(cx - r, cy - r, 2 * r, 2 * r, dimensions);
            let r2 = r * r;
            let mask = shape_mask(bbox, |gx, gy| {
                let (dx, dy) = (gx - cx, gy - cy);
                dx * dx + dy * dy <= r2
            });
            Region { bbox, mask }
        }
        Roi::Ellipse {
            cx,
            cy,
            rx,
            ry,
            angle_deg,
        } => {
            let (sin, cos) = angle_deg.to_radians().sin_cos();
            let (rxf, ryf) = (f64::from(rx), f64::from(ry));
            let half_w = (rxf * cos).hypot(ryf * sin).ceil();
            let half_h = (rxf * sin).hypot(ryf * cos).ceil();
            #[allow(clippy::cast_possible_truncation)]
            let (hw, hh) = (half_w as i64, half_h as i64);
            let (cxi, cyi) = (i64::from(cx), i64::from(cy));
            let bbox = clip(cxi - hw, cyi - hh, 2 * hw, 2 * hh, dimensions);
            let (cxf, cyf) = (f64::from(cx), f64::from(cy));
            #[allow(clippy::cast_precision_loss)]
            let mask = shape_mask(bbox, |gx, gy| {
                let (dx, dy) = (gx as f64 - cxf, gy as f64 - cyf);
                let u = dx.mul_add(cos, dy * sin);
                let v = (-dx).mul_add(sin, dy * cos);
                (u / rxf).powi(2) + (v / ryf).powi(2) <= 1.0
            });
            Region { bbox, mask }
        }
    }
}

/// Intersect the box `(x, y, w, h)` with the image.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn clip(x: i64, y: i64, w: i64, h: i64, dimensions: Dimensions) -> BoundingBox {
    let x0 = x.max(0);
    let y0 = y.max(0);
    let x1 = (x + w).min(i64::from(dimensions.width));
    let y1 = (y + h).min(i64::from(dimensions.height));
    if x1 <= x0 || y1 <= y0 {
        return BoundingBox::EMPTY;
    }
    BoundingBox::new(x0 as u32, y0 as u32, (x1 - x0) as u32, (y1 - y0) as u32)
}

/// Rasterize a shape predicate over `bbox`, evaluated at global pixel
/// coordinates so clipped shapes keep their true centre.
fn shape_mask(bbox: BoundingBox, inside: impl Fn(i64, i64) -> bool) -> Option<GrayImage> {
    if bbox.is_empty() {
        return None;
    }
    Some(GrayImage::from_fn(bbox.width, bbox.height, |px, py| {
        let gx = i64::from(bbox.x) + i64::from(px);
        let gy = i64::from(bbox.y) + i64::from(py);
        image::Luma([if inside(gx, gy) { INSIDE } else { 0 }])
    }))
}

/// Write `sub` back into `working` at `bbox`.
///
/// When `mask` is present only pixels where it is non-zero are replaced.
/// `sub` is converted to the working image's channel layout first.
///
/// # Errors
///
/// Returns [`StageError::InvalidInput`] if `sub` (or `mask`) does not have
/// the box's size, or the box does not fit inside `working`.
pub fn apply(
    working: &mut Frame,
    sub: Frame,
    bbox: BoundingBox,
    mask: Option<&GrayImage>,
) -> Result<(), StageError> {
    if sub.width() != bbox.width || sub.height() != bbox.height {
        return Err(StageError::InvalidInput(format!(
            "sub-image is {}x{} but region is {}x{}",
            sub.width(),
            sub.height(),
            bbox.width,
            bbox.height
        )));
    }
    if !bbox.fits_within(working.dimensions()) {
        return Err(StageError::InvalidInput(format!(
            "region {bbox:?} exceeds image {}x{}",
            working.width(),
            working.height()
        )));
    }
    if let Some(m) = mask
        && m.dimensions() != (bbox.width, bbox.height)
    {
        return Err(StageError::InvalidInput(
            "mask size does not match region".to_owned(),
        ));
    }

    let sub = sub.matching(working);
    match (working, &sub) {
        (Frame::Gray(dst), Frame::Gray(src)) => blit(dst, src, bbox, mask),
        (Frame::Color(dst), Frame::Color(src)) => blit(dst, src, bbox, mask),
        _ => {
            return Err(StageError::InvalidInput(
                "sub-image channel layout does not match working image".to_owned(),
            ));
        }
    }
    Ok(())
}

fn blit<P: Pixel>(
    dst: &mut ImageBuffer<P, Vec<P::Subpixel>>,
    src: &ImageBuffer<P, Vec<P::Subpixel>>,
    bbox: BoundingBox,
    mask: Option<&GrayImage>,
) {
    for (px, py, pixel) in src.enumerate_pixels() {
        if mask.is_some_and(|m| m.get_pixel(px, py).0[0] == 0) {
            continue;
        }
        dst.put_pixel(bbox.x + px, bbox.y + py, *pixel);
    }
}
