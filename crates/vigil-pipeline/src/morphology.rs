//! Morphology filter: opening and closing with a shaped structuring element.
//!
//! The structuring element is rendered into an
//! [`imageproc::morphology::Mask`] and handed to imageproc's grayscale
//! erosion and dilation. Neighbours that fall outside the image are ignored
//! rather than padded, so borders neither grow nor shrink artificially.

use image::{GrayImage, Luma, RgbImage};
use imageproc::morphology::{
    Mask, grayscale_close, grayscale_dilate, grayscale_erode, grayscale_open,
};
use serde::{Deserialize, Serialize};

use crate::blur::odd_kernel_size;
use crate::types::{Frame, StageError};

/// Shape of the structuring element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StructuringShape {
    /// Filled ellipse inscribed in the kernel square.
    #[default]
    Ellipse,
    /// Full kernel square.
    Rect,
    /// Centre row and centre column.
    Cross,
}

/// Parameters of a Morphology stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MorphologyParams {
    /// Structuring element shape.
    pub shape: StructuringShape,
    /// Kernel size, coerced to the nearest odd value of at least 3.
    #[serde(alias = "kernel")]
    pub kernel_size: u32,
    /// Opening iterations (erode `n` times, then dilate `n` times).
    pub open: u32,
    /// Closing iterations (dilate `n` times, then erode `n` times).
    pub close: u32,
}

impl Default for MorphologyParams {
    fn default() -> Self {
        Self {
            shape: StructuringShape::default(),
            kernel_size: 3,
            open: 0,
            close: 0,
        }
    }
}

/// Largest kernel an [`imageproc::morphology::Mask`] can hold.
pub const MAX_KERNEL_SIZE: u32 = 511;

/// Structuring element rendered as a binary image (255 = member) with its
/// centre at `(size / 2, size / 2)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructuringElement {
    pixels: GrayImage,
}

impl StructuringElement {
    /// Build the element for a shape and kernel size.
    ///
    /// The size is coerced odd and capped at [`MAX_KERNEL_SIZE`].
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    pub fn new(shape: StructuringShape, kernel_size: u32) -> Self {
        let size = odd_kernel_size(kernel_size).min(MAX_KERNEL_SIZE);
        let r = (size / 2) as i32;
        let pixels = GrayImage::from_fn(size, size, |x, y| {
            let (dx, dy) = (x as i32 - r, y as i32 - r);
            let half_width = match shape {
                StructuringShape::Rect => r,
                StructuringShape::Cross if dy == 0 => r,
                StructuringShape::Cross => 0,
                StructuringShape::Ellipse => ellipse_half_width(r, dy),
            };
            Luma([if dx.abs() <= half_width { 255 } else { 0 }])
        });
        Self { pixels }
    }

    /// Number of pixels in the element.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pixels.pixels().filter(|p| p.0[0] > 0).count()
    }

    /// Returns `true` if the element has no pixels.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` if `(dx, dy)` relative to the centre is part of the
    /// element.
    #[must_use]
    #[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]
    pub fn contains(&self, dx: i32, dy: i32) -> bool {
        let r = (self.pixels.width() / 2) as i32;
        let (x, y) = (dx + r, dy + r);
        x >= 0
            && y >= 0
            && self
                .pixels
                .get_pixel_checked(x as u32, y as u32)
                .is_some_and(|p| p.0[0] > 0)
    }

    /// The element as an imageproc mask.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn mask(&self) -> Mask {
        let centre = (self.pixels.width() / 2) as u8;
        Mask::from_image(&self.pixels, centre, centre)
    }
}

/// Half-width of the ellipse row `dy` for a kernel of radius `r`.
#[allow(clippy::cast_possible_truncation)]
fn ellipse_half_width(r: i32, dy: i32) -> i32 {
    if r == 0 {
        return 0;
    }
    let rf = f64::from(r);
    let t = f64::from(dy);
    let frac = ((rf * rf) - t * t) / (rf * rf);
    (rf * frac.max(0.0).sqrt()).round() as i32
}

/// Run the Morphology stage on a sub-image.
///
/// Opening runs `open` erosions then `open` dilations; closing follows with
/// `close` dilations then `close` erosions.
///
/// # Errors
///
/// Never fails for well-formed frames; the `Result` keeps the filter
/// signature uniform with the other filters.
pub fn apply(input: &Frame, params: &MorphologyParams) -> Result<Frame, StageError> {
    if params.open == 0 && params.close == 0 {
        return Ok(input.clone());
    }
    let mask = StructuringElement::new(params.shape, params.kernel_size).mask();
    Ok(match input {
        Frame::Gray(img) => Frame::Gray(open_close(img, &mask, params)),
        Frame::Color(img) => Frame::Color(open_close_rgb(img, &mask, params)),
    })
}

fn repeat(image: GrayImage, times: u32, op: impl Fn(&GrayImage) -> GrayImage) -> GrayImage {
    (0..times).fold(image, |img, _| op(&img))
}

fn open_close(image: &GrayImage, mask: &Mask, params: &MorphologyParams) -> GrayImage {
    let erode = |img: &GrayImage| grayscale_erode(img, mask);
    let dilate = |img: &GrayImage| grayscale_dilate(img, mask);
    let opened = match params.open {
        0 => image.clone(),
        1 => grayscale_open(image, mask),
        n => repeat(repeat(image.clone(), n, erode), n, dilate),
    };
    match params.close {
        0 => opened,
        1 => grayscale_close(&opened, mask),
        n => repeat(repeat(opened, n, dilate), n, erode),
    }
}

fn open_close_rgb(image: &RgbImage, mask: &Mask, params: &MorphologyParams) -> RgbImage {
    let (w, h) = (image.width(), image.height());
    let channels: [GrayImage; 3] = std::array::from_fn(|c| {
        let plane = GrayImage::from_fn(w, h, |x, y| Luma([image.get_pixel(x, y).0[c]]));
        open_close(&plane, mask, params)
    });
    RgbImage::from_fn(w, h, |x, y| {
        image::Rgb([
            channels[0].get_pixel(x, y).0[0],
            channels[1].get_pixel(x, y).0[0],
            channels[2].get_pixel(x, y).0[0],
        ])
    })
}
