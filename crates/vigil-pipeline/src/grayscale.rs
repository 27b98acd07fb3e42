//! Grayscale conversion filter.
//!
//! Converts a color sub-image to a single channel using one of three
//! channel-mixing methods, optionally followed by histogram equalization.
//! A sub-image that is already single-channel passes through the mixing
//! step unchanged.

use image::{GrayImage, RgbImage};
use serde::{Deserialize, Serialize};

use crate::types::{Frame, StageError};

/// Perceptual luminance weights for R, G and B.
const LUMINANCE_WEIGHTS: ChannelWeights = ChannelWeights {
    r: 0.299,
    g: 0.587,
    b: 0.114,
};

/// How color channels are mixed into one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrayscaleMethod {
    /// `0.299*R + 0.587*G + 0.114*B`, rounded.
    #[default]
    Luminance,
    /// Unweighted mean of the three channels, truncated.
    Average,
    /// Caller-supplied channel weights, normalized by their sum.
    Weighted,
}

/// Per-channel weights for [`GrayscaleMethod::Weighted`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChannelWeights {
    /// Red weight.
    pub r: f32,
    /// Green weight.
    pub g: f32,
    /// Blue weight.
    pub b: f32,
}

impl Default for ChannelWeights {
    fn default() -> Self {
        Self {
            r: 0.2,
            g: 0.5,
            b: 0.3,
        }
    }
}

impl ChannelWeights {
    fn sum(self) -> f32 {
        self.r + self.g + self.b
    }
}

/// Parameters of a Grayscale stage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GrayscaleParams {
    /// Channel mixing method.
    pub method: GrayscaleMethod,
    /// Apply histogram equalization after conversion.
    pub normalize: bool,
    /// Channel weights, used only by [`GrayscaleMethod::Weighted`].
    pub weights: ChannelWeights,
}

impl Default for GrayscaleParams {
    fn default() -> Self {
        Self {
            method: GrayscaleMethod::default(),
            normalize: true,
            weights: ChannelWeights::default(),
        }
    }
}

impl GrayscaleParams {
    /// Check parameter consistency.
    ///
    /// # Errors
    ///
    /// Returns a description of the problem when weighted mixing has a
    /// negative or all-zero weight set.
    pub fn validate(&self) -> Result<(), String> {
        if self.method == GrayscaleMethod::Weighted {
            check_weights(self.weights)?;
        }
        Ok(())
    }
}

fn check_weights(w: ChannelWeights) -> Result<(), String> {
    if w.r < 0.0 || w.g < 0.0 || w.b < 0.0 {
        return Err(format!("grayscale weights must be non-negative, got {w:?}"));
    }
    if w.sum() <= 0.0 || !w.sum().is_finite() {
        return Err(format!("grayscale weights must have a positive sum, got {w:?}"));
    }
    Ok(())
}

/// Convert an RGB image to grayscale with perceptual luminance weights.
#[must_use = "returns the grayscale image"]
pub fn luminance(image: &RgbImage) -> GrayImage {
    mix(image, LUMINANCE_WEIGHTS, f32::round)
}

/// Run the Grayscale stage on a sub-image.
///
/// # Errors
///
/// Returns [`StageError::InvalidInput`] if weighted mixing is requested
/// with unusable weights.
pub fn apply(input: &Frame, params: &GrayscaleParams) -> Result<Frame, StageError> {
    let gray = match input {
        Frame::Gray(img) => img.clone(),
        Frame::Color(img) => match params.method {
            GrayscaleMethod::Luminance => luminance(img),
            GrayscaleMethod::Average => average(img),
            GrayscaleMethod::Weighted => {
                check_weights(params.weights).map_err(StageError::InvalidInput)?;
                let total = params.weights.sum();
                let normalized = ChannelWeights {
                    r: params.weights.r / total,
                    g: params.weights.g / total,
                    b: params.weights.b / total,
                };
                mix(img, normalized, f32::trunc)
            }
        },
    };

    let gray = if params.normalize { equalize(&gray) } else { gray };
    Ok(Frame::Gray(gray))
}

/// Histogram equalization mapping the darkest present level to 0 and the
/// brightest to 255. Images with a single level are returned unchanged.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
fn equalize(image: &GrayImage) -> GrayImage {
    let mut hist = [0u64; 256];
    for p in image.pixels() {
        hist[usize::from(p.0[0])] += 1;
    }
    let total: u64 = hist.iter().sum();
    let lowest = hist.iter().copied().find(|&c| c > 0).unwrap_or(0);
    if total == lowest {
        return image.clone();
    }

    let scale = 255.0 / (total - lowest) as f64;
    let mut lut = [0u8; 256];
    let mut cdf = 0u64;
    for (level, &count) in hist.iter().enumerate() {
        cdf += count;
        lut[level] = ((cdf.saturating_sub(lowest)) as f64 * scale)
            .round()
            .clamp(0.0, 255.0) as u8;
    }
    GrayImage::from_fn(image.width(), image.height(), |x, y| {
        image::Luma([lut[usize::from(image.get_pixel(x, y).0[0])]])
    })
}

fn average(image: &RgbImage) -> GrayImage {
    GrayImage::from_fn(image.width(), image.height(), |x, y| {
        let [r, g, b] = image.get_pixel(x, y).0;
        let sum = u16::from(r) + u16::from(g) + u16::from(b);
        image::Luma([u8::try_from(sum / 3).unwrap_or(u8::MAX)])
    })
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn mix(image: &RgbImage, w: ChannelWeights, round: fn(f32) -> f32) -> GrayImage {
    GrayImage::from_fn(image.width(), image.height(), |x, y| {
        let [r, g, b] = image.get_pixel(x, y).0;
        let v = w
            .r
            .mul_add(f32::from(r), w.g.mul_add(f32::from(g), w.b * f32::from(b)));
        image::Luma([round(v).clamp(0.0, 255.0) as u8])
    })
}
