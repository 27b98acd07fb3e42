//! Threshold filter: binarize a sub-image.
//!
//! Color input is reduced to luminance first; the output is always a
//! single-channel image whose pixels are either 0 or the configured
//! foreground value.

use image::GrayImage;
use serde::{Deserialize, Serialize};

use crate::types::{Frame, StageError};

/// Binarization rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdMode {
    /// `src > min ? max : 0`.
    #[default]
    Binary,
    /// `min <= src <= max ? 255 : 0`.
    Range,
    /// `src > otsu_level(src) ? 255 : 0`.
    Otsu,
}

/// Parameters of a Threshold stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdParams {
    /// Binarization rule.
    pub mode: ThresholdMode,
    /// Lower bound (binary cut-off, or inclusive range start).
    #[serde(alias = "th_min")]
    pub min: u8,
    /// Upper bound (binary foreground value, or inclusive range end).
    #[serde(alias = "th_max")]
    pub max: u8,
}

impl Default for ThresholdParams {
    fn default() -> Self {
        Self {
            mode: ThresholdMode::default(),
            min: 128,
            max: 255,
        }
    }
}

/// Run the Threshold stage on a sub-image.
///
/// # Errors
///
/// Never fails for well-formed frames; the `Result` keeps the filter
/// signature uniform with the other filters.
pub fn apply(input: &Frame, params: &ThresholdParams) -> Result<Frame, StageError> {
    let gray = input.to_gray();
    let out = match params.mode {
        ThresholdMode::Binary => binary(&gray, params.min, params.max),
        ThresholdMode::Range => {
            let lo = params.min;
            let hi = params.max.max(lo);
            in_range(&gray, lo, hi)
        }
        ThresholdMode::Otsu => {
            let level = imageproc::contrast::otsu_level(&gray);
            binary(&gray, level, u8::MAX)
        }
    };
    Ok(Frame::Gray(out))
}

/// `src > cutoff ? foreground : 0` for every pixel.
#[must_use = "returns the binary image"]
pub fn binary(image: &GrayImage, cutoff: u8, foreground: u8) -> GrayImage {
    GrayImage::from_fn(image.width(), image.height(), |x, y| {
        let v = image.get_pixel(x, y).0[0];
        image::Luma([if v > cutoff { foreground } else { 0 }])
    })
}

fn in_range(image: &GrayImage, lo: u8, hi: u8) -> GrayImage {
    GrayImage::from_fn(image.width(), image.height(), |x, y| {
        let v = image.get_pixel(x, y).0[0];
        image::Luma([if (lo..=hi).contains(&v) { u8::MAX } else { 0 }])
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn ramp() -> GrayImage {
        GrayImage::from_fn(256, 1, |x, _| image::Luma([u8::try_from(x).unwrap()]))
    }

    fn run(params: ThresholdParams) -> GrayImage {
        match apply(&Frame::Gray(ramp()), &params).unwrap() {
            Frame::Gray(img) => img,
            Frame::Color(_) => unreachable!("threshold output must be single-channel"),
        }
    }

    #[test]
    fn binary_uses_strict_cutoff_and_foreground_value() {
        let out = run(ThresholdParams {
            mode: ThresholdMode::Binary,
            min: 128,
            max: 200,
        });
        assert_eq!(out.get_pixel(128, 0).0[0], 0);
        assert_eq!(out.get_pixel(129, 0).0[0], 200);
    }

    #[test]
    fn range_is_inclusive() {
        let out = run(ThresholdParams {
            mode: ThresholdMode::Range,
            min: 50,
            max: 60,
        });
        assert_eq!(out.get_pixel(49, 0).0[0], 0);
        assert_eq!(out.get_pixel(50, 0).0[0], 255);
        assert_eq!(out.get_pixel(60, 0).0[0], 255);
        assert_eq!(out.get_pixel(61, 0).0[0], 0);
    }

    #[test]
    fn inverted_range_collapses_to_single_level() {
        let out = run(ThresholdParams {
            mode: ThresholdMode::Range,
            min: 90,
            max: 10,
        });
        let on: Vec<u32> = (0..256).filter(|&x| out.get_pixel(x, 0).0[0] == 255).collect();
        assert_eq!(on, vec![90]);
    }

    #[test]
    fn otsu_separates_bimodal_image() {
        let img = GrayImage::from_fn(20, 20, |x, _| image::Luma([if x < 10 { 30 } else { 220 }]));
        let Frame::Gray(out) = apply(&Frame::Gray(img), &ThresholdParams {
            mode: ThresholdMode::Otsu,
            ..ThresholdParams::default()
        })
        .unwrap() else {
            unreachable!("threshold output must be single-channel");
        };
        assert_eq!(out.get_pixel(2, 2).0[0], 0);
        assert_eq!(out.get_pixel(15, 2).0[0], 255);
    }

    #[test]
    fn color_input_produces_gray_output() {
        let img = image::RgbImage::from_pixel(4, 4, image::Rgb([255, 255, 255]));
        let out = apply(&Frame::Color(img), &ThresholdParams::default()).unwrap();
        assert_eq!(out.channels(), 1);
    }
}
