//! Blur filter: Gaussian or median smoothing of a sub-image.
//!
//! The Gaussian runs a `kernel_size`-tap normalised kernel through
//! [`imageproc::filter::separable_filter_equal`], so a bright pixel never
//! spreads further than `kernel_size / 2` pixels whatever the sigma. The
//! median wraps [`imageproc::filter::median_filter`]. Both act per channel
//! on color sub-images.

use serde::{Deserialize, Serialize};

use crate::types::{Frame, StageError};

/// Smallest kernel size the filters accept.
pub const MIN_KERNEL_SIZE: u32 = 3;

/// Which smoothing filter to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlurMethod {
    /// Gaussian smoothing with `sigma` (derived from the kernel size when
    /// non-positive).
    #[default]
    Gaussian,
    /// Median of the `kernel_size × kernel_size` neighbourhood.
    Median,
}

/// Parameters of a Blur stage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlurParams {
    /// Smoothing filter.
    pub method: BlurMethod,
    /// Kernel size, coerced to the nearest odd value of at least 3.
    #[serde(alias = "ksize")]
    pub kernel_size: u32,
    /// Gaussian sigma; `<= 0` derives it from `kernel_size`.
    pub sigma: f32,
}

impl Default for BlurParams {
    fn default() -> Self {
        Self {
            method: BlurMethod::default(),
            kernel_size: MIN_KERNEL_SIZE,
            sigma: 0.0,
        }
    }
}

impl BlurParams {
    /// Check parameter consistency.
    ///
    /// # Errors
    ///
    /// Returns a description of the problem when `sigma` is not finite.
    pub fn validate(&self) -> Result<(), String> {
        if !self.sigma.is_finite() {
            return Err(format!("blur sigma must be finite, got {}", self.sigma));
        }
        Ok(())
    }
}

/// Coerce a kernel size to the nearest odd value of at least 3.
#[must_use]
pub const fn odd_kernel_size(size: u32) -> u32 {
    let odd = size | 1;
    if odd < MIN_KERNEL_SIZE {
        MIN_KERNEL_SIZE
    } else {
        odd
    }
}

/// Sigma implied by a kernel size when none is given.
///
/// Uses the conventional `0.3 * ((k - 1) * 0.5 - 1) + 0.8` rule so a 3-tap
/// kernel gets sigma 0.8 and a 5-tap kernel sigma 1.1.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn sigma_for_kernel(kernel_size: u32) -> f32 {
    let k = kernel_size as f32;
    0.3f32.mul_add((k - 1.0).mul_add(0.5, -1.0), 0.8)
}

/// Run the Blur stage on a sub-image.
///
/// # Errors
///
/// Returns [`StageError::InvalidInput`] if the effective sigma is not a
/// positive finite number.
pub fn apply(input: &Frame, params: &BlurParams) -> Result<Frame, StageError> {
    let k = odd_kernel_size(params.kernel_size);
    match params.method {
        BlurMethod::Median => Ok(median(input, k)),
        BlurMethod::Gaussian => {
            let sigma = if params.sigma > 0.0 {
                params.sigma
            } else {
                sigma_for_kernel(k)
            };
            if !(sigma.is_finite() && sigma > 0.0) {
                return Err(StageError::InvalidInput(format!(
                    "gaussian sigma must be positive, got {sigma}"
                )));
            }
            Ok(gaussian(input, &gaussian_taps(k, sigma)))
        }
    }
}

fn median(input: &Frame, kernel_size: u32) -> Frame {
    let radius = kernel_size / 2;
    match input {
        Frame::Gray(img) => Frame::Gray(imageproc::filter::median_filter(img, radius, radius)),
        Frame::Color(img) => Frame::Color(imageproc::filter::median_filter(img, radius, radius)),
    }
}

/// Normalised taps of a `kernel_size`-wide Gaussian with the given sigma.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn gaussian_taps(kernel_size: u32, sigma: f32) -> Vec<f32> {
    let r = (kernel_size / 2) as f32;
    let taps: Vec<f32> = (0..kernel_size)
        .map(|i| {
            let x = i as f32 - r;
            (-(x * x) / (2.0 * sigma * sigma)).exp()
        })
        .collect();
    let sum: f32 = taps.iter().sum();
    taps.into_iter().map(|t| t / sum).collect()
}

fn gaussian(input: &Frame, taps: &[f32]) -> Frame {
    match input {
        Frame::Gray(img) => Frame::Gray(imageproc::filter::separable_filter_equal(img, taps)),
        Frame::Color(img) => Frame::Color(imageproc::filter::separable_filter_equal(img, taps)),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use image::{GrayImage, RgbImage};

    use super::*;

    /// Create a test image with a sharp black-to-white boundary at x=5.
    fn sharp_edge_image() -> GrayImage {
        GrayImage::from_fn(10, 10, |x, _y| {
            if x < 5 {
                image::Luma([0])
            } else {
                image::Luma([255])
            }
        })
    }

    fn gray(frame: Frame) -> GrayImage {
        match frame {
            Frame::Gray(img) => img,
            Frame::Color(_) => unreachable!("expected gray output"),
        }
    }

    #[test]
    fn kernel_size_coerced_to_odd_minimum_three() {
        assert_eq!(odd_kernel_size(0), 3);
        assert_eq!(odd_kernel_size(1), 3);
        assert_eq!(odd_kernel_size(3), 3);
        assert_eq!(odd_kernel_size(4), 5);
        assert_eq!(odd_kernel_size(7), 7);
    }

    #[test]
    fn sigma_derived_from_kernel() {
        assert!((sigma_for_kernel(3) - 0.8).abs() < 1e-6);
        assert!((sigma_for_kernel(5) - 1.1).abs() < 1e-6);
    }

    #[test]
    fn gaussian_smooths_sharp_edge() {
        let out = gray(apply(&Frame::Gray(sharp_edge_image()), &BlurParams {
            sigma: 2.0,
            ..BlurParams::default()
        })
        .unwrap());

        let left_of_edge = out.get_pixel(4, 5).0[0];
        let right_of_edge = out.get_pixel(5, 5).0[0];
        assert!(
            left_of_edge > 0,
            "expected blur to raise left-of-edge above 0, got {left_of_edge}",
        );
        assert!(
            right_of_edge < 255,
            "expected blur to lower right-of-edge below 255, got {right_of_edge}",
        );
    }

    #[test]
    fn taps_are_normalised_and_sized_by_kernel() {
        let taps = gaussian_taps(5, 10.0);
        assert_eq!(taps.len(), 5);
        assert!((taps.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        assert!(taps[2] > taps[0]);
        assert!((taps[0] - taps[4]).abs() < 1e-7);
    }

    #[test]
    fn wide_sigma_stays_within_kernel() {
        let mut img = GrayImage::new(21, 1);
        img.put_pixel(10, 0, image::Luma([255]));
        let out = gray(apply(&Frame::Gray(img), &BlurParams {
            method: BlurMethod::Gaussian,
            kernel_size: 3,
            sigma: 5.0,
        })
        .unwrap());
        for x in (0..9).chain(12..21) {
            assert_eq!(out.get_pixel(x, 0).0[0], 0, "x={x} is outside the 3-tap kernel");
        }
        assert!(out.get_pixel(9, 0).0[0] > 0);
        assert!(out.get_pixel(11, 0).0[0] > 0);
    }

    #[test]
    fn median_removes_salt_noise() {
        let mut img = GrayImage::from_pixel(9, 9, image::Luma([40]));
        img.put_pixel(4, 4, image::Luma([255]));
        let out = gray(apply(&Frame::Gray(img), &BlurParams {
            method: BlurMethod::Median,
            kernel_size: 3,
            sigma: 0.0,
        })
        .unwrap());
        assert_eq!(out.get_pixel(4, 4).0[0], 40);
    }

    #[test]
    fn color_blur_preserves_channels_and_dimensions() {
        let img = RgbImage::from_pixel(12, 7, image::Rgb([100, 150, 200]));
        let out = apply(&Frame::Color(img), &BlurParams::default()).unwrap();
        let Frame::Color(rgb) = out else {
            unreachable!("expected color output");
        };
        assert_eq!((rgb.width(), rgb.height()), (12, 7));
        for p in rgb.pixels() {
            for (c, exp) in [100i16, 150, 200].into_iter().enumerate() {
                assert!((i16::from(p.0[c]) - exp).abs() <= 1, "channel {c}: got {}", p.0[c]);
            }
        }
    }

    #[test]
    fn non_finite_sigma_fails_validation() {
        let params = BlurParams {
            sigma: f32::NAN,
            ..BlurParams::default()
        };
        assert!(params.validate().is_err());
    }
}
