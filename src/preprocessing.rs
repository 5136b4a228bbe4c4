// src/preprocessing.rs

use image::{GrayImage, RgbImage};
use imageproc::contrast::{equalize_histogram, otsu_level, threshold, ThresholdType};
use imageproc::distance_transform::Norm;
use imageproc::filter::gaussian_blur_f32;
use imageproc::morphology::{dilate, erode};

const BLUR_SIGMA: f32 = 0.8;

// 3x3 square structuring element
const MORPH_NORM: Norm = Norm::LInf;
const MORPH_RADIUS: u8 = 1;

/// One preprocessing strategy in the cascade. Declaration order is cascade
/// priority: earlier passes are tried first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrepPass {
    /// Aspect-preserving resize to the target width, single-channel.
    Rescaled,
    /// Histogram-equalized intensity with light blur against sensor noise.
    Equalized,
    /// Otsu-threshold binarization.
    Binarized,
    /// Dilated binarization; repairs thin or broken glyphs.
    Dilated,
    /// Eroded binarization; repairs bold or merged glyphs.
    Eroded,
    /// Inverted binarization; handles inverse-polarity plates.
    Inverted,
}

pub const PASS_ORDER: [PrepPass; 6] = [
    PrepPass::Rescaled,
    PrepPass::Equalized,
    PrepPass::Binarized,
    PrepPass::Dilated,
    PrepPass::Eroded,
    PrepPass::Inverted,
];

/// Derive the full pass sequence from one plate crop. Pure and deterministic:
/// the same crop always yields the same rasters, and no pass depends on
/// recognition results.
pub fn derive_passes(crop: &RgbImage, target_width: u32) -> Vec<(PrepPass, GrayImage)> {
    let rescaled = rescale_to_gray(crop, target_width);

    let equalized = gaussian_blur_f32(&equalize_histogram(&rescaled), BLUR_SIGMA);

    let level = otsu_level(&rescaled);
    let binarized = threshold(&rescaled, level, ThresholdType::Binary);

    let dilated = dilate(&binarized, MORPH_NORM, MORPH_RADIUS);
    let eroded = erode(&binarized, MORPH_NORM, MORPH_RADIUS);

    let mut inverted = binarized.clone();
    image::imageops::invert(&mut inverted);

    let rasters = [rescaled, equalized, binarized, dilated, eroded, inverted];
    PASS_ORDER.iter().copied().zip(rasters).collect()
}

fn rescale_to_gray(crop: &RgbImage, target_width: u32) -> GrayImage {
    let target_height =
        ((crop.height() as u64 * target_width as u64) / crop.width().max(1) as u64).max(1) as u32;
    let resized = image::imageops::resize(
        crop,
        target_width,
        target_height,
        image::imageops::FilterType::CatmullRom,
    );
    image::imageops::grayscale(&resized)
}
