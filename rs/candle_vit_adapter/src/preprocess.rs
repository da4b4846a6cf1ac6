//! Image Preprocessing for the adapter backbone
//!
//! This module handles the preprocessing pipeline for input images:
//! 1. Load image and convert to tensor (RGB, CHW format, values in [0, 1])
//! 2. Normalize using ImageNet mean and std
//! 3. Resize so both sides are multiples of 32

use candle_core::{Device, Result, Tensor};
use image::DynamicImage;

use crate::debug::TensorStats;
use crate::model::INPUT_MULTIPLE;

/// ImageNet normalization mean values (RGB order)
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];

/// ImageNet normalization std values (RGB order)
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Load an image from disk and return it as a DynamicImage
pub fn load_image(path: &str) -> anyhow::Result<DynamicImage> {
    let img = image::open(path)?;
    Ok(img)
}

/// Convert a DynamicImage to a tensor in CHW format with values in [0, 1]
///
/// This corresponds to PyTorch's `torchvision.transforms.functional.to_tensor`
pub fn image_to_tensor(img: &DynamicImage, device: &Device) -> Result<Tensor> {
    let img = img.to_rgb8();
    let (width, height) = img.dimensions();
    let (h, w) = (height as usize, width as usize);

    // HWC u8 -> CHW f32
    let data: Vec<f32> = img.into_raw().iter().map(|&x| x as f32 / 255.0).collect();
    Tensor::from_vec(data, (h, w, 3), device)?.permute((2, 0, 1))?.contiguous()
}

/// Normalize a [3, H, W] tensor with ImageNet mean and std
///
/// Formula: output = (input - mean) / std
pub fn normalize(tensor: &Tensor) -> Result<Tensor> {
    let device = tensor.device();
    let mean = Tensor::from_slice(&IMAGENET_MEAN, (3, 1, 1), device)?;
    let std = Tensor::from_slice(&IMAGENET_STD, (3, 1, 1), device)?;
    tensor.broadcast_sub(&mean)?.broadcast_div(&std)
}

/// Round `len` to the nearest positive multiple of `multiple`.
pub fn round_to_multiple(len: usize, multiple: usize) -> usize {
    (((len + multiple / 2) / multiple) * multiple).max(multiple)
}

/// Output size of the pipeline: a square `resolution` when given (rounded to
/// a multiple of 32), otherwise the original size rounded per side.
pub fn target_size(h: usize, w: usize, resolution: Option<usize>) -> (usize, usize) {
    match resolution {
        Some(r) => {
            let r = round_to_multiple(r, INPUT_MULTIPLE);
            (r, r)
        }
        None => (
            round_to_multiple(h, INPUT_MULTIPLE),
            round_to_multiple(w, INPUT_MULTIPLE),
        ),
    }
}

/// Bilinear resize of a [3, H, W] tensor
pub fn resize(tensor: &Tensor, target_size: (usize, usize)) -> Result<Tensor> {
    let (_, h, w) = tensor.dims3()?;
    let (target_h, target_w) = target_size;
    if (h, w) == target_size {
        return Ok(tensor.clone());
    }
    tensor
        .unsqueeze(0)?
        .upsample_bilinear2d(target_h, target_w, false)?
        .squeeze(0)
}

/// Full preprocessing pipeline: load, convert to tensor, normalize, and resize
///
/// # Returns
/// Tuple of (image batch [1, 3, H', W'], original_height, original_width)
pub fn preprocess_image(
    image_path: &str,
    resolution: Option<usize>,
    device: &Device,
) -> anyhow::Result<(Tensor, usize, usize)> {
    let img = load_image(image_path)?;

    let tensor = image_to_tensor(&img, device)?;
    let (_, h_orig, w_orig) = tensor.dims3()?;
    TensorStats::from_tensor(&tensor)?.trace("input_image_raw");

    let normalized = normalize(&tensor)?;
    TensorStats::from_tensor(&normalized)?.trace("input_image_normalized");

    let resized = resize(&normalized, target_size(h_orig, w_orig, resolution))?;
    TensorStats::from_tensor(&resized)?.trace("input_image_resized");

    Ok((resized.unsqueeze(0)?, h_orig, w_orig))
}
