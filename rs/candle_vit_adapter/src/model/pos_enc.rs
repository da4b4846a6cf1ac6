//! Position embedding resampling
//!
//! The ViT position embedding is learned on a fixed `pretrain_size / patch`
//! grid. Detection inputs come in arbitrary sizes, so the patch part of the
//! table is resized bicubically to the current token grid on every call.

use candle_core::{Result, Tensor};

use crate::model::interpolate::resize_bicubic;

/// Resizes the pretrained patch position grid to any token grid.
#[derive(Debug, Clone, Copy)]
pub struct PositionalResampler {
    /// Side of the pretrained grid
    grid: usize,
}

impl PositionalResampler {
    pub fn new(grid: usize) -> Self {
        Self { grid }
    }

    /// # Arguments
    /// * `pos_embed` - Patch position embeddings [1, grid * grid, D] (no class slot)
    /// * `h`, `w` - Target token grid
    ///
    /// # Returns
    /// Position embeddings [1, h * w, D]
    pub fn resample(&self, pos_embed: &Tensor, h: usize, w: usize) -> Result<Tensor> {
        let dim = pos_embed.dim(2)?;
        // [1, g*g, D] -> [1, D, g, g]
        let grid = pos_embed
            .reshape((1, self.grid, self.grid, dim))?
            .permute((0, 3, 1, 2))?
            .contiguous()?;
        let resized = resize_bicubic(&grid, h, w)?;
        // [1, D, h, w] -> [1, h*w, D]
        resized.reshape((1, dim, h * w))?.transpose(1, 2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn test_output_length_is_h_times_w() {
        let resampler = PositionalResampler::new(14);
        let pos = Tensor::randn(0f32, 1., (1, 14 * 14, 8), &Device::Cpu).unwrap();
        for (h, w) in [(20, 20), (7, 13), (1, 1), (14, 14), (40, 25)] {
            let out = resampler.resample(&pos, h, w).unwrap();
            assert_eq!(out.dims(), &[1, h * w, 8]);
        }
    }

    #[test]
    fn test_same_grid_is_identity() {
        let resampler = PositionalResampler::new(4);
        let pos = Tensor::randn(0f32, 1., (1, 16, 3), &Device::Cpu).unwrap();
        let out = resampler.resample(&pos, 4, 4).unwrap();
        let diff = (out - &pos)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff < 1e-6);
    }

    #[test]
    fn test_channels_are_resized_independently() {
        // channel 0 constant, channel 1 zero: both stay that way after resizing
        let resampler = PositionalResampler::new(3);
        let ones = Tensor::ones((1, 9, 1), DType::F32, &Device::Cpu).unwrap();
        let zeros = Tensor::zeros((1, 9, 1), DType::F32, &Device::Cpu).unwrap();
        let pos = Tensor::cat(&[&ones, &zeros], 2).unwrap();

        let out = resampler.resample(&pos, 5, 6).unwrap();
        let out: Vec<Vec<f32>> = out.squeeze(0).unwrap().to_vec2().unwrap();
        for token in out {
            assert!((token[0] - 1.0).abs() < 1e-5);
            assert!(token[1].abs() < 1e-6);
        }
    }
}
