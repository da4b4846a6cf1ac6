//! Output pyramid
//!
//! Turns the fused prior sequence back into spatial maps, builds the
//! stride-4 level and optionally mixes the ViT token grid into every level,
//! then normalises each level with its own BatchNorm.

use candle_core::{Result, Tensor};
use candle_nn::{BatchNorm, ConvTranspose2d, ConvTranspose2dConfig, Module, ModuleT, VarBuilder};

use crate::init;

/// Token lengths of the stride 8/16/32 levels for an `h` x `w` token grid.
pub fn level_lengths(h: usize, w: usize) -> [usize; 3] {
    [4 * h * w, h * w, (h / 2) * (w / 2)]
}

/// Splits `[B, L8 + L16 + L32, D]` into the three levels, in order.
pub fn split_levels(c: &Tensor, lengths: &[usize; 3]) -> Result<[Tensor; 3]> {
    let total: usize = lengths.iter().sum();
    let len = c.dim(1)?;
    if total != len {
        candle_core::bail!(
            "prior sequence has {} tokens, level lengths {:?} sum to {}",
            len,
            lengths,
            total
        );
    }
    Ok([
        c.narrow(1, 0, lengths[0])?,
        c.narrow(1, lengths[0], lengths[1])?,
        c.narrow(1, lengths[0] + lengths[1], lengths[2])?,
    ])
}

/// [B, h*w, D] -> [B, D, h, w]
fn to_spatial(xs: &Tensor, h: usize, w: usize) -> Result<Tensor> {
    let (b, _, d) = xs.dims3()?;
    xs.transpose(1, 2)?.reshape((b, d, h, w))
}

/// ViT tokens resized to the four output strides (x4, x2, x1, x0.5).
fn token_pyramid(x: &Tensor, h: usize, w: usize) -> Result<[Tensor; 4]> {
    let x3 = to_spatial(x, h, w)?;
    Ok([
        x3.upsample_bilinear2d_with_scale(4.0, 4.0, false)?,
        x3.upsample_bilinear2d_with_scale(2.0, 2.0, false)?,
        x3.clone(),
        x3.upsample_bilinear2d_with_scale(0.5, 0.5, false)?,
    ])
}

pub struct PyramidReassembler {
    up: ConvTranspose2d,
    add_vit_feature: bool,
}

impl PyramidReassembler {
    pub fn load(vb: VarBuilder, dim: usize, add_vit_feature: bool) -> Result<Self> {
        let config = ConvTranspose2dConfig {
            stride: 2,
            ..Default::default()
        };
        let up = init::conv_transpose2d(dim, dim, 2, config, vb.pp("up"))?;
        Ok(Self {
            up,
            add_vit_feature,
        })
    }

    /// # Arguments
    /// * `c` - Fused prior sequence [B, L8 + L16 + L32, D]
    /// * `c1` - Stride-4 prior map [B, D, 4h, 4w]
    /// * `x` - ViT tokens [B, h*w, D], only read when `add_vit_feature` is set
    /// * `h`, `w` - Token grid
    ///
    /// # Returns
    /// Maps at strides 4, 8, 16, 32
    pub fn forward(
        &self,
        c: &Tensor,
        c1: &Tensor,
        x: &Tensor,
        h: usize,
        w: usize,
    ) -> Result<[Tensor; 4]> {
        let [c2, c3, c4] = split_levels(c, &level_lengths(h, w))?;
        let c2 = to_spatial(&c2, 2 * h, 2 * w)?;
        let c3 = to_spatial(&c3, h, w)?;
        let c4 = to_spatial(&c4, h / 2, w / 2)?;
        let c1 = (self.up.forward(&c2)? + c1)?;

        let levels = [c1, c2, c3, c4];
        if !self.add_vit_feature {
            return Ok(levels);
        }
        let tokens = token_pyramid(x, h, w)?;
        let [c1, c2, c3, c4] = levels;
        let [x1, x2, x3, x4] = tokens;
        Ok([(c1 + x1)?, (c2 + x2)?, (c3 + x3)?, (c4 + x4)?])
    }
}

/// One BatchNorm per output level
pub struct LevelNormalizer {
    norms: [BatchNorm; 4],
}

impl LevelNormalizer {
    /// Loads `norm1` .. `norm4` from `vb`.
    pub fn load(vb: VarBuilder, dim: usize) -> Result<Self> {
        let norm = |i: usize| candle_nn::batch_norm(dim, 1e-5, vb.pp(format!("norm{i}")));
        Ok(Self {
            norms: [norm(1)?, norm(2)?, norm(3)?, norm(4)?],
        })
    }

    pub fn forward_t(&self, levels: [Tensor; 4], train: bool) -> Result<[Tensor; 4]> {
        let [f1, f2, f3, f4] = levels;
        let [n1, n2, n3, n4] = &self.norms;
        Ok([
            n1.forward_t(&f1, train)?,
            n2.forward_t(&f2, train)?,
            n3.forward_t(&f3, train)?,
            n4.forward_t(&f4, train)?,
        ])
    }
}
