//! Multi-Scale Deformable Attention
//!
//! Pure candle implementation (no custom CUDA kernels) of the deformable
//! attention used by the adapter in both directions:
//! - injector: ViT tokens query the three spatial-prior levels;
//! - extractor: the flattened spatial-prior levels query the ViT token grid.
//!
//! Each query predicts `n_points` sampling offsets per head and level around
//! its reference point, samples the value maps bilinearly (`grid_sample`
//! with zero padding, `align_corners=False`) and mixes the samples with
//! softmax weights.

use std::f64::consts::PI;

use candle_core::{DType, Device, IndexOp, Result, Tensor, D};
use candle_nn::{Linear, Module, VarBuilder, VarMap};

use crate::init::{self, ParamRole};

/// Multi-Scale Deformable Attention Module
pub struct MSDeformAttn {
    n_levels: usize,
    n_heads: usize,
    n_points: usize,
    /// Width of the projected values, `d_model * ratio`
    value_dim: usize,

    sampling_offsets: Linear,
    attention_weights: Linear,
    value_proj: Linear,
    output_proj: Linear,

    /// Var path of `sampling_offsets`, needed by the reset hook
    offsets_path: String,
}

impl MSDeformAttn {
    pub fn load(
        d_model: usize,
        n_levels: usize,
        n_heads: usize,
        n_points: usize,
        ratio: f64,
        vb: VarBuilder,
    ) -> Result<Self> {
        let value_dim = (d_model as f64 * ratio) as usize;
        if value_dim % n_heads != 0 {
            candle_core::bail!(
                "deformable value dim {} must be divisible by n_heads {}",
                value_dim,
                n_heads
            );
        }

        let offsets_vb = vb.pp("sampling_offsets");
        let offsets_path = offsets_vb.prefix();
        let sampling_offsets = init::linear_with_roles(
            d_model,
            n_heads * n_levels * n_points * 2,
            ParamRole::DeformZero,
            ParamRole::DeformZero,
            offsets_vb,
        )?;
        let attention_weights = init::linear_with_roles(
            d_model,
            n_heads * n_levels * n_points,
            ParamRole::DeformZero,
            ParamRole::DeformZero,
            vb.pp("attention_weights"),
        )?;
        let value_proj = init::linear_with_roles(
            d_model,
            value_dim,
            ParamRole::DeformXavier {
                fan_in: d_model,
                fan_out: value_dim,
            },
            ParamRole::DeformZero,
            vb.pp("value_proj"),
        )?;
        let output_proj = init::linear_with_roles(
            value_dim,
            d_model,
            ParamRole::DeformXavier {
                fan_in: value_dim,
                fan_out: d_model,
            },
            ParamRole::DeformZero,
            vb.pp("output_proj"),
        )?;

        Ok(Self {
            n_levels,
            n_heads,
            n_points,
            value_dim,
            sampling_offsets,
            attention_weights,
            value_proj,
            output_proj,
            offsets_path,
        })
    }

    /// Write the directional sampling-offset bias into a freshly built
    /// `VarMap`. Everything else already got its value from the init hints.
    pub fn reset_parameters(&self, varmap: &mut VarMap) -> Result<()> {
        let current = match self.sampling_offsets.bias() {
            Some(bias) => bias,
            None => candle_core::bail!("sampling_offsets has no bias"),
        };
        let bias = directional_offset_bias(self.n_heads, self.n_levels, self.n_points);
        let len = bias.len();
        let bias = Tensor::from_vec(bias, len, current.device())?.to_dtype(current.dtype())?;
        varmap.set_one(format!("{}.bias", self.offsets_path), &bias)
    }

    /// Forward pass for multi-scale deformable attention
    ///
    /// # Arguments
    /// * `query` - Query tensor [N, Len_q, C]
    /// * `reference_points` - Normalised (x, y) in [0, 1], [N or 1, Len_q, n_levels or 1, 2]
    /// * `input_flatten` - Flattened input features [N, sum(H*W), C]
    /// * `input_spatial_shapes` - Spatial shapes [(H, W), ...]
    /// * `input_level_start_index` - Start indices for each level [n_levels]
    ///
    /// # Returns
    /// Output tensor [N, Len_q, C]
    pub fn forward(
        &self,
        query: &Tensor,
        reference_points: &Tensor,
        input_flatten: &Tensor,
        input_spatial_shapes: &[(usize, usize)],
        input_level_start_index: &[usize],
    ) -> Result<Tensor> {
        let (n, len_q, _) = query.dims3()?;
        let (_, len_in, _) = input_flatten.dims3()?;

        let total_hw: usize = input_spatial_shapes.iter().map(|(h, w)| h * w).sum();
        if total_hw != len_in {
            candle_core::bail!("Spatial shapes sum {} != input length {}", total_hw, len_in);
        }
        if input_spatial_shapes.len() != self.n_levels
            || input_level_start_index.len() != self.n_levels
        {
            candle_core::bail!(
                "expected {} levels, got {} shapes and {} start indices",
                self.n_levels,
                input_spatial_shapes.len(),
                input_level_start_index.len()
            );
        }

        let value = self.value_proj.forward(input_flatten)?;

        // [N, Len_q, n_heads, n_levels, n_points, 2]
        let sampling_offsets = self.sampling_offsets.forward(query)?.reshape((
            n,
            len_q,
            self.n_heads,
            self.n_levels,
            self.n_points,
            2,
        ))?;
        // [N, Len_q, n_heads, n_levels * n_points]
        let attention_weights = self.attention_weights.forward(query)?.reshape((
            n,
            len_q,
            self.n_heads,
            self.n_levels * self.n_points,
        ))?;
        let attention_weights = candle_nn::ops::softmax_last_dim(&attention_weights)?;

        // Offsets are in pixels of their level; normalise by (W, H).
        let normalizer: Vec<f32> = input_spatial_shapes
            .iter()
            .flat_map(|&(h, w)| [w as f32, h as f32])
            .collect();
        let normalizer =
            Tensor::from_vec(normalizer, (1, 1, 1, self.n_levels, 1, 2), query.device())?
                .to_dtype(query.dtype())?;
        // [N, Len_q, 1, levels, 1, 2]
        let ref_pts = reference_points.unsqueeze(2)?.unsqueeze(4)?;
        let sampling_locations =
            ref_pts.broadcast_add(&sampling_offsets.broadcast_div(&normalizer)?)?;

        let output = self.attend(
            &value,
            input_spatial_shapes,
            input_level_start_index,
            &sampling_locations,
            &attention_weights,
        )?;
        self.output_proj.forward(&output)
    }

    /// # Arguments
    /// * `value` - [N, Len_in, value_dim]
    /// * `sampling_locations` - [N, Len_q, n_heads, n_levels, n_points, 2]
    /// * `attention_weights` - [N, Len_q, n_heads, n_levels * n_points]
    ///
    /// # Returns
    /// [N, Len_q, value_dim]
    fn attend(
        &self,
        value: &Tensor,
        spatial_shapes: &[(usize, usize)],
        level_start_index: &[usize],
        sampling_locations: &Tensor,
        attention_weights: &Tensor,
    ) -> Result<Tensor> {
        let dims = sampling_locations.dims();
        let (n, len_q) = (dims[0], dims[1]);
        let heads = self.n_heads;
        let head_dim = self.value_dim / heads;
        let samples = self.n_levels * self.n_points;

        // grid_sample expects [-1, 1]
        let sampling_grids = ((sampling_locations * 2.0)? - 1.0)?;

        let mut per_level = Vec::with_capacity(self.n_levels);
        for (lvl, (&(h, w), &start)) in spatial_shapes
            .iter()
            .zip(level_start_index.iter())
            .enumerate()
        {
            // [N, h*w, heads, head_dim] -> [N*heads, head_dim, h, w]
            let value_l = value
                .narrow(1, start, h * w)?
                .reshape((n, h * w, heads, head_dim))?
                .permute((0, 2, 3, 1))?
                .reshape((n * heads, head_dim, h, w))?;
            // [N, Len_q, heads, points, 2] -> [N*heads, Len_q, points, 2]
            let grid_l = sampling_grids
                .i((.., .., .., lvl))?
                .transpose(1, 2)?
                .reshape((n * heads, len_q, self.n_points, 2))?;
            // [N*heads, head_dim, Len_q, points]
            per_level.push(grid_sample_bilinear(&value_l, &grid_l)?);
        }

        // [N*heads, head_dim, Len_q, levels * points]
        let sampled = Tensor::stack(&per_level, 3)?.reshape((n * heads, head_dim, len_q, samples))?;
        let weights = attention_weights
            .transpose(1, 2)?
            .reshape((n * heads, 1, len_q, samples))?;

        // [N*heads, head_dim, Len_q] -> [N, Len_q, value_dim]
        sampled
            .broadcast_mul(&weights)?
            .sum(D::Minus1)?
            .reshape((n, heads * head_dim, len_q))?
            .transpose(1, 2)
    }
}

/// Initial sampling-offset bias: head `k` looks along angle `2*pi*k/heads`
/// (scaled so the larger of |cos|, |sin| is 1) and point `i` sits `i + 1`
/// steps out. Layout matches `[heads, levels, points, 2]`.
pub fn directional_offset_bias(n_heads: usize, n_levels: usize, n_points: usize) -> Vec<f32> {
    let mut bias = Vec::with_capacity(n_heads * n_levels * n_points * 2);
    for head in 0..n_heads {
        let theta = head as f64 * (2.0 * PI / n_heads as f64);
        let (sin, cos) = theta.sin_cos();
        let norm = cos.abs().max(sin.abs());
        let (dx, dy) = (cos / norm, sin / norm);
        for _level in 0..n_levels {
            for point in 0..n_points {
                let scale = (point + 1) as f64;
                bias.push((dx * scale) as f32);
                bias.push((dy * scale) as f32);
            }
        }
    }
    bias
}

/// Bilinear `grid_sample` with zero padding and `align_corners=False`.
///
/// # Arguments
/// * `input` - [N, C, H, W]
/// * `grid` - [N, H_out, W_out, 2], (x, y) in [-1, 1]
///
/// # Returns
/// [N, C, H_out, W_out]
fn grid_sample_bilinear(input: &Tensor, grid: &Tensor) -> Result<Tensor> {
    let (n, c, h, w) = input.dims4()?;
    let (_, h_out, w_out, _) = grid.dims4()?;

    // [-1, 1] -> [-0.5, size - 0.5], pixel centres at integers
    let x = (((grid.i((.., .., .., 0))? + 1.0)? * (w as f64 / 2.0))? - 0.5)?;
    let y = (((grid.i((.., .., .., 1))? + 1.0)? * (h as f64 / 2.0))? - 0.5)?;

    let x0 = x.floor()?;
    let y0 = y.floor()?;
    let x1 = (&x0 + 1.0)?;
    let y1 = (&y0 + 1.0)?;
    let fx = (&x - &x0)?;
    let fy = (&y - &y0)?;
    let gx = (1.0 - &fx)?;
    let gy = (1.0 - &fy)?;

    let input_flat = input.contiguous()?.reshape((n, c, h * w))?;
    let corners = [
        (&x0, &y0, (&gx * &gy)?),
        (&x1, &y0, (&fx * &gy)?),
        (&x0, &y1, (&gx * &fy)?),
        (&x1, &y1, (&fx * &fy)?),
    ];

    let mut out = Tensor::zeros((n, c, h_out, w_out), input.dtype(), input.device())?;
    for (cx, cy, weight) in corners.iter() {
        out = (out + sample_corner(&input_flat, cx, cy, weight, (h, w))?)?;
    }
    Ok(out)
}

/// Weighted gather of one bilinear corner; corners outside the map add zero.
fn sample_corner(
    input_flat: &Tensor,
    cx: &Tensor,
    cy: &Tensor,
    weight: &Tensor,
    (h, w): (usize, usize),
) -> Result<Tensor> {
    let (n, c, _) = input_flat.dims3()?;
    let (_, h_out, w_out) = cx.dims3()?;
    let dtype = input_flat.dtype();

    let inside_x = cx.ge(0.0)?.to_dtype(dtype)?.mul(&cx.lt(w as f64)?.to_dtype(dtype)?)?;
    let inside_y = cy.ge(0.0)?.to_dtype(dtype)?.mul(&cy.lt(h as f64)?.to_dtype(dtype)?)?;
    let weight = weight.mul(&inside_x)?.mul(&inside_y)?.unsqueeze(1)?;

    let xi = cx.clamp(0.0, (w - 1) as f64)?;
    let yi = cy.clamp(0.0, (h - 1) as f64)?;
    let idx = ((yi * w as f64)? + xi)?
        .to_dtype(DType::U32)?
        .reshape((n, 1, h_out * w_out))?
        .repeat((1, c, 1))?;

    input_flat
        .gather(&idx, 2)?
        .reshape((n, c, h_out, w_out))?
        .broadcast_mul(&weight)
}

/// Reference points, spatial shapes and level starts for one attention
/// direction. Depends only on the image size.
#[derive(Debug, Clone)]
pub struct DeformInputs {
    /// [1, Len_q, 1, 2]
    pub reference_points: Tensor,
    pub spatial_shapes: Vec<(usize, usize)>,
    pub level_start_index: Vec<usize>,
}

impl DeformInputs {
    /// Inputs for both directions of an `height` x `width` image:
    /// (injector: tokens -> prior levels, extractor: prior levels -> tokens).
    pub fn for_image(height: usize, width: usize, device: &Device) -> Result<(Self, Self)> {
        let pyramid = [
            (height / 8, width / 8),
            (height / 16, width / 16),
            (height / 32, width / 32),
        ];
        let tokens = [(height / 16, width / 16)];

        let injector = Self {
            reference_points: reference_points(&tokens, device)?,
            spatial_shapes: pyramid.to_vec(),
            level_start_index: level_start_index(&pyramid),
        };
        let extractor = Self {
            reference_points: reference_points(&pyramid, device)?,
            spatial_shapes: tokens.to_vec(),
            level_start_index: level_start_index(&tokens),
        };
        Ok((injector, extractor))
    }
}

pub fn level_start_index(shapes: &[(usize, usize)]) -> Vec<usize> {
    shapes
        .iter()
        .scan(0, |start, &(h, w)| {
            let current = *start;
            *start += h * w;
            Some(current)
        })
        .collect()
}

/// Cell centres of every level, normalised to [0, 1], concatenated in level
/// order: [1, sum(H*W), 1, 2] with (x, y) in the last dim.
pub fn reference_points(shapes: &[(usize, usize)], device: &Device) -> Result<Tensor> {
    let mut points = Vec::new();
    for &(h, w) in shapes {
        for y in 0..h {
            for x in 0..w {
                points.push((x as f32 + 0.5) / w as f32);
                points.push((y as f32 + 0.5) / h as f32);
            }
        }
    }
    let len = points.len() / 2;
    Tensor::from_vec(points, (1, len, 1, 2), device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;

    fn to_vec(t: &Tensor) -> Vec<f32> {
        t.flatten_all().unwrap().to_vec1().unwrap()
    }

    #[test]
    fn test_grid_sample_at_pixel_centres_is_exact() {
        let device = Device::Cpu;
        let input = Tensor::arange(0f32, 12., &device)
            .unwrap()
            .reshape((1, 1, 3, 4))
            .unwrap();
        // centre of pixel (x=2, y=1) is ((2 + 0.5) / 4, (1 + 0.5) / 3) in [0, 1]
        let gx = (2.5f32 / 4.0) * 2.0 - 1.0;
        let gy = (1.5f32 / 3.0) * 2.0 - 1.0;
        let grid = Tensor::from_vec(vec![gx, gy], (1, 1, 1, 2), &device).unwrap();
        let out = grid_sample_bilinear(&input, &grid).unwrap();
        assert_eq!(out.dims(), &[1, 1, 1, 1]);
        assert!((to_vec(&out)[0] - 6.0).abs() < 1e-5);
    }

    #[test]
    fn test_grid_sample_zero_padding_outside() {
        let device = Device::Cpu;
        let input = Tensor::ones((1, 2, 4, 4), DType::F32, &device).unwrap();
        // far outside the map on both axes
        let grid = Tensor::from_vec(vec![3f32, -3.], (1, 1, 1, 2), &device).unwrap();
        let out = grid_sample_bilinear(&input, &grid).unwrap();
        assert!(to_vec(&out).iter().all(|v| v.abs() < 1e-6));

        // half a pixel past the left edge: only the inside corners count
        let gx = -1f32;
        let grid = Tensor::from_vec(vec![gx, 0.], (1, 1, 1, 2), &device).unwrap();
        let out = grid_sample_bilinear(&input, &grid).unwrap();
        for v in to_vec(&out) {
            assert!((v - 0.5).abs() < 1e-5, "{v}");
        }
    }

    #[test]
    fn test_directional_bias_layout() {
        let bias = directional_offset_bias(4, 2, 3);
        assert_eq!(bias.len(), 4 * 2 * 3 * 2);
        // head 0 points along +x, point i at i + 1
        assert_eq!(&bias[0..6], &[1.0, 0.0, 2.0, 0.0, 3.0, 0.0]);
        // head 1 (90 degrees) along +y
        let head1 = &bias[12..14];
        assert!(head1[0].abs() < 1e-6 && (head1[1] - 1.0).abs() < 1e-6);
        // the max-norm of every unit direction is 1
        for head in bias.chunks(12) {
            let m = head[0].abs().max(head[1].abs());
            assert!((m - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_deform_inputs_shapes() {
        let (inj, ext) = DeformInputs::for_image(320, 320, &Device::Cpu).unwrap();
        assert_eq!(inj.spatial_shapes, vec![(40, 40), (20, 20), (10, 10)]);
        assert_eq!(inj.level_start_index, vec![0, 1600, 2000]);
        assert_eq!(inj.reference_points.dims(), &[1, 400, 1, 2]);

        assert_eq!(ext.spatial_shapes, vec![(20, 20)]);
        assert_eq!(ext.level_start_index, vec![0]);
        assert_eq!(ext.reference_points.dims(), &[1, 2100, 1, 2]);
    }

    #[test]
    fn test_reference_points_are_cell_centres() {
        let pts = reference_points(&[(2, 4)], &Device::Cpu).unwrap();
        let v = to_vec(&pts);
        assert_eq!(&v[0..2], &[0.125, 0.25]);
        // last cell (x=3, y=1)
        assert_eq!(&v[14..16], &[0.875, 0.75]);
    }

    #[test]
    fn test_forward_shapes_and_reset() {
        let device = Device::Cpu;
        let mut varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let attn = MSDeformAttn::load(16, 3, 2, 4, 0.5, vb.pp("attn")).unwrap();
        attn.reset_parameters(&mut varmap).unwrap();

        let bias = varmap
            .data()
            .lock()
            .unwrap()
            .get("attn.sampling_offsets.bias")
            .map(|v| to_vec(v.as_tensor()))
            .unwrap();
        assert_eq!(bias, directional_offset_bias(2, 3, 4));

        let (inj, _) = DeformInputs::for_image(64, 96, &device).unwrap();
        let len_in: usize = inj.spatial_shapes.iter().map(|(h, w)| h * w).sum();
        let query = Tensor::randn(0f32, 1., (2, 4 * 6, 16), &device).unwrap();
        let feat = Tensor::randn(0f32, 1., (2, len_in, 16), &device).unwrap();
        let out = attn
            .forward(
                &query,
                &inj.reference_points,
                &feat,
                &inj.spatial_shapes,
                &inj.level_start_index,
            )
            .unwrap();
        assert_eq!(out.dims(), &[2, 24, 16]);
    }

    #[test]
    fn test_forward_rejects_mismatched_shapes() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let attn = MSDeformAttn::load(8, 1, 2, 2, 1.0, vb).unwrap();

        let query = Tensor::zeros((1, 4, 8), DType::F32, &device).unwrap();
        let refs = reference_points(&[(2, 2)], &device).unwrap();
        let feat = Tensor::zeros((1, 5, 8), DType::F32, &device).unwrap();
        assert!(attn.forward(&query, &refs, &feat, &[(2, 2)], &[0]).is_err());
    }
}
