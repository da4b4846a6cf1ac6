//! Bicubic resampling
//!
//! Candle has nearest and bilinear upsampling but no bicubic mode, which the
//! position-embedding resize needs. It is built here from per-axis weight
//! matrices: each resize is two plain matmuls, so it runs on whatever device
//! the input lives on.
//!
//! Follows `torch.nn.functional.interpolate(mode="bicubic")` with
//! `align_corners=False` and no antialiasing: cubic convolution with
//! A = -0.75, out-of-range taps clamped to the border.

use candle_core::{DType, Device, Result, Tensor};

const CUBIC_A: f64 = -0.75;

fn cubic_near(x: f64) -> f64 {
    ((CUBIC_A + 2.0) * x - (CUBIC_A + 3.0)) * x * x + 1.0
}

fn cubic_far(x: f64) -> f64 {
    ((CUBIC_A * x - 5.0 * CUBIC_A) * x + 8.0 * CUBIC_A) * x - 4.0 * CUBIC_A
}

/// `[out_len, in_len]` weights of a bicubic resize along one axis.
pub fn bicubic_weights(in_len: usize, out_len: usize) -> Result<Vec<f32>> {
    if in_len == 0 || out_len == 0 {
        candle_core::bail!("bicubic resize from {} to {} samples", in_len, out_len);
    }
    let scale = in_len as f64 / out_len as f64;
    let last = in_len as isize - 1;
    let mut weights = vec![0f32; out_len * in_len];

    for dst in 0..out_len {
        let src = scale * (dst as f64 + 0.5) - 0.5;
        let base = src.floor();
        let t = src - base;
        let taps = [
            cubic_far(t + 1.0),
            cubic_near(t),
            cubic_near(1.0 - t),
            cubic_far(2.0 - t),
        ];
        for (k, w) in taps.iter().enumerate() {
            let idx = (base as isize - 1 + k as isize).clamp(0, last) as usize;
            weights[dst * in_len + idx] += *w as f32;
        }
    }
    Ok(weights)
}

fn weight_matrix(
    weights: Vec<f32>,
    out_len: usize,
    in_len: usize,
    device: &Device,
    dtype: DType,
) -> Result<Tensor> {
    Tensor::from_vec(weights, (out_len, in_len), device)?.to_dtype(dtype)
}

/// Apply `[out_h, h]` and `[out_w, w]` axis matrices to an NCHW tensor.
fn resize_separable(x: &Tensor, wy: &Tensor, wx: &Tensor) -> Result<Tensor> {
    let (b, c, h, w) = x.dims4()?;
    let out_h = wy.dim(0)?;
    let out_w = wx.dim(0)?;

    // Rows: [B*C*W, H] @ [H, out_h]
    let rows = x
        .transpose(2, 3)?
        .contiguous()?
        .reshape((b * c * w, h))?
        .matmul(&wy.t()?)?;
    // [B*C, W, out_h] -> [B*C, out_h, W]
    let rows = rows
        .reshape((b * c, w, out_h))?
        .transpose(1, 2)?
        .contiguous()?;

    // Columns: [B*C*out_h, W] @ [W, out_w]
    rows.reshape((b * c * out_h, w))?
        .matmul(&wx.t()?)?
        .reshape((b, c, out_h, out_w))
}

/// Bicubic resize of an NCHW tensor to `(out_h, out_w)`.
pub fn resize_bicubic(x: &Tensor, out_h: usize, out_w: usize) -> Result<Tensor> {
    let (_, _, h, w) = x.dims4()?;
    if h == out_h && w == out_w {
        return Ok(x.clone());
    }
    let (device, dtype) = (x.device(), x.dtype());
    let wy = weight_matrix(bicubic_weights(h, out_h)?, out_h, h, device, dtype)?;
    let wx = weight_matrix(bicubic_weights(w, out_w)?, out_w, w, device, dtype)?;
    resize_separable(x, &wy, &wx)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row_sums(weights: &[f32], in_len: usize) -> Vec<f32> {
        weights.chunks(in_len).map(|r| r.iter().sum()).collect()
    }

    #[test]
    fn test_bicubic_rows_sum_to_one() {
        for (i, o) in [(14, 20), (14, 7), (5, 33), (1, 4)] {
            let w = bicubic_weights(i, o).unwrap();
            for s in row_sums(&w, i) {
                assert!((s - 1.0).abs() < 1e-5, "{i}->{o}: row sum {s}");
            }
        }
    }

    #[test]
    fn test_bicubic_identity_when_same_size() {
        let w = bicubic_weights(6, 6).unwrap();
        for r in 0..6 {
            for c in 0..6 {
                let expected = if r == c { 1.0 } else { 0.0 };
                assert!((w[r * 6 + c] - expected).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn test_empty_axis_is_an_error() {
        assert!(bicubic_weights(0, 4).is_err());
        assert!(bicubic_weights(4, 0).is_err());

        let x = Tensor::zeros((1, 2, 0, 0), DType::F32, &Device::Cpu).unwrap();
        assert!(resize_bicubic(&x, 4, 4).is_err());
    }

    #[test]
    fn test_resize_keeps_constant_maps_constant() {
        let x = Tensor::full(3.5f32, (2, 3, 5, 7), &Device::Cpu).unwrap();
        let y = resize_bicubic(&x, 9, 4).unwrap();
        let v: Vec<f32> = y.flatten_all().unwrap().to_vec1().unwrap();
        assert!(v.iter().all(|&a| (a - 3.5).abs() < 1e-4));
    }

    #[test]
    fn test_resize_preserves_batch_and_channels() {
        let x = Tensor::randn(0f32, 1., (2, 3, 4, 6), &Device::Cpu).unwrap();
        assert_eq!(resize_bicubic(&x, 8, 5).unwrap().dims(), &[2, 3, 8, 5]);
    }
}
