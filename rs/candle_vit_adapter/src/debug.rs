//! Tensor statistics and `.npy` dumps for comparing outputs against a
//! reference implementation.

use std::path::Path;

use candle_core::{DType, Result, Tensor};

/// Tensor statistics for debugging and validation
#[derive(Debug)]
pub struct TensorStats {
    pub shape: Vec<usize>,
    pub min: f32,
    pub max: f32,
    pub mean: f32,
    pub sum: f32,
}

impl TensorStats {
    /// Compute statistics for a tensor
    pub fn from_tensor(tensor: &Tensor) -> Result<Self> {
        let shape = tensor.dims().to_vec();
        let data: Vec<f32> = tensor.flatten_all()?.to_dtype(DType::F32)?.to_vec1()?;

        let min = data.iter().cloned().fold(f32::INFINITY, f32::min);
        let max = data.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        let sum: f32 = data.iter().sum();
        let mean = sum / data.len().max(1) as f32;

        Ok(Self {
            shape,
            min,
            max,
            mean,
            sum,
        })
    }

    /// Print statistics in a format similar to Python debug output
    pub fn print(&self, name: &str) {
        println!(
            "  {}: shape={:?}, min={:.6}, max={:.6}, mean={:.6}, sum={:.6}",
            name, self.shape, self.min, self.max, self.mean, self.sum
        );
    }

    pub fn trace(&self, name: &str) {
        tracing::debug!(
            name,
            shape = ?self.shape,
            min = self.min,
            max = self.max,
            mean = self.mean,
            "tensor stats"
        );
    }
}

/// Write `tensor` as an f32 `.npy` file.
pub fn dump_npy(tensor: &Tensor, path: impl AsRef<Path>) -> anyhow::Result<()> {
    let shape = tensor.dims().to_vec();
    let data: Vec<f32> = tensor.flatten_all()?.to_dtype(DType::F32)?.to_vec1()?;
    let array = ndarray::ArrayD::from_shape_vec(ndarray::IxDyn(&shape), data)?;
    ndarray_npy::write_npy(path, &array)?;
    Ok(())
}
