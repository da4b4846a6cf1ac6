//! Spatial prior module
//!
//! A small ResNet-style convolutional stem that gives the adapter its
//! multi-scale local context: four maps at strides 4, 8, 16 and 32, each
//! projected to the ViT width by a 1x1 convolution.
//!
//! Layer names follow the PyTorch `nn.Sequential` indices
//! (`stem.0` conv, `stem.1` bn, `stem.3` conv, ...).

use candle_core::{Result, Tensor};
use candle_nn::{BatchNorm, Conv2d, Conv2dConfig, Module, ModuleT, VarBuilder};

use crate::init;

const BN_EPS: f64 = 1e-5;

/// conv3x3 (no bias) -> BatchNorm -> ReLU
#[derive(Debug)]
struct ConvBnRelu {
    conv: Conv2d,
    bn: BatchNorm,
}

impl ConvBnRelu {
    fn load(
        in_channels: usize,
        out_channels: usize,
        stride: usize,
        conv_vb: VarBuilder,
        bn_vb: VarBuilder,
    ) -> Result<Self> {
        let config = Conv2dConfig {
            padding: 1,
            stride,
            ..Default::default()
        };
        let conv = init::conv2d(in_channels, out_channels, 3, config, false, conv_vb)?;
        let bn = candle_nn::batch_norm(out_channels, BN_EPS, bn_vb)?;
        Ok(Self { conv, bn })
    }

    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let xs = self.conv.forward(xs)?;
        self.bn.forward_t(&xs, train)?.relu()
    }
}

/// Convolutional feature pyramid feeding the adapter
#[derive(Debug)]
pub struct SpatialPriorModule {
    stem: [ConvBnRelu; 3],
    conv2: ConvBnRelu,
    conv3: ConvBnRelu,
    conv4: ConvBnRelu,
    fc1: Conv2d,
    fc2: Conv2d,
    fc3: Conv2d,
    fc4: Conv2d,
}

impl SpatialPriorModule {
    /// # Arguments
    /// * `inplanes` - Base width `c`; the levels have c, 2c, 4c and 4c channels
    /// * `embed_dim` - Output width of every level
    pub fn load(vb: VarBuilder, inplanes: usize, embed_dim: usize) -> Result<Self> {
        let stem_vb = vb.pp("stem");
        let stem = [
            ConvBnRelu::load(3, inplanes, 2, stem_vb.pp("0"), stem_vb.pp("1"))?,
            ConvBnRelu::load(inplanes, inplanes, 1, stem_vb.pp("3"), stem_vb.pp("4"))?,
            ConvBnRelu::load(inplanes, inplanes, 1, stem_vb.pp("6"), stem_vb.pp("7"))?,
        ];
        let stage = |name: &str, c_in: usize, c_out: usize| {
            let vb = vb.pp(name);
            ConvBnRelu::load(c_in, c_out, 2, vb.pp("0"), vb.pp("1"))
        };
        let conv2 = stage("conv2", inplanes, 2 * inplanes)?;
        let conv3 = stage("conv3", 2 * inplanes, 4 * inplanes)?;
        let conv4 = stage("conv4", 4 * inplanes, 4 * inplanes)?;

        let project = |name: &str, c_in: usize| {
            init::conv2d(c_in, embed_dim, 1, Default::default(), true, vb.pp(name))
        };
        Ok(Self {
            stem,
            conv2,
            conv3,
            conv4,
            fc1: project("fc1", inplanes)?,
            fc2: project("fc2", 2 * inplanes)?,
            fc3: project("fc3", 4 * inplanes)?,
            fc4: project("fc4", 4 * inplanes)?,
        })
    }

    /// # Arguments
    /// * `image` - [B, 3, H, W]
    ///
    /// # Returns
    /// `c1` [B, D, H/4, W/4] and `c2`, `c3`, `c4` flattened to
    /// [B, (H/s)*(W/s), D] for s = 8, 16, 32
    pub fn forward_t(
        &self,
        image: &Tensor,
        train: bool,
    ) -> Result<(Tensor, Tensor, Tensor, Tensor)> {
        let mut xs = image.clone();
        for layer in self.stem.iter() {
            xs = layer.forward_t(&xs, train)?;
        }
        // 3x3/s2/p1 max pool; zero padding equals -inf padding after ReLU
        let c1 = xs
            .pad_with_zeros(2, 1, 1)?
            .pad_with_zeros(3, 1, 1)?
            .max_pool2d_with_stride((3, 3), (2, 2))?;
        let c2 = self.conv2.forward_t(&c1, train)?;
        let c3 = self.conv3.forward_t(&c2, train)?;
        let c4 = self.conv4.forward_t(&c3, train)?;

        let c1 = self.fc1.forward(&c1)?;
        let c2 = flatten_tokens(&self.fc2.forward(&c2)?)?;
        let c3 = flatten_tokens(&self.fc3.forward(&c3)?)?;
        let c4 = flatten_tokens(&self.fc4.forward(&c4)?)?;
        Ok((c1, c2, c3, c4))
    }
}

/// [B, D, H, W] -> [B, H*W, D]
fn flatten_tokens(xs: &Tensor) -> Result<Tensor> {
    xs.flatten_from(2)?.transpose(1, 2)
}
