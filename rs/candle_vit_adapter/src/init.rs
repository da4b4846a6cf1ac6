//! Parameter roles and their initialisation.
//!
//! Every parameter the backbone creates is declared with one [`ParamRole`].
//! The role picks the `candle_nn::Init` hint handed to the `VarBuilder`, so a
//! `VarMap`-backed builder produces freshly initialised weights while a
//! safetensors-backed builder simply ignores the hints.
//!
//! The only initialisation that cannot be expressed as an `Init` hint is the
//! directional sampling-offset bias of deformable attention; that one is
//! written by [`crate::model::deform_attn::MSDeformAttn::reset_parameters`].

use candle_core::{Result, Shape, Tensor};
use candle_nn::{
    Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig, Init, LayerNorm, Linear,
    VarBuilder,
};

/// Standard deviation of the truncated-normal linear init.
const LINEAR_STD: f64 = 0.02;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParamRole {
    LinearWeight,
    LinearBias,
    /// Class token and position table
    TokenEmbed,
    NormWeight,
    NormBias,
    /// `fan_out = kernel_h * kernel_w * out_channels / groups`
    ConvWeight { fan_out: usize },
    ConvBias,
    LevelEmbed,
    /// Per-channel residual scale of the injector.
    Gamma(f64),
    DeformZero,
    DeformXavier { fan_in: usize, fan_out: usize },
}

impl ParamRole {
    pub fn init(&self) -> Init {
        match *self {
            // TODO: switch to a truncated normal once candle_nn::Init provides one.
            ParamRole::LinearWeight | ParamRole::TokenEmbed => Init::Randn {
                mean: 0.0,
                stdev: LINEAR_STD,
            },
            ParamRole::LinearBias | ParamRole::NormBias | ParamRole::ConvBias => Init::Const(0.0),
            ParamRole::NormWeight => Init::Const(1.0),
            ParamRole::ConvWeight { fan_out } => Init::Randn {
                mean: 0.0,
                stdev: (2.0 / fan_out.max(1) as f64).sqrt(),
            },
            ParamRole::LevelEmbed => Init::Randn {
                mean: 0.0,
                stdev: 1.0,
            },
            ParamRole::Gamma(value) => Init::Const(value),
            ParamRole::DeformZero => Init::Const(0.0),
            ParamRole::DeformXavier { fan_in, fan_out } => {
                let bound = (6.0 / (fan_in + fan_out) as f64).sqrt();
                Init::Uniform {
                    lo: -bound,
                    up: bound,
                }
            }
        }
    }
}

pub fn get<S: Into<Shape>>(
    vb: &VarBuilder,
    shape: S,
    name: &str,
    role: ParamRole,
) -> Result<Tensor> {
    vb.get_with_hints(shape, name, role.init())
}

/// Linear layer with the default linear roles.
pub fn linear(in_dim: usize, out_dim: usize, vb: VarBuilder) -> Result<Linear> {
    linear_with_roles(
        in_dim,
        out_dim,
        ParamRole::LinearWeight,
        ParamRole::LinearBias,
        vb,
    )
}

pub fn linear_with_roles(
    in_dim: usize,
    out_dim: usize,
    weight_role: ParamRole,
    bias_role: ParamRole,
    vb: VarBuilder,
) -> Result<Linear> {
    let weight = get(&vb, (out_dim, in_dim), "weight", weight_role)?;
    let bias = get(&vb, out_dim, "bias", bias_role)?;
    Ok(Linear::new(weight, Some(bias)))
}

pub fn layer_norm(dim: usize, eps: f64, vb: VarBuilder) -> Result<LayerNorm> {
    let weight = get(&vb, dim, "weight", ParamRole::NormWeight)?;
    let bias = get(&vb, dim, "bias", ParamRole::NormBias)?;
    Ok(LayerNorm::new(weight, bias, eps))
}

pub fn conv2d(
    in_channels: usize,
    out_channels: usize,
    kernel_size: usize,
    config: Conv2dConfig,
    bias: bool,
    vb: VarBuilder,
) -> Result<Conv2d> {
    let fan_out = kernel_size * kernel_size * out_channels / config.groups;
    let weight = get(
        &vb,
        (
            out_channels,
            in_channels / config.groups,
            kernel_size,
            kernel_size,
        ),
        "weight",
        ParamRole::ConvWeight { fan_out },
    )?;
    let bias = if bias {
        Some(get(&vb, out_channels, "bias", ParamRole::ConvBias)?)
    } else {
        None
    };
    Ok(Conv2d::new(weight, bias, config))
}

pub fn conv_transpose2d(
    in_channels: usize,
    out_channels: usize,
    kernel_size: usize,
    config: ConvTranspose2dConfig,
    vb: VarBuilder,
) -> Result<ConvTranspose2d> {
    let fan_out = kernel_size * kernel_size * out_channels;
    let weight = get(
        &vb,
        (in_channels, out_channels, kernel_size, kernel_size),
        "weight",
        ParamRole::ConvWeight { fan_out },
    )?;
    let bias = get(&vb, out_channels, "bias", ParamRole::ConvBias)?;
    Ok(ConvTranspose2d::new(weight, Some(bias), config))
}
