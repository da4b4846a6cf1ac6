//! Interaction stages
//!
//! One stage fuses the two streams of the adapter:
//! 1. the injector lets the ViT tokens attend (deformably) to the three
//!    spatial-prior levels and adds the result, scaled by `gamma`;
//! 2. the stage's slice of ViT blocks runs over `[cls, tokens]`;
//! 3. the extractor lets the flattened prior levels attend to the updated
//!    token grid, optionally followed by a convolutional FFN.
//!
//! The last stage may run two extra extractors.

use candle_core::{Result, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, LayerNorm, Linear, Module, VarBuilder, VarMap};

use crate::error::AdapterError;
use crate::init::{self, ParamRole};
use crate::model::deform_attn::{DeformInputs, MSDeformAttn};
use crate::model::vit::Block;

const NORM_EPS: f64 = 1e-6;

/// Learned per-level bias added to the stride 8/16/32 prior levels
#[derive(Debug, Clone)]
pub struct LevelEmbedding {
    /// [3, D]
    embed: Tensor,
}

impl LevelEmbedding {
    pub fn load(vb: &VarBuilder, dim: usize) -> Result<Self> {
        let embed = init::get(vb, (3, dim), "level_embed", ParamRole::LevelEmbed)?;
        Ok(Self { embed })
    }

    pub fn new(embed: Tensor) -> Self {
        Self { embed }
    }

    /// Adds row `i` of the table to level `i` ([B, L_i, D] each).
    pub fn forward(
        &self,
        c2: &Tensor,
        c3: &Tensor,
        c4: &Tensor,
    ) -> Result<(Tensor, Tensor, Tensor)> {
        let add = |c: &Tensor, level: usize| c.broadcast_add(&self.embed.get(level)?);
        Ok((add(c2, 0)?, add(c3, 1)?, add(c4, 2)?))
    }
}

/// Depth-wise 3x3 convolution over the three prior levels of a flattened
/// sequence.
#[derive(Debug)]
struct DwConv {
    conv: Conv2d,
}

impl DwConv {
    fn load(dim: usize, vb: VarBuilder) -> Result<Self> {
        let config = Conv2dConfig {
            padding: 1,
            groups: dim,
            ..Default::default()
        };
        let conv = init::conv2d(dim, dim, 3, config, true, vb.pp("dwconv"))?;
        Ok(Self { conv })
    }

    /// `xs` is [B, sum(h*w), C] laid out level after level per `level_shapes`.
    fn forward(&self, xs: &Tensor, level_shapes: &[(usize, usize)]) -> Result<Tensor> {
        let (b, n, c) = xs.dims3()?;
        let total: usize = level_shapes.iter().map(|(h, w)| h * w).sum();
        if total != n {
            candle_core::bail!("dwconv: level shapes cover {} tokens, got {}", total, n);
        }

        let mut start = 0;
        let mut levels = Vec::with_capacity(level_shapes.len());
        for &(h, w) in level_shapes {
            let level = xs
                .narrow(1, start, h * w)?
                .transpose(1, 2)?
                .reshape((b, c, h, w))?;
            levels.push(self.conv.forward(&level)?.flatten_from(2)?.transpose(1, 2)?);
            start += h * w;
        }
        Tensor::cat(&levels, 1)
    }
}

/// fc1 -> depth-wise conv -> GELU -> fc2
#[derive(Debug)]
struct ConvFfn {
    fc1: Linear,
    dwconv: DwConv,
    fc2: Linear,
}

impl ConvFfn {
    fn load(dim: usize, hidden: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            fc1: init::linear(dim, hidden, vb.pp("fc1"))?,
            dwconv: DwConv::load(hidden, vb.pp("dwconv"))?,
            fc2: init::linear(hidden, dim, vb.pp("fc2"))?,
        })
    }

    fn forward(&self, xs: &Tensor, level_shapes: &[(usize, usize)]) -> Result<Tensor> {
        let xs = self.fc1.forward(xs)?;
        let xs = self.dwconv.forward(&xs, level_shapes)?.gelu_erf()?;
        self.fc2.forward(&xs)
    }
}

/// Deformable-attention widths shared by injector and extractors
#[derive(Debug, Clone, Copy)]
pub struct DeformDims {
    pub dim: usize,
    pub num_heads: usize,
    pub n_points: usize,
    pub deform_ratio: f64,
}

/// Prior levels -> tokens
pub struct Injector {
    query_norm: LayerNorm,
    feat_norm: LayerNorm,
    attn: MSDeformAttn,
    /// [D]
    gamma: Tensor,
}

impl Injector {
    pub fn load(vb: VarBuilder, dims: DeformDims, init_values: f64) -> Result<Self> {
        Ok(Self {
            query_norm: init::layer_norm(dims.dim, NORM_EPS, vb.pp("query_norm"))?,
            feat_norm: init::layer_norm(dims.dim, NORM_EPS, vb.pp("feat_norm"))?,
            attn: MSDeformAttn::load(
                dims.dim,
                3,
                dims.num_heads,
                dims.n_points,
                dims.deform_ratio,
                vb.pp("attn"),
            )?,
            gamma: init::get(&vb, dims.dim, "gamma", ParamRole::Gamma(init_values))?,
        })
    }

    /// # Arguments
    /// * `query` - Tokens [B, h*w, D]
    /// * `feat` - Flattened prior levels [B, L8 + L16 + L32, D]
    pub fn forward(
        &self,
        query: &Tensor,
        feat: &Tensor,
        inputs: &DeformInputs,
    ) -> Result<Tensor> {
        let attn = self.attn.forward(
            &self.query_norm.forward(query)?,
            &inputs.reference_points,
            &self.feat_norm.forward(feat)?,
            &inputs.spatial_shapes,
            &inputs.level_start_index,
        )?;
        query + attn.broadcast_mul(&self.gamma)?
    }
}

/// Tokens -> prior levels
pub struct Extractor {
    query_norm: LayerNorm,
    feat_norm: LayerNorm,
    attn: MSDeformAttn,
    ffn: Option<(LayerNorm, ConvFfn)>,
}

impl Extractor {
    pub fn load(vb: VarBuilder, dims: DeformDims, cffn_hidden: Option<usize>) -> Result<Self> {
        let ffn = match cffn_hidden {
            Some(hidden) => Some((
                init::layer_norm(dims.dim, NORM_EPS, vb.pp("ffn_norm"))?,
                ConvFfn::load(dims.dim, hidden, vb.pp("ffn"))?,
            )),
            None => None,
        };
        Ok(Self {
            query_norm: init::layer_norm(dims.dim, NORM_EPS, vb.pp("query_norm"))?,
            feat_norm: init::layer_norm(dims.dim, NORM_EPS, vb.pp("feat_norm"))?,
            attn: MSDeformAttn::load(
                dims.dim,
                1,
                dims.num_heads,
                dims.n_points,
                dims.deform_ratio,
                vb.pp("attn"),
            )?,
            ffn,
        })
    }

    /// # Arguments
    /// * `query` - Flattened prior levels [B, L8 + L16 + L32, D]
    /// * `feat` - Tokens [B, h*w, D]
    /// * `level_shapes` - Spatial shapes of the three levels in `query`
    pub fn forward(
        &self,
        query: &Tensor,
        feat: &Tensor,
        inputs: &DeformInputs,
        level_shapes: &[(usize, usize)],
    ) -> Result<Tensor> {
        let attn = self.attn.forward(
            &self.query_norm.forward(query)?,
            &inputs.reference_points,
            &self.feat_norm.forward(feat)?,
            &inputs.spatial_shapes,
            &inputs.level_start_index,
        )?;
        let query = (query + attn)?;
        match &self.ffn {
            Some((norm, ffn)) => {
                let out = ffn.forward(&norm.forward(&query)?, level_shapes)?;
                query + out
            }
            None => Ok(query),
        }
    }

    fn reset_parameters(&self, varmap: &mut VarMap) -> Result<()> {
        self.attn.reset_parameters(varmap)
    }
}

/// Class-token attention handed from stage to stage.
///
/// Each stage replaces it with the row produced by its last block; nothing
/// in the backbone reads it besides the next stage.
#[derive(Debug, Clone, Default)]
pub struct ClsAttention(Option<Tensor>);

impl ClsAttention {
    /// [B, h*w] from the most recent block, if any block ran.
    pub fn latest(&self) -> Option<&Tensor> {
        self.0.as_ref()
    }
}

/// Tensors threaded through the interaction stages
#[derive(Debug, Clone)]
pub struct StageState {
    /// [B, 1, D]
    pub cls: Tensor,
    /// [B, h*w, D]
    pub x: Tensor,
    /// [B, L8 + L16 + L32, D]
    pub c: Tensor,
    pub cls_attn: ClsAttention,
}

impl StageState {
    pub fn new(cls: Tensor, x: Tensor, c: Tensor) -> Self {
        Self {
            cls,
            x,
            c,
            cls_attn: ClsAttention::default(),
        }
    }
}

/// Per-call inputs of a stage
pub struct StageContext<'a> {
    pub blocks: &'a [Block],
    pub inject: &'a DeformInputs,
    pub extract: &'a DeformInputs,
    pub stage_wise_prune: bool,
}

pub struct InteractionStage {
    injector: Injector,
    extractor: Extractor,
    extra_extractors: Vec<Extractor>,
}

impl InteractionStage {
    pub fn load(
        vb: VarBuilder,
        dims: DeformDims,
        init_values: f64,
        cffn_hidden: Option<usize>,
        extra_extractor: bool,
    ) -> Result<Self> {
        let injector = Injector::load(vb.pp("injector"), dims, init_values)?;
        let extractor = Extractor::load(vb.pp("extractor"), dims, cffn_hidden)?;
        let extra_extractors = if extra_extractor {
            (0..2)
                .map(|i| {
                    Extractor::load(vb.pp(format!("extra_extractors.{i}")), dims, cffn_hidden)
                })
                .collect::<Result<Vec<_>>>()?
        } else {
            Vec::new()
        };
        Ok(Self {
            injector,
            extractor,
            extra_extractors,
        })
    }

    pub fn has_extra_extractors(&self) -> bool {
        !self.extra_extractors.is_empty()
    }

    pub fn reset_parameters(&self, varmap: &mut VarMap) -> Result<()> {
        self.injector.attn.reset_parameters(varmap)?;
        self.extractor.reset_parameters(varmap)?;
        for extractor in self.extra_extractors.iter() {
            extractor.reset_parameters(varmap)?;
        }
        Ok(())
    }

    pub fn forward(
        &self,
        state: StageState,
        ctx: &StageContext,
    ) -> crate::error::Result<StageState> {
        if ctx.stage_wise_prune {
            return Err(AdapterError::UnsupportedFeature("stage-wise token pruning"));
        }
        let StageState {
            cls,
            x,
            c,
            mut cls_attn,
        } = state;
        let level_shapes = &ctx.inject.spatial_shapes;

        let x = self.injector.forward(&x, &c, ctx.inject)?;

        let n_tokens = x.dim(1)?;
        let mut xs = Tensor::cat(&[&cls, &x], 1)?;
        for block in ctx.blocks {
            let (out, attn) = block.forward(&xs)?;
            xs = out;
            cls_attn = ClsAttention(Some(attn));
        }
        let cls = xs.narrow(1, 0, 1)?;
        let x = xs.narrow(1, 1, n_tokens)?;

        let mut c = self.extractor.forward(&c, &x, ctx.extract, level_shapes)?;
        for extractor in self.extra_extractors.iter() {
            c = extractor.forward(&c, &x, ctx.extract, level_shapes)?;
        }

        Ok(StageState {
            cls,
            x,
            c,
            cls_attn,
        })
    }
}
