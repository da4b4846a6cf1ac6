pub mod deform_attn;
pub mod interaction;
pub mod interpolate;
pub mod pos_enc;
pub mod pyramid;
pub mod spatial_prior;
pub mod vit;

use std::ops::Range;

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};

use crate::config::AdapterConfig;
use crate::error::{AdapterError, Result};
use crate::model::deform_attn::DeformInputs;
use crate::model::interaction::{
    ClsAttention, DeformDims, InteractionStage, LevelEmbedding, StageContext, StageState,
};
use crate::model::pos_enc::PositionalResampler;
use crate::model::pyramid::{LevelNormalizer, PyramidReassembler};
use crate::model::spatial_prior::SpatialPriorModule;
use crate::model::vit::PlainVit;

/// Input sides must be multiples of the coarsest stride.
pub const INPUT_MULTIPLE: usize = 32;

/// ViT-Adapter backbone
///
/// Wraps a plain ViT with a convolutional spatial prior and deformable
/// interaction stages, and returns a four-level feature pyramid at strides
/// 4, 8, 16 and 32, each with `embed_dim` channels.
pub struct ViTAdapter {
    vit: PlainVit,
    resampler: PositionalResampler,
    level_embed: LevelEmbedding,
    spm: SpatialPriorModule,
    interactions: Vec<InteractionStage>,
    /// Block range of each interaction stage
    stage_blocks: Vec<Range<usize>>,
    reassembler: PyramidReassembler,
    normalizer: LevelNormalizer,
    stage_wise_prune: bool,
}

impl ViTAdapter {
    /// Validates `config`, then builds every module from `vb`.
    ///
    /// Weight path layout matches the PyTorch checkpoint: `patch_embed.*`,
    /// `cls_token`, `pos_embed`, `blocks.{i}.*`, `level_embed`, `spm.*`,
    /// `interactions.{i}.*`, `up.*`, `norm1` .. `norm4`.
    pub fn load(vb: VarBuilder, config: &AdapterConfig) -> Result<Self> {
        config.validate()?;

        let dim = config.embed_dim();
        let pretrain_grid = config.pretrain_grid();
        let vit = PlainVit::load(vb.clone(), &config.vit, pretrain_grid)?;
        let level_embed = LevelEmbedding::load(&vb, dim)?;
        let spm = SpatialPriorModule::load(vb.pp("spm"), config.conv_inplane, dim)?;

        let dims = DeformDims {
            dim,
            num_heads: config.deform_num_heads,
            n_points: config.n_points,
            deform_ratio: config.deform_ratio,
        };
        let cffn_hidden = config
            .with_cffn
            .then(|| (dim as f64 * config.cffn_ratio) as usize);
        let num_stages = config.num_stages();
        let mut interactions = Vec::with_capacity(num_stages);
        for i in 0..num_stages {
            let extra = config.use_extra_extractor && i == num_stages - 1;
            interactions.push(InteractionStage::load(
                vb.pp(format!("interactions.{i}")),
                dims,
                config.init_values,
                cffn_hidden,
                extra,
            )?);
        }
        let stage_blocks = (0..num_stages).map(|i| config.stage_blocks(i)).collect();

        let reassembler = PyramidReassembler::load(vb.clone(), dim, config.add_vit_feature)?;
        let normalizer = LevelNormalizer::load(vb, dim)?;

        tracing::debug!(
            embed_dim = dim,
            stages = num_stages,
            pretrain_grid,
            "built ViT-Adapter"
        );

        Ok(Self {
            vit,
            resampler: PositionalResampler::new(pretrain_grid),
            level_embed,
            spm,
            interactions,
            stage_blocks,
            reassembler,
            normalizer,
            stage_wise_prune: false,
        })
    }

    /// Builds a randomly initialised backbone (f32) together with the
    /// `VarMap` holding its parameters.
    pub fn init(config: &AdapterConfig, device: &Device) -> Result<(Self, VarMap)> {
        let mut varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let model = Self::load(vb, config)?;
        for stage in model.interactions.iter() {
            stage.reset_parameters(&mut varmap)?;
        }
        Ok((model, varmap))
    }

    pub fn set_stage_wise_prune(&mut self, enabled: bool) {
        self.stage_wise_prune = enabled;
    }

    pub fn stage_wise_prune(&self) -> bool {
        self.stage_wise_prune
    }

    pub fn num_stages(&self) -> usize {
        self.interactions.len()
    }

    /// Inference forward pass (batch norms use running statistics).
    pub fn forward(&self, image: &Tensor) -> Result<[Tensor; 4]> {
        self.forward_t(image, false)
    }

    /// # Arguments
    /// * `image` - Normalised images [B, 3, H, W], H and W multiples of 32
    /// * `train` - Batch norms use batch statistics when set
    ///
    /// # Returns
    /// `[f1, f2, f3, f4]` at strides 4, 8, 16, 32, each [B, D, H/s, W/s]
    pub fn forward_t(&self, image: &Tensor, train: bool) -> Result<[Tensor; 4]> {
        self.forward_with_cls_attn(image, train).map(|(levels, _)| levels)
    }

    /// Like [`Self::forward_t`], also returning the class-token attention of
    /// the last block.
    pub fn forward_with_cls_attn(
        &self,
        image: &Tensor,
        train: bool,
    ) -> Result<([Tensor; 4], ClsAttention)> {
        if self.stage_wise_prune {
            return Err(AdapterError::UnsupportedFeature("stage-wise token pruning"));
        }
        let (bs, _, img_h, img_w) = image.dims4()?;
        if img_h % INPUT_MULTIPLE != 0 || img_w % INPUT_MULTIPLE != 0 || img_h == 0 || img_w == 0
        {
            return Err(candle_core::Error::Msg(format!(
                "input {img_h}x{img_w} is not a multiple of {INPUT_MULTIPLE}"
            ))
            .into());
        }
        let span = tracing::debug_span!("vit_adapter", batch = bs, img_h, img_w);
        let _enter = span.enter();

        let (inject, extract) = DeformInputs::for_image(img_h, img_w, image.device())?;

        // Spatial prior
        let (c1, c2, c3, c4) = self.spm.forward_t(image, train)?;
        let (c2, c3, c4) = self.level_embed.forward(&c2, &c3, &c4)?;
        let c = Tensor::cat(&[&c2, &c3, &c4], 1)?;
        tracing::debug!(c1 = ?c1.dims(), c = ?c.dims(), "spatial prior");

        // Patch embedding
        let (x, h, w) = self.vit.patch_embed(image)?;
        let dim = x.dim(2)?;
        let pos_embed = self
            .resampler
            .resample(&self.vit.patch_pos_embed()?, h, w)?;
        let x = self.vit.pos_drop(x.broadcast_add(&pos_embed)?);
        let cls = self.vit.pos_drop(
            self.vit
                .cls_token()
                .broadcast_as((bs, 1, dim))?
                .broadcast_add(&self.vit.cls_pos_embed()?)?,
        );
        tracing::debug!(h, w, "patch embedding");

        // Interaction
        let mut state = StageState::new(cls, x, c);
        for (i, (stage, blocks)) in self
            .interactions
            .iter()
            .zip(self.stage_blocks.iter())
            .enumerate()
        {
            let ctx = StageContext {
                blocks: &self.vit.blocks()[blocks.clone()],
                inject: &inject,
                extract: &extract,
                stage_wise_prune: self.stage_wise_prune,
            };
            state = stage.forward(state, &ctx)?;
            tracing::debug!(
                stage = i,
                blocks = ?blocks,
                extra = stage.has_extra_extractors(),
                "interaction"
            );
        }

        // Split & reshape, then normalise
        let levels = self.reassembler.forward(&state.c, &c1, &state.x, h, w)?;
        let levels = self.normalizer.forward_t(levels, train)?;
        Ok((levels, state.cls_attn))
    }
}
