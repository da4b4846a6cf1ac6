//! Plain ViT encoder wrapped by the adapter
//!
//! This is the sequence-processing side of the backbone: patch embedding,
//! class token, the pretrained-size position embedding and an ordered list of
//! pre-norm transformer blocks. There is no classification head and no final
//! norm; the adapter only drives the blocks it is handed slice by slice.
//!
//! Weight names follow timm's `VisionTransformer`
//! (`patch_embed.proj`, `cls_token`, `pos_embed`, `blocks.{i}.attn.qkv`, ...).

use candle_core::{IndexOp, Result, Tensor, D};
use candle_nn::{Conv2d, Conv2dConfig, LayerNorm, Linear, Module, VarBuilder};

use crate::config::VitConfig;
use crate::init::{self, ParamRole};

/// Patch embeddings using a Conv2d projection
#[derive(Debug)]
pub struct PatchEmbed {
    proj: Conv2d,
}

impl PatchEmbed {
    pub fn load(vb: VarBuilder, config: &VitConfig) -> Result<Self> {
        let conv_config = Conv2dConfig {
            stride: config.patch_size,
            ..Default::default()
        };
        let proj = init::conv2d(
            config.in_chans,
            config.embed_dim,
            config.patch_size,
            conv_config,
            true,
            vb.pp("proj"),
        )?;
        Ok(Self { proj })
    }

    /// Returns tokens [B, H*W, D] and the token grid (H, W).
    pub fn forward(&self, pixel_values: &Tensor) -> Result<(Tensor, usize, usize)> {
        let embeddings = self.proj.forward(pixel_values)?;
        let (_, _, h, w) = embeddings.dims4()?;
        // [B, D, H, W] -> [B, H*W, D]
        let tokens = embeddings.flatten_from(2)?.transpose(1, 2)?;
        Ok((tokens, h, w))
    }
}

#[derive(Debug)]
pub struct Attention {
    qkv: Linear,
    proj: Linear,
    num_heads: usize,
    scale: f64,
}

impl Attention {
    pub fn load(vb: VarBuilder, config: &VitConfig) -> Result<Self> {
        let dim = config.embed_dim;
        let qkv = if config.qkv_bias {
            init::linear(dim, 3 * dim, vb.pp("qkv"))?
        } else {
            let weight = init::get(
                &vb.pp("qkv"),
                (3 * dim, dim),
                "weight",
                ParamRole::LinearWeight,
            )?;
            Linear::new(weight, None)
        };
        let proj = init::linear(dim, dim, vb.pp("proj"))?;
        let scale = 1. / ((dim / config.num_heads) as f64).sqrt();
        Ok(Self {
            qkv,
            proj,
            num_heads: config.num_heads,
            scale,
        })
    }

    /// Returns the attention output [B, N, C] and the class-token attention
    /// row averaged over heads [B, N - 1].
    pub fn forward(&self, xs: &Tensor) -> Result<(Tensor, Tensor)> {
        let (b, n, c) = xs.dims3()?;
        let qkv = self
            .qkv
            .forward(xs)?
            .reshape((b, n, 3, self.num_heads, c / self.num_heads))?
            .transpose(1, 2)? // b,3,n,h,d
            .transpose(0, 1)? // 3,b,n,h,d
            .transpose(2, 3)?; // 3,b,h,n,d
        let q = (qkv.i(0)?.contiguous()? * self.scale)?;
        let k = qkv.i(1)?.contiguous()?;
        let v = qkv.i(2)?.contiguous()?;
        let attn = candle_nn::ops::softmax(&q.matmul(&k.t()?)?, D::Minus1)?;

        let cls_attn = attn.i((.., .., 0, 1..))?.mean(1)?;

        let out = attn.matmul(&v)?.transpose(1, 2)?.reshape((b, n, c))?;
        Ok((self.proj.forward(&out)?, cls_attn))
    }
}

#[derive(Debug)]
pub struct Mlp {
    fc1: Linear,
    fc2: Linear,
}

impl Mlp {
    pub fn load(vb: VarBuilder, config: &VitConfig) -> Result<Self> {
        let hidden_features = (config.embed_dim as f64 * config.mlp_ratio) as usize;
        let fc1 = init::linear(config.embed_dim, hidden_features, vb.pp("fc1"))?;
        let fc2 = init::linear(hidden_features, config.embed_dim, vb.pp("fc2"))?;
        Ok(Self { fc1, fc2 })
    }
}

impl Module for Mlp {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let xs = self.fc1.forward(xs)?;
        let xs = xs.gelu_erf()?;
        self.fc2.forward(&xs)
    }
}

/// Single pre-norm transformer block
#[derive(Debug)]
pub struct Block {
    norm1: LayerNorm,
    attn: Attention,
    norm2: LayerNorm,
    mlp: Mlp,
}

impl Block {
    pub fn load(vb: VarBuilder, config: &VitConfig) -> Result<Self> {
        let norm1 = init::layer_norm(config.embed_dim, config.layer_norm_eps, vb.pp("norm1"))?;
        let attn = Attention::load(vb.pp("attn"), config)?;
        let norm2 = init::layer_norm(config.embed_dim, config.layer_norm_eps, vb.pp("norm2"))?;
        let mlp = Mlp::load(vb.pp("mlp"), config)?;
        Ok(Self {
            norm1,
            attn,
            norm2,
            mlp,
        })
    }

    /// # Arguments
    /// * `xs` - Class token followed by the spatial tokens [B, 1 + N, D]
    ///
    /// # Returns
    /// (updated tokens [B, 1 + N, D], class-token attention [B, N])
    pub fn forward(&self, xs: &Tensor) -> Result<(Tensor, Tensor)> {
        let (attn_out, cls_attn) = self.attn.forward(&self.norm1.forward(xs)?)?;
        let xs = (xs + attn_out)?;
        let mlp_out = self.mlp.forward(&self.norm2.forward(&xs)?)?;
        Ok(((xs + mlp_out)?, cls_attn))
    }
}

/// Plain ViT: embeddings plus an ordered block list
pub struct PlainVit {
    patch_embed: PatchEmbed,
    cls_token: Tensor,
    /// [1, 1 + grid * grid, D], class slot first
    pos_embed: Tensor,
    blocks: Vec<Block>,
}

impl PlainVit {
    pub fn load(vb: VarBuilder, config: &VitConfig, pretrain_grid: usize) -> Result<Self> {
        let dim = config.embed_dim;
        let patch_embed = PatchEmbed::load(vb.pp("patch_embed"), config)?;
        let cls_token = init::get(&vb, (1, 1, dim), "cls_token", ParamRole::TokenEmbed)?;
        let pos_embed = init::get(
            &vb,
            (1, pretrain_grid * pretrain_grid + 1, dim),
            "pos_embed",
            ParamRole::TokenEmbed,
        )?;

        let mut blocks = Vec::with_capacity(config.depth);
        for i in 0..config.depth {
            blocks.push(Block::load(vb.pp(format!("blocks.{}", i)), config)?);
        }

        Ok(Self {
            patch_embed,
            cls_token,
            pos_embed,
            blocks,
        })
    }

    pub fn patch_embed(&self, pixel_values: &Tensor) -> Result<(Tensor, usize, usize)> {
        self.patch_embed.forward(pixel_values)
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn cls_token(&self) -> &Tensor {
        &self.cls_token
    }

    /// Position embedding of the class slot [1, 1, D]
    pub fn cls_pos_embed(&self) -> Result<Tensor> {
        self.pos_embed.i((.., ..1, ..))
    }

    /// Position embeddings of the pretrained patch grid [1, grid * grid, D]
    pub fn patch_pos_embed(&self) -> Result<Tensor> {
        self.pos_embed.i((.., 1.., ..))
    }

    /// Dropout after adding position embeddings; identity at inference.
    pub fn pos_drop(&self, xs: Tensor) -> Tensor {
        xs
    }
}
