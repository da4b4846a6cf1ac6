//! ViT-Adapter Configuration
//!
//! This module defines the configuration structures for the adapter backbone
//! and the plain ViT it wraps, plus the presets used by the detection configs
//! (DeiT tiny/small/base with four interaction stages of three blocks each).

use std::ops::Range;
use std::path::Path;

use serde::Deserialize;

use crate::error::{AdapterError, Result};

/// Configuration of the plain ViT encoder
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct VitConfig {
    /// Token width (192 tiny, 384 small, 768 base)
    pub embed_dim: usize,
    /// Number of transformer blocks
    pub depth: usize,
    /// Number of self-attention heads
    pub num_heads: usize,
    /// MLP hidden size ratio
    pub mlp_ratio: f64,
    /// Patch size of the patch embedding convolution
    pub patch_size: usize,
    /// Number of input image channels
    pub in_chans: usize,
    /// Whether the qkv projection has a bias
    pub qkv_bias: bool,
    /// LayerNorm epsilon inside the blocks
    pub layer_norm_eps: f64,
}

impl Default for VitConfig {
    fn default() -> Self {
        Self {
            embed_dim: 192,
            depth: 12,
            num_heads: 3,
            mlp_ratio: 4.0,
            patch_size: 16,
            in_chans: 3,
            qkv_bias: true,
            layer_norm_eps: 1e-6,
        }
    }
}

/// Configuration of the adapter backbone
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AdapterConfig {
    /// Wrapped ViT
    pub vit: VitConfig,
    /// Image size the position embedding was trained at
    pub pretrain_size: usize,
    /// Base width of the spatial prior convolutions
    pub conv_inplane: usize,
    /// Sampling points per head per level in deformable attention
    pub n_points: usize,
    /// Heads of the deformable attention
    pub deform_num_heads: usize,
    /// Initial value of the injector residual scale
    pub init_values: f64,
    /// Inclusive `[first, last]` block ranges, one per interaction stage
    pub interaction_indexes: Vec<[usize; 2]>,
    /// Use the convolutional FFN after each extractor
    pub with_cffn: bool,
    /// Hidden ratio of the convolutional FFN
    pub cffn_ratio: f64,
    /// Value projection ratio of the deformable attention
    pub deform_ratio: f64,
    /// Add resampled ViT tokens to every output level
    pub add_vit_feature: bool,
    /// Two extra extractors after the last stage
    pub use_extra_extractor: bool,

    // Legacy keys
    /// Accepted for compatibility with windowed-ViT configs, ignored
    pub window_attn: Option<Vec<bool>>,
    /// Accepted for compatibility with windowed-ViT configs, ignored
    pub window_size: Option<Vec<usize>>,
    /// Must stay false
    pub layer_scale: bool,
    /// Must stay unset; load weights through the `VarBuilder` instead
    pub pretrained: Option<String>,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self::tiny()
    }
}

fn four_stages() -> Vec<[usize; 2]> {
    vec![[0, 2], [3, 5], [6, 8], [9, 11]]
}

impl AdapterConfig {
    /// DeiT-Tiny adapter
    pub fn tiny() -> Self {
        Self {
            vit: VitConfig::default(),
            pretrain_size: 224,
            conv_inplane: 64,
            n_points: 4,
            deform_num_heads: 6,
            init_values: 0.0,
            interaction_indexes: four_stages(),
            with_cffn: true,
            cffn_ratio: 0.25,
            deform_ratio: 1.0,
            add_vit_feature: true,
            use_extra_extractor: true,
            window_attn: None,
            window_size: None,
            layer_scale: false,
            pretrained: None,
        }
    }

    /// DeiT-Small adapter
    pub fn small() -> Self {
        Self {
            vit: VitConfig {
                embed_dim: 384,
                num_heads: 6,
                ..VitConfig::default()
            },
            ..Self::tiny()
        }
    }

    /// DeiT-Base adapter
    pub fn base() -> Self {
        Self {
            vit: VitConfig {
                embed_dim: 768,
                num_heads: 12,
                ..VitConfig::default()
            },
            deform_num_heads: 12,
            deform_ratio: 0.5,
            ..Self::tiny()
        }
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        let config: Self = serde_json::from_reader(std::io::BufReader::new(file))?;
        Ok(config)
    }

    pub fn embed_dim(&self) -> usize {
        self.vit.embed_dim
    }

    pub fn num_stages(&self) -> usize {
        self.interaction_indexes.len()
    }

    /// Block range run by interaction stage `stage`
    pub fn stage_blocks(&self, stage: usize) -> Range<usize> {
        let [first, last] = self.interaction_indexes[stage];
        first..last + 1
    }

    /// Token grid side of the pretrained position embedding
    pub fn pretrain_grid(&self) -> usize {
        self.pretrain_size / self.vit.patch_size
    }

    /// Single validation pass run before anything is built.
    pub fn validate(&self) -> Result<()> {
        if self.layer_scale {
            return Err(AdapterError::config(
                "layer scale is not supported by the adapter blocks",
            ));
        }
        if let Some(path) = &self.pretrained {
            return Err(AdapterError::config(format!(
                "pretrained={path:?} is not supported, load weights through the VarBuilder instead"
            )));
        }
        if self.window_attn.is_some() || self.window_size.is_some() {
            tracing::warn!("window_attn/window_size are ignored by the adapter backbone");
        }

        let vit = &self.vit;
        if vit.embed_dim == 0 || vit.depth == 0 || vit.patch_size == 0 {
            return Err(AdapterError::config(
                "embed_dim, depth and patch_size must be positive",
            ));
        }
        if vit.num_heads == 0 || vit.embed_dim % vit.num_heads != 0 {
            return Err(AdapterError::config(format!(
                "embed_dim {} is not divisible by num_heads {}",
                vit.embed_dim, vit.num_heads
            )));
        }
        if vit.patch_size != 16 {
            return Err(AdapterError::config(format!(
                "patch_size {} does not match the stride-16 token level of the pyramid",
                vit.patch_size
            )));
        }
        if self.pretrain_size < vit.patch_size || self.pretrain_size % vit.patch_size != 0 {
            return Err(AdapterError::config(format!(
                "pretrain_size {} is not a positive multiple of patch_size {}",
                self.pretrain_size, vit.patch_size
            )));
        }
        let value_dim = (vit.embed_dim as f64 * self.deform_ratio) as usize;
        if self.deform_num_heads == 0 || value_dim == 0 || value_dim % self.deform_num_heads != 0 {
            return Err(AdapterError::config(format!(
                "deformable value dim {} is not divisible by deform_num_heads {}",
                value_dim, self.deform_num_heads
            )));
        }
        if self.n_points == 0 {
            return Err(AdapterError::config("n_points must be positive"));
        }
        if self.with_cffn && (vit.embed_dim as f64 * self.cffn_ratio) as usize == 0 {
            return Err(AdapterError::config(format!(
                "cffn_ratio {} leaves no hidden channels",
                self.cffn_ratio
            )));
        }
        if self.conv_inplane == 0 {
            return Err(AdapterError::config("conv_inplane must be positive"));
        }

        validate_partition(&self.interaction_indexes, vit.depth)
    }
}

/// The stages must split `0..depth` into contiguous, ordered, non-empty ranges.
fn validate_partition(indexes: &[[usize; 2]], depth: usize) -> Result<()> {
    if indexes.is_empty() {
        return Err(AdapterError::config(
            "interaction_indexes must name at least one stage",
        ));
    }
    let mut next = 0usize;
    for (stage, &[first, last]) in indexes.iter().enumerate() {
        if first != next {
            return Err(AdapterError::config(format!(
                "interaction stage {stage} starts at block {first}, expected {next}"
            )));
        }
        if last < first {
            return Err(AdapterError::config(format!(
                "interaction stage {stage} has an empty range [{first}, {last}]"
            )));
        }
        if last >= depth {
            return Err(AdapterError::config(format!(
                "interaction stage {stage} ends at block {last}, the ViT has {depth}"
            )));
        }
        next = last + 1;
    }
    if next != depth {
        return Err(AdapterError::config(format!(
            "interaction_indexes cover {next} blocks but the ViT has {depth}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_are_valid() {
        for config in [
            AdapterConfig::tiny(),
            AdapterConfig::small(),
            AdapterConfig::base(),
        ] {
            config.validate().unwrap();
        }
    }

    #[test]
    fn test_stage_block_counts_sum_to_depth() {
        let config = AdapterConfig {
            interaction_indexes: vec![[0, 0], [1, 4], [5, 10], [11, 11]],
            ..AdapterConfig::tiny()
        };
        config.validate().unwrap();

        let total: usize = (0..config.num_stages())
            .map(|i| config.stage_blocks(i).len())
            .sum();
        assert_eq!(total, config.vit.depth);
        assert_eq!(config.stage_blocks(1), 1..5);
    }

    #[test]
    fn test_layer_scale_rejected_with_window_flags() {
        let config = AdapterConfig {
            window_attn: Some(vec![false; 12]),
            window_size: Some(vec![14; 12]),
            layer_scale: true,
            ..AdapterConfig::tiny()
        };
        assert!(matches!(
            config.validate(),
            Err(AdapterError::Configuration(_))
        ));
    }

    #[test]
    fn test_window_flags_alone_are_ignored() {
        let config = AdapterConfig {
            window_attn: Some(vec![true; 12]),
            window_size: Some(vec![7; 12]),
            ..AdapterConfig::tiny()
        };
        config.validate().unwrap();
    }

    #[test]
    fn test_pretrained_rejected() {
        let config = AdapterConfig {
            pretrained: Some("deit_tiny.pth".to_string()),
            ..AdapterConfig::tiny()
        };
        assert!(matches!(
            config.validate(),
            Err(AdapterError::Configuration(_))
        ));
    }

    #[test]
    fn test_malformed_partitions_rejected() {
        let cases: Vec<Vec<[usize; 2]>> = vec![
            vec![],
            // gap
            vec![[0, 2], [4, 11]],
            // overlap
            vec![[0, 5], [5, 11]],
            // short
            vec![[0, 2], [3, 5]],
            // past the end
            vec![[0, 5], [6, 12]],
            // reversed
            vec![[0, 5], [8, 6], [7, 11]],
            // would overflow the next start
            vec![[0, usize::MAX]],
            vec![[0, 5], [6, usize::MAX]],
        ];
        for indexes in cases {
            let config = AdapterConfig {
                interaction_indexes: indexes.clone(),
                ..AdapterConfig::tiny()
            };
            assert!(
                matches!(config.validate(), Err(AdapterError::Configuration(_))),
                "{:?} should be rejected",
                indexes
            );
        }
    }

    #[test]
    fn test_json_partition_ending_at_usize_max_rejected() {
        let json = r#"{"interaction_indexes": [[0, 18446744073709551615]]}"#;
        let config: AdapterConfig = serde_json::from_str(json).unwrap();
        assert!(matches!(
            config.validate(),
            Err(AdapterError::Configuration(_))
        ));
    }

    #[test]
    fn test_pretrain_size_must_hold_a_patch() {
        for pretrain_size in [0, 8, 15, 40] {
            let config = AdapterConfig {
                pretrain_size,
                ..AdapterConfig::small()
            };
            assert!(
                matches!(config.validate(), Err(AdapterError::Configuration(_))),
                "pretrain_size {pretrain_size} should be rejected"
            );
        }
        let config = AdapterConfig {
            pretrain_size: 16,
            ..AdapterConfig::small()
        };
        config.validate().unwrap();
        assert_eq!(config.pretrain_grid(), 1);
    }

    #[test]
    fn test_deform_heads_must_divide_value_dim() {
        let config = AdapterConfig {
            deform_num_heads: 5,
            ..AdapterConfig::tiny()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_json_uses_defaults_for_missing_keys() {
        let json = r#"{
            "vit": { "embed_dim": 384, "num_heads": 6, "drop_path_rate": 0.2 },
            "interaction_indexes": [[0, 5], [6, 11]],
            "add_vit_feature": false,
            "window_attn": [false, false, true]
        }"#;
        let config: AdapterConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.vit.embed_dim, 384);
        assert_eq!(config.vit.depth, 12);
        assert_eq!(config.pretrain_size, 224);
        assert_eq!(config.num_stages(), 2);
        assert!(!config.add_vit_feature);
        config.validate().unwrap();
    }
}
