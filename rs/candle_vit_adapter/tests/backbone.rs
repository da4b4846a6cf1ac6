use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};

use candle_vit_adapter::{AdapterConfig, AdapterError, VitConfig, ViTAdapter};

fn tiny_config() -> AdapterConfig {
    AdapterConfig {
        vit: VitConfig {
            embed_dim: 32,
            depth: 4,
            num_heads: 2,
            ..VitConfig::default()
        },
        pretrain_size: 64,
        conv_inplane: 8,
        n_points: 2,
        deform_num_heads: 2,
        interaction_indexes: vec![[0, 1], [2, 3]],
        ..AdapterConfig::tiny()
    }
}

fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
    (a - b)
        .unwrap()
        .abs()
        .unwrap()
        .max_all()
        .unwrap()
        .to_scalar()
        .unwrap()
}

#[test]
fn test_pyramid_shapes() {
    let device = Device::Cpu;
    let (model, _varmap) = ViTAdapter::init(&tiny_config(), &device).unwrap();
    assert_eq!(model.num_stages(), 2);

    let image = Tensor::randn(0f32, 1., (2, 3, 64, 96), &device).unwrap();
    let [f1, f2, f3, f4] = model.forward(&image).unwrap();
    assert_eq!(f1.dims(), &[2, 32, 16, 24]);
    assert_eq!(f2.dims(), &[2, 32, 8, 12]);
    assert_eq!(f3.dims(), &[2, 32, 4, 6]);
    assert_eq!(f4.dims(), &[2, 32, 2, 3]);
}

#[test]
fn test_cls_attention_comes_from_last_block() {
    let device = Device::Cpu;
    let (model, _varmap) = ViTAdapter::init(&tiny_config(), &device).unwrap();
    let image = Tensor::randn(0f32, 1., (1, 3, 64, 64), &device).unwrap();

    let (_, cls_attn) = model.forward_with_cls_attn(&image, false).unwrap();
    assert_eq!(cls_attn.latest().unwrap().dims(), &[1, 16]);
}

#[test]
fn test_forward_is_stateless_at_inference() {
    let device = Device::Cpu;
    let (model, _varmap) = ViTAdapter::init(&tiny_config(), &device).unwrap();
    let image = Tensor::randn(0f32, 1., (1, 3, 64, 64), &device).unwrap();

    let a = model.forward(&image).unwrap();
    let b = model.forward(&image).unwrap();
    for (x, y) in a.iter().zip(b.iter()) {
        assert_eq!(max_abs_diff(x, y), 0.0);
    }
}

#[test]
fn test_training_mode_runs() {
    let device = Device::Cpu;
    let (model, _varmap) = ViTAdapter::init(&tiny_config(), &device).unwrap();
    let image = Tensor::randn(0f32, 1., (2, 3, 64, 64), &device).unwrap();
    let levels = model.forward_t(&image, true).unwrap();
    assert_eq!(levels[0].dims(), &[2, 32, 16, 16]);
}

#[test]
fn test_saved_weights_reload_to_same_outputs() {
    let device = Device::Cpu;
    let config = tiny_config();
    let (model, varmap) = ViTAdapter::init(&config, &device).unwrap();

    let path =
        std::env::temp_dir().join(format!("vit_adapter_{}.safetensors", std::process::id()));
    varmap.save(&path).unwrap();
    let vb =
        unsafe { VarBuilder::from_mmaped_safetensors(&[&path], DType::F32, &device).unwrap() };
    let reloaded = ViTAdapter::load(vb, &config).unwrap();

    let image = Tensor::randn(0f32, 1., (1, 3, 64, 64), &device).unwrap();
    let a = model.forward(&image).unwrap();
    let b = reloaded.forward(&image).unwrap();
    std::fs::remove_file(&path).unwrap();
    for (x, y) in a.iter().zip(b.iter()) {
        assert!(max_abs_diff(x, y) < 1e-5);
    }
}

#[test]
fn test_stage_wise_prune_fails_before_any_tensor_op() {
    let device = Device::Cpu;
    let (mut model, _varmap) = ViTAdapter::init(&tiny_config(), &device).unwrap();
    model.set_stage_wise_prune(true);
    assert!(model.stage_wise_prune());

    // not even an image: any tensor op would fail with a shape error instead
    let garbage = Tensor::zeros(7, DType::F32, &device).unwrap();
    assert!(matches!(
        model.forward(&garbage),
        Err(AdapterError::UnsupportedFeature(_))
    ));

    model.set_stage_wise_prune(false);
    let image = Tensor::zeros((1, 3, 64, 64), DType::F32, &device).unwrap();
    model.forward(&image).unwrap();
}

#[test]
fn test_layer_scale_rejected_before_building() {
    let config = AdapterConfig {
        window_attn: Some(vec![false; 4]),
        window_size: Some(vec![14; 4]),
        layer_scale: true,
        ..tiny_config()
    };
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    assert!(matches!(
        ViTAdapter::load(vb, &config),
        Err(AdapterError::Configuration(_))
    ));
    assert!(varmap.all_vars().is_empty());
}

#[test]
fn test_bad_partition_rejected() {
    let config = AdapterConfig {
        interaction_indexes: vec![[0, 1], [3, 3]],
        ..tiny_config()
    };
    assert!(matches!(
        ViTAdapter::init(&config, &Device::Cpu),
        Err(AdapterError::Configuration(_))
    ));
}

#[test]
fn test_pretrain_size_below_one_patch_rejected() {
    for pretrain_size in [0, 8] {
        let config = AdapterConfig {
            pretrain_size,
            ..tiny_config()
        };
        assert!(matches!(
            ViTAdapter::init(&config, &Device::Cpu),
            Err(AdapterError::Configuration(_))
        ));
    }
}

#[test]
fn test_input_must_be_multiple_of_32() {
    let device = Device::Cpu;
    let (model, _varmap) = ViTAdapter::init(&tiny_config(), &device).unwrap();
    let image = Tensor::zeros((1, 3, 48, 64), DType::F32, &device).unwrap();
    assert!(matches!(
        model.forward(&image),
        Err(AdapterError::Tensor(_))
    ));
}

#[test]
fn test_without_vit_feature_or_cffn() {
    let device = Device::Cpu;
    let config = AdapterConfig {
        add_vit_feature: false,
        with_cffn: false,
        use_extra_extractor: false,
        ..tiny_config()
    };
    let (model, varmap) = ViTAdapter::init(&config, &device).unwrap();
    let names: Vec<String> = varmap.data().lock().unwrap().keys().cloned().collect();
    assert!(!names.iter().any(|n| n.contains("ffn") || n.contains("extra_extractors")));

    let image = Tensor::randn(0f32, 1., (1, 3, 64, 64), &device).unwrap();
    let [f1, f2, f3, f4] = model.forward(&image).unwrap();
    assert_eq!(f1.dims(), &[1, 32, 16, 16]);
    assert_eq!(f2.dims(), &[1, 32, 8, 8]);
    assert_eq!(f3.dims(), &[1, 32, 4, 4]);
    assert_eq!(f4.dims(), &[1, 32, 2, 2]);
}
