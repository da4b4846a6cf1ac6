//! ViT-Adapter backbone with Candle
//!
//! Runs the backbone on one image and reports the four pyramid levels.

#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

#[cfg(feature = "accelerate")]
extern crate accelerate_src;

use std::path::PathBuf;

use candle_core::{DType, Device, Result};
use candle_nn::VarBuilder;
use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use candle_vit_adapter::debug::{dump_npy, TensorStats};
use candle_vit_adapter::{preprocess, AdapterConfig, ViTAdapter};

/// Select the compute device
pub fn device(cpu: bool) -> Result<Device> {
    if cpu {
        Ok(Device::Cpu)
    } else if candle_core::utils::cuda_is_available() {
        Ok(Device::new_cuda(0)?)
    } else if candle_core::utils::metal_is_available() {
        Ok(Device::new_metal(0)?)
    } else {
        #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
        {
            tracing::info!("Running on CPU, to run on GPU(metal), build with `--features metal`");
        }
        #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
        {
            tracing::info!("Running on CPU, to run on GPU, build with `--features cuda`");
        }
        Ok(Device::Cpu)
    }
}

/// Adapter presets
#[derive(Clone, Copy, ValueEnum, Debug)]
enum Which {
    Tiny,
    Small,
    Base,
}

impl Which {
    fn config(&self) -> AdapterConfig {
        match self {
            Which::Tiny => AdapterConfig::tiny(),
            Which::Small => AdapterConfig::small(),
            Which::Base => AdapterConfig::base(),
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Run on CPU rather than on GPU.
    #[arg(long)]
    cpu: bool,

    /// Which preset to use.
    #[arg(long, value_enum, default_value_t = Which::Tiny)]
    which: Which,

    /// JSON config overriding the preset.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Path to model weights, in safetensors format. Random init when absent.
    #[arg(long)]
    model: Option<PathBuf>,

    /// Square input resolution; defaults to the image size rounded to 32.
    #[arg(long)]
    resolution: Option<usize>,

    /// Write each output level as `f{i}.npy` into this directory.
    #[arg(long)]
    dump_dir: Option<PathBuf>,

    /// Input image to process.
    image: String,
}

pub fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
    let args = Args::parse();

    let device = device(args.cpu)?;
    println!("Using device: {:?}", device);

    let config = match &args.config {
        Some(path) => AdapterConfig::from_json_file(path)?,
        None => args.which.config(),
    };
    println!("Model config: {:?}", args.which);
    println!("  Embed dim: {}", config.embed_dim());
    println!("  Depth: {}", config.vit.depth);
    println!("  Interaction stages: {}", config.num_stages());

    let model = match &args.model {
        Some(path) => {
            if !path.exists() {
                anyhow::bail!("Model weights not found at {:?}", path);
            }
            println!("Loading model from: {:?}", path);
            let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[path], DType::F32, &device)? };
            ViTAdapter::load(vb, &config)?
        }
        None => {
            tracing::warn!("no --model given, running with randomly initialised weights");
            let (model, _varmap) = ViTAdapter::init(&config, &device)?;
            model
        }
    };
    println!("Model loaded successfully");

    let (image, h_orig, w_orig) =
        preprocess::preprocess_image(&args.image, args.resolution, &device)?;
    println!("  Original image size: {}x{}", w_orig, h_orig);
    println!("  Batch tensor shape: {:?}", image.dims());

    println!("Running backbone...");
    let levels = model.forward(&image)?;
    for (i, level) in levels.iter().enumerate() {
        TensorStats::from_tensor(level)?.print(&format!("f{} (stride {})", i + 1, 4 << i));
    }

    if let Some(dir) = &args.dump_dir {
        std::fs::create_dir_all(dir)?;
        for (i, level) in levels.iter().enumerate() {
            let path = dir.join(format!("f{}.npy", i + 1));
            dump_npy(level, &path)?;
            println!("Wrote {:?}", path);
        }
    }

    Ok(())
}
