//! ViT-Adapter backbone in candle
//!
//! A plain ViT made dense-prediction ready: a convolutional spatial prior
//! and deformable-attention interaction stages turn the single-scale token
//! stream into a four-level feature pyramid for detection heads.

pub mod config;
pub mod debug;
pub mod error;
pub mod init;
pub mod model;
pub mod preprocess;

pub use config::{AdapterConfig, VitConfig};
pub use error::{AdapterError, Result};
pub use model::ViTAdapter;
