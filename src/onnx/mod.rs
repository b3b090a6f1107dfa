//! ONNX backend for the inference engine
//!
//! This module provides ONNX Runtime based model loading

pub mod onnx_engine;
pub use onnx_engine::{HfTokenizer, OnnxConfig};

#[cfg(feature = "onnx")]
pub use onnx_engine::{OnnxForwardPass, OnnxModelLoader};
