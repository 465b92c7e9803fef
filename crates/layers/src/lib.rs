//! Building blocks for LoRA fine-tuning of decoder-only transformers.
//!
//! Base parameters are plain frozen tensors; only adapter matrices are
//! [`candle_core::Var`]s, so backpropagation produces gradients for adapters
//! alone.

pub mod activations;
pub mod checks;
pub mod dtypes;
pub mod linear;
pub mod mlp;
pub mod norm;
pub mod params;
pub mod quantize;

pub use dtypes::{Precision, PrecisionPolicy};
pub use linear::{LoraLinear, LoraSpec};
pub use quantize::QuantMode;
