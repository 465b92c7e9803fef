//! GPT decoder assembled from the `layers` crate, with LoRA adapters on the
//! projections selected by [`LoraConfig`].

pub mod block;
pub mod config;
pub mod kv_cache;
pub mod model;
pub mod rope;

pub use block::Block;
pub use config::{Config, LoraConfig};
pub use model::{is_lora_parameter, Gpt};
