use std::fs;
use std::path::Path;

use candle_core::{bail, Error, Result};
use layers::{activations::ActivationKind, linear::LoraSpec, mlp::MlpKind, norm::NormKind};
use serde::{Deserialize, Serialize};

/// Architecture of a GPT-style decoder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub name: String,
    pub block_size: usize,
    pub vocab_size: usize,
    pub padded_vocab_size: usize,
    pub n_layer: usize,
    pub n_head: usize,
    /// Key/value head groups; equal to `n_head` for plain multi-head attention.
    pub n_query_groups: usize,
    pub n_embd: usize,
    pub rotary_percentage: f64,
    pub parallel_residual: bool,
    #[serde(default)]
    pub shared_attention_norm: bool,
    pub bias: bool,
    #[serde(default)]
    pub lm_head_bias: bool,
    pub norm_class: NormKind,
    pub norm_eps: f64,
    pub mlp_class: MlpKind,
    pub intermediate_size: usize,
    #[serde(default = "default_rope_base")]
    pub rope_base: f64,
}

fn default_rope_base() -> f64 {
    10_000.0
}

impl Config {
    /// Looks up one of the bundled architectures by name.
    pub fn from_name(name: &str) -> Result<Self> {
        let config = match name {
            "pythia-14m" => pythia(name, 512, 6, 4, 128),
            "pythia-70m" => pythia(name, 2048, 6, 8, 512),
            "pythia-160m" => pythia(name, 2048, 12, 12, 768),
            "stablelm-base-alpha-3b" => Config {
                padded_vocab_size: 50_688,
                ..pythia(name, 4096, 16, 32, 4096)
            },
            "tiny-llama-1.1b" => Config {
                name: name.to_string(),
                block_size: 2048,
                vocab_size: 32_000,
                padded_vocab_size: 32_000,
                n_layer: 22,
                n_head: 32,
                n_query_groups: 4,
                n_embd: 2048,
                rotary_percentage: 1.0,
                parallel_residual: false,
                shared_attention_norm: false,
                bias: false,
                lm_head_bias: false,
                norm_class: NormKind::RmsNorm,
                norm_eps: 1e-5,
                mlp_class: MlpKind::LlamaMlp,
                intermediate_size: 5632,
                rope_base: 10_000.0,
            },
            other => bail!("unknown model name '{other}'"),
        };
        Ok(config)
    }

    /// Reads a JSON model description such as `model_config.json`.
    pub fn from_json(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&contents)
            .map_err(|err| Error::Msg(format!("{}: {err}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn head_size(&self) -> usize {
        self.n_embd / self.n_head
    }

    /// Number of leading head features rotated by RoPE.
    pub fn rope_n_elem(&self) -> usize {
        (self.rotary_percentage * self.head_size() as f64) as usize
    }

    pub fn activation(&self) -> ActivationKind {
        match self.mlp_class {
            MlpKind::GptNeoxMlp => ActivationKind::Gelu,
            MlpKind::LlamaMlp => ActivationKind::Silu,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();
        if self.n_layer == 0 || self.n_head == 0 || self.n_embd == 0 {
            errors.push("n_layer, n_head and n_embd must be greater than zero".to_string());
        }
        if self.n_head > 0 && self.n_embd % self.n_head != 0 {
            errors.push(format!(
                "n_embd ({}) must be divisible by n_head ({})",
                self.n_embd, self.n_head
            ));
        }
        if self.n_query_groups == 0 || self.n_head % self.n_query_groups.max(1) != 0 {
            errors.push(format!(
                "n_head ({}) must be a multiple of n_query_groups ({})",
                self.n_head, self.n_query_groups
            ));
        }
        if self.padded_vocab_size < self.vocab_size {
            errors.push("padded_vocab_size must be at least vocab_size".to_string());
        }
        if self.block_size == 0 {
            errors.push("block_size must be greater than zero".to_string());
        }
        if !(0.0..=1.0).contains(&self.rotary_percentage) {
            errors.push("rotary_percentage must be in [0, 1]".to_string());
        }
        if self.n_head > 0 && self.rope_n_elem() % 2 != 0 {
            errors.push("rotary dimensions must be even".to_string());
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Msg(format!(
                "invalid model config '{}': {}",
                self.name,
                errors.join("; ")
            )))
        }
    }
}

fn pythia(name: &str, block_size: usize, n_layer: usize, n_head: usize, n_embd: usize) -> Config {
    Config {
        name: name.to_string(),
        block_size,
        vocab_size: 50_254,
        padded_vocab_size: 50_304,
        n_layer,
        n_head,
        n_query_groups: n_head,
        n_embd,
        rotary_percentage: 0.25,
        parallel_residual: true,
        shared_attention_norm: false,
        bias: true,
        lm_head_bias: false,
        norm_class: NormKind::LayerNorm,
        norm_eps: 1e-5,
        mlp_class: MlpKind::GptNeoxMlp,
        intermediate_size: 4 * n_embd,
        rope_base: 10_000.0,
    }
}

/// Adapter rank, scale, dropout, and the projections that carry adapters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoraConfig {
    pub r: usize,
    pub alpha: f64,
    pub dropout: f32,
    pub to_query: bool,
    pub to_key: bool,
    pub to_value: bool,
    pub to_projection: bool,
    pub to_mlp: bool,
    pub to_head: bool,
}

impl Default for LoraConfig {
    fn default() -> Self {
        Self {
            r: 256,
            alpha: 512.0,
            dropout: 0.05,
            to_query: true,
            to_key: false,
            to_value: true,
            to_projection: false,
            to_mlp: false,
            to_head: false,
        }
    }
}

impl LoraConfig {
    pub fn scaling(&self) -> f64 {
        self.alpha / self.r as f64
    }

    pub fn any_enabled(&self) -> bool {
        self.to_query
            || self.to_key
            || self.to_value
            || self.to_projection
            || self.to_mlp
            || self.to_head
    }

    /// Adapter description for a projection when `enabled` is set.
    pub fn spec_if(&self, enabled: bool) -> Option<LoraSpec> {
        (enabled && self.r > 0).then_some(LoraSpec {
            r: self.r,
            alpha: self.alpha,
            dropout: self.dropout,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundled_configs_are_valid() -> Result<()> {
        for name in [
            "pythia-14m",
            "pythia-70m",
            "pythia-160m",
            "stablelm-base-alpha-3b",
            "tiny-llama-1.1b",
        ] {
            let config = Config::from_name(name)?;
            config.validate()?;
            assert_eq!(config.name, name);
        }
        assert!(Config::from_name("gpt-5").is_err());
        Ok(())
    }

    #[test]
    fn derived_sizes() -> Result<()> {
        let config = Config::from_name("pythia-70m")?;
        assert_eq!(config.head_size(), 64);
        assert_eq!(config.rope_n_elem(), 16);
        Ok(())
    }

    #[test]
    fn default_lora_targets_query_and_value() {
        let lora = LoraConfig::default();
        assert_eq!(lora.scaling(), 2.0);
        assert!(lora.spec_if(lora.to_query).is_some());
        assert!(lora.spec_if(lora.to_key).is_none());
        let disabled = LoraConfig {
            to_query: false,
            to_value: false,
            ..LoraConfig::default()
        };
        assert!(!disabled.any_enabled());
    }
}
