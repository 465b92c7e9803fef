//! Position-wise feed-forward blocks.
//!
//! Two families are supported: the GPT-NeoX layout (`fc → gelu → proj`) and
//! the LLaMA gated layout (`silu(fc_1) * fc_2 → proj`). Every projection is a
//! [`LoraLinear`], so enabling adapters on the MLP attaches one to each of them.

use candle_core::{Device, Result, Tensor};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::{
    activations::ActivationKind,
    dtypes::PrecisionPolicy,
    linear::{LoraLinear, LoraSpec},
    params::{join, FrozenParams, TensorSource, TrainableParams},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MlpKind {
    GptNeoxMlp,
    LlamaMlp,
}

#[derive(Debug, Clone)]
pub enum Mlp {
    GptNeox {
        fc: LoraLinear,
        proj: LoraLinear,
        activation: ActivationKind,
    },
    Llama {
        fc_1: LoraLinear,
        fc_2: LoraLinear,
        proj: LoraLinear,
    },
}

impl Mlp {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        kind: MlpKind,
        hidden: usize,
        intermediate: usize,
        bias: bool,
        lora: Option<&LoraSpec>,
        policy: PrecisionPolicy,
        device: &Device,
        rng: &mut StdRng,
    ) -> Result<Self> {
        match kind {
            MlpKind::GptNeoxMlp => Ok(Mlp::GptNeox {
                fc: LoraLinear::new(hidden, intermediate, bias, lora, policy, device, rng)?,
                proj: LoraLinear::new(intermediate, hidden, bias, lora, policy, device, rng)?,
                activation: ActivationKind::Gelu,
            }),
            MlpKind::LlamaMlp => Ok(Mlp::Llama {
                fc_1: LoraLinear::new(hidden, intermediate, bias, lora, policy, device, rng)?,
                fc_2: LoraLinear::new(hidden, intermediate, bias, lora, policy, device, rng)?,
                proj: LoraLinear::new(intermediate, hidden, bias, lora, policy, device, rng)?,
            }),
        }
    }

    pub fn forward(&self, hidden: &Tensor) -> Result<Tensor> {
        match self {
            Mlp::GptNeox {
                fc,
                proj,
                activation,
            } => proj.forward(&activation.apply(&fc.forward(hidden)?)?),
            Mlp::Llama { fc_1, fc_2, proj } => {
                let gate = ActivationKind::Silu.apply(&fc_1.forward(hidden)?)?;
                proj.forward(&(gate * fc_2.forward(hidden)?)?)
            }
        }
    }

    fn projections(&self) -> Vec<(&'static str, &LoraLinear)> {
        match self {
            Mlp::GptNeox { fc, proj, .. } => vec![("fc", fc), ("proj", proj)],
            Mlp::Llama { fc_1, fc_2, proj } => vec![("fc_1", fc_1), ("fc_2", fc_2), ("proj", proj)],
        }
    }

    fn projections_mut(&mut self) -> Vec<(&'static str, &mut LoraLinear)> {
        match self {
            Mlp::GptNeox { fc, proj, .. } => vec![("fc", fc), ("proj", proj)],
            Mlp::Llama { fc_1, fc_2, proj } => vec![("fc_1", fc_1), ("fc_2", fc_2), ("proj", proj)],
        }
    }

    pub fn set_training(&mut self, training: bool) {
        for (_, linear) in self.projections_mut() {
            linear.set_training(training);
        }
    }

    pub fn quantize(&mut self, mode: crate::quantize::QuantMode) -> Result<()> {
        for (_, linear) in self.projections_mut() {
            linear.quantize(mode)?;
        }
        Ok(())
    }

    pub fn collect_frozen(&self, prefix: &str, out: &mut FrozenParams) -> Result<()> {
        for (name, linear) in self.projections() {
            linear.collect_frozen(&join(prefix, name), out)?;
        }
        Ok(())
    }

    pub fn collect_trainable(&self, prefix: &str, out: &mut TrainableParams) {
        for (name, linear) in self.projections() {
            linear.collect_trainable(&join(prefix, name), out);
        }
    }

    pub fn load_frozen(&mut self, prefix: &str, source: &mut TensorSource) -> Result<()> {
        for (name, linear) in self.projections_mut() {
            linear.load_frozen(&join(prefix, name), source)?;
        }
        Ok(())
    }

    pub fn load_adapter(&mut self, prefix: &str, source: &mut TensorSource) -> Result<()> {
        for (name, linear) in self.projections_mut() {
            linear.load_adapter(&join(prefix, name), source)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use rand::SeedableRng;

    #[test]
    fn both_layouts_preserve_hidden_shape() -> Result<()> {
        let policy = PrecisionPolicy::uniform(DType::F32);
        let x = Tensor::ones((2, 3, 8), DType::F32, &Device::Cpu)?;
        for kind in [MlpKind::GptNeoxMlp, MlpKind::LlamaMlp] {
            let mut rng = StdRng::seed_from_u64(0);
            let mlp = Mlp::new(kind, 8, 16, false, None, policy, &Device::Cpu, &mut rng)?;
            assert_eq!(mlp.forward(&x)?.dims(), &[2, 3, 8]);
        }
        Ok(())
    }

    #[test]
    fn adapters_attach_to_every_projection() -> Result<()> {
        let policy = PrecisionPolicy::uniform(DType::F32);
        let spec = LoraSpec {
            r: 2,
            alpha: 4.0,
            dropout: 0.0,
        };
        let mut rng = StdRng::seed_from_u64(0);
        let mlp = Mlp::new(MlpKind::LlamaMlp, 8, 16, false, Some(&spec), policy, &Device::Cpu, &mut rng)?;
        let mut trainable = Vec::new();
        mlp.collect_trainable("mlp", &mut trainable);
        assert_eq!(trainable.len(), 6);
        assert_eq!(trainable[0].0, "mlp.fc_1.lora_A");
        Ok(())
    }
}
