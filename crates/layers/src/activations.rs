//! Activation functions used by the feed-forward blocks.
//!
//! * **GELU** uses the erf form `0.5 * x * (1 + erf(x / sqrt(2)))`.
//! * **GELU (tanh)** uses the tanh approximation.
//! * **SiLU** computes `x * sigmoid(x)` and gates LLaMA-style MLPs.

use candle_core::{Result, Tensor};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationKind {
    Gelu,
    GeluTanh,
    Silu,
}

impl ActivationKind {
    pub fn apply(&self, input: &Tensor) -> Result<Tensor> {
        match self {
            ActivationKind::Gelu => input.gelu_erf(),
            ActivationKind::GeluTanh => input.gelu(),
            ActivationKind::Silu => input.silu(),
        }
    }
}
