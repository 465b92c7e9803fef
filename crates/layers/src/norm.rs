//! Frozen normalisation layers.
//!
//! Inputs follow the `(batch, seq, hidden)` convention and are normalised
//! along the last axis. Statistics are computed in the reduction dtype (`f32`)
//! and the result is returned in the compute dtype of the [`PrecisionPolicy`].

use candle_core::{bail, DType, Device, Result, Tensor, D};
use serde::{Deserialize, Serialize};

use crate::{
    checks,
    dtypes::PrecisionPolicy,
    params::{join, FrozenParams, TensorSource},
};

/// Normalisation flavour used by a model family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NormKind {
    LayerNorm,
    RmsNorm,
}

#[derive(Debug, Clone)]
pub struct Norm {
    kind: NormKind,
    hidden_size: usize,
    epsilon: f64,
    weight: Tensor,
    bias: Option<Tensor>,
    policy: PrecisionPolicy,
}

impl Norm {
    /// Identity-initialised norm (scale one, bias zero).
    pub fn new(
        kind: NormKind,
        hidden_size: usize,
        epsilon: f64,
        policy: PrecisionPolicy,
        device: &Device,
    ) -> Result<Self> {
        if hidden_size == 0 {
            bail!("norm hidden size must be non-zero");
        }
        let weight = Tensor::ones(hidden_size, policy.storage(), device)?;
        let bias = match kind {
            NormKind::LayerNorm => Some(Tensor::zeros(hidden_size, policy.storage(), device)?),
            NormKind::RmsNorm => None,
        };
        Ok(Self {
            kind,
            hidden_size,
            epsilon,
            weight,
            bias,
            policy,
        })
    }

    pub fn kind(&self) -> NormKind {
        self.kind
    }

    pub fn forward(&self, hidden: &Tensor) -> Result<Tensor> {
        checks::expect_last_dim("norm.input", hidden, self.hidden_size)?;
        let size = self.hidden_size as f64;
        let mut x = self.policy.cast_for_reduction(hidden)?;
        if self.kind == NormKind::LayerNorm {
            let mean = (x.sum_keepdim(D::Minus1)? / size)?;
            x = x.broadcast_sub(&mean)?;
        }
        let variance = (x.sqr()?.sum_keepdim(D::Minus1)? / size)?;
        let denom = (variance + self.epsilon)?.sqrt()?;
        let mut normalized = x.broadcast_div(&denom)?;
        normalized = normalized.broadcast_mul(&self.weight.to_dtype(DType::F32)?)?;
        if let Some(bias) = &self.bias {
            normalized = normalized.broadcast_add(&bias.to_dtype(DType::F32)?)?;
        }
        self.policy.cast_for_matmul(&normalized)
    }

    pub fn collect_frozen(&self, prefix: &str, out: &mut FrozenParams) {
        out.push((join(prefix, "weight"), self.weight.clone()));
        if let Some(bias) = &self.bias {
            out.push((join(prefix, "bias"), bias.clone()));
        }
    }

    pub fn load_frozen(&mut self, prefix: &str, source: &mut TensorSource) -> Result<()> {
        let shape = [self.hidden_size];
        self.weight = source
            .take(&join(prefix, "weight"), &shape)?
            .to_dtype(self.policy.storage())?;
        if self.bias.is_some() {
            self.bias = Some(
                source
                    .take(&join(prefix, "bias"), &shape)?
                    .to_dtype(self.policy.storage())?,
            );
        }
        Ok(())
    }
}
