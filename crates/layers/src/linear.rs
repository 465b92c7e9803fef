//! Frozen linear projections with optional low-rank adapters.
//!
//! A [`LoraLinear`] computes `y = x Wᵀ + b + scaling · dropout(x) Aᵀ Bᵀ` where
//! `W`/`b` are frozen base parameters and `A` (`r × in`) / `B` (`out × r`) are
//! the trainable adapter matrices. `A` starts Kaiming-uniform and `B` starts
//! at zero, so a fresh adapter leaves the base output untouched. Inputs may
//! have any leading shape; only the trailing feature axis is projected.
//!
//! The base weight can be swapped for a [`QuantizedWeight`], in which case it
//! is dequantised into the compute dtype on every forward call.

use candle_core::{DType, Device, Result, Tensor, Var};
use rand::distributions::{Distribution, Uniform};
use rand::rngs::StdRng;

use crate::{
    checks,
    dtypes::PrecisionPolicy,
    params::{join, FrozenParams, TensorSource, TrainableParams},
    quantize::{QuantMode, QuantizedWeight},
};

/// Rank, scale, and dropout of one adapter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoraSpec {
    pub r: usize,
    pub alpha: f64,
    pub dropout: f32,
}

impl LoraSpec {
    pub fn scaling(&self) -> f64 {
        self.alpha / self.r as f64
    }
}

/// Frozen base weight storage.
#[derive(Debug, Clone)]
pub enum BaseWeight {
    Dense(Tensor),
    Quantized(QuantizedWeight),
}

/// Trainable low-rank update attached to a projection.
#[derive(Debug, Clone)]
pub struct LoraAdapter {
    a: Var,
    b: Var,
    spec: LoraSpec,
}

impl LoraAdapter {
    fn new(
        spec: LoraSpec,
        in_features: usize,
        out_features: usize,
        dtype: DType,
        device: &Device,
        rng: &mut StdRng,
    ) -> Result<Self> {
        let a = uniform_tensor((spec.r, in_features), rng, dtype, device)?;
        let b = Tensor::zeros((out_features, spec.r), dtype, device)?;
        Ok(Self {
            a: Var::from_tensor(&a)?,
            b: Var::from_tensor(&b)?,
            spec,
        })
    }

    pub fn a(&self) -> &Var {
        &self.a
    }

    pub fn b(&self) -> &Var {
        &self.b
    }

    pub fn spec(&self) -> &LoraSpec {
        &self.spec
    }

    /// `B · A · scaling`, shaped like the base weight.
    pub fn delta_weight(&self) -> Result<Tensor> {
        self.b
            .as_tensor()
            .matmul(self.a.as_tensor())?
            .affine(self.spec.scaling(), 0.0)
    }
}

/// Linear projection whose base weight is frozen.
#[derive(Debug, Clone)]
pub struct LoraLinear {
    in_features: usize,
    out_features: usize,
    weight: BaseWeight,
    bias: Option<Tensor>,
    adapter: Option<LoraAdapter>,
    policy: PrecisionPolicy,
    training: bool,
}

impl LoraLinear {
    /// Builds a projection with uniformly initialised base weights, optionally
    /// wrapped with an adapter described by `lora`.
    pub fn new(
        in_features: usize,
        out_features: usize,
        bias: bool,
        lora: Option<&LoraSpec>,
        policy: PrecisionPolicy,
        device: &Device,
        rng: &mut StdRng,
    ) -> Result<Self> {
        let weight = uniform_tensor((out_features, in_features), rng, policy.storage(), device)?;
        let bias = if bias {
            Some(Tensor::zeros(out_features, policy.storage(), device)?)
        } else {
            None
        };
        let adapter = match lora {
            Some(spec) if spec.r > 0 => Some(LoraAdapter::new(
                *spec,
                in_features,
                out_features,
                policy.storage(),
                device,
                rng,
            )?),
            _ => None,
        };
        Ok(Self {
            in_features,
            out_features,
            weight: BaseWeight::Dense(weight),
            bias,
            adapter,
            policy,
            training: true,
        })
    }

    pub fn in_features(&self) -> usize {
        self.in_features
    }

    pub fn out_features(&self) -> usize {
        self.out_features
    }

    pub fn adapter(&self) -> Option<&LoraAdapter> {
        self.adapter.as_ref()
    }

    pub fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    pub fn is_quantized(&self) -> bool {
        matches!(self.weight, BaseWeight::Quantized(_))
    }

    /// Dense base weight in `dtype`, dequantising when necessary.
    pub fn base_weight(&self, dtype: DType) -> Result<Tensor> {
        match &self.weight {
            BaseWeight::Dense(weight) => crate::dtypes::cast_tensor(weight, dtype),
            BaseWeight::Quantized(weight) => weight.dequantize(dtype),
        }
    }

    /// Base weight with the adapter update folded in.
    pub fn merged_weight(&self) -> Result<Tensor> {
        let base = self.base_weight(DType::F32)?;
        match &self.adapter {
            Some(adapter) => base + adapter.delta_weight()?.to_dtype(DType::F32)?,
            None => Ok(base),
        }
    }

    /// Replaces the base weight with block-wise quantised storage.
    pub fn quantize(&mut self, mode: QuantMode) -> Result<()> {
        if let BaseWeight::Dense(weight) = &self.weight {
            self.weight = BaseWeight::Quantized(QuantizedWeight::quantize(weight, mode)?);
        }
        Ok(())
    }

    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        checks::expect_last_dim("linear.input", input, self.in_features)?;
        let hidden = self.policy.cast_for_matmul(input)?;
        let weight = self.base_weight(self.policy.compute())?;
        let mut output = project(&hidden, &weight)?;
        if let Some(bias) = &self.bias {
            output = output.broadcast_add(&self.policy.cast_for_matmul(bias)?)?;
        }
        if let Some(adapter) = &self.adapter {
            let dropped = if self.training && adapter.spec.dropout > 0.0 {
                candle_nn::ops::dropout(&hidden, adapter.spec.dropout)?
            } else {
                hidden
            };
            let a = self.policy.cast_for_matmul(adapter.a.as_tensor())?;
            let b = self.policy.cast_for_matmul(adapter.b.as_tensor())?;
            let update = project(&project(&dropped, &a)?, &b)?.affine(adapter.spec.scaling(), 0.0)?;
            output = (output + update)?;
        }
        Ok(output)
    }

    pub fn collect_frozen(&self, prefix: &str, out: &mut FrozenParams) -> Result<()> {
        out.push((join(prefix, "weight"), self.base_weight(self.policy.storage())?));
        if let Some(bias) = &self.bias {
            out.push((join(prefix, "bias"), bias.clone()));
        }
        Ok(())
    }

    pub fn collect_trainable(&self, prefix: &str, out: &mut TrainableParams) {
        if let Some(adapter) = &self.adapter {
            out.push((join(prefix, "lora_A"), adapter.a.clone()));
            out.push((join(prefix, "lora_B"), adapter.b.clone()));
        }
    }

    /// Copies base weights from `source`; every base tensor must be present.
    pub fn load_frozen(&mut self, prefix: &str, source: &mut TensorSource) -> Result<()> {
        let weight = source.take(&join(prefix, "weight"), &[self.out_features, self.in_features])?;
        self.weight = BaseWeight::Dense(weight.to_dtype(self.policy.storage())?);
        if self.bias.is_some() {
            let bias = source.take(&join(prefix, "bias"), &[self.out_features])?;
            self.bias = Some(bias.to_dtype(self.policy.storage())?);
        }
        Ok(())
    }

    /// Copies adapter weights from `source` when they are present.
    pub fn load_adapter(&mut self, prefix: &str, source: &mut TensorSource) -> Result<()> {
        let Some(adapter) = &self.adapter else {
            return Ok(());
        };
        let r = adapter.spec.r;
        if let Some(a) = source.take_optional(&join(prefix, "lora_A"), &[r, self.in_features])? {
            adapter.a.set(&a.to_dtype(adapter.a.dtype())?)?;
        }
        if let Some(b) = source.take_optional(&join(prefix, "lora_B"), &[self.out_features, r])? {
            adapter.b.set(&b.to_dtype(adapter.b.dtype())?)?;
        }
        Ok(())
    }
}

/// Applies `weight` (`out × in`) to the trailing axis of `input`.
fn project(input: &Tensor, weight: &Tensor) -> Result<Tensor> {
    let dims = input.dims().to_vec();
    let in_features = dims[dims.len() - 1];
    let rows = input.elem_count() / in_features.max(1);
    let flat = input.reshape((rows, in_features))?;
    let projected = flat.matmul(&weight.t()?)?;
    let mut out_dims = dims;
    let last = out_dims.len() - 1;
    out_dims[last] = weight.dim(0)?;
    projected.reshape(out_dims)
}

/// Samples `U(-1/√fan_in, 1/√fan_in)`, the default linear initialisation.
fn uniform_tensor(
    shape: (usize, usize),
    rng: &mut StdRng,
    dtype: DType,
    device: &Device,
) -> Result<Tensor> {
    let bound = 1.0 / (shape.1.max(1) as f32).sqrt();
    let dist = Uniform::new_inclusive(-bound, bound);
    let values: Vec<f32> = (0..shape.0 * shape.1).map(|_| dist.sample(rng)).collect();
    Tensor::from_vec(values, shape, device)?.to_dtype(dtype)
}
