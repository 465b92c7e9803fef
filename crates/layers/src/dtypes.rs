//! Precision selection and dtype policy for fine-tuning runs.
//!
//! A run picks one of the precision strings accepted on the command line
//! (`32-true`, `16-true`, `bf16-true`, `16-mixed`, `bf16-mixed`). "True"
//! precisions store and compute in the same dtype. "Mixed" precisions keep
//! parameters in `f32` and run matmuls and activations in the half dtype.
//! Reductions (norm statistics, softmax, loss) always happen in `f32`.

use std::fmt;
use std::str::FromStr;

use candle_core::{DType, Device, Result, Tensor};
use serde::{Deserialize, Serialize};

/// Numeric precision of a training run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Precision {
    #[serde(rename = "32-true")]
    F32True,
    #[serde(rename = "16-true")]
    F16True,
    #[serde(rename = "bf16-true")]
    Bf16True,
    #[serde(rename = "16-mixed")]
    F16Mixed,
    #[serde(rename = "bf16-mixed")]
    Bf16Mixed,
}

impl Precision {
    /// Precision used when none is requested for `device`.
    pub fn default_for(device: &Device) -> Self {
        if device.is_cuda() {
            Precision::Bf16Mixed
        } else {
            Precision::F32True
        }
    }

    /// Whether parameters and compute use different dtypes.
    pub fn is_mixed(&self) -> bool {
        matches!(self, Precision::F16Mixed | Precision::Bf16Mixed)
    }

    /// Precision string as accepted by [`FromStr`].
    pub fn as_str(&self) -> &'static str {
        match self {
            Precision::F32True => "32-true",
            Precision::F16True => "16-true",
            Precision::Bf16True => "bf16-true",
            Precision::F16Mixed => "16-mixed",
            Precision::Bf16Mixed => "bf16-mixed",
        }
    }

    /// Builds the dtype policy layers use for this precision.
    pub fn policy(&self) -> PrecisionPolicy {
        match self {
            Precision::F32True => PrecisionPolicy::new(DType::F32, DType::F32),
            Precision::F16True => PrecisionPolicy::new(DType::F16, DType::F16),
            Precision::Bf16True => PrecisionPolicy::new(DType::BF16, DType::BF16),
            Precision::F16Mixed => PrecisionPolicy::new(DType::F32, DType::F16),
            Precision::Bf16Mixed => PrecisionPolicy::new(DType::F32, DType::BF16),
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Precision {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value.trim() {
            "32-true" | "32" => Ok(Precision::F32True),
            "16-true" => Ok(Precision::F16True),
            "bf16-true" => Ok(Precision::Bf16True),
            "16-mixed" | "16" => Ok(Precision::F16Mixed),
            "bf16-mixed" | "bf16" => Ok(Precision::Bf16Mixed),
            other => Err(format!(
                "unsupported precision '{other}', expected one of 32-true, 16-true, bf16-true, 16-mixed, bf16-mixed"
            )),
        }
    }
}

/// Describes how tensors are cast while flowing through a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrecisionPolicy {
    storage: DType,
    compute: DType,
    reduction: DType,
}

impl PrecisionPolicy {
    /// Policy with the given parameter and activation dtypes; reductions run in `f32`.
    pub fn new(storage: DType, compute: DType) -> Self {
        Self {
            storage,
            compute,
            reduction: DType::F32,
        }
    }

    /// Policy where parameters and activations share `dtype`.
    pub fn uniform(dtype: DType) -> Self {
        Self::new(dtype, dtype)
    }

    pub fn storage(&self) -> DType {
        self.storage
    }

    pub fn compute(&self) -> DType {
        self.compute
    }

    pub fn reduction(&self) -> DType {
        self.reduction
    }

    pub fn is_mixed_precision(&self) -> bool {
        self.storage != self.compute
    }

    /// Casts a tensor to the activation dtype before a matmul.
    pub fn cast_for_matmul(&self, tensor: &Tensor) -> Result<Tensor> {
        cast_tensor(tensor, self.compute)
    }

    /// Casts a tensor to `f32` for statistics.
    pub fn cast_for_reduction(&self, tensor: &Tensor) -> Result<Tensor> {
        cast_tensor(tensor, self.reduction)
    }

    /// Casts a tensor to the parameter dtype.
    pub fn cast_to_storage(&self, tensor: &Tensor) -> Result<Tensor> {
        cast_tensor(tensor, self.storage)
    }

    /// Absolute tolerance that matches the activation dtype.
    pub fn tolerance(&self) -> f32 {
        epsilon_for(self.compute)
    }
}

pub(crate) fn cast_tensor(tensor: &Tensor, dtype: DType) -> Result<Tensor> {
    if tensor.dtype() == dtype {
        Ok(tensor.clone())
    } else {
        tensor.to_dtype(dtype)
    }
}

fn epsilon_for(dtype: DType) -> f32 {
    match dtype {
        DType::BF16 => 2e-2,
        DType::F16 => 5e-3,
        DType::F32 => 1e-5,
        DType::F64 => 1e-7,
        _ => 0.0,
    }
}
