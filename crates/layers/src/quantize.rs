//! Block-wise weight quantisation for frozen base projections.
//!
//! A weight matrix is flattened, split into fixed-size blocks, and each block is
//! scaled by its absolute maximum before every element is snapped to the
//! nearest entry of a codebook. Codes are stored as `u8` (one code per byte)
//! next to the per-block scales and are expanded back to a dense tensor with a
//! single `index_select` during the forward pass.
//!
//! Double quantisation (`-dq` modes) additionally stores the per-block scales
//! as signed 8-bit codes relative to their mean, in blocks of
//! [`DOUBLE_QUANT_BLOCK`].

use std::fmt;
use std::str::FromStr;

use candle_core::{bail, DType, Device, Result, Tensor};
use serde::{Deserialize, Serialize};

/// Number of weights sharing one absmax scale.
pub const QUANT_BLOCK: usize = 64;
/// Number of absmax scales sharing one second-level scale.
pub const DOUBLE_QUANT_BLOCK: usize = 256;

/// 4-bit NormalFloat code points.
pub const NF4_CODEBOOK: [f32; 16] = [
    -1.0,
    -0.696_192_8,
    -0.525_073_05,
    -0.394_917_5,
    -0.284_441_38,
    -0.184_773_43,
    -0.091_050_036,
    0.0,
    0.079_580_3,
    0.160_930_2,
    0.246_112_3,
    0.337_915_24,
    0.440_709_83,
    0.562_617,
    0.722_956_84,
    1.0,
];

/// Signed e2m1 code points normalised to `[-1, 1]`.
pub const FP4_CODEBOOK: [f32; 16] = [
    0.0,
    0.083_333_336,
    0.166_666_67,
    0.25,
    0.333_333_34,
    0.5,
    0.666_666_7,
    1.0,
    -0.0,
    -0.083_333_336,
    -0.166_666_67,
    -0.25,
    -0.333_333_34,
    -0.5,
    -0.666_666_7,
    -1.0,
];

/// Quantisation modes selectable with `--quantize`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuantMode {
    #[serde(rename = "bnb.nf4")]
    Nf4,
    #[serde(rename = "bnb.nf4-dq")]
    Nf4Dq,
    #[serde(rename = "bnb.fp4")]
    Fp4,
    #[serde(rename = "bnb.fp4-dq")]
    Fp4Dq,
    #[serde(rename = "bnb.int8-training")]
    Int8Training,
}

impl QuantMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuantMode::Nf4 => "bnb.nf4",
            QuantMode::Nf4Dq => "bnb.nf4-dq",
            QuantMode::Fp4 => "bnb.fp4",
            QuantMode::Fp4Dq => "bnb.fp4-dq",
            QuantMode::Int8Training => "bnb.int8-training",
        }
    }

    pub fn double_quant(&self) -> bool {
        matches!(self, QuantMode::Nf4Dq | QuantMode::Fp4Dq)
    }

    fn codebook_len(&self) -> usize {
        match self {
            QuantMode::Int8Training => 256,
            _ => 16,
        }
    }

    fn codebook(&self) -> Vec<f32> {
        match self {
            QuantMode::Nf4 | QuantMode::Nf4Dq => NF4_CODEBOOK.to_vec(),
            QuantMode::Fp4 | QuantMode::Fp4Dq => FP4_CODEBOOK.to_vec(),
            QuantMode::Int8Training => (0..256).map(|i| (i as f32 - 128.0) / 127.0).collect(),
        }
    }
}

impl fmt::Display for QuantMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QuantMode {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value.trim() {
            "bnb.nf4" => Ok(QuantMode::Nf4),
            "bnb.nf4-dq" => Ok(QuantMode::Nf4Dq),
            "bnb.fp4" => Ok(QuantMode::Fp4),
            "bnb.fp4-dq" => Ok(QuantMode::Fp4Dq),
            "bnb.int8-training" => Ok(QuantMode::Int8Training),
            other => Err(format!("unsupported quantization mode '{other}'")),
        }
    }
}

#[derive(Debug, Clone)]
enum Scales {
    Plain(Tensor),
    Double {
        codes: Tensor,
        scales: Tensor,
        mean: f32,
        blocks: usize,
    },
}

/// A frozen weight held as codebook indices plus block scales.
#[derive(Debug, Clone)]
pub struct QuantizedWeight {
    mode: QuantMode,
    shape: Vec<usize>,
    codes: Tensor,
    codebook: Tensor,
    scales: Scales,
}

impl QuantizedWeight {
    /// Quantises `weight` on its current device.
    pub fn quantize(weight: &Tensor, mode: QuantMode) -> Result<Self> {
        let device = weight.device().clone();
        let shape = weight.dims().to_vec();
        let values = weight.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        if values.is_empty() {
            bail!("cannot quantize an empty tensor");
        }
        let codebook = mode.codebook();
        let blocks = values.len().div_ceil(QUANT_BLOCK);
        let mut codes = Vec::with_capacity(blocks * QUANT_BLOCK);
        let mut absmax = Vec::with_capacity(blocks);

        for chunk in values.chunks(QUANT_BLOCK) {
            let scale = chunk.iter().fold(0f32, |acc, v| acc.max(v.abs()));
            absmax.push(scale);
            for value in chunk {
                let normalised = if scale > 0.0 { value / scale } else { 0.0 };
                codes.push(nearest_code(&codebook, normalised, mode));
            }
        }
        let zero = nearest_code(&codebook, 0.0, mode);
        codes.resize(blocks * QUANT_BLOCK, zero);

        let scales = if mode.double_quant() {
            double_quantize(&absmax, &device)?
        } else {
            Scales::Plain(Tensor::from_vec(absmax, (blocks, 1), &device)?)
        };

        Ok(Self {
            mode,
            shape,
            codes: Tensor::from_vec(codes, (blocks * QUANT_BLOCK,), &device)?,
            codebook: Tensor::from_vec(codebook, (mode.codebook_len(),), &device)?,
            scales,
        })
    }

    pub fn mode(&self) -> QuantMode {
        self.mode
    }

    pub fn dims(&self) -> &[usize] {
        &self.shape
    }

    pub fn device(&self) -> &Device {
        self.codes.device()
    }

    /// Expands the codes back into a dense tensor of `dtype`.
    pub fn dequantize(&self, dtype: DType) -> Result<Tensor> {
        let numel: usize = self.shape.iter().product();
        let blocks = self.codes.dim(0)? / QUANT_BLOCK;
        let values = self
            .codebook
            .index_select(&self.codes, 0)?
            .reshape((blocks, QUANT_BLOCK))?;
        let absmax = self.block_scales(blocks)?;
        values
            .broadcast_mul(&absmax)?
            .flatten_all()?
            .narrow(0, 0, numel)?
            .reshape(self.shape.as_slice())?
            .to_dtype(dtype)
    }

    fn block_scales(&self, blocks: usize) -> Result<Tensor> {
        match &self.scales {
            Scales::Plain(absmax) => Ok(absmax.clone()),
            Scales::Double {
                codes,
                scales,
                mean,
                blocks: super_blocks,
            } => {
                let signed = codes
                    .to_dtype(DType::F32)?
                    .affine(1.0 / 127.0, -128.0 / 127.0)?
                    .reshape((*super_blocks, DOUBLE_QUANT_BLOCK))?;
                signed
                    .broadcast_mul(scales)?
                    .affine(1.0, *mean as f64)?
                    .flatten_all()?
                    .narrow(0, 0, blocks)?
                    .reshape((blocks, 1))
            }
        }
    }

    /// Bytes held by codes and scales.
    pub fn storage_bytes(&self) -> usize {
        let scales = match &self.scales {
            Scales::Plain(absmax) => absmax.elem_count() * 4,
            Scales::Double { codes, scales, .. } => codes.elem_count() + scales.elem_count() * 4 + 4,
        };
        self.codes.elem_count() + scales
    }
}

fn nearest_code(codebook: &[f32], value: f32, mode: QuantMode) -> u8 {
    if mode == QuantMode::Int8Training {
        return ((value * 127.0).round().clamp(-127.0, 127.0) + 128.0) as u8;
    }
    let mut best = 0usize;
    let mut best_distance = f32::INFINITY;
    for (index, code) in codebook.iter().enumerate() {
        let distance = (code - value).abs();
        if distance < best_distance {
            best = index;
            best_distance = distance;
        }
    }
    best as u8
}

fn double_quantize(absmax: &[f32], device: &Device) -> Result<Scales> {
    let mean = absmax.iter().sum::<f32>() / absmax.len() as f32;
    let super_blocks = absmax.len().div_ceil(DOUBLE_QUANT_BLOCK);
    let mut codes = Vec::with_capacity(super_blocks * DOUBLE_QUANT_BLOCK);
    let mut scales = Vec::with_capacity(super_blocks);
    for chunk in absmax.chunks(DOUBLE_QUANT_BLOCK) {
        let scale = chunk.iter().fold(0f32, |acc, v| acc.max((v - mean).abs()));
        scales.push(scale);
        for value in chunk {
            let centred = if scale > 0.0 { (value - mean) / scale } else { 0.0 };
            codes.push(((centred * 127.0).round().clamp(-127.0, 127.0) + 128.0) as u8);
        }
    }
    codes.resize(super_blocks * DOUBLE_QUANT_BLOCK, 128);
    Ok(Scales::Double {
        codes: Tensor::from_vec(codes, (super_blocks * DOUBLE_QUANT_BLOCK,), device)?,
        scales: Tensor::from_vec(scales, (super_blocks, 1), device)?,
        mean,
        blocks: super_blocks,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_weight() -> Result<Tensor> {
        let values: Vec<f32> = (0..300).map(|i| ((i * 37 % 101) as f32 - 50.0) / 40.0).collect();
        Tensor::from_vec(values, (10, 30), &Device::Cpu)
    }

    fn max_error(mode: QuantMode) -> Result<f32> {
        let weight = sample_weight()?;
        let quantized = QuantizedWeight::quantize(&weight, mode)?;
        assert_eq!(quantized.dims(), &[10, 30]);
        let restored = quantized.dequantize(DType::F32)?;
        let diff = (restored - &weight)?.abs()?.max_all()?.to_scalar::<f32>()?;
        Ok(diff)
    }

    #[test]
    fn int8_error_is_half_a_step() -> Result<()> {
        let absmax = 50.0 / 40.0;
        assert!(max_error(QuantMode::Int8Training)? <= absmax / 127.0 * 0.5 + 1e-5);
        Ok(())
    }

    #[test]
    fn four_bit_modes_stay_within_largest_codebook_gap() -> Result<()> {
        let absmax = 50.0 / 40.0;
        for mode in [QuantMode::Nf4, QuantMode::Fp4] {
            assert!(max_error(mode)? <= absmax * 0.17, "{mode}");
        }
        Ok(())
    }

    #[test]
    fn double_quant_adds_little_error() -> Result<()> {
        let single = max_error(QuantMode::Nf4)?;
        let double = max_error(QuantMode::Nf4Dq)?;
        assert!(double <= single + 0.05);
        Ok(())
    }

    #[test]
    fn codes_are_smaller_than_f32_weights() -> Result<()> {
        let weight = sample_weight()?;
        let quantized = QuantizedWeight::quantize(&weight, QuantMode::Nf4)?;
        assert!(quantized.storage_bytes() < weight.elem_count() * 4);
        Ok(())
    }

    #[test]
    fn parses_mode_strings() {
        assert_eq!("bnb.nf4-dq".parse::<QuantMode>(), Ok(QuantMode::Nf4Dq));
        assert!("gptq.int4".parse::<QuantMode>().is_err());
    }
}
