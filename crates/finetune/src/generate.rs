use std::cmp::Ordering;

use candle_core::{DType, IndexOp, Tensor};
use model::Gpt;
use rand::{
    distributions::{Distribution, WeightedIndex},
    Rng,
};

use crate::error::{Result, TrainingError};

/// Autoregressive sampling through the model's key/value cache.
///
/// The cache must be freshly allocated. The prompt is prefilled in one pass,
/// then tokens are sampled one at a time until `max_returned_tokens` ids
/// (prompt included) exist or `eos_id` is drawn. The EOS token itself is not
/// returned.
pub fn generate<R: Rng + ?Sized>(
    model: &mut Gpt,
    prompt: &[u32],
    max_returned_tokens: usize,
    temperature: f32,
    top_k: Option<usize>,
    eos_id: Option<u32>,
    rng: &mut R,
) -> Result<Vec<u32>> {
    if prompt.is_empty() {
        return Err(TrainingError::runtime("cannot generate from an empty prompt"));
    }
    if max_returned_tokens <= prompt.len() {
        return Err(TrainingError::runtime(format!(
            "max_returned_tokens ({max_returned_tokens}) must exceed the prompt length ({})",
            prompt.len()
        )));
    }
    let capacity = model
        .kv_cache_capacity()
        .ok_or_else(|| TrainingError::runtime("generation requires an allocated kv cache"))?;
    // The final sampled token is never fed back.
    if max_returned_tokens - 1 > capacity {
        return Err(TrainingError::runtime(format!(
            "kv cache holds {capacity} positions but generation needs {}",
            max_returned_tokens - 1
        )));
    }

    let device = model.device().clone();
    let mut tokens = prompt.to_vec();
    let mut input = Tensor::from_slice(prompt, (1, prompt.len()), &device)?;
    let mut input_pos = 0;
    while tokens.len() < max_returned_tokens {
        let logits = model.forward_cached(&input, input_pos)?;
        input_pos += input.dim(1)?;
        let last = logits.i((0, logits.dim(1)? - 1))?.to_dtype(DType::F32)?;
        let scores = last.to_vec1::<f32>()?;
        let next = sample_next_token(&scores, temperature, top_k, rng)
            .ok_or_else(|| TrainingError::runtime("sampling produced no token"))?;
        if Some(next) == eos_id {
            break;
        }
        tokens.push(next);
        input = Tensor::from_slice(&[next], (1, 1), &device)?;
    }
    Ok(tokens)
}

/// Samples an index from `logits` scaled by `1 / temperature`.
///
/// A temperature of zero picks the arg-max. With `top_k`, only the `k`
/// highest logits keep probability mass.
pub fn sample_next_token<R: Rng + ?Sized>(
    logits: &[f32],
    temperature: f32,
    top_k: Option<usize>,
    rng: &mut R,
) -> Option<u32> {
    if logits.is_empty() {
        return None;
    }
    let argmax = || {
        logits
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(Ordering::Equal))
            .map(|(idx, _)| idx as u32)
    };
    if temperature <= 0.0 {
        return argmax();
    }

    let inv_temp = 1.0 / temperature;
    let mut scaled: Vec<f32> = logits.iter().map(|logit| logit * inv_temp).collect();
    if let Some(k) = top_k.filter(|&k| k > 0 && k < scaled.len()) {
        let mut sorted = scaled.clone();
        sorted.sort_unstable_by(|a, b| b.partial_cmp(a).unwrap_or(Ordering::Equal));
        let threshold = sorted[k - 1];
        for value in scaled.iter_mut() {
            if *value < threshold {
                *value = f32::NEG_INFINITY;
            }
        }
    }

    let max_val = scaled.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let probs: Vec<f32> = scaled.iter().map(|v| (v - max_val).exp()).collect();
    let sum: f32 = probs.iter().sum();
    if !sum.is_finite() || sum <= 0.0 {
        return argmax();
    }
    let dist = WeightedIndex::new(&probs).ok()?;
    Some(dist.sample(rng) as u32)
}
