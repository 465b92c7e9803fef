//! Token-level cross entropy that skips ignored targets.
//!
//! Logits may arrive as several chunks along the sequence axis (the model's
//! chunked LM head). The result is always `sum(nll) / max(1, counted)` over
//! non-ignored positions, so chunking never changes the value.

use candle_core::{DType, Result, Tensor, D};

use crate::data::IGNORE_INDEX;

/// Scalar loss plus bookkeeping.
#[derive(Debug, Clone)]
pub struct LossOutput {
    pub loss: Tensor,
    pub metrics: LossMetrics,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossMetrics {
    pub average_loss: f32,
    pub total_tokens: usize,
}

/// Summed negative log-likelihood and the number of counted targets.
fn nll_sum(logits: &Tensor, targets: &Tensor) -> Result<(Tensor, Tensor)> {
    let vocab = logits.dim(D::Minus1)?;
    let logits = logits.to_dtype(DType::F32)?.reshape(((), vocab))?;
    let targets = targets.flatten_all()?;
    let valid = targets.ne(IGNORE_INDEX)?;
    let safe_targets = valid.where_cond(&targets, &targets.zeros_like()?)?;
    let log_probs = candle_nn::ops::log_softmax(&logits, D::Minus1)?;
    let picked = log_probs
        .gather(&safe_targets.to_dtype(DType::U32)?.unsqueeze(1)?, 1)?
        .squeeze(1)?;
    let mask = valid.to_dtype(DType::F32)?;
    let total = (picked.neg()? * &mask)?.sum_all()?;
    Ok((total, mask.sum_all()?))
}

/// Cross entropy over `logits_chunks` against `targets` `(batch, seq)`.
///
/// With a single logits tensor and `chunk_size > 0`, the flattened rows are
/// processed `chunk_size` at a time; `chunk_size == 0` computes everything in
/// one pass. With several chunks, chunk `i` is matched against the next
/// `chunk.dim(1)` target columns.
pub fn chunked_cross_entropy(
    logits_chunks: &[Tensor],
    targets: &Tensor,
    chunk_size: usize,
) -> Result<LossOutput> {
    let pieces: Vec<(Tensor, Tensor)> = match logits_chunks {
        [] => candle_core::bail!("no logits to score"),
        [single] => {
            let vocab = single.dim(D::Minus1)?;
            let logits = single.reshape(((), vocab))?;
            let targets = targets.flatten_all()?;
            let rows = logits.dim(0)?;
            if chunk_size == 0 || chunk_size >= rows {
                vec![(logits, targets)]
            } else {
                let mut pieces = Vec::new();
                let mut start = 0;
                while start < rows {
                    let len = chunk_size.min(rows - start);
                    pieces.push((logits.narrow(0, start, len)?, targets.narrow(0, start, len)?));
                    start += len;
                }
                pieces
            }
        }
        chunks => {
            let mut pieces = Vec::with_capacity(chunks.len());
            let mut start = 0;
            for chunk in chunks {
                let len = chunk.dim(1)?;
                pieces.push((chunk.clone(), targets.narrow(1, start, len)?));
                start += len;
            }
            if start != targets.dim(1)? {
                candle_core::bail!(
                    "logit chunks cover {start} positions but targets have {}",
                    targets.dim(1)?
                );
            }
            pieces
        }
    };

    let mut total: Option<Tensor> = None;
    let mut count: Option<Tensor> = None;
    for (logits, targets) in &pieces {
        let (sum, counted) = nll_sum(logits, targets)?;
        total = Some(match total {
            Some(acc) => (acc + sum)?,
            None => sum,
        });
        count = Some(match count {
            Some(acc) => (acc + counted)?,
            None => counted,
        });
    }
    let (Some(total), Some(count)) = (total, count) else {
        candle_core::bail!("no logits to score");
    };
    let counted = count.to_scalar::<f32>()?;
    let loss = total.affine(1.0 / counted.max(1.0) as f64, 0.0)?;
    let average_loss = loss.to_scalar::<f32>()?;
    Ok(LossOutput {
        loss,
        metrics: LossMetrics {
            average_loss,
            total_tokens: counted as usize,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use candle_core::Device;

    fn logits() -> Result<Tensor> {
        let values: Vec<f32> = (0..2 * 4 * 5).map(|i| ((i * 7) % 11) as f32 / 3.0).collect();
        Tensor::from_vec(values, (2, 4, 5), &Device::Cpu)
    }

    fn targets() -> Result<Tensor> {
        Tensor::from_vec(vec![1i64, 4, -1, 0, 2, -1, -1, 3], (2, 4), &Device::Cpu)
    }

    #[test]
    fn chunking_does_not_change_the_loss() -> Result<()> {
        let full = chunked_cross_entropy(&[logits()?], &targets()?, 0)?;
        let rows = chunked_cross_entropy(&[logits()?], &targets()?, 3)?;
        let logits = logits()?;
        let seq_chunks = vec![logits.narrow(1, 0, 3)?, logits.narrow(1, 3, 1)?];
        let by_sequence = chunked_cross_entropy(&seq_chunks, &targets()?, 3)?;

        assert_eq!(full.metrics.total_tokens, 5);
        assert_relative_eq!(full.metrics.average_loss, rows.metrics.average_loss, epsilon = 1e-5);
        assert_relative_eq!(full.metrics.average_loss, by_sequence.metrics.average_loss, epsilon = 1e-5);
        Ok(())
    }

    #[test]
    fn ignored_positions_do_not_contribute() -> Result<()> {
        let all_ignored = Tensor::full(-1i64, (2, 4), &Device::Cpu)?;
        let out = chunked_cross_entropy(&[logits()?], &all_ignored, 0)?;
        assert_eq!(out.metrics.total_tokens, 0);
        assert_eq!(out.metrics.average_loss, 0.0);
        Ok(())
    }

    #[test]
    fn uniform_logits_give_log_vocab() -> Result<()> {
        let uniform = Tensor::zeros((1, 2, 8), DType::F32, &Device::Cpu)?;
        let targets = Tensor::from_vec(vec![3i64, 5], (1, 2), &Device::Cpu)?;
        let out = chunked_cross_entropy(&[uniform], &targets, 0)?;
        assert_relative_eq!(out.metrics.average_loss, (8f32).ln(), epsilon = 1e-5);
        Ok(())
    }
}
