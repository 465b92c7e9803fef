//! Rotary position embeddings.
//!
//! The cache stores `cos`/`sin` tables shaped `(seq, n_elem)` in `f32`; the
//! rotation uses the half-split layout (`[-x2, x1]`).

use candle_core::{Device, Result, Tensor, D};

/// Builds `(cos, sin)` for positions `0..seq_len`.
pub fn build_rope_cache(
    seq_len: usize,
    n_elem: usize,
    base: f64,
    device: &Device,
) -> Result<(Tensor, Tensor)> {
    let half = n_elem / 2;
    let mut cos = Vec::with_capacity(seq_len * n_elem);
    let mut sin = Vec::with_capacity(seq_len * n_elem);
    for position in 0..seq_len {
        for _ in 0..2 {
            for i in 0..half {
                let theta = 1.0 / base.powf((2 * i) as f64 / n_elem as f64);
                let angle = position as f64 * theta;
                cos.push(angle.cos() as f32);
                sin.push(angle.sin() as f32);
            }
        }
    }
    Ok((
        Tensor::from_vec(cos, (seq_len, n_elem), device)?,
        Tensor::from_vec(sin, (seq_len, n_elem), device)?,
    ))
}

/// Rotates `x` shaped `(batch, heads, seq, n_elem)` with tables `(seq, n_elem)`.
pub fn apply_rope(x: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
    let n_elem = x.dim(D::Minus1)?;
    let half = n_elem / 2;
    let x1 = x.narrow(D::Minus1, 0, half)?;
    let x2 = x.narrow(D::Minus1, half, half)?;
    let rotated = Tensor::cat(&[&x2.neg()?, &x1], D::Minus1)?;
    let cos = cos.to_dtype(x.dtype())?;
    let sin = sin.to_dtype(x.dtype())?;
    x.broadcast_mul(&cos)? + rotated.broadcast_mul(&sin)?
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    #[test]
    fn position_zero_is_identity() -> Result<()> {
        let (cos, sin) = build_rope_cache(4, 8, 10_000.0, &Device::Cpu)?;
        let x = Tensor::arange(0f32, 8.0, &Device::Cpu)?.reshape((1, 1, 1, 8))?;
        let rotated = apply_rope(&x, &cos.narrow(0, 0, 1)?, &sin.narrow(0, 0, 1)?)?;
        let diff = (rotated - &x)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(diff < 1e-6);
        Ok(())
    }

    #[test]
    fn rotation_preserves_norm() -> Result<()> {
        let (cos, sin) = build_rope_cache(4, 8, 10_000.0, &Device::Cpu)?;
        let x = Tensor::ones((1, 2, 4, 8), DType::F32, &Device::Cpu)?;
        let rotated = apply_rope(&x, &cos, &sin)?;
        let before = x.sqr()?.sum_all()?.to_scalar::<f32>()?;
        let after = rotated.sqr()?.sum_all()?.to_scalar::<f32>()?;
        assert!((before - after).abs() < 1e-3);
        Ok(())
    }
}
