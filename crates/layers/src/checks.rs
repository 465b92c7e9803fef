//! Shape assertions shared by layer constructors and forward paths.
//!
//! Every helper takes a `name` used in the error message and returns
//! `candle_core::Result<()>` so call sites can propagate with `?`.

use candle_core::{Error, Result, Tensor};

/// Ensures a tensor matches the expected dimensions exactly.
pub fn expect_shape(name: &str, tensor: &Tensor, expected: &[usize]) -> Result<()> {
    if tensor.dims() == expected {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{name}: expected shape {:?}, got {:?}",
            expected,
            tensor.dims()
        )))
    }
}

/// Validates the trailing feature dimension of an activation tensor.
pub fn expect_last_dim(name: &str, tensor: &Tensor, features: usize) -> Result<()> {
    match tensor.dims().last() {
        Some(actual) if *actual == features => Ok(()),
        _ => Err(Error::Msg(format!(
            "{name}: expected trailing dimension {features}, got {:?}",
            tensor.dims()
        ))),
    }
}

/// Validates the `(batch, seq, hidden)` convention with a known hidden size.
pub fn expect_batch_seq_hidden(name: &str, tensor: &Tensor, hidden: usize) -> Result<()> {
    match tensor.dims() {
        [_, _, actual] if *actual == hidden => Ok(()),
        dims => Err(Error::Msg(format!(
            "{name}: expected (batch, seq, {hidden}) layout, got {dims:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn reports_offending_name() -> Result<()> {
        let tensor = Tensor::zeros((2, 3), DType::F32, &Device::Cpu)?;
        expect_shape("w", &tensor, &[2, 3])?;
        let err = expect_shape("w", &tensor, &[3, 2]).unwrap_err();
        assert!(err.to_string().contains("w: expected shape [3, 2]"));
        assert!(expect_last_dim("x", &tensor, 3).is_ok());
        assert!(expect_batch_seq_hidden("x", &tensor, 3).is_err());
        Ok(())
    }
}
