//! Named parameter plumbing shared by every layer.
//!
//! Frozen weights are plain tensors collected as `(name, Tensor)` pairs, and
//! trainable adapter weights are `Var`s collected as `(name, Var)` pairs. A
//! [`TensorSource`] hands checkpoint tensors out by name while loading and
//! remembers which names were never consumed.

use std::collections::HashMap;

use candle_core::{bail, Result, Tensor, Var};

use crate::checks;

/// Joins a module prefix and a parameter name with a dot.
pub fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

/// Collected frozen parameters in registration order.
pub type FrozenParams = Vec<(String, Tensor)>;
/// Collected trainable parameters in registration order.
pub type TrainableParams = Vec<(String, Var)>;

/// Checkpoint tensors keyed by parameter name.
#[derive(Debug, Default)]
pub struct TensorSource {
    tensors: HashMap<String, Tensor>,
}

impl TensorSource {
    pub fn new(tensors: HashMap<String, Tensor>) -> Self {
        Self { tensors }
    }

    /// Removes `name`, failing when it is absent or has the wrong shape.
    pub fn take(&mut self, name: &str, shape: &[usize]) -> Result<Tensor> {
        match self.tensors.remove(name) {
            Some(tensor) => {
                checks::expect_shape(name, &tensor, shape)?;
                Ok(tensor)
            }
            None => bail!("missing parameter '{name}' in checkpoint"),
        }
    }

    /// Removes `name` when present.
    pub fn take_optional(&mut self, name: &str, shape: &[usize]) -> Result<Option<Tensor>> {
        if self.tensors.contains_key(name) {
            self.take(name, shape).map(Some)
        } else {
            Ok(None)
        }
    }

    /// Names that were never consumed, sorted.
    pub fn remaining(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tensors.keys().cloned().collect();
        names.sort();
        names
    }
}
