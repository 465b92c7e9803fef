//! Per-layer key/value cache used during incremental decoding.

use candle_core::{bail, Result, Tensor};

/// Storage for projected keys and values across decoding steps.
pub trait KeyValueCache {
    /// Appends `(batch, groups, new, head)` keys/values and returns everything cached so far.
    fn append(&mut self, k: &Tensor, v: &Tensor) -> Result<(Tensor, Tensor)>;

    /// Number of cached positions.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn reset(&mut self);
}

/// Concatenating cache with a fixed capacity along the sequence axis.
#[derive(Debug, Clone)]
pub struct KvCache {
    batch_size: usize,
    capacity: usize,
    keys: Option<Tensor>,
    values: Option<Tensor>,
}

impl KvCache {
    pub fn new(batch_size: usize, capacity: usize) -> Self {
        Self {
            batch_size,
            capacity,
            keys: None,
            values: None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl KeyValueCache for KvCache {
    fn append(&mut self, k: &Tensor, v: &Tensor) -> Result<(Tensor, Tensor)> {
        let batch = k.dim(0)?;
        if batch > self.batch_size {
            bail!(
                "kv cache was allocated for batch {} but received {}",
                self.batch_size,
                batch
            );
        }
        let incoming = k.dim(2)?;
        if self.len() + incoming > self.capacity {
            bail!(
                "kv cache overflow: {} cached + {} new exceeds capacity {}",
                self.len(),
                incoming,
                self.capacity
            );
        }
        let (keys, values) = match (&self.keys, &self.values) {
            (Some(keys), Some(values)) => (Tensor::cat(&[keys, k], 2)?, Tensor::cat(&[values, v], 2)?),
            _ => (k.clone(), v.clone()),
        };
        self.keys = Some(keys.clone());
        self.values = Some(values.clone());
        Ok((keys, values))
    }

    fn len(&self) -> usize {
        self.keys
            .as_ref()
            .and_then(|keys| keys.dim(2).ok())
            .unwrap_or(0)
    }

    fn reset(&mut self) {
        self.keys = None;
        self.values = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn grows_until_capacity() -> Result<()> {
        let mut cache = KvCache::new(1, 3);
        let step = Tensor::zeros((1, 2, 2, 4), DType::F32, &Device::Cpu)?;
        let (k, _) = cache.append(&step, &step)?;
        assert_eq!(k.dims(), &[1, 2, 2, 4]);
        let one = step.narrow(2, 0, 1)?;
        let (k, v) = cache.append(&one, &one)?;
        assert_eq!(k.dim(2)?, 3);
        assert_eq!(v.dim(2)?, 3);
        assert!(cache.append(&one, &one).is_err());
        cache.reset();
        assert!(cache.is_empty());
        Ok(())
    }
}
