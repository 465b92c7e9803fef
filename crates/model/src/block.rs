use candle_core::{bail, DType, Device, Result, Tensor, D};
use layers::{
    checks,
    dtypes::PrecisionPolicy,
    linear::LoraLinear,
    mlp::Mlp,
    norm::Norm,
    params::{join, FrozenParams, TensorSource, TrainableParams},
    quantize::QuantMode,
};
use rand::rngs::StdRng;

use crate::{
    config::{Config, LoraConfig},
    kv_cache::{KeyValueCache, KvCache},
    rope::apply_rope,
};

/// Causal mask of shape `(q_len, k_len)` where query `i` sees keys `0..=i + k_len - q_len`.
pub fn build_causal_mask(device: &Device, q_len: usize, k_len: usize) -> Result<Tensor> {
    let offset = k_len.saturating_sub(q_len);
    let mut data = vec![0f32; q_len * k_len];
    for q in 0..q_len {
        for k in (q + offset + 1)..k_len {
            data[q * k_len + k] = f32::NEG_INFINITY;
        }
    }
    Tensor::from_vec(data, (q_len, k_len), device)
}

/// Multi-head (optionally grouped-query) causal self-attention.
#[derive(Debug, Clone)]
pub struct CausalSelfAttention {
    query: LoraLinear,
    key: LoraLinear,
    value: LoraLinear,
    proj: LoraLinear,
    n_head: usize,
    n_query_groups: usize,
    head_size: usize,
    rope_n_elem: usize,
}

impl CausalSelfAttention {
    fn new(
        config: &Config,
        lora: &LoraConfig,
        policy: PrecisionPolicy,
        device: &Device,
        rng: &mut StdRng,
    ) -> Result<Self> {
        let head_size = config.head_size();
        let kv_dim = config.n_query_groups * head_size;
        let query = lora.spec_if(lora.to_query);
        let key = lora.spec_if(lora.to_key);
        let value = lora.spec_if(lora.to_value);
        let projection = lora.spec_if(lora.to_projection);
        Ok(Self {
            query: LoraLinear::new(config.n_embd, config.n_embd, config.bias, query.as_ref(), policy, device, rng)?,
            key: LoraLinear::new(config.n_embd, kv_dim, config.bias, key.as_ref(), policy, device, rng)?,
            value: LoraLinear::new(config.n_embd, kv_dim, config.bias, value.as_ref(), policy, device, rng)?,
            proj: LoraLinear::new(config.n_embd, config.n_embd, config.bias, projection.as_ref(), policy, device, rng)?,
            n_head: config.n_head,
            n_query_groups: config.n_query_groups,
            head_size,
            rope_n_elem: config.rope_n_elem(),
        })
    }

    fn split_heads(&self, x: &Tensor, heads: usize) -> Result<Tensor> {
        let (batch, seq, _) = x.dims3()?;
        x.reshape((batch, seq, heads, self.head_size))?
            .transpose(1, 2)?
            .contiguous()
    }

    fn rotate(&self, x: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
        if self.rope_n_elem == 0 {
            return Ok(x.clone());
        }
        let roped = apply_rope(&x.narrow(D::Minus1, 0, self.rope_n_elem)?, cos, sin)?;
        if self.rope_n_elem == self.head_size {
            return Ok(roped);
        }
        let rest = x.narrow(D::Minus1, self.rope_n_elem, self.head_size - self.rope_n_elem)?;
        Tensor::cat(&[&roped, &rest], D::Minus1)
    }

    fn repeat_kv(&self, x: Tensor) -> Result<Tensor> {
        if self.n_query_groups == self.n_head {
            return Ok(x);
        }
        let (batch, groups, seq, head) = x.dims4()?;
        let repeats = self.n_head / groups;
        x.unsqueeze(2)?
            .broadcast_as((batch, groups, repeats, seq, head))?
            .contiguous()?
            .reshape((batch, groups * repeats, seq, head))
    }

    fn forward(
        &self,
        x: &Tensor,
        cos: &Tensor,
        sin: &Tensor,
        cache: Option<&mut KvCache>,
    ) -> Result<Tensor> {
        let (batch, seq, embd) = x.dims3()?;
        let q = self.split_heads(&self.query.forward(x)?, self.n_head)?;
        let k = self.split_heads(&self.key.forward(x)?, self.n_query_groups)?;
        let v = self.split_heads(&self.value.forward(x)?, self.n_query_groups)?;

        let q = self.rotate(&q, cos, sin)?;
        let k = self.rotate(&k, cos, sin)?;
        let (k, v) = match cache {
            Some(cache) => cache.append(&k, &v)?,
            None => (k, v),
        };
        let k = self.repeat_kv(k)?;
        let v = self.repeat_kv(v)?;
        let k_len = k.dim(2)?;

        let scale = 1.0 / (self.head_size as f64).sqrt();
        let scores = q.contiguous()?.matmul(&k.t()?.contiguous()?)?.to_dtype(DType::F32)?.affine(scale, 0.0)?;
        let mask = build_causal_mask(x.device(), seq, k_len)?;
        let probs = candle_nn::ops::softmax(&scores.broadcast_add(&mask)?, D::Minus1)?;
        let y = probs.to_dtype(v.dtype())?.matmul(&v)?;
        let y = y.transpose(1, 2)?.contiguous()?.reshape((batch, seq, embd))?;
        self.proj.forward(&y)
    }

    fn projections(&self) -> [(&'static str, &LoraLinear); 4] {
        [
            ("query", &self.query),
            ("key", &self.key),
            ("value", &self.value),
            ("proj", &self.proj),
        ]
    }

    fn projections_mut(&mut self) -> [(&'static str, &mut LoraLinear); 4] {
        [
            ("query", &mut self.query),
            ("key", &mut self.key),
            ("value", &mut self.value),
            ("proj", &mut self.proj),
        ]
    }
}

/// Pre-norm decoder block with optional parallel residual.
#[derive(Debug, Clone)]
pub struct Block {
    norm_1: Norm,
    attn: CausalSelfAttention,
    norm_2: Option<Norm>,
    mlp: Mlp,
    parallel_residual: bool,
}

impl Block {
    pub fn new(
        config: &Config,
        lora: &LoraConfig,
        policy: PrecisionPolicy,
        device: &Device,
        rng: &mut StdRng,
    ) -> Result<Self> {
        if config.shared_attention_norm && !config.parallel_residual {
            bail!("shared_attention_norm requires parallel_residual");
        }
        let norm_1 = Norm::new(config.norm_class, config.n_embd, config.norm_eps, policy, device)?;
        let attn = CausalSelfAttention::new(config, lora, policy, device, rng)?;
        let norm_2 = if config.shared_attention_norm {
            None
        } else {
            Some(Norm::new(config.norm_class, config.n_embd, config.norm_eps, policy, device)?)
        };
        let mlp_lora = lora.spec_if(lora.to_mlp);
        let mlp = Mlp::new(
            config.mlp_class,
            config.n_embd,
            config.intermediate_size,
            config.bias,
            mlp_lora.as_ref(),
            policy,
            device,
            rng,
        )?;
        Ok(Self {
            norm_1,
            attn,
            norm_2,
            mlp,
            parallel_residual: config.parallel_residual,
        })
    }

    pub fn forward(
        &self,
        x: &Tensor,
        cos: &Tensor,
        sin: &Tensor,
        cache: Option<&mut KvCache>,
    ) -> Result<Tensor> {
        checks::expect_batch_seq_hidden("block.input", x, self.norm_dim())?;
        let n_1 = self.norm_1.forward(x)?;
        let h = self.attn.forward(&n_1, cos, sin, cache)?;
        if self.parallel_residual {
            let n_2 = match &self.norm_2 {
                Some(norm) => norm.forward(x)?,
                None => n_1,
            };
            (self.mlp.forward(&n_2)? + h)? + x
        } else {
            let x = (h + x)?;
            let n_2 = match &self.norm_2 {
                Some(norm) => norm.forward(&x)?,
                None => bail!("sequential residual blocks need a second norm"),
            };
            self.mlp.forward(&n_2)? + x
        }
    }

    fn norm_dim(&self) -> usize {
        self.attn.n_head * self.attn.head_size
    }

    pub fn set_training(&mut self, training: bool) {
        for (_, linear) in self.attn.projections_mut() {
            linear.set_training(training);
        }
        self.mlp.set_training(training);
    }

    pub fn quantize(&mut self, mode: QuantMode) -> Result<()> {
        for (_, linear) in self.attn.projections_mut() {
            linear.quantize(mode)?;
        }
        self.mlp.quantize(mode)
    }

    pub fn collect_frozen(&self, prefix: &str, out: &mut FrozenParams) -> Result<()> {
        self.norm_1.collect_frozen(&join(prefix, "norm_1"), out);
        for (name, linear) in self.attn.projections() {
            linear.collect_frozen(&join(prefix, &format!("attn.{name}")), out)?;
        }
        if let Some(norm) = &self.norm_2 {
            norm.collect_frozen(&join(prefix, "norm_2"), out);
        }
        self.mlp.collect_frozen(&join(prefix, "mlp"), out)
    }

    pub fn collect_trainable(&self, prefix: &str, out: &mut TrainableParams) {
        for (name, linear) in self.attn.projections() {
            linear.collect_trainable(&join(prefix, &format!("attn.{name}")), out);
        }
        self.mlp.collect_trainable(&join(prefix, "mlp"), out);
    }

    pub fn load_frozen(&mut self, prefix: &str, source: &mut TensorSource) -> Result<()> {
        self.norm_1.load_frozen(&join(prefix, "norm_1"), source)?;
        for (name, linear) in self.attn.projections_mut() {
            linear.load_frozen(&join(prefix, &format!("attn.{name}")), source)?;
        }
        if let Some(norm) = &mut self.norm_2 {
            norm.load_frozen(&join(prefix, "norm_2"), source)?;
        }
        self.mlp.load_frozen(&join(prefix, "mlp"), source)
    }

    pub fn load_adapter(&mut self, prefix: &str, source: &mut TensorSource) -> Result<()> {
        for (name, linear) in self.attn.projections_mut() {
            linear.load_adapter(&join(prefix, &format!("attn.{name}")), source)?;
        }
        self.mlp.load_adapter(&join(prefix, "mlp"), source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_allows_prefix_when_keys_outnumber_queries() -> Result<()> {
        let mask = build_causal_mask(&Device::Cpu, 2, 4)?.to_vec2::<f32>()?;
        assert_eq!(mask[0][..3], [0.0, 0.0, 0.0]);
        assert!(mask[0][3].is_infinite());
        assert!(mask[1].iter().all(|v| *v == 0.0));
        Ok(())
    }

    #[test]
    fn square_mask_is_lower_triangular() -> Result<()> {
        let mask = build_causal_mask(&Device::Cpu, 3, 3)?.to_vec2::<f32>()?;
        for (q, row) in mask.iter().enumerate() {
            for (k, value) in row.iter().enumerate() {
                assert_eq!(value.is_infinite(), k > q);
            }
        }
        Ok(())
    }
}
