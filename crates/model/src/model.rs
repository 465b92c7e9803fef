use std::collections::HashMap;

use candle_core::{bail, DType, Device, Result, Tensor};
use layers::{
    dtypes::PrecisionPolicy,
    linear::LoraLinear,
    norm::Norm,
    params::{FrozenParams, TensorSource, TrainableParams},
    quantize::QuantMode,
};
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};

use crate::{
    block::Block,
    config::{Config, LoraConfig},
    kv_cache::{KeyValueCache, KvCache},
    rope::build_rope_cache,
};

/// Adapter predicate: whether `name` belongs to a low-rank adapter.
pub fn is_lora_parameter(name: &str) -> bool {
    name.contains("lora_")
}

/// Decoder-only GPT with low-rank adapters on selected projections.
pub struct Gpt {
    config: Config,
    lora: LoraConfig,
    policy: PrecisionPolicy,
    device: Device,
    wte: Tensor,
    blocks: Vec<Block>,
    ln_f: Norm,
    lm_head: LoraLinear,
    cos: Tensor,
    sin: Tensor,
    max_seq_length: usize,
    kv_caches: Vec<KvCache>,
}

impl Gpt {
    /// Builds the model with randomly initialised base weights drawn from `rng`.
    pub fn new(
        config: Config,
        lora: LoraConfig,
        policy: PrecisionPolicy,
        device: &Device,
        rng: &mut StdRng,
    ) -> Result<Self> {
        config.validate()?;
        let normal = Normal::new(0f32, 0.02).map_err(|err| candle_core::Error::Msg(err.to_string()))?;
        let embedding: Vec<f32> = (0..config.padded_vocab_size * config.n_embd)
            .map(|_| normal.sample(rng))
            .collect();
        let wte = Tensor::from_vec(embedding, (config.padded_vocab_size, config.n_embd), device)?
            .to_dtype(policy.storage())?;

        let mut blocks = Vec::with_capacity(config.n_layer);
        for _ in 0..config.n_layer {
            blocks.push(Block::new(&config, &lora, policy, device, rng)?);
        }
        let ln_f = Norm::new(config.norm_class, config.n_embd, config.norm_eps, policy, device)?;
        let head_lora = lora.spec_if(lora.to_head);
        let lm_head = LoraLinear::new(
            config.n_embd,
            config.padded_vocab_size,
            config.lm_head_bias,
            head_lora.as_ref(),
            policy,
            device,
            rng,
        )?;
        let (cos, sin) = build_rope_cache(config.block_size, config.rope_n_elem(), config.rope_base, device)?;

        Ok(Self {
            max_seq_length: config.block_size,
            config,
            lora,
            policy,
            device: device.clone(),
            wte,
            blocks,
            ln_f,
            lm_head,
            cos,
            sin,
            kv_caches: Vec::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn lora_config(&self) -> &LoraConfig {
        &self.lora
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn policy(&self) -> PrecisionPolicy {
        self.policy
    }

    pub fn max_seq_length(&self) -> usize {
        self.max_seq_length
    }

    /// Bounds the sequence length accepted by `forward`; cannot exceed `block_size`.
    pub fn set_max_seq_length(&mut self, value: usize) -> Result<()> {
        if value > self.config.block_size {
            bail!(
                "cannot attend to {value}, block size is only {}",
                self.config.block_size
            );
        }
        self.max_seq_length = value;
        Ok(())
    }

    /// Toggles adapter dropout.
    pub fn set_training(&mut self, training: bool) {
        for block in &mut self.blocks {
            block.set_training(training);
        }
        self.lm_head.set_training(training);
    }

    fn embed(&self, idx: &Tensor) -> Result<Tensor> {
        let (batch, seq) = idx.dims2()?;
        if seq > self.max_seq_length {
            bail!(
                "cannot forward sequence of length {seq}, max seq length is only {}",
                self.max_seq_length
            );
        }
        let ids = idx.to_dtype(DType::U32)?.flatten_all()?;
        let hidden = self.wte.index_select(&ids, 0)?.reshape((batch, seq, self.config.n_embd))?;
        self.policy.cast_for_matmul(&hidden)
    }

    fn hidden_states(&self, idx: &Tensor) -> Result<Tensor> {
        let mut x = self.embed(idx)?;
        let seq = x.dim(1)?;
        let cos = self.cos.narrow(0, 0, seq)?;
        let sin = self.sin.narrow(0, 0, seq)?;
        for block in &self.blocks {
            x = block.forward(&x, &cos, &sin, None)?;
        }
        self.ln_f.forward(&x)
    }

    /// Logits `(batch, seq, padded_vocab_size)` for token ids `(batch, seq)`.
    pub fn forward(&self, idx: &Tensor) -> Result<Tensor> {
        self.lm_head.forward(&self.hidden_states(idx)?)
    }

    /// Logits split along the sequence axis into chunks of `chunk_size`
    /// positions; `0` returns a single chunk.
    pub fn forward_chunked(&self, idx: &Tensor, chunk_size: usize) -> Result<Vec<Tensor>> {
        let hidden = self.hidden_states(idx)?;
        if chunk_size == 0 {
            return Ok(vec![self.lm_head.forward(&hidden)?]);
        }
        let seq = hidden.dim(1)?;
        let mut chunks = Vec::with_capacity(seq.div_ceil(chunk_size));
        let mut start = 0;
        while start < seq {
            let len = chunk_size.min(seq - start);
            chunks.push(self.lm_head.forward(&hidden.narrow(1, start, len)?)?);
            start += len;
        }
        Ok(chunks)
    }

    /// Allocates one cache per layer for incremental decoding.
    pub fn set_kv_cache(&mut self, batch_size: usize, max_seq_length: usize) -> Result<()> {
        if max_seq_length > self.config.block_size {
            bail!(
                "kv cache length {max_seq_length} exceeds block size {}",
                self.config.block_size
            );
        }
        self.kv_caches = (0..self.config.n_layer)
            .map(|_| KvCache::new(batch_size, max_seq_length))
            .collect();
        Ok(())
    }

    pub fn clear_kv_cache(&mut self) {
        self.kv_caches.clear();
    }

    pub fn has_kv_cache(&self) -> bool {
        !self.kv_caches.is_empty()
    }

    /// Longest sequence the allocated cache can hold.
    pub fn kv_cache_capacity(&self) -> Option<usize> {
        self.kv_caches.first().map(|cache| cache.capacity())
    }

    /// Positions currently held by the cache.
    pub fn cached_len(&self) -> usize {
        self.kv_caches.first().map(|cache| cache.len()).unwrap_or(0)
    }

    /// Runs `idx` through the cache starting at position `input_pos`.
    pub fn forward_cached(&mut self, idx: &Tensor, input_pos: usize) -> Result<Tensor> {
        if self.kv_caches.is_empty() {
            bail!("kv cache is not allocated, call set_kv_cache first");
        }
        if input_pos != self.cached_len() {
            bail!(
                "input position {input_pos} does not follow the {} cached positions",
                self.cached_len()
            );
        }
        let mut x = self.embed(idx)?;
        let seq = x.dim(1)?;
        if input_pos + seq > self.config.block_size {
            bail!("position {} exceeds block size {}", input_pos + seq, self.config.block_size);
        }
        let cos = self.cos.narrow(0, input_pos, seq)?;
        let sin = self.sin.narrow(0, input_pos, seq)?;
        for (block, cache) in self.blocks.iter().zip(self.kv_caches.iter_mut()) {
            x = block.forward(&x, &cos, &sin, Some(cache))?;
        }
        self.lm_head.forward(&self.ln_f.forward(&x)?)
    }

    /// Adapter parameters in registration order.
    pub fn trainable_parameters(&self) -> TrainableParams {
        let mut out = Vec::new();
        for (i, block) in self.blocks.iter().enumerate() {
            block.collect_trainable(&format!("transformer.h.{i}"), &mut out);
        }
        self.lm_head.collect_trainable("lm_head", &mut out);
        out
    }

    fn frozen_parameters(&self) -> Result<FrozenParams> {
        let mut out = vec![("transformer.wte.weight".to_string(), self.wte.clone())];
        for (i, block) in self.blocks.iter().enumerate() {
            block.collect_frozen(&format!("transformer.h.{i}"), &mut out)?;
        }
        self.ln_f.collect_frozen("transformer.ln_f", &mut out);
        self.lm_head.collect_frozen("lm_head", &mut out)?;
        Ok(out)
    }

    /// Every parameter, frozen and trainable, by name.
    pub fn state_dict(&self) -> Result<Vec<(String, Tensor)>> {
        let mut out = self.frozen_parameters()?;
        out.extend(
            self.trainable_parameters()
                .into_iter()
                .map(|(name, var)| (name, var.as_tensor().clone())),
        );
        Ok(out)
    }

    /// Counts trainable (`true`) or frozen (`false`) parameters.
    pub fn num_parameters(&self, trainable: bool) -> Result<usize> {
        if trainable {
            Ok(self
                .trainable_parameters()
                .iter()
                .map(|(_, var)| var.elem_count())
                .sum())
        } else {
            Ok(self
                .frozen_parameters()?
                .iter()
                .map(|(_, tensor)| tensor.elem_count())
                .sum())
        }
    }

    /// Copies base weights from `tensors`. Missing base weights are an error,
    /// adapter weights are loaded when present, and any other key is returned
    /// as unexpected.
    pub fn load_base_weights(&mut self, tensors: HashMap<String, Tensor>) -> Result<Vec<String>> {
        let mut source = TensorSource::new(tensors);
        let shape = [self.config.padded_vocab_size, self.config.n_embd];
        self.wte = source
            .take("transformer.wte.weight", &shape)?
            .to_device(&self.device)?
            .to_dtype(self.policy.storage())?;
        for (i, block) in self.blocks.iter_mut().enumerate() {
            block.load_frozen(&format!("transformer.h.{i}"), &mut source)?;
        }
        self.ln_f.load_frozen("transformer.ln_f", &mut source)?;
        self.lm_head.load_frozen("lm_head", &mut source)?;
        self.load_adapter_source(&mut source)?;
        let unexpected = source.remaining();
        if !unexpected.is_empty() {
            log::warn!("ignoring {} unexpected checkpoint tensors", unexpected.len());
        }
        Ok(unexpected)
    }

    /// Copies adapter weights from `tensors`, leaving absent adapters untouched.
    pub fn load_adapter_weights(&mut self, tensors: HashMap<String, Tensor>) -> Result<Vec<String>> {
        let mut source = TensorSource::new(tensors);
        self.load_adapter_source(&mut source)?;
        Ok(source.remaining())
    }

    fn load_adapter_source(&mut self, source: &mut TensorSource) -> Result<()> {
        for (i, block) in self.blocks.iter_mut().enumerate() {
            block.load_adapter(&format!("transformer.h.{i}"), source)?;
        }
        self.lm_head.load_adapter("lm_head", source)
    }

    /// Replaces every frozen linear weight with quantised storage.
    pub fn quantize_base(&mut self, mode: QuantMode) -> Result<()> {
        for block in &mut self.blocks {
            block.quantize(mode)?;
        }
        self.lm_head.quantize(mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adapter_predicate_matches_lora_names() {
        assert!(is_lora_parameter("transformer.h.0.attn.query.lora_A"));
        assert!(is_lora_parameter("lm_head.lora_B"));
        assert!(!is_lora_parameter("transformer.h.0.attn.query.weight"));
    }
}
