use std::collections::HashMap;

use anyhow::Result;
use candle_core::{DType, Device, Tensor, D};
use layers::{mlp::MlpKind, norm::NormKind, Precision, QuantMode};
use model::{is_lora_parameter, Config, Gpt, LoraConfig};
use rand::{rngs::StdRng, SeedableRng};

fn neox_config() -> Config {
    Config {
        name: "tiny-neox".into(),
        block_size: 16,
        vocab_size: 30,
        padded_vocab_size: 32,
        n_layer: 2,
        n_head: 4,
        n_query_groups: 4,
        n_embd: 16,
        rotary_percentage: 0.5,
        parallel_residual: true,
        shared_attention_norm: false,
        bias: true,
        lm_head_bias: false,
        norm_class: NormKind::LayerNorm,
        norm_eps: 1e-5,
        mlp_class: MlpKind::GptNeoxMlp,
        intermediate_size: 32,
        rope_base: 10_000.0,
    }
}

fn llama_config() -> Config {
    Config {
        name: "tiny-llama".into(),
        n_query_groups: 2,
        rotary_percentage: 1.0,
        parallel_residual: false,
        bias: false,
        norm_class: NormKind::RmsNorm,
        mlp_class: MlpKind::LlamaMlp,
        ..neox_config()
    }
}

fn lora(r: usize) -> LoraConfig {
    LoraConfig {
        r,
        alpha: 2.0 * r as f64,
        dropout: 0.0,
        ..LoraConfig::default()
    }
}

fn build(config: Config, lora: LoraConfig) -> Result<Gpt> {
    let mut rng = StdRng::seed_from_u64(1337);
    let mut model = Gpt::new(config, lora, Precision::F32True.policy(), &Device::Cpu, &mut rng)?;
    model.set_training(false);
    Ok(model)
}

fn tokens() -> Result<Tensor> {
    Ok(Tensor::from_vec(
        vec![1u32, 5, 9, 2, 7, 3, 11, 4, 0, 8, 6, 12],
        (2, 6),
        &Device::Cpu,
    )?)
}

fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
    Ok((a - b)?.abs()?.max_all()?.to_dtype(DType::F32)?.to_scalar::<f32>()?)
}

#[test]
fn forward_produces_padded_vocab_logits() -> Result<()> {
    for config in [neox_config(), llama_config()] {
        let model = build(config, lora(4))?;
        let logits = model.forward(&tokens()?)?;
        assert_eq!(logits.dims(), &[2, 6, 32]);
    }
    Ok(())
}

#[test]
fn fresh_adapters_leave_base_logits_unchanged() -> Result<()> {
    let adapted = build(neox_config(), lora(4))?;
    let base_only: HashMap<String, Tensor> = adapted
        .state_dict()?
        .into_iter()
        .filter(|(name, _)| !is_lora_parameter(name))
        .collect();

    let mut plain = build(
        neox_config(),
        LoraConfig {
            to_query: false,
            to_value: false,
            ..lora(4)
        },
    )?;
    let unexpected = plain.load_base_weights(base_only)?;
    assert!(unexpected.is_empty());

    let diff = max_abs_diff(&adapted.forward(&tokens()?)?, &plain.forward(&tokens()?)?)?;
    assert!(diff < 1e-5, "diff {diff}");
    Ok(())
}

#[test]
fn chunked_head_matches_full_head() -> Result<()> {
    let model = build(neox_config(), lora(4))?;
    let full = model.forward(&tokens()?)?;
    let chunks = model.forward_chunked(&tokens()?, 4)?;
    assert_eq!(chunks.len(), 2);
    assert_eq!(chunks[1].dim(1)?, 2);
    let joined = Tensor::cat(&chunks, 1)?;
    assert!(max_abs_diff(&full, &joined)? < 1e-5);
    assert_eq!(model.forward_chunked(&tokens()?, 0)?.len(), 1);
    Ok(())
}

#[test]
fn cached_decoding_matches_full_forward() -> Result<()> {
    for config in [neox_config(), llama_config()] {
        let mut model = build(config, lora(4))?;
        let ids = tokens()?.narrow(0, 0, 1)?;
        let full = model.forward(&ids)?;

        model.set_kv_cache(1, 8)?;
        let prefill = model.forward_cached(&ids.narrow(1, 0, 5)?, 0)?;
        let step = model.forward_cached(&ids.narrow(1, 5, 1)?, 5)?;
        assert_eq!(model.cached_len(), 6);

        let expected_prefill = full.narrow(1, 0, 5)?;
        assert!(max_abs_diff(&expected_prefill, &prefill)? < 1e-4);
        let expected_last = full.narrow(1, 5, 1)?;
        assert!(max_abs_diff(&expected_last, &step)? < 1e-4);

        model.clear_kv_cache();
        assert!(!model.has_kv_cache());
        assert!(model.forward_cached(&ids, 0).is_err());
    }
    Ok(())
}

#[test]
fn sequences_longer_than_max_seq_length_are_rejected() -> Result<()> {
    let mut model = build(neox_config(), lora(4))?;
    model.set_max_seq_length(4)?;
    assert!(model.forward(&tokens()?).is_err());
    assert!(model.set_max_seq_length(17).is_err());
    Ok(())
}

#[test]
fn trainable_parameters_follow_adapter_flags() -> Result<()> {
    let model = build(neox_config(), lora(4))?;
    let names: Vec<String> = model
        .trainable_parameters()
        .into_iter()
        .map(|(name, _)| name)
        .collect();
    assert_eq!(names.len(), 2 * 2 * 2);
    assert_eq!(names[0], "transformer.h.0.attn.query.lora_A");
    assert_eq!(names[3], "transformer.h.0.attn.value.lora_B");
    assert!(names.iter().all(|name| is_lora_parameter(name)));
    // query: 4x16 + 16x4, value likewise, per layer
    assert_eq!(model.num_parameters(true)?, 2 * 2 * (4 * 16 + 16 * 4));
    Ok(())
}

#[test]
fn missing_base_weight_is_an_error() -> Result<()> {
    let source = build(neox_config(), lora(4))?;
    let mut tensors: HashMap<String, Tensor> = source.state_dict()?.into_iter().collect();
    tensors.remove("transformer.h.1.mlp.proj.weight");
    tensors.insert("rogue".into(), Tensor::zeros(1, DType::F32, &Device::Cpu)?);

    let mut target = build(neox_config(), lora(4))?;
    let err = target.load_base_weights(tensors.clone()).unwrap_err();
    assert!(err.to_string().contains("transformer.h.1.mlp.proj.weight"));

    tensors.insert(
        "transformer.h.1.mlp.proj.weight".into(),
        Tensor::zeros((16, 32), DType::F32, &Device::Cpu)?,
    );
    let unexpected = target.load_base_weights(tensors)?;
    assert_eq!(unexpected, vec!["rogue".to_string()]);
    Ok(())
}

#[test]
fn quantized_model_keeps_predictions_close() -> Result<()> {
    let mut model = build(neox_config(), lora(4))?;
    let dense = model.forward(&tokens()?)?;
    model.quantize_base(QuantMode::Int8Training)?;
    let quantized = model.forward(&tokens()?)?;
    let dense_top = dense.argmax(D::Minus1)?.flatten_all()?.to_vec1::<u32>()?;
    let quant_top = quantized.argmax(D::Minus1)?.flatten_all()?.to_vec1::<u32>()?;
    let agree = dense_top.iter().zip(&quant_top).filter(|(a, b)| a == b).count();
    assert!(agree * 4 >= dense_top.len() * 3);
    Ok(())
}
