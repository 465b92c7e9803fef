use candle_core::Tensor;
use model::Gpt;
use rand::rngs::StdRng;

use crate::{
    data::{get_batch, Dataset},
    error::{Result, TrainingError},
    fabric::Fabric,
    generate::generate,
    loss::chunked_cross_entropy,
    prompt::{generate_prompt, InstructionSample},
    tokenizer::TextTokenizer,
};

/// Instruction completed after every validation pass.
pub const SAMPLE_INSTRUCTION: &str =
    "Recommend a movie for me to watch during the weekend and explain the reason.";
pub const SAMPLE_TEMPERATURE: f32 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidationSettings {
    pub eval_iters: usize,
    pub micro_batch_size: usize,
    pub max_new_tokens: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidationOutcome {
    pub loss: f32,
    /// Decoded prompt plus completion; `None` when no tokens were requested.
    pub sample: Option<String>,
}

/// Mean validation loss plus one sampled completion.
///
/// The model runs in eval mode. Its cache, training mode and maximum
/// sequence length are restored before returning, whether or not validation
/// succeeded.
pub fn validate(
    fabric: &dyn Fabric,
    model: &mut Gpt,
    val_data: &Dataset,
    tokenizer: &dyn TextTokenizer,
    settings: &ValidationSettings,
    rng: &mut StdRng,
) -> Result<ValidationOutcome> {
    fabric.print("Validating ...");
    let max_seq_length = model.max_seq_length();
    model.set_training(false);
    let outcome = run_validation(fabric, model, val_data, tokenizer, settings, rng);
    model.clear_kv_cache();
    model.set_training(true);
    model.set_max_seq_length(max_seq_length)?;
    outcome
}

fn run_validation(
    fabric: &dyn Fabric,
    model: &mut Gpt,
    val_data: &Dataset,
    tokenizer: &dyn TextTokenizer,
    settings: &ValidationSettings,
    rng: &mut StdRng,
) -> Result<ValidationOutcome> {
    if settings.eval_iters == 0 {
        return Err(TrainingError::runtime("validation needs at least one batch"));
    }
    let mut losses = Vec::with_capacity(settings.eval_iters);
    for _ in 0..settings.eval_iters {
        let batch = get_batch(val_data, settings.micro_batch_size, rng, None, fabric.device())?;
        losses.push(batch_loss(model, &batch.input_ids, &batch.targets)?);
    }
    let loss = mean_loss(&losses).ok_or_else(|| {
        TrainingError::runtime("every validation batch was shorter than two tokens")
    })?;

    if settings.max_new_tokens == 0 {
        return Ok(ValidationOutcome { loss, sample: None });
    }
    fabric.print(SAMPLE_INSTRUCTION);
    let prompt = generate_prompt(&InstructionSample::new(SAMPLE_INSTRUCTION));
    let encoded = tokenizer.encode(&prompt)?;
    let block_size = model.config().block_size;
    if encoded.len() >= block_size {
        log::warn!(
            "sample prompt has {} tokens, leaving no room to generate within block size {block_size}",
            encoded.len()
        );
        return Ok(ValidationOutcome { loss, sample: None });
    }
    let capacity = block_size.min(encoded.len() + settings.max_new_tokens);
    // The prompt is usually longer than the training sequences.
    model.set_max_seq_length(capacity.max(model.max_seq_length()))?;
    model.set_kv_cache(1, capacity)?;
    let max_returned = (encoded.len() + settings.max_new_tokens).min(capacity + 1);
    let output = generate(
        model,
        &encoded,
        max_returned,
        SAMPLE_TEMPERATURE,
        None,
        tokenizer.eos_id(),
        rng,
    )?;
    model.clear_kv_cache();
    let text = tokenizer.decode(&output)?;
    fabric.print(&text);
    Ok(ValidationOutcome {
        loss,
        sample: Some(text),
    })
}

/// Mean over the batches that produced a loss.
fn mean_loss(losses: &[Option<f32>]) -> Option<f32> {
    let counted: Vec<f64> = losses.iter().flatten().map(|&loss| loss as f64).collect();
    if counted.is_empty() {
        return None;
    }
    Some((counted.iter().sum::<f64>() / counted.len() as f64) as f32)
}

/// Loss of one padded batch with output `n` predicting token `n + 1`;
/// `None` when the batch is too short to have a target.
fn batch_loss(model: &Gpt, input_ids: &Tensor, targets: &Tensor) -> Result<Option<f32>> {
    let seq = input_ids.dim(1)?;
    if seq < 2 {
        return Ok(None);
    }
    let logits = model.forward(input_ids)?.narrow(1, 0, seq - 1)?;
    let targets = targets.narrow(1, 1, seq - 1)?;
    Ok(Some(
        chunked_cross_entropy(&[logits], &targets, 0)?
            .metrics
            .average_loss,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{data::Example, fabric::SingleDevice, tokenizer::TextTokenizer};
    use candle_core::Device;
    use layers::{mlp::MlpKind, norm::NormKind, Precision};
    use model::{Config, LoraConfig};
    use rand::SeedableRng;

    struct NoTokens;

    impl TextTokenizer for NoTokens {
        fn encode(&self, _text: &str) -> Result<Vec<u32>> {
            Ok(vec![1])
        }

        fn decode(&self, _ids: &[u32]) -> Result<String> {
            Ok(String::new())
        }

        fn eos_id(&self) -> Option<u32> {
            None
        }
    }

    fn tiny_model() -> Result<Gpt> {
        let config = Config {
            name: "tiny".into(),
            block_size: 8,
            vocab_size: 8,
            padded_vocab_size: 8,
            n_layer: 1,
            n_head: 2,
            n_query_groups: 2,
            n_embd: 8,
            rotary_percentage: 1.0,
            parallel_residual: false,
            shared_attention_norm: false,
            bias: false,
            lm_head_bias: false,
            norm_class: NormKind::RmsNorm,
            norm_eps: 1e-5,
            mlp_class: MlpKind::LlamaMlp,
            intermediate_size: 16,
            rope_base: 10_000.0,
        };
        let lora = LoraConfig {
            r: 2,
            alpha: 4.0,
            dropout: 0.0,
            ..LoraConfig::default()
        };
        let mut rng = StdRng::seed_from_u64(0);
        Ok(Gpt::new(config, lora, Precision::F32True.policy(), &Device::Cpu, &mut rng)?)
    }

    #[test]
    fn short_batches_do_not_count_towards_the_mean() {
        assert_eq!(mean_loss(&[Some(2.0), None, Some(4.0)]), Some(3.0));
        assert_eq!(mean_loss(&[None, None]), None);
    }

    #[test]
    fn single_token_validation_set_is_an_error() -> Result<()> {
        let example = Example {
            input_ids: vec![3],
            labels: vec![3],
        };
        let val = Dataset::new(vec![example])?;
        let mut model = tiny_model()?;
        let settings = ValidationSettings {
            eval_iters: 2,
            micro_batch_size: 1,
            max_new_tokens: 0,
        };
        let fabric = SingleDevice::new(Device::Cpu);
        let mut rng = StdRng::seed_from_u64(1);
        let result = validate(&fabric, &mut model, &val, &NoTokens, &settings, &mut rng);
        assert!(matches!(result, Err(TrainingError::Runtime(_))));
        assert!(!model.has_kv_cache());
        Ok(())
    }
}

