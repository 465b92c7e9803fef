use std::{path::PathBuf, sync::Arc, time::Instant};

use log::{debug, warn};
use model::Gpt;
use rand::rngs::StdRng;

use crate::{
    checkpoint::{periodic_checkpoint_path, save_lora_checkpoint, SaveInfo},
    config::FinetuneConfig,
    data::{get_batch, get_longest_seq_length, Batch, Dataset},
    error::Result,
    fabric::Fabric,
    logging::{ExperimentTracker, MetricsLogger},
    loss::chunked_cross_entropy,
    metrics::ThroughputMonitor,
    optimizer::{GradientBuffer, GradientScaler, TrainerOptimizer},
    scheduler::{warmup_lr, CosineAnnealing, LRScheduler},
    tokenizer::TextTokenizer,
    validate::{validate, ValidationSettings},
};

/// Counters carried across iterations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrainState {
    pub iter_num: usize,
    pub step_count: usize,
    pub total_lengths: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainingOutcome {
    pub state: TrainState,
    pub last_loss: Option<f32>,
    pub last_val_loss: Option<f32>,
    /// Periodic checkpoints written by this worker, in order.
    pub checkpoints: Vec<PathBuf>,
    pub skipped_steps: usize,
}

/// True on the iteration that closes an accumulation window and steps the
/// optimizer.
pub fn is_sync_iteration(iter_num: usize, accum: usize) -> bool {
    iter_num % accum.max(1) == 0
}

/// Optimizer-step counter and the learning rate that goes with it.
///
/// The rate climbs linearly while `step_count <= warmup_steps`, then follows
/// the cosine schedule. Either way it only moves when a step completes.
#[derive(Debug, Clone)]
pub struct StepClock {
    base_lr: f64,
    warmup_steps: usize,
    step_count: usize,
    scheduler: CosineAnnealing,
    lr: f64,
}

impl StepClock {
    pub fn new(base_lr: f64, warmup_steps: usize, scheduler: CosineAnnealing) -> Self {
        Self {
            base_lr,
            warmup_steps,
            step_count: 0,
            scheduler,
            lr: base_lr,
        }
    }

    pub fn step_count(&self) -> usize {
        self.step_count
    }

    /// Learning rate for the coming micro-batch.
    pub fn begin_iteration(&mut self) -> f64 {
        if let Some(lr) = warmup_lr(self.base_lr, self.step_count, self.warmup_steps) {
            self.lr = lr;
        }
        self.lr
    }

    /// Records a completed optimizer step and returns the rate for what follows.
    pub fn complete_step(&mut self) -> f64 {
        if self.step_count > self.warmup_steps {
            self.lr = self.scheduler.step();
        }
        self.step_count += 1;
        self.lr
    }
}

/// Where a worker sends its logs; only rank zero gets a CSV writer.
pub struct TrainerSinks {
    pub metrics: Option<MetricsLogger>,
    pub tracker: Box<dyn ExperimentTracker>,
}

pub struct Trainer<'a> {
    fabric: &'a dyn Fabric,
    config: Arc<FinetuneConfig>,
    model: Gpt,
    tokenizer: &'a dyn TextTokenizer,
    optimizer: TrainerOptimizer,
    clock: StepClock,
    scaler: GradientScaler,
    grads: GradientBuffer,
    sinks: TrainerSinks,
    throughput: ThroughputMonitor,
    rng: StdRng,
}

impl<'a> Trainer<'a> {
    /// Builds the optimizer, schedule and loss scaler around `model`.
    ///
    /// `rng` drives batch sampling and generation for this worker.
    pub fn new(
        fabric: &'a dyn Fabric,
        config: Arc<FinetuneConfig>,
        model: Gpt,
        tokenizer: &'a dyn TextTokenizer,
        sinks: TrainerSinks,
        rng: StdRng,
    ) -> Result<Self> {
        let params = model.trainable_parameters();
        let grads = GradientBuffer::new(&params);
        let optimizer = TrainerOptimizer::new(
            params,
            config.optimizer_kind(),
            config.optimizer.learning_rate,
            config.optimizer.weight_decay,
        )?;
        let scheduler = CosineAnnealing::after_warmup(
            config.optimizer.learning_rate,
            config.planned_optimizer_steps(),
            config.run.warmup_steps,
        )?;
        let clock = StepClock::new(
            config.optimizer.learning_rate,
            config.run.warmup_steps,
            scheduler,
        );
        let scaler = GradientScaler::new(config.resolved_precision(fabric.device()));
        Ok(Self {
            fabric,
            throughput: ThroughputMonitor::new(fabric.world_size()),
            config,
            model,
            tokenizer,
            optimizer,
            clock,
            scaler,
            grads,
            sinks,
            rng,
        })
    }

    pub fn model(&self) -> &Gpt {
        &self.model
    }

    pub fn learning_rate(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    /// Runs `max_iters` micro-batch iterations over `train_data`.
    pub fn fit(&mut self, train_data: &Dataset, val_data: &Dataset) -> Result<TrainingOutcome> {
        let run = self.config.run.clone();
        let accum = self.config.gradient_accumulation_iters().max(1);
        let (_, longest_ix) = get_longest_seq_length(train_data)?;
        let validation = ValidationSettings {
            eval_iters: run.eval_iters,
            micro_batch_size: run.micro_batch_size,
            max_new_tokens: run.eval_max_new_tokens,
        };

        self.model.set_training(true);
        let mut state = TrainState::default();
        let mut outcome = TrainingOutcome::default();
        let total_t0 = Instant::now();

        for iter_num in 1..=run.max_iters {
            state.iter_num = iter_num;
            let lr = self.clock.begin_iteration();
            self.optimizer.set_learning_rate(lr);
            let iter_t0 = Instant::now();

            let force = (iter_num == 1).then_some(longest_ix);
            let batch = get_batch(
                train_data,
                run.micro_batch_size,
                &mut self.rng,
                force,
                self.fabric.device(),
            )?;
            let is_accumulating = !is_sync_iteration(iter_num, accum);
            let loss = self.backward_micro_batch(&batch, accum)?;
            if loss.is_some() {
                outcome.last_loss = loss;
            }

            if !is_accumulating {
                if !self.optimizer_step()? {
                    outcome.skipped_steps += 1;
                }
                let lr = self.clock.complete_step();
                self.optimizer.set_learning_rate(lr);
                state.step_count = self.clock.step_count();
            }
            state.total_lengths += batch.input_ids.elem_count() as u64;

            if iter_num % run.log_interval == 0 {
                let elapsed = total_t0.elapsed().as_secs_f64();
                self.throughput.update(
                    elapsed,
                    iter_num as u64,
                    (iter_num * run.micro_batch_size) as u64,
                    state.total_lengths,
                );
                let metrics = self.throughput.compute();
                if let Some(logger) = self.sinks.metrics.as_mut() {
                    logger.log_dict(&metrics, iter_num)?;
                }
                let loss_item = loss.unwrap_or(f32::NAN);
                self.fabric.print(&format!(
                    "iter {iter_num} step {}: loss {loss_item:.4}, iter time: {:.2}ms{}",
                    state.step_count,
                    iter_t0.elapsed().as_secs_f64() * 1000.0,
                    if is_accumulating { "" } else { " (optimizer.step)" }
                ));
                self.sinks
                    .tracker
                    .log_scalar("loss", loss_item as f64, iter_num)?;
            }

            if !is_accumulating && state.step_count % run.eval_interval == 0 {
                let t0 = Instant::now();
                let result = validate(
                    self.fabric,
                    &mut self.model,
                    val_data,
                    self.tokenizer,
                    &validation,
                    &mut self.rng,
                )?;
                self.fabric.print(&format!(
                    "step {iter_num}: val loss {:.4}, val time: {:.2}ms",
                    result.loss,
                    t0.elapsed().as_secs_f64() * 1000.0
                ));
                outcome.last_val_loss = Some(result.loss);
                self.fabric.barrier()?;
            }
            if !is_accumulating && state.step_count % run.save_interval == 0 {
                let path = periodic_checkpoint_path(&self.config.paths.out_dir, iter_num);
                let info = SaveInfo {
                    iteration: iter_num,
                    step_count: state.step_count,
                };
                if save_lora_checkpoint(self.fabric, &self.model, &path, info)?.is_some() {
                    outcome.checkpoints.push(path);
                }
            }
        }

        if let Some(logger) = self.sinks.metrics.as_mut() {
            logger.flush()?;
        }
        self.sinks.tracker.flush()?;
        outcome.state = state;
        Ok(outcome)
    }

    /// Forward and backward for one micro-batch; gradients of
    /// `loss / accum` are added to the buffer.
    ///
    /// Returns the unscaled loss, or `None` for batches too short to predict
    /// a next token.
    fn backward_micro_batch(&mut self, batch: &Batch, accum: usize) -> Result<Option<f32>> {
        let seq = batch.input_ids.dim(1)?;
        if seq < 2 {
            debug!("skipping micro-batch of length {seq}");
            return Ok(None);
        }
        let chunk_size = self.config.run.lm_head_chunk_size;
        let mut chunks = self.model.forward_chunked(&batch.input_ids, chunk_size)?;
        // Output n predicts token n + 1, so the final position has no target.
        if let Some(last) = chunks.pop() {
            let keep = last.dim(1)? - 1;
            if keep > 0 {
                chunks.push(last.narrow(1, 0, keep)?);
            }
        }
        let targets = batch.targets.narrow(1, 1, seq - 1)?;
        let output = chunked_cross_entropy(&chunks, &targets, chunk_size)?;
        let normalized = output.loss.affine(1.0 / accum as f64, 0.0)?;
        let store = self.scaler.scale(&normalized)?.backward()?;
        self.grads.accumulate(&store)?;
        Ok(Some(output.metrics.average_loss))
    }

    /// Synchronises gradients and applies them. Returns `false` when the
    /// step was skipped because the gradients overflowed.
    fn optimizer_step(&mut self) -> Result<bool> {
        let grads = self.fabric.all_reduce_mean(self.grads.take())?;
        let grads = self.scaler.unscale(grads)?;
        let overflow = self.scaler.has_overflow(&grads)?;
        self.scaler.update(overflow);
        if overflow {
            warn!(
                "non-finite gradients, skipping optimizer step (loss scale now {})",
                self.scaler.loss_scale()
            );
            return Ok(false);
        }
        self.optimizer.step(&grads)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// `(iter_num, step_count, lr)` as seen by each micro-batch.
    fn trace(clock: &mut StepClock, accum: usize, iters: usize) -> Vec<(usize, usize, f64)> {
        let mut rows = Vec::with_capacity(iters);
        for iter_num in 1..=iters {
            let lr = clock.begin_iteration();
            rows.push((iter_num, clock.step_count(), lr));
            if is_sync_iteration(iter_num, accum) {
                clock.complete_step();
            }
        }
        rows
    }

    #[test]
    fn batch_128_over_micro_16_steps_every_eighth_iteration() -> Result<()> {
        let accum = 128 / 16;
        for iter_num in 1..=7 {
            assert!(!is_sync_iteration(iter_num, accum), "iteration {iter_num}");
        }
        for iter_num in [8, 16, 24] {
            assert!(is_sync_iteration(iter_num, accum), "iteration {iter_num}");
        }

        let scheduler = CosineAnnealing::after_warmup(3e-4, 3, 0)?;
        let mut clock = StepClock::new(3e-4, 0, scheduler);
        let rows = trace(&mut clock, accum, 24);
        for window in rows.windows(2) {
            let (prev_iter, prev_step, _) = window[0];
            let (_, step, _) = window[1];
            let expected = prev_step + usize::from(is_sync_iteration(prev_iter, accum));
            assert_eq!(step, expected, "after iteration {prev_iter}");
        }
        assert_eq!(rows[7].1, 0);
        assert_eq!(rows[8].1, 1);
        assert_eq!(clock.step_count(), 3);
        Ok(())
    }

    #[test]
    fn warmup_is_linear_then_rate_moves_only_on_sync_iterations() -> Result<()> {
        let (base_lr, warmup, accum) = (1e-2, 3, 4);
        let scheduler = CosineAnnealing::after_warmup(base_lr, 10, warmup)?;
        let mut clock = StepClock::new(base_lr, warmup, scheduler);
        let rows = trace(&mut clock, accum, 40);

        for &(iter_num, step, lr) in &rows {
            if step <= warmup {
                let expected = base_lr * step as f64 / warmup as f64;
                assert_relative_eq!(lr, expected, epsilon = 1e-12);
            } else {
                assert!(lr <= base_lr, "iteration {iter_num}");
            }
        }
        for window in rows.windows(2) {
            let (prev_iter, _, prev_lr) = window[0];
            let (_, _, lr) = window[1];
            if !is_sync_iteration(prev_iter, accum) {
                assert_eq!(lr, prev_lr, "rate moved after iteration {prev_iter}");
            }
        }
        let decayed: Vec<f64> = rows
            .iter()
            .filter(|(iter_num, step, _)| *step > warmup + 1 && (iter_num - 1) % accum == 0)
            .map(|&(_, _, lr)| lr)
            .collect();
        assert!(decayed.len() >= 2);
        assert!(decayed.windows(2).all(|pair| pair[1] < pair[0]));
        Ok(())
    }
}
