//! LoRA instruction fine-tuning for GPT-style decoders.
//!
//! [`setup`] validates a [`FinetuneConfig`] and launches one worker per
//! device; each worker executes [`run`], which loads the base checkpoint,
//! attaches adapters, trains them with [`Trainer`] and writes adapter-only
//! checkpoints.

pub mod checkpoint;
pub mod config;
pub mod data;
pub mod error;
pub mod fabric;
pub mod generate;
pub mod logging;
pub mod loss;
pub mod metrics;
pub mod optimizer;
pub mod prompt;
pub mod scheduler;
pub mod tokenizer;
pub mod trainer;
pub mod validate;

use std::{fs, path::PathBuf, sync::Arc, time::Instant};

use candle_core::Device;
use log::{info, warn};
use model::Gpt;
use rand::{rngs::StdRng, SeedableRng};

pub use config::{FinetuneConfig, OptimizerKind};
pub use data::{Batch, Dataset, Example};
pub use error::{Result, TrainingError};
pub use fabric::{launch, Fabric, SingleDevice, ThreadGroup};
pub use trainer::{TrainState, Trainer, TrainingOutcome};

use crate::{
    checkpoint::{
        check_valid_checkpoint_dir, final_checkpoint_path, load_base_checkpoint,
        save_lora_checkpoint, SaveInfo, BASE_WEIGHTS_FILENAME,
    },
    data::get_longest_seq_length,
    logging::{ExperimentTracker, MetricsLogger, NoopTracker, RunInfo, TensorBoardTracker},
    metrics::ThroughputMonitor,
    tokenizer::{HfTokenizer, TextTokenizer},
    trainer::TrainerSinks,
};

/// What a worker reports back once training is over.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub outcome: TrainingOutcome,
    pub trainable_parameters: usize,
    pub frozen_parameters: usize,
    /// Present on global rank zero only.
    pub final_checkpoint: Option<PathBuf>,
    pub metrics_csv: Option<PathBuf>,
}

/// Resolves precision, rejects unsupported combinations and launches
/// `run.devices` workers on the detected accelerators.
pub fn setup(config: FinetuneConfig) -> Result<RunSummary> {
    setup_with_devices(config, fabric::select_device)
}

/// [`setup`] with an explicit device per rank.
pub fn setup_with_devices<D>(mut config: FinetuneConfig, device_factory: D) -> Result<RunSummary>
where
    D: Fn(usize) -> Result<Device> + Sync,
{
    if config.run.precision.is_none() {
        let device = device_factory(0)?;
        config.run.precision = Some(config.resolved_precision(&device));
    }
    config.validate()?;
    info!("{}", serde_json::to_string(&config.hparams()?)?);

    let config = Arc::new(config);
    launch(config.run.devices, device_factory, |fabric| {
        run(fabric, Arc::clone(&config))
    })
}

/// One worker's fine-tuning run.
pub fn run(fabric: &dyn Fabric, config: Arc<FinetuneConfig>) -> Result<RunSummary> {
    let paths = &config.paths;
    let mut model_config = check_valid_checkpoint_dir(&paths.checkpoint_dir)?;
    let precision = config.resolved_precision(fabric.device());

    let seed = config.run.seed;
    if let Err(err) = fabric.device().set_seed(seed) {
        warn!("failed to seed device RNG: {err}");
    }
    let mut init_rng = StdRng::seed_from_u64(seed);

    if fabric.is_global_zero() {
        fs::create_dir_all(&paths.out_dir)?;
    }

    let train_data = Dataset::load_split(&paths.data_dir, "train")?;
    let val_data = Dataset::load_split(&paths.data_dir, "test")?;
    if train_data.is_empty() || val_data.is_empty() {
        return Err(TrainingError::initialization(format!(
            "{} needs non-empty train and test splits",
            paths.data_dir.display()
        )));
    }

    let lora = config.lora_config();
    if !lora.any_enabled() {
        fabric.print("Warning: all LoRA layers are disabled!");
    }
    model_config.validate().map_err(|err| {
        TrainingError::initialization(format!("invalid model config: {err}"))
    })?;
    fabric.print(&format!(
        "Loading model {:?} with {}",
        paths.checkpoint_dir.join(BASE_WEIGHTS_FILENAME).display().to_string(),
        serde_json::to_string(&model_config)?
    ));

    let t0 = Instant::now();
    let mut model = Gpt::new(
        model_config.clone(),
        lora,
        precision.policy(),
        fabric.device(),
        &mut init_rng,
    )?;
    fabric.print(&format!(
        "Time to instantiate model: {:.02} seconds.",
        t0.elapsed().as_secs_f64()
    ));
    let trainable_parameters = model.num_parameters(true)?;
    let frozen_parameters = model.num_parameters(false)?;
    fabric.print(&format!("Number of trainable parameters: {trainable_parameters}"));
    fabric.print(&format!("Number of non trainable parameters: {frozen_parameters}"));

    load_base_checkpoint(&mut model, &paths.checkpoint_dir.join(BASE_WEIGHTS_FILENAME))?;
    if let Some(mode) = config.run.quantize {
        model.quantize_base(mode)?;
        fabric.print(&format!("Quantized frozen weights with {mode}"));
    }

    let (train_longest, _) = get_longest_seq_length(&train_data)?;
    let (val_longest, _) = get_longest_seq_length(&val_data)?;
    model.set_max_seq_length(train_longest.max(val_longest).min(model_config.block_size))?;
    fabric.print(&format!(
        "The longest sequence length in the train data is {train_longest}, the model's maximum sequence length is {} and context length is {}",
        model.max_seq_length(),
        model_config.block_size
    ));

    let tokenizer = HfTokenizer::from_dir(&paths.checkpoint_dir)?;
    let sinks = build_sinks(fabric, &config)?;
    let metrics_csv = sinks.metrics.as_ref().map(|logger| logger.path().to_path_buf());
    let data_rng = StdRng::seed_from_u64(seed + fabric.global_rank() as u64);

    let train_t0 = Instant::now();
    let mut trainer = Trainer::new(
        fabric,
        Arc::clone(&config),
        model,
        &tokenizer as &dyn TextTokenizer,
        sinks,
        data_rng,
    )?;
    let outcome = trainer.fit(&train_data, &val_data)?;
    fabric.print(&format!(
        "Training time: {:.2}s",
        train_t0.elapsed().as_secs_f64()
    ));

    let final_path = final_checkpoint_path(&paths.out_dir);
    let info = SaveInfo {
        iteration: outcome.state.iter_num,
        step_count: outcome.state.step_count,
    };
    let saved = save_lora_checkpoint(fabric, trainer.model(), &final_path, info)?;

    Ok(RunSummary {
        outcome,
        trainable_parameters,
        frozen_parameters,
        final_checkpoint: saved.map(|_| final_path),
        metrics_csv,
    })
}

fn build_sinks(fabric: &dyn Fabric, config: &FinetuneConfig) -> Result<TrainerSinks> {
    if !fabric.is_global_zero() {
        return Ok(TrainerSinks {
            metrics: None,
            tracker: Box::new(NoopTracker),
        });
    }
    let out_dir = &config.paths.out_dir;
    let metrics = MetricsLogger::create(
        out_dir,
        config.run.log_interval,
        &ThroughputMonitor::metric_names(),
    )?;
    let tracker: Box<dyn ExperimentTracker> = if config.tracking.tensorboard {
        let run = RunInfo {
            project: config.tracking.project.clone(),
            name: config.run_name(),
            hparams: config.hparams()?,
        };
        Box::new(TensorBoardTracker::create(&out_dir.join("tensorboard"), &run)?)
    } else {
        Box::new(NoopTracker)
    };
    Ok(TrainerSinks {
        metrics: Some(metrics),
        tracker,
    })
}
