use std::path::PathBuf;

use clap::Parser;
use finetune::{FinetuneConfig, TrainingError};
use layers::{Precision, QuantMode};
use log::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "LoRA instruction fine-tuning", long_about = None)]
struct Args {
    #[arg(
        short,
        long,
        value_name = "PATH",
        help = "TOML or JSON run config; built-in defaults when omitted"
    )]
    config: Option<PathBuf>,

    #[arg(long, value_name = "DIR", help = "Directory with train.json and test.json")]
    data_dir: Option<PathBuf>,

    #[arg(long, value_name = "DIR", help = "Base checkpoint directory")]
    checkpoint_dir: Option<PathBuf>,

    #[arg(long, value_name = "DIR", help = "Where adapter checkpoints and logs go")]
    out_dir: Option<PathBuf>,

    #[arg(long, help = "32-true, 16-true, bf16-true, 16-mixed or bf16-mixed")]
    precision: Option<Precision>,

    #[arg(long, help = "bnb.nf4, bnb.nf4-dq, bnb.fp4, bnb.fp4-dq or bnb.int8-training")]
    quantize: Option<QuantMode>,

    #[arg(long, help = "Number of worker devices")]
    devices: Option<usize>,

    #[arg(
        long = "override",
        value_name = "KEY=VALUE",
        help = "Override configuration value using dot-separated paths"
    )]
    overrides: Vec<String>,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    if let Err(err) = run() {
        error!("fine-tuning failed: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), TrainingError> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => FinetuneConfig::from_path(path)?,
        None => FinetuneConfig::default(),
    };
    config = config.with_overrides(&args.overrides)?;
    if let Some(dir) = args.data_dir {
        config.paths.data_dir = dir;
    }
    if let Some(dir) = args.checkpoint_dir {
        config.paths.checkpoint_dir = dir;
    }
    if let Some(dir) = args.out_dir {
        config.paths.out_dir = dir;
    }
    if args.precision.is_some() {
        config.run.precision = args.precision;
    }
    if args.quantize.is_some() {
        config.run.quantize = args.quantize;
    }
    if let Some(devices) = args.devices {
        config.run.devices = devices;
    }

    let summary = finetune::setup(config)?;
    if let Some(path) = summary.final_checkpoint {
        info!(
            "finished after {} iterations / {} optimizer steps; adapters at {}",
            summary.outcome.state.iter_num,
            summary.outcome.state.step_count,
            path.display()
        );
    }
    Ok(())
}
