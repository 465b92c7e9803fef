use std::{
    fs,
    path::{Path, PathBuf},
};

use candle_core::Device;
use layers::{Precision, QuantMode};
use model::LoraConfig;
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

use crate::error::{Result, TrainingError};

/// Complete description of a fine-tuning run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FinetuneConfig {
    pub paths: PathsConfig,
    pub run: RunConfig,
    pub lora: LoraSection,
    pub optimizer: OptimizerConfig,
    pub tracking: TrackingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Directory holding `train.json` and `test.json`.
    pub data_dir: PathBuf,
    /// Directory holding the base model weights and tokenizer.
    pub checkpoint_dir: PathBuf,
    pub out_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data/alpaca"),
            checkpoint_dir: PathBuf::from("checkpoints/stabilityai/stablelm-base-alpha-3b"),
            out_dir: PathBuf::from("out/lora/alpaca"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub devices: usize,
    pub precision: Option<Precision>,
    pub quantize: Option<QuantMode>,
    pub seed: u64,
    pub max_iters: usize,
    pub micro_batch_size: usize,
    pub batch_size: usize,
    pub warmup_steps: usize,
    pub eval_interval: usize,
    pub save_interval: usize,
    pub eval_iters: usize,
    pub eval_max_new_tokens: usize,
    pub log_interval: usize,
    pub lm_head_chunk_size: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            devices: 1,
            precision: None,
            quantize: None,
            seed: 1337,
            max_iters: 10_000,
            micro_batch_size: 16,
            batch_size: 128,
            warmup_steps: 100,
            eval_interval: 100,
            save_interval: 100,
            eval_iters: 100,
            eval_max_new_tokens: 100,
            log_interval: 1,
            lm_head_chunk_size: 128,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoraSection {
    pub r: usize,
    /// Defaults to `2 * r`.
    pub alpha: Option<f64>,
    pub dropout: f32,
    pub query: bool,
    pub key: bool,
    pub value: bool,
    pub projection: bool,
    pub mlp: bool,
    pub head: bool,
}

impl Default for LoraSection {
    fn default() -> Self {
        Self {
            r: 256,
            alpha: None,
            dropout: 0.05,
            query: true,
            key: false,
            value: true,
            projection: false,
            mlp: false,
            head: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerKind {
    Lion,
    AdamW,
    PagedAdamW,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub learning_rate: f64,
    pub weight_decay: f64,
    /// Explicit optimizer; by default Lion, or paged AdamW for quantised runs.
    pub kind: Option<OptimizerKind>,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            learning_rate: 3e-4,
            weight_decay: 0.01,
            kind: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    /// Write a TensorBoard event stream next to the CSV metrics.
    pub tensorboard: bool,
    pub project: String,
    /// Defaults to `{model}_{dataset}_lora_r={r}`.
    pub run_name: Option<String>,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            tensorboard: true,
            project: "lora+c".to_string(),
            run_name: None,
        }
    }
}

impl FinetuneConfig {
    /// Loads a TOML or JSON config and resolves relative paths against its directory.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut config: FinetuneConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(TrainingError::ConfigFormat(format!(
                    "unsupported configuration extension '{other}'"
                )));
            }
        };
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        config.apply_base_path(base_dir);
        Ok(config)
    }

    /// Applies `key.path=value` overrides on top of this config.
    ///
    /// Values are parsed as booleans, `null`, numbers or inline JSON before
    /// falling back to strings. Every key must already exist.
    pub fn with_overrides<S: AsRef<str>>(self, overrides: &[S]) -> Result<Self> {
        if overrides.is_empty() {
            return Ok(self);
        }
        let mut value = serde_json::to_value(self)?;
        for raw in overrides {
            let raw = raw.as_ref();
            let (path, new_value) = raw.split_once('=').ok_or_else(|| {
                TrainingError::ConfigFormat(format!("override '{raw}' must be in the form key=value"))
            })?;
            set_at_path(&mut value, path.trim(), parse_override_value(new_value))?;
        }
        Ok(serde_json::from_value(value)?)
    }

    fn apply_base_path(&mut self, base: &Path) {
        for path in [
            &mut self.paths.data_dir,
            &mut self.paths.checkpoint_dir,
            &mut self.paths.out_dir,
        ] {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        }
    }

    /// Micro-batches folded into one optimizer step.
    pub fn gradient_accumulation_iters(&self) -> usize {
        self.run.batch_size / self.run.micro_batch_size.max(1)
    }

    /// Optimizer steps the run performs when it finishes.
    pub fn planned_optimizer_steps(&self) -> usize {
        self.run.max_iters / self.gradient_accumulation_iters().max(1)
    }

    pub fn lora_config(&self) -> LoraConfig {
        LoraConfig {
            r: self.lora.r,
            alpha: self.lora.alpha.unwrap_or(2.0 * self.lora.r as f64),
            dropout: self.lora.dropout,
            to_query: self.lora.query,
            to_key: self.lora.key,
            to_value: self.lora.value,
            to_projection: self.lora.projection,
            to_mlp: self.lora.mlp,
            to_head: self.lora.head,
        }
    }

    pub fn resolved_precision(&self, device: &Device) -> Precision {
        self.run.precision.unwrap_or_else(|| Precision::default_for(device))
    }

    pub fn optimizer_kind(&self) -> OptimizerKind {
        match (self.optimizer.kind, self.run.quantize) {
            (Some(kind), _) => kind,
            (None, Some(_)) => OptimizerKind::PagedAdamW,
            (None, None) => OptimizerKind::Lion,
        }
    }

    /// Tracker run name, derived from the checkpoint and data directory names.
    pub fn run_name(&self) -> String {
        if let Some(name) = &self.tracking.run_name {
            return name.clone();
        }
        let leaf = |path: &Path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .unwrap_or("unknown")
                .to_string()
        };
        format!(
            "{}_{}_lora_r={}",
            leaf(&self.paths.checkpoint_dir),
            leaf(&self.paths.data_dir),
            self.lora.r
        )
    }

    /// Flat record of every hyperparameter, as logged at start-up.
    pub fn hparams(&self) -> Result<Value> {
        let mut value = serde_json::to_value(self)?;
        if let Some(map) = value.as_object_mut() {
            map.insert(
                "gradient_accumulation_iters".into(),
                self.gradient_accumulation_iters().into(),
            );
            map.insert("lora_alpha".into(), self.lora_config().alpha.into());
            map.insert(
                "optimizer".into(),
                format!("{:?}", self.optimizer_kind()).into(),
            );
        }
        Ok(value)
    }

    /// Checks every field and returns all problems at once.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();
        let run = &self.run;

        if run.micro_batch_size == 0 {
            errors.push("run.micro_batch_size must be greater than 0".to_string());
        } else if run.batch_size % run.micro_batch_size != 0 || run.batch_size == 0 {
            errors.push(format!(
                "run.batch_size ({}) must be a positive multiple of run.micro_batch_size ({})",
                run.batch_size, run.micro_batch_size
            ));
        }
        for (name, value) in [
            ("run.devices", run.devices),
            ("run.max_iters", run.max_iters),
            ("run.eval_interval", run.eval_interval),
            ("run.save_interval", run.save_interval),
            ("run.eval_iters", run.eval_iters),
            ("run.log_interval", run.log_interval),
            ("lora.r", self.lora.r),
        ] {
            if value == 0 {
                errors.push(format!("{name} must be greater than 0"));
            }
        }
        if self.optimizer.learning_rate <= 0.0 {
            errors.push("optimizer.learning_rate must be greater than 0".to_string());
        }
        if self.optimizer.weight_decay < 0.0 {
            errors.push("optimizer.weight_decay must be >= 0".to_string());
        }
        if !(0.0..1.0).contains(&self.lora.dropout) {
            errors.push("lora.dropout must be in [0, 1)".to_string());
        }
        if let Some(alpha) = self.lora.alpha {
            if alpha <= 0.0 {
                errors.push("lora.alpha must be greater than 0".to_string());
            }
        }
        if run.quantize.is_some() && run.precision.is_some_and(|p| p.is_mixed()) {
            errors.push("Quantization and mixed precision is not supported.".to_string());
        }
        if !errors.is_empty() {
            return Err(TrainingError::validation(errors));
        }

        if run.quantize.is_some() && run.devices > 1 {
            return Err(TrainingError::unsupported(
                "Quantization is currently not supported for multi-GPU training. Please set devices=1 when using the --quantize flag.",
            ));
        }

        let accum = self.gradient_accumulation_iters();
        if run.max_iters % accum != 0 {
            log::warn!(
                "max_iters ({}) is not a multiple of the accumulation factor ({accum}); the last {} iterations will not produce an optimizer step",
                run.max_iters,
                run.max_iters % accum
            );
        }
        Ok(())
    }
}

fn parse_override_value(raw: &str) -> Value {
    let trimmed = raw.trim();
    match trimmed {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        "null" => return Value::Null,
        _ => {}
    }
    if let Ok(int) = trimmed.parse::<i64>() {
        return Value::Number(Number::from(int));
    }
    if let Some(number) = trimmed.parse::<f64>().ok().and_then(Number::from_f64) {
        return Value::Number(number);
    }
    if trimmed.starts_with('[') || trimmed.starts_with('{') {
        if let Ok(json) = serde_json::from_str::<Value>(trimmed) {
            return json;
        }
    }
    Value::String(trimmed.to_string())
}

fn set_at_path(root: &mut Value, path: &str, new_value: Value) -> Result<()> {
    let unknown = || TrainingError::ConfigFormat(format!("unknown configuration key '{path}'"));
    let mut current = root;
    let mut segments = path.split('.').peekable();
    while let Some(segment) = segments.next() {
        let slot = current
            .as_object_mut()
            .and_then(|map| map.get_mut(segment))
            .ok_or_else(unknown)?;
        if segments.peek().is_none() {
            *slot = new_value;
            return Ok(());
        }
        current = slot;
    }
    Err(unknown())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_mirror_reference_run() {
        let config = FinetuneConfig::default();
        assert_eq!(config.gradient_accumulation_iters(), 8);
        assert_eq!(config.planned_optimizer_steps(), 1250);
        assert_eq!(config.lora_config().alpha, 512.0);
        assert_eq!(config.optimizer_kind(), OptimizerKind::Lion);
        assert_eq!(config.run_name(), "stablelm-base-alpha-3b_alpaca_lora_r=256");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn collects_every_validation_error() {
        let mut config = FinetuneConfig::default();
        config.run.batch_size = 100;
        config.run.micro_batch_size = 16;
        config.optimizer.learning_rate = 0.0;
        config.run.eval_interval = 0;
        match config.validate() {
            Err(TrainingError::Validation(errors)) => assert_eq!(errors.len(), 3),
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn rejects_quantization_with_mixed_precision() {
        let mut config = FinetuneConfig::default();
        config.run.quantize = Some(QuantMode::Nf4);
        config.run.precision = Some(Precision::Bf16Mixed);
        let err = config.validate().unwrap_err();
        assert!(err
            .to_string()
            .contains("Quantization and mixed precision is not supported."));

        config.run.precision = Some(Precision::Bf16True);
        assert!(config.validate().is_ok());
        assert_eq!(config.optimizer_kind(), OptimizerKind::PagedAdamW);
    }

    #[test]
    fn rejects_quantization_across_devices() {
        let mut config = FinetuneConfig::default();
        config.run.quantize = Some(QuantMode::Nf4Dq);
        config.run.devices = 2;
        assert!(matches!(config.validate(), Err(TrainingError::Unsupported(_))));
    }

    #[test]
    fn loads_toml_with_relative_paths() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("run.toml");
        let mut file = fs::File::create(&path)?;
        writeln!(
            file,
            "[paths]\ndata_dir = \"data\"\n\n[run]\nmicro_batch_size = 4\nbatch_size = 8\nprecision = \"bf16-true\"\nquantize = \"bnb.nf4\"\n\n[lora]\nr = 8\nmlp = true"
        )?;
        let config = FinetuneConfig::from_path(&path)?;
        assert_eq!(config.paths.data_dir, dir.path().join("data"));
        assert_eq!(config.run.precision, Some(Precision::Bf16True));
        assert_eq!(config.run.quantize, Some(QuantMode::Nf4));
        assert_eq!(config.gradient_accumulation_iters(), 2);
        assert!(config.lora_config().to_mlp);
        assert_eq!(config.lora_config().alpha, 16.0);
        Ok(())
    }

    #[test]
    fn overrides_follow_dotted_paths() -> Result<()> {
        let config = FinetuneConfig::default().with_overrides(&[
            "run.max_iters=64",
            "lora.alpha=16.5",
            "run.precision=bf16-true",
            "tracking.tensorboard=false",
        ])?;
        assert_eq!(config.run.max_iters, 64);
        assert_eq!(config.lora.alpha, Some(16.5));
        assert_eq!(config.run.precision, Some(Precision::Bf16True));
        assert!(!config.tracking.tensorboard);

        let typo = FinetuneConfig::default().with_overrides(&["run.max_iter=1"]);
        assert!(matches!(typo, Err(TrainingError::ConfigFormat(_))));
        assert!(FinetuneConfig::default().with_overrides(&["run.max_iters"]).is_err());
        Ok(())
    }
}
