//! Run artefacts other than checkpoints: the per-iteration CSV metrics file
//! and the experiment tracker event stream.

use std::{
    collections::BTreeMap,
    fs::{self, File, OpenOptions},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::BytesMut;
use crc32fast::Hasher as Crc32;
use prost::Message;
use serde_json::Value;

use crate::error::{Result, TrainingError};

/// Writes `log_dict` rows to `root/version_{n}/metrics.csv`.
///
/// The header is `step` followed by the columns fixed at creation. Rows are
/// buffered and appended every `flush_every` rows; written rows are dropped.
#[derive(Debug)]
pub struct MetricsLogger {
    path: PathBuf,
    flush_every: usize,
    columns: Vec<String>,
    pending: Vec<BTreeMap<String, f64>>,
    header_written: bool,
}

impl MetricsLogger {
    /// Claims the next free `version_{n}` directory under `root`.
    pub fn create<S: AsRef<str>>(root: &Path, flush_every: usize, columns: &[S]) -> Result<Self> {
        fs::create_dir_all(root)?;
        let mut version = 0;
        while root.join(format!("version_{version}")).exists() {
            version += 1;
        }
        let dir = root.join(format!("version_{version}"));
        fs::create_dir_all(&dir)?;
        let mut header = vec!["step".to_string()];
        for column in columns {
            let column = column.as_ref();
            if !header.iter().any(|existing| existing == column) {
                header.push(column.to_string());
            }
        }
        Ok(Self {
            path: dir.join("metrics.csv"),
            flush_every: flush_every.max(1),
            columns: header,
            pending: Vec::new(),
            header_written: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Queues one row; keys missing from the header are rejected.
    pub fn log_dict(&mut self, metrics: &BTreeMap<String, f64>, step: usize) -> Result<()> {
        if let Some(unknown) = metrics.keys().find(|key| !self.columns.contains(*key)) {
            return Err(TrainingError::runtime(format!(
                "metric '{unknown}' is not a column of {}",
                self.path.display()
            )));
        }
        let mut row = metrics.clone();
        row.insert("step".to_string(), step as f64);
        self.pending.push(row);
        if self.pending.len() >= self.flush_every {
            self.flush()?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        let csv_error =
            |err: csv::Error| TrainingError::runtime(format!("failed to write metrics csv: {err}"));
        if !self.header_written {
            writer.write_record(&self.columns).map_err(csv_error)?;
        }
        for row in &self.pending {
            let record = self
                .columns
                .iter()
                .map(|column| row.get(column).map(|v| v.to_string()).unwrap_or_default());
            writer.write_record(record).map_err(csv_error)?;
        }
        writer.flush()?;
        self.header_written = true;
        self.pending.clear();
        Ok(())
    }
}

impl Drop for MetricsLogger {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

/// Sink for scalar training curves.
pub trait ExperimentTracker: Send {
    fn log_scalar(&mut self, tag: &str, value: f64, step: usize) -> Result<()>;

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Tracker used on non-zero ranks and when tracking is switched off.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTracker;

impl ExperimentTracker for NoopTracker {
    fn log_scalar(&mut self, _tag: &str, _value: f64, _step: usize) -> Result<()> {
        Ok(())
    }
}

/// Description of a tracked run, stored as `run.json` next to the events.
#[derive(Debug, Clone)]
pub struct RunInfo {
    pub project: String,
    pub name: String,
    pub hparams: Value,
}

/// Appends TensorBoard `Event` records to an `events.out.tfevents.*` file.
pub struct TensorBoardTracker {
    writer: BufWriter<File>,
    path: PathBuf,
}

impl std::fmt::Debug for TensorBoardTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TensorBoardTracker")
            .field("path", &self.path)
            .finish()
    }
}

impl TensorBoardTracker {
    /// Creates `root/{project}/{name}/` with the event file and `run.json`.
    pub fn create(root: &Path, run: &RunInfo) -> Result<Self> {
        let dir = root.join(&run.project).join(&run.name);
        fs::create_dir_all(&dir).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create tracker directory {}: {err}",
                dir.display()
            ))
        })?;
        let mut run_json = serde_json::Map::new();
        run_json.insert("project".into(), Value::String(run.project.clone()));
        run_json.insert("name".into(), Value::String(run.name.clone()));
        run_json.insert("config".into(), run.hparams.clone());
        fs::write(dir.join("run.json"), serde_json::to_vec_pretty(&run_json)?)?;

        let path = dir.join(format!(
            "events.out.tfevents.{}.{}",
            unix_seconds(),
            hostname()
        ));
        let file = File::create(&path).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create event file {}: {err}",
                path.display()
            ))
        })?;
        let mut tracker = Self {
            writer: BufWriter::new(file),
            path,
        };
        tracker.write_event(&Event {
            wall_time: wall_time(),
            step: 0,
            file_version: Some("brain.Event:2".to_string()),
            summary: None,
        })?;
        Ok(tracker)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_event(&mut self, event: &Event) -> Result<()> {
        let mut buffer = BytesMut::with_capacity(event.encoded_len());
        event.encode(&mut buffer).map_err(|err| {
            TrainingError::runtime(format!("failed to encode tracker event: {err}"))
        })?;
        let data = buffer.freeze();
        let len = (data.len() as u64).to_le_bytes();

        self.writer.write_all(&len)?;
        self.writer.write_all(&masked_crc32(&len).to_le_bytes())?;
        self.writer.write_all(&data)?;
        self.writer.write_all(&masked_crc32(&data).to_le_bytes())?;
        Ok(())
    }
}

impl ExperimentTracker for TensorBoardTracker {
    fn log_scalar(&mut self, tag: &str, value: f64, step: usize) -> Result<()> {
        self.write_event(&Event {
            wall_time: wall_time(),
            step: step as i64,
            file_version: None,
            summary: Some(Summary {
                value: vec![summary::Value {
                    tag: tag.to_string(),
                    simple_value: Some(value as f32),
                }],
            }),
        })
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

impl Drop for TensorBoardTracker {
    fn drop(&mut self) {
        let _ = self.writer.flush();
    }
}

fn masked_crc32(data: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(data);
    let crc = hasher.finalize();
    ((crc >> 15) | (crc << 17)).wrapping_add(0xa282_ead8)
}

fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn wall_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|dur| dur.as_secs_f64())
        .unwrap_or(0.0)
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string())
}

#[derive(Clone, PartialEq, Message)]
struct Event {
    #[prost(double, tag = "1")]
    wall_time: f64,
    #[prost(int64, tag = "2")]
    step: i64,
    #[prost(string, optional, tag = "3")]
    file_version: Option<String>,
    #[prost(message, optional, tag = "5")]
    summary: Option<Summary>,
}

#[derive(Clone, PartialEq, Message)]
struct Summary {
    #[prost(message, repeated, tag = "1")]
    value: Vec<summary::Value>,
}

mod summary {
    use prost::Message;

    #[derive(Clone, PartialEq, Message)]
    pub struct Value {
        #[prost(string, tag = "1")]
        pub tag: String,
        #[prost(float, optional, tag = "2")]
        pub simple_value: Option<f32>,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn csv_versions_and_keeps_fixed_columns() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let first = MetricsLogger::create(dir.path(), 10, &["samples"])?;
        assert!(first.path().ends_with("version_0/metrics.csv"));

        let mut logger = MetricsLogger::create(dir.path(), 1, &["samples", "samples_per_sec"])?;
        assert!(logger.path().ends_with("version_1/metrics.csv"));
        logger.log_dict(&row(&[("samples", 4.0)]), 1)?;
        logger.log_dict(&row(&[("samples", 8.0), ("samples_per_sec", 2.5)]), 2)?;
        assert!(logger.log_dict(&row(&[("loss", 1.0)]), 3).is_err());

        let contents = fs::read_to_string(logger.path())?;
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines, vec!["step,samples,samples_per_sec", "1,4,", "2,8,2.5"]);
        Ok(())
    }

    #[test]
    fn csv_buffers_until_interval_and_releases_written_rows() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut logger = MetricsLogger::create(dir.path(), 3, &["time"])?;
        logger.log_dict(&row(&[("time", 0.5)]), 1)?;
        assert!(!logger.path().exists());
        logger.log_dict(&row(&[("time", 1.0)]), 2)?;
        logger.log_dict(&row(&[("time", 1.5)]), 3)?;
        assert!(logger.pending.is_empty());
        assert_eq!(fs::read_to_string(logger.path())?.lines().count(), 4);

        logger.log_dict(&row(&[("time", 2.0)]), 4)?;
        logger.flush()?;
        let contents = fs::read_to_string(logger.path())?;
        assert_eq!(contents.lines().filter(|line| line.starts_with("step")).count(), 1);
        assert_eq!(contents.lines().last(), Some("4,2"));
        Ok(())
    }

    #[test]
    fn tensorboard_records_are_framed() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let run = RunInfo {
            project: "lora+c".into(),
            name: "tiny_alpaca_lora_r=8".into(),
            hparams: serde_json::json!({ "lora_r": 8 }),
        };
        let path = {
            let mut tracker = TensorBoardTracker::create(dir.path(), &run)?;
            tracker.log_scalar("loss", 1.25, 3)?;
            tracker.path().to_path_buf()
        };
        let bytes = fs::read(&path)?;
        let first_len = u64::from_le_bytes(bytes[..8].try_into()?) as usize;
        let second = 8 + 4 + first_len + 4;
        let second_len = u64::from_le_bytes(bytes[second..second + 8].try_into()?) as usize;
        assert_eq!(bytes.len(), second + 8 + 4 + second_len + 4);

        let event = Event::decode(&bytes[second + 12..second + 12 + second_len])?;
        assert_eq!(event.step, 3);
        let value = event.summary.map(|s| s.value[0].clone());
        assert_eq!(value.and_then(|v| v.simple_value), Some(1.25));

        let run_json: Value = serde_json::from_slice(&fs::read(
            dir.path().join("lora+c/tiny_alpaca_lora_r=8/run.json"),
        )?)?;
        assert_eq!(run_json["config"]["lora_r"], 8);
        Ok(())
    }
}
