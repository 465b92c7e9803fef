//! Tokenised instruction datasets and random micro-batch sampling.
//!
//! A dataset file is either a JSON array or JSON lines of objects carrying
//! `input_ids` and `labels` (extra fields such as the raw instruction are
//! ignored). Labels use [`IGNORE_INDEX`] for positions that must not
//! contribute to the loss, typically the prompt.

use std::{fs, path::Path};

use candle_core::{Device, Tensor};
use rand::{rngs::StdRng, Rng};
use serde::Deserialize;

use crate::error::{Result, TrainingError};

/// Target value excluded from the loss.
pub const IGNORE_INDEX: i64 = -1;
/// Value used to right-pad input ids.
pub const PAD_TOKEN: i64 = 0;

/// One tokenised training example.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Example {
    pub input_ids: Vec<i64>,
    pub labels: Vec<i64>,
}

impl Example {
    pub fn len(&self) -> usize {
        self.input_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.input_ids.is_empty()
    }
}

/// Ordered collection of examples; an example's identity is its index.
#[derive(Debug, Clone, Default)]
pub struct Dataset {
    examples: Vec<Example>,
}

impl Dataset {
    pub fn new(examples: Vec<Example>) -> Result<Self> {
        for (index, example) in examples.iter().enumerate() {
            if example.is_empty() {
                return Err(TrainingError::initialization(format!(
                    "example {index} has no tokens"
                )));
            }
            if example.input_ids.len() != example.labels.len() {
                return Err(TrainingError::initialization(format!(
                    "example {index} has {} input ids but {} labels",
                    example.input_ids.len(),
                    example.labels.len()
                )));
            }
        }
        Ok(Self { examples })
    }

    /// Reads a `.json` array or `.jsonl` file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(|err| {
            TrainingError::initialization(format!("failed to read {}: {err}", path.display()))
        })?;
        let parse_error = |err: serde_json::Error| {
            TrainingError::initialization(format!("failed to parse {}: {err}", path.display()))
        };
        let examples = if path.extension().and_then(|ext| ext.to_str()) == Some("jsonl") {
            contents
                .lines()
                .filter(|line| !line.trim().is_empty())
                .map(|line| serde_json::from_str::<Example>(line).map_err(parse_error))
                .collect::<Result<Vec<_>>>()?
        } else {
            serde_json::from_str::<Vec<Example>>(&contents).map_err(parse_error)?
        };
        Self::new(examples)
    }

    /// Loads `{split}.json`, falling back to `{split}.jsonl`, from `dir`.
    pub fn load_split(dir: &Path, split: &str) -> Result<Self> {
        let json = dir.join(format!("{split}.json"));
        if json.exists() {
            return Self::load(&json);
        }
        let jsonl = dir.join(format!("{split}.jsonl"));
        if jsonl.exists() {
            return Self::load(&jsonl);
        }
        Err(TrainingError::initialization(format!(
            "no {split}.json or {split}.jsonl in {}",
            dir.display()
        )))
    }

    pub fn len(&self) -> usize {
        self.examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    pub fn examples(&self) -> &[Example] {
        &self.examples
    }
}

/// Padded micro-batch living on a worker's device.
#[derive(Debug, Clone)]
pub struct Batch {
    /// `(micro_batch_size, longest)` token ids, `u32`.
    pub input_ids: Tensor,
    /// `(micro_batch_size, longest)` targets, `i64`.
    pub targets: Tensor,
    /// Unpadded length of each row.
    pub lengths: Vec<usize>,
}

impl Batch {
    pub fn seq_len(&self) -> usize {
        self.lengths.iter().copied().max().unwrap_or(0)
    }
}

/// Length of the longest example and the first index attaining it.
pub fn get_longest_seq_length(data: &Dataset) -> Result<(usize, usize)> {
    let mut best: Option<(usize, usize)> = None;
    for (index, example) in data.examples().iter().enumerate() {
        match best {
            Some((len, _)) if example.len() <= len => {}
            _ => best = Some((example.len(), index)),
        }
    }
    best.ok_or_else(|| TrainingError::runtime("cannot scan an empty dataset"))
}

/// Draws `count` indices uniformly with replacement; `force_index` overrides slot 0.
pub fn sample_indices(
    len: usize,
    count: usize,
    rng: &mut StdRng,
    force_index: Option<usize>,
) -> Result<Vec<usize>> {
    if len == 0 {
        return Err(TrainingError::runtime("cannot sample from an empty dataset"));
    }
    let mut indices: Vec<usize> = (0..count).map(|_| rng.gen_range(0..len)).collect();
    if let Some(force) = force_index {
        if force >= len {
            return Err(TrainingError::runtime(format!(
                "forced index {force} is out of range for {len} examples"
            )));
        }
        if let Some(first) = indices.first_mut() {
            *first = force;
        }
    }
    Ok(indices)
}

/// Right-pads the selected examples into `(inputs, targets)` rows of equal length.
pub fn collate(examples: &[&Example]) -> (Vec<Vec<i64>>, Vec<Vec<i64>>) {
    let longest = examples.iter().map(|example| example.len()).max().unwrap_or(0);
    let pad = |values: &[i64], fill: i64| {
        let mut row = values.to_vec();
        row.resize(longest, fill);
        row
    };
    examples
        .iter()
        .map(|example| {
            (
                pad(&example.input_ids, PAD_TOKEN),
                pad(&example.labels, IGNORE_INDEX),
            )
        })
        .unzip()
}

/// Samples a padded micro-batch and places it on `device`.
pub fn get_batch(
    data: &Dataset,
    micro_batch_size: usize,
    rng: &mut StdRng,
    force_index: Option<usize>,
    device: &Device,
) -> Result<Batch> {
    let indices = sample_indices(data.len(), micro_batch_size, rng, force_index)?;
    let selected: Vec<&Example> = indices.iter().map(|&i| &data.examples()[i]).collect();
    let lengths = selected.iter().map(|example| example.len()).collect();
    let (inputs, targets) = collate(&selected);
    let rows = inputs.len();
    let cols = inputs.first().map(Vec::len).unwrap_or(0);

    let flat_inputs = inputs
        .into_iter()
        .flatten()
        .map(|id| {
            u32::try_from(id)
                .map_err(|_| TrainingError::runtime(format!("token id {id} is not a valid vocabulary index")))
        })
        .collect::<Result<Vec<u32>>>()?;
    let flat_targets: Vec<i64> = targets.into_iter().flatten().collect();

    Ok(Batch {
        input_ids: Tensor::from_vec(flat_inputs, (rows, cols), device)?,
        targets: Tensor::from_vec(flat_targets, (rows, cols), device)?,
        lengths,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn example(len: usize) -> Example {
        Example {
            input_ids: (1..=len as i64).collect(),
            labels: (1..=len as i64).map(|v| v + 100).collect(),
        }
    }

    fn dataset(lengths: &[usize]) -> Dataset {
        Dataset::new(lengths.iter().map(|&len| example(len)).collect()).expect("valid dataset")
    }

    #[test]
    fn longest_returns_first_maximum() -> Result<()> {
        assert_eq!(get_longest_seq_length(&dataset(&[3, 7, 2, 7]))?, (7, 1));
        assert_eq!(get_longest_seq_length(&dataset(&[5]))?, (5, 0));
        assert!(get_longest_seq_length(&Dataset::default()).is_err());
        Ok(())
    }

    #[test]
    fn collate_pads_inputs_with_zero_and_targets_with_ignore() {
        let (a, b) = (example(2), example(4));
        let (inputs, targets) = collate(&[&a, &b]);
        assert_eq!(inputs[0], vec![1, 2, 0, 0]);
        assert_eq!(targets[0], vec![101, 102, -1, -1]);
        assert_eq!(inputs[1], vec![1, 2, 3, 4]);
    }

    #[test]
    fn forced_index_occupies_first_slot() -> Result<()> {
        let data = dataset(&[3, 7, 2, 7]);
        let mut rng = StdRng::seed_from_u64(0);
        let batch = get_batch(&data, 4, &mut rng, Some(1), &Device::Cpu)?;
        assert_eq!(batch.input_ids.dims(), &[4, 7]);
        assert_eq!(batch.lengths[0], 7);
        assert_eq!(batch.seq_len(), 7);
        let first = batch.input_ids.get(0)?.to_vec1::<u32>()?;
        assert_eq!(first, vec![1, 2, 3, 4, 5, 6, 7]);
        Ok(())
    }

    #[test]
    fn same_seed_same_batch() -> Result<()> {
        let data = dataset(&[3, 5, 2, 8, 4]);
        let mut a = StdRng::seed_from_u64(42);
        let mut b = StdRng::seed_from_u64(42);
        assert_eq!(
            sample_indices(data.len(), 6, &mut a, None)?,
            sample_indices(data.len(), 6, &mut b, None)?
        );
        Ok(())
    }

    #[test]
    fn batch_of_one_is_unpadded() -> Result<()> {
        let data = dataset(&[3]);
        let mut rng = StdRng::seed_from_u64(1);
        let batch = get_batch(&data, 1, &mut rng, None, &Device::Cpu)?;
        assert_eq!(batch.targets.to_vec2::<i64>()?, vec![vec![101, 102, 103]]);
        Ok(())
    }

    #[test]
    fn rejects_bad_inputs() {
        let mut rng = StdRng::seed_from_u64(0);
        assert!(sample_indices(0, 2, &mut rng, None).is_err());
        assert!(sample_indices(3, 2, &mut rng, Some(3)).is_err());
        let mismatched = Example {
            input_ids: vec![1, 2],
            labels: vec![1],
        };
        assert!(Dataset::new(vec![mismatched]).is_err());
    }

    #[test]
    fn loads_json_lines() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("train.jsonl");
        fs::write(
            &path,
            "{\"input_ids\": [1, 2], \"labels\": [-1, 2], \"instruction\": \"hi\"}\n\n{\"input_ids\": [3], \"labels\": [3]}\n",
        )?;
        let data = Dataset::load_split(dir.path(), "train")?;
        assert_eq!(data.len(), 2);
        assert_eq!(data.examples()[0].labels, vec![-1, 2]);
        assert!(Dataset::load_split(dir.path(), "test").is_err());
        Ok(())
    }
}
