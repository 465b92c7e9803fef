//! Text tokenizer seam used by validation-time generation.

use std::{fs, path::Path};

use serde_json::Value;
use tokenizers::Tokenizer;

use crate::error::{Result, TrainingError};

pub trait TextTokenizer: Send + Sync {
    fn encode(&self, text: &str) -> Result<Vec<u32>>;

    fn decode(&self, ids: &[u32]) -> Result<String>;

    fn eos_id(&self) -> Option<u32>;
}

/// `tokenizer.json` from a checkpoint directory.
///
/// The optional `tokenizer_config.json` decides whether a BOS token is
/// prepended and which tokens act as BOS and EOS.
pub struct HfTokenizer {
    inner: Tokenizer,
    bos_id: Option<u32>,
    eos_id: Option<u32>,
    use_bos: bool,
}

impl std::fmt::Debug for HfTokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HfTokenizer")
            .field("vocab_size", &self.inner.get_vocab_size(true))
            .field("bos_id", &self.bos_id)
            .field("eos_id", &self.eos_id)
            .field("use_bos", &self.use_bos)
            .finish()
    }
}

impl HfTokenizer {
    pub fn from_dir(checkpoint_dir: &Path) -> Result<Self> {
        let path = checkpoint_dir.join("tokenizer.json");
        let inner = Tokenizer::from_file(&path).map_err(|err| {
            TrainingError::initialization(format!(
                "failed to load tokenizer {}: {err}",
                path.display()
            ))
        })?;

        let config_path = checkpoint_dir.join("tokenizer_config.json");
        let config: Value = if config_path.exists() {
            serde_json::from_str(&fs::read_to_string(&config_path)?)?
        } else {
            Value::Null
        };
        let lookup = |key: &str| special_token(&config, key).and_then(|t| inner.token_to_id(&t));
        let bos_id = lookup("bos_token");
        let eos_id = lookup("eos_token");
        let use_bos = config
            .get("add_bos_token")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        Ok(Self {
            inner,
            bos_id,
            eos_id,
            use_bos,
        })
    }

    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }

    pub fn bos_id(&self) -> Option<u32> {
        self.bos_id
    }
}

/// Special tokens appear either as a plain string or as `{"content": ..}`.
fn special_token(config: &Value, key: &str) -> Option<String> {
    match config.get(key)? {
        Value::String(token) => Some(token.clone()),
        Value::Object(map) => map.get("content")?.as_str().map(str::to_string),
        _ => None,
    }
}

impl TextTokenizer for HfTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|err| TrainingError::runtime(format!("failed to encode prompt: {err}")))?;
        let mut ids = Vec::with_capacity(encoding.len() + 1);
        if self.use_bos {
            if let Some(bos) = self.bos_id {
                ids.push(bos);
            }
        }
        ids.extend_from_slice(encoding.get_ids());
        Ok(ids)
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        self.inner
            .decode(ids, true)
            .map_err(|err| TrainingError::runtime(format!("failed to decode tokens: {err}")))
    }

    fn eos_id(&self) -> Option<u32> {
        self.eos_id
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const WORD_LEVEL_JSON: &str = r#"{
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [],
        "normalizer": null,
        "pre_tokenizer": {"type": "Whitespace"},
        "post_processor": null,
        "decoder": null,
        "model": {
            "type": "WordLevel",
            "vocab": {"<unk>": 0, "<s>": 1, "</s>": 2, "hello": 3, "world": 4},
            "unk_token": "<unk>"
        }
    }"#;

    #[test]
    fn honours_bos_and_eos_from_config() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        fs::write(dir.path().join("tokenizer.json"), WORD_LEVEL_JSON)?;
        fs::write(
            dir.path().join("tokenizer_config.json"),
            r#"{"add_bos_token": true, "bos_token": {"content": "<s>"}, "eos_token": "</s>"}"#,
        )?;
        let tokenizer = HfTokenizer::from_dir(dir.path())?;
        assert_eq!(tokenizer.encode("hello world")?, vec![1, 3, 4]);
        assert_eq!(tokenizer.eos_id(), Some(2));
        assert_eq!(tokenizer.decode(&[3, 4])?, "hello world");
        Ok(())
    }

    #[test]
    fn no_config_means_no_bos() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        fs::write(dir.path().join("tokenizer.json"), WORD_LEVEL_JSON)?;
        let tokenizer = HfTokenizer::from_dir(dir.path())?;
        assert_eq!(tokenizer.encode("world hello")?, vec![4, 3]);
        assert_eq!(tokenizer.eos_id(), None);
        assert!(HfTokenizer::from_dir(&dir.path().join("missing")).is_err());
        Ok(())
    }
}
