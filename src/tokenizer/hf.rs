//! Adapter for Hugging Face `tokenizer.json` files.

use std::path::Path;

use super::Tokenizer;
use crate::error::{ModelError, Result};

/// Default end-of-text marker; also used as padding.
pub const DEFAULT_EOS: &str = "<|endoftext|>";
pub const DEFAULT_SOS: &str = "<|startoftext|>";

/// Names of the special tokens to look up in the vocabulary.
#[derive(Debug, Clone)]
pub struct SpecialTokens {
    pub pad: String,
    pub eos: String,
    pub sos: String,
}

impl Default for SpecialTokens {
    fn default() -> Self {
        Self {
            pad: DEFAULT_EOS.to_string(),
            eos: DEFAULT_EOS.to_string(),
            sos: DEFAULT_SOS.to_string(),
        }
    }
}

/// Wraps a [`tokenizers::Tokenizer`] with resolved special ids.
pub struct HfTokenizer {
    inner: tokenizers::Tokenizer,
    pad_id: u32,
    eos_id: u32,
    sos_id: u32,
}

impl HfTokenizer {
    /// Load `tokenizer.json` and resolve the special tokens.
    ///
    /// # Errors
    /// Returns [`ModelError::Tokenizer`] if the file cannot be loaded or a
    /// special token is missing from the vocabulary.
    pub fn from_file(path: &Path, special: &SpecialTokens) -> Result<Self> {
        let inner = tokenizers::Tokenizer::from_file(path).map_err(|e| {
            ModelError::Tokenizer(format!("failed to load {}: {e}", path.display()))
        })?;
        Self::from_tokenizer(inner, special)
    }

    /// Resolve the special ids. eos is required; a missing pad or sos token
    /// falls back to eos, since vocabularies like GPT-2's only carry
    /// `<|endoftext|>`.
    ///
    /// # Errors
    /// Returns [`ModelError::Tokenizer`] if the eos token is missing.
    pub fn from_tokenizer(inner: tokenizers::Tokenizer, special: &SpecialTokens) -> Result<Self> {
        let eos_id = inner.token_to_id(&special.eos).ok_or_else(|| {
            ModelError::Tokenizer(format!("eos token {:?} not in vocabulary", special.eos))
        })?;
        let or_eos = |role: &str, name: &str| {
            inner.token_to_id(name).unwrap_or_else(|| {
                log::warn!("{role} token {name:?} not in vocabulary, using eos");
                eos_id
            })
        };
        let pad_id = or_eos("pad", &special.pad);
        let sos_id = or_eos("sos", &special.sos);
        Ok(Self {
            inner,
            pad_id,
            eos_id,
            sos_id,
        })
    }
}

impl Tokenizer for HfTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| ModelError::Tokenizer(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, token_ids: &[u32]) -> Result<String> {
        self.inner
            .decode(token_ids, true)
            .map_err(|e| ModelError::Tokenizer(e.to_string()))
    }

    fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }

    fn pad_id(&self) -> u32 {
        self.pad_id
    }

    fn eos_id(&self) -> u32 {
        self.eos_id
    }

    fn sos_id(&self) -> u32 {
        self.sos_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_vocab(dir: &Path, vocab: &str) -> std::path::PathBuf {
        let json = format!(
            r#"{{"version":"1.0","truncation":null,"padding":null,"added_tokens":[],
            "normalizer":null,"pre_tokenizer":null,"post_processor":null,"decoder":null,
            "model":{{"type":"WordLevel","vocab":{{{vocab}}},"unk_token":"<|endoftext|>"}}}}"#
        );
        let path = dir.join("tokenizer.json");
        std::fs::write(&path, json).unwrap();
        path
    }

    #[test]
    fn test_missing_sos_falls_back_to_eos() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_vocab(dir.path(), r#""<|endoftext|>":0,"hello":1"#);
        let tok = HfTokenizer::from_file(&path, &SpecialTokens::default()).unwrap();
        assert_eq!(tok.eos_id(), 0);
        assert_eq!(tok.sos_id(), 0);
        assert_eq!(tok.pad_id(), 0);
        assert_eq!(tok.vocab_size(), 2);
    }

    #[test]
    fn test_explicit_special_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_vocab(
            dir.path(),
            r#""<|endoftext|>":0,"<s>":1,"</s>":2,"<pad>":3,"hello":4"#,
        );
        let special = SpecialTokens {
            pad: "<pad>".into(),
            eos: "</s>".into(),
            sos: "<s>".into(),
        };
        let tok = HfTokenizer::from_file(&path, &special).unwrap();
        assert_eq!((tok.pad_id(), tok.eos_id(), tok.sos_id()), (3, 2, 1));
    }

    #[test]
    fn test_missing_eos_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_vocab(dir.path(), r#""<|endoftext|>":0"#);
        let special = SpecialTokens {
            eos: "</s>".into(),
            ..SpecialTokens::default()
        };
        assert!(matches!(
            HfTokenizer::from_file(&path, &special),
            Err(ModelError::Tokenizer(_))
        ));
    }
}
