//! Byte-level tokenizer.
//!
//! - Special tokens occupy IDs 0..=2
//! - Every byte `b` of the UTF-8 text maps to ID `3 + b`
//!
//! The mapping is fixed, so any text round-trips and no vocabulary file is needed.

use super::Tokenizer;
use crate::error::Result;

/// Special token IDs.
pub const PAD_ID: u32 = 0;
pub const EOS_ID: u32 = 1;
pub const SOS_ID: u32 = 2;

pub const NUM_SPECIAL_TOKENS: u32 = 3;

/// Total vocabulary size: 3 special tokens + 256 bytes = 259.
pub const VOCAB_SIZE: u32 = NUM_SPECIAL_TOKENS + 256;

/// Stateless byte tokenizer.
#[derive(Debug, Default, Clone, Copy)]
pub struct ByteTokenizer;

impl ByteTokenizer {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Encode a single byte into a token ID.
    #[must_use]
    pub fn encode_byte(self, byte: u8) -> u32 {
        NUM_SPECIAL_TOKENS + u32::from(byte)
    }

    /// Decode a token ID into a byte.
    ///
    /// Returns `None` for special tokens and out-of-range IDs.
    #[must_use]
    pub fn decode_token(self, token_id: u32) -> Option<u8> {
        token_id
            .checked_sub(NUM_SPECIAL_TOKENS)
            .and_then(|b| u8::try_from(b).ok())
    }
}

impl Tokenizer for ByteTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        Ok(text.bytes().map(|b| self.encode_byte(b)).collect())
    }

    /// Skips special tokens; invalid UTF-8 is replaced lossily.
    fn decode(&self, token_ids: &[u32]) -> Result<String> {
        let bytes: Vec<u8> = token_ids
            .iter()
            .filter_map(|&t| self.decode_token(t))
            .collect();
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn vocab_size(&self) -> usize {
        VOCAB_SIZE as usize
    }

    fn pad_id(&self) -> u32 {
        PAD_ID
    }

    fn eos_id(&self) -> u32 {
        EOS_ID
    }

    fn sos_id(&self) -> u32 {
        SOS_ID
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vocab_size() {
        assert_eq!(ByteTokenizer::new().vocab_size(), 259);
    }

    #[test]
    fn test_special_ids_are_distinct() {
        let tok = ByteTokenizer::new();
        let ids = [tok.pad_id(), tok.eos_id(), tok.sos_id()];
        for (i, a) in ids.iter().enumerate() {
            for b in &ids[i + 1..] {
                assert_ne!(a, b);
            }
        }
        assert!(ids.iter().all(|&id| id < NUM_SPECIAL_TOKENS));
    }

    #[test]
    fn test_simple_roundtrip() {
        let tok = ByteTokenizer::new();
        let text = "hello, world";
        assert_eq!(tok.decode(&tok.encode(text).unwrap()).unwrap(), text);
    }

    #[test]
    fn test_multibyte_roundtrip() {
        let tok = ByteTokenizer::new();
        let text = "héllo ✓\nnext line";
        let ids = tok.encode(text).unwrap();
        assert_eq!(ids.len(), text.len());
        assert_eq!(tok.decode(&ids).unwrap(), text);
    }

    #[test]
    fn test_byte_range() {
        let tok = ByteTokenizer::new();
        assert_eq!(tok.encode_byte(0), NUM_SPECIAL_TOKENS);
        assert_eq!(tok.encode_byte(255), VOCAB_SIZE - 1);
        assert_eq!(tok.decode_token(VOCAB_SIZE), None);
        assert_eq!(tok.decode_token(PAD_ID), None);
    }

    #[test]
    fn test_empty_string() {
        let tok = ByteTokenizer::new();
        assert!(tok.encode("").unwrap().is_empty());
        assert_eq!(tok.decode(&[]).unwrap(), "");
    }
}
