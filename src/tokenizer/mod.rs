//! Text <-> token id boundary.
//!
//! The model only ever sees ids; anything implementing [`Tokenizer`] can sit
//! in front of it.

pub mod byte;
pub mod hf;
pub mod stream;

use crate::error::Result;

pub use byte::ByteTokenizer;
pub use hf::{HfTokenizer, SpecialTokens};
pub use stream::DecodeStream;

/// Text to ids and back, plus the special ids the model needs.
pub trait Tokenizer {
    /// # Errors
    /// Returns an error if the text cannot be encoded.
    fn encode(&self, text: &str) -> Result<Vec<u32>>;

    /// # Errors
    /// Returns an error if the ids cannot be decoded.
    fn decode(&self, token_ids: &[u32]) -> Result<String>;

    fn vocab_size(&self) -> usize;
    fn pad_id(&self) -> u32;
    fn eos_id(&self) -> u32;
    fn sos_id(&self) -> u32;
}
