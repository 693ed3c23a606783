//! Incremental detokenization for streamed output.
//!
//! Decoding token by token breaks multi-byte characters and drops the
//! word-boundary spaces some decoders only emit in context. The stream
//! re-decodes the whole span on every push and hands out only the new suffix.

use super::Tokenizer;
use crate::error::Result;

/// Accumulates ids and yields text once it is stable.
pub struct DecodeStream<'a> {
    tokenizer: &'a dyn Tokenizer,
    ids: Vec<u32>,
    emitted: usize,
}

impl<'a> DecodeStream<'a> {
    #[must_use]
    pub fn new(tokenizer: &'a dyn Tokenizer) -> Self {
        Self {
            tokenizer,
            ids: Vec::new(),
            emitted: 0,
        }
    }

    /// Add one id and return the text it completes, if any.
    ///
    /// Text ending in U+FFFD is held back: it is usually a character whose
    /// remaining bytes have not been generated yet.
    ///
    /// # Errors
    /// Returns an error if the tokenizer fails.
    pub fn push(&mut self, token_id: u32) -> Result<Option<String>> {
        self.ids.push(token_id);
        let text = self.tokenizer.decode(&self.ids)?;
        if text.ends_with(char::REPLACEMENT_CHARACTER) {
            return Ok(None);
        }
        Ok(self.take_suffix(&text))
    }

    /// Flush whatever is still pending, including an incomplete character.
    ///
    /// # Errors
    /// Returns an error if the tokenizer fails.
    pub fn finish(mut self) -> Result<String> {
        let text = self.tokenizer.decode(&self.ids)?;
        Ok(self.take_suffix(&text).unwrap_or_default())
    }

    /// Every id pushed so far.
    #[must_use]
    pub fn ids(&self) -> &[u32] {
        &self.ids
    }

    fn take_suffix(&mut self, text: &str) -> Option<String> {
        // A decoder may rewrite earlier text; only ever append.
        let suffix = text.get(self.emitted..)?;
        if suffix.is_empty() {
            return None;
        }
        self.emitted = text.len();
        Some(suffix.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokenizer::ByteTokenizer;

    fn stream_all(text: &str) -> (Vec<String>, String) {
        let tok = ByteTokenizer::new();
        let mut stream = DecodeStream::new(&tok);
        let mut pieces = Vec::new();
        for id in tok.encode(text).unwrap() {
            if let Some(piece) = stream.push(id).unwrap() {
                pieces.push(piece);
            }
        }
        let rest = stream.finish().unwrap();
        (pieces, rest)
    }

    #[test]
    fn test_multibyte_characters_survive_streaming() {
        let (pieces, rest) = stream_all("é ✓");
        assert_eq!(pieces, vec!["é", " ", "✓"]);
        assert!(rest.is_empty());
        assert!(!pieces.concat().contains(char::REPLACEMENT_CHARACTER));
    }

    #[test]
    fn test_ascii_streams_per_token() {
        let (pieces, _) = stream_all("abc");
        assert_eq!(pieces, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_incomplete_character_flushed_at_finish() {
        let tok = ByteTokenizer::new();
        let mut stream = DecodeStream::new(&tok);
        assert_eq!(stream.push(tok.encode_byte(b'x')).unwrap().as_deref(), Some("x"));
        // First byte of "é" only.
        assert_eq!(stream.push(tok.encode_byte(0xC3)).unwrap(), None);
        assert_eq!(stream.ids().len(), 2);
        assert_eq!(stream.finish().unwrap(), "\u{FFFD}");
    }
}
