//! Autoregressive generation loop.
//!
//! [`Generation`] is a pull-based iterator: every `next()` runs one model
//! step on a sliding window of the last `context_window` tokens, samples one
//! token and yields it. The end-of-sequence token stops generation without
//! being yielded.

use rand::SeedableRng;
use rand::rngs::StdRng;

use crate::error::{ModelError, Result};
use crate::inference::sampling::sample_next;

/// Anything that can score the next token given a context.
pub trait LogitsSource {
    /// Longest context the source accepts.
    fn context_window(&self) -> usize;

    /// Logits over the vocabulary for the token following `tokens`.
    ///
    /// `tokens` is never longer than [`LogitsSource::context_window`].
    ///
    /// # Errors
    /// Returns an error if the underlying model fails.
    fn next_token_logits(&self, tokens: &[u32]) -> Result<Vec<f32>>;
}

impl<T: LogitsSource + ?Sized> LogitsSource for &T {
    fn context_window(&self) -> usize {
        (**self).context_window()
    }

    fn next_token_logits(&self, tokens: &[u32]) -> Result<Vec<f32>> {
        (**self).next_token_logits(tokens)
    }
}

impl<T: LogitsSource + ?Sized> LogitsSource for Box<T> {
    fn context_window(&self) -> usize {
        (**self).context_window()
    }

    fn next_token_logits(&self, tokens: &[u32]) -> Result<Vec<f32>> {
        (**self).next_token_logits(tokens)
    }
}

/// Generation settings.
#[derive(Debug, Clone)]
pub struct GenerationConfig {
    pub max_new_tokens: usize,
    /// `0` selects greedy decoding
    pub temperature: f32,
    /// Nucleus mass in `(0, 1]`; `1` disables the filter
    pub top_p: f32,
    /// When set, top-k filtering is used instead of top-p
    pub top_k: Option<usize>,
    /// Token that ends generation; never yielded
    pub eos_id: Option<u32>,
    pub seed: Option<u64>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: 20,
            temperature: 0.9,
            top_p: 0.95,
            top_k: None,
            eos_id: None,
            seed: None,
        }
    }
}

impl GenerationConfig {
    /// # Errors
    /// Returns [`ModelError::Configuration`] for a negative temperature,
    /// `top_p` outside `(0, 1]` or `top_k == 0`.
    pub fn validate(&self) -> Result<()> {
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(ModelError::config(format!(
                "temperature must be >= 0, got {}",
                self.temperature
            )));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(ModelError::config(format!(
                "top_p must be in (0, 1], got {}",
                self.top_p
            )));
        }
        if self.top_k == Some(0) {
            return Err(ModelError::config("top_k must be positive when set"));
        }
        Ok(())
    }
}

/// Lifecycle of a [`Generation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationState {
    /// Prompt loaded, no step taken yet
    Primed,
    Generating,
    /// Finished by eos, step budget, cancellation or error
    Done,
}

/// Lazy, finite token stream.
pub struct Generation<S> {
    source: S,
    config: GenerationConfig,
    tokens: Vec<u32>,
    prompt_len: usize,
    produced: usize,
    state: GenerationState,
    rng: StdRng,
    context_lens: Vec<usize>,
}

impl<S: LogitsSource> Generation<S> {
    /// Prime a generation with a non-empty prompt.
    ///
    /// # Errors
    /// Returns [`ModelError::Configuration`] for an empty prompt or invalid settings.
    pub fn new(source: S, prompt: Vec<u32>, config: GenerationConfig) -> Result<Self> {
        config.validate()?;
        if prompt.is_empty() {
            return Err(ModelError::config("prompt must contain at least one token"));
        }
        if source.context_window() == 0 {
            return Err(ModelError::config("context window must be positive"));
        }

        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Self {
            source,
            prompt_len: prompt.len(),
            tokens: prompt,
            config,
            produced: 0,
            state: GenerationState::Primed,
            rng,
            context_lens: Vec::new(),
        })
    }

    #[must_use]
    pub fn state(&self) -> GenerationState {
        self.state
    }

    /// Prompt followed by everything sampled so far, including a final eos.
    #[must_use]
    pub fn tokens(&self) -> &[u32] {
        &self.tokens
    }

    /// Tokens sampled after the prompt.
    #[must_use]
    pub fn generated(&self) -> &[u32] {
        &self.tokens[self.prompt_len..]
    }

    /// Context length handed to the model at each step.
    #[must_use]
    pub fn context_len_history(&self) -> &[usize] {
        &self.context_lens
    }

    /// Stop before the next step. Takes effect between tokens only.
    pub fn cancel(&mut self) {
        self.state = GenerationState::Done;
    }

    /// Drain the iterator, returning the yielded tokens.
    ///
    /// # Errors
    /// Returns the first error raised by a step.
    pub fn collect_tokens(&mut self) -> Result<Vec<u32>> {
        self.by_ref().collect()
    }

    fn step(&mut self) -> Result<Option<u32>> {
        let window = self.source.context_window();
        let start = self.tokens.len().saturating_sub(window);
        let context = &self.tokens[start..];
        self.context_lens.push(context.len());

        let logits = self.source.next_token_logits(context)?;
        let next = sample_next(
            &logits,
            self.config.temperature,
            self.config.top_k,
            self.config.top_p,
            &mut self.rng,
        )?;
        self.tokens.push(next);
        self.produced += 1;

        if self.config.eos_id == Some(next) {
            log::debug!("eos after {} new tokens", self.produced);
            return Ok(None);
        }
        Ok(Some(next))
    }
}

impl<S: LogitsSource> Iterator for Generation<S> {
    type Item = Result<u32>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.state {
            GenerationState::Done => return None,
            GenerationState::Primed => self.state = GenerationState::Generating,
            GenerationState::Generating => {}
        }
        if self.produced >= self.config.max_new_tokens {
            self.state = GenerationState::Done;
            return None;
        }

        match self.step() {
            Ok(Some(token)) => Some(Ok(token)),
            Ok(None) => {
                self.state = GenerationState::Done;
                None
            }
            Err(e) => {
                self.state = GenerationState::Done;
                Some(Err(e))
            }
        }
    }
}

impl<S: LogitsSource> std::iter::FusedIterator for Generation<S> {}
