//! Small transformer language models.
//!
//! - [`model`]: decoder-only and encoder-decoder architectures behind [`ModelHead`]
//! - [`inference`]: temperature / top-k / top-p sampling and lazy generation
//! - [`training`]: AdamW, datasets, checkpoints and the epoch loop
//! - [`tokenizer`]: the text <-> id boundary

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod inference;
pub mod model;
pub mod tokenizer;
pub mod training;

pub use error::{ModelError, Result};
pub use inference::{Generation, GenerationConfig, LogitsSource};
pub use model::{Batch, ModelConfig, ModelHead, ModelOutput};
