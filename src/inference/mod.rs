pub mod generate;
pub mod sampling;

pub use generate::{Generation, GenerationConfig, GenerationState, LogitsSource};
pub use sampling::sample_next;
