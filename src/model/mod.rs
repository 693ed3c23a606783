pub mod attention;
pub mod config;
pub mod embedding;
pub mod head;
pub mod layers;
pub mod loss;
pub mod mask;
pub mod params;
pub mod position;
pub mod seq2seq;
pub mod transformer;

// Re-exports for convenience
pub use attention::MultiHeadAttention;
pub use config::{Architecture, ModelConfig, PositionalKind};
pub use embedding::TokenEmbedding;
pub use head::{Batch, ModelHead, ModelOutput};
pub use layers::{BlockInputs, LayerNorm, MLP, TransformerBlock};
pub use loss::{IGNORE_INDEX, labels_from_targets, shifted_cross_entropy};
pub use mask::MASK_VALUE;
pub use params::{ParamStore, WeightDecay};
pub use position::{Alibi, LearnedPositions, PositionalBias};
pub use seq2seq::{ConditionedDecoder, EncodedSource, EncoderDecoder};
pub use transformer::DecoderOnly;
