pub mod checkpoint;
pub mod dataset;
pub mod monitor;
pub mod optimizer;
pub mod trainer;

pub use checkpoint::CheckpointMeta;
pub use dataset::{PairDataset, TextDataset};
pub use monitor::{FanOut, JsonlSink, LogSink, MonitorSink};
pub use optimizer::{AdamW, AdamWConfig};
pub use trainer::{EpochSummary, MonitorPrompt, Trainer, TrainerConfig};
