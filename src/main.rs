//! tiny-lm CLI
//!
//! Train a small transformer on text or source/target pairs, then sample from
//! a checkpoint.

use std::io::{self, Write};
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use candle_core::Device;
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;

use tiny_lm::inference::GenerationConfig;
use tiny_lm::model::{Architecture, ModelConfig, ModelHead};
use tiny_lm::tokenizer::{ByteTokenizer, DecodeStream, HfTokenizer, SpecialTokens, Tokenizer};
use tiny_lm::training::dataset::{load_pairs, load_texts};
use tiny_lm::training::{
    AdamWConfig, FanOut, JsonlSink, LogSink, MonitorPrompt, MonitorSink, PairDataset, TextDataset,
    Trainer, TrainerConfig, checkpoint,
};

/// Output format for generated text.
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum OutputFormat {
    /// Plain text output
    #[default]
    Plain,
    /// JSON with metadata
    Json,
}

#[derive(Debug, Parser)]
#[command(
    name = "tiny-lm",
    version,
    about = "Train and sample small transformer language models"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Train a model, resuming if the checkpoint directory already holds one
    Train(TrainArgs),
    /// Sample a continuation from a checkpoint
    Generate(GenerateArgs),
    /// Print a preset or checkpoint configuration
    Info(InfoArgs),
}

#[derive(Debug, Args)]
struct TrainArgs {
    /// Training data: .txt, or .jsonl with "text" (or "source"/"target" with --pairs)
    #[arg(long)]
    data_src: PathBuf,

    /// Model preset: tiny, small, alibi or seq2seq
    #[arg(long, default_value = "small")]
    preset: String,

    /// Treat the data as source/target pairs (encoder-decoder presets)
    #[arg(long)]
    pairs: bool,

    #[arg(long, default_value = "8")]
    batch: usize,

    #[arg(long, default_value = "3e-4")]
    lr: f64,

    #[arg(long, default_value = "0.1")]
    weight_decay: f64,

    #[arg(long, default_value = "1")]
    epochs: usize,

    /// Checkpoint directory, written after every epoch
    #[arg(long, default_value = "checkpoints")]
    checkpoint: PathBuf,

    /// Log metrics and a sample every N steps
    #[arg(long, default_value = "50")]
    sample_every: usize,

    /// Text completed at every sampling step
    #[arg(long, default_value = "The")]
    prompt: String,

    /// Seed for initialization and shuffling
    #[arg(long, default_value = "42")]
    seed: u64,

    #[command(flatten)]
    tokenizer: TokenizerArgs,

    /// Append metrics and samples as JSON lines to this file
    #[arg(long)]
    log_jsonl: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct GenerateArgs {
    /// Prompt text; for encoder-decoder checkpoints a prefix of the target
    #[arg(index = 1, default_value = "")]
    prompt: String,

    /// Source text for encoder-decoder checkpoints
    #[arg(long)]
    source: Option<String>,

    #[arg(long, default_value = "checkpoints")]
    checkpoint: PathBuf,

    #[arg(long, default_value = "100")]
    max_new_tokens: usize,

    /// Sampling temperature (0 = greedy)
    #[arg(short, long, default_value = "0.9")]
    temperature: f32,

    /// Top-k sampling; takes precedence over top-p when set
    #[arg(long)]
    top_k: Option<usize>,

    /// Top-p (nucleus) sampling (1 = disabled)
    #[arg(long, default_value = "0.95")]
    top_p: f32,

    /// Random seed for reproducible generation
    #[arg(long)]
    seed: Option<u64>,

    #[command(flatten)]
    tokenizer: TokenizerArgs,

    #[arg(long, value_enum, default_value = "plain")]
    format: OutputFormat,
}

#[derive(Debug, Args)]
struct TokenizerArgs {
    /// Hugging Face tokenizer.json; byte-level tokenization otherwise
    #[arg(long)]
    tokenizer: Option<PathBuf>,

    #[arg(long, default_value = tiny_lm::tokenizer::hf::DEFAULT_EOS)]
    eos_token: String,

    /// Falls back to the eos token when missing from the vocabulary
    #[arg(long, default_value = tiny_lm::tokenizer::hf::DEFAULT_SOS)]
    sos_token: String,

    /// Falls back to the eos token when missing from the vocabulary
    #[arg(long, default_value = tiny_lm::tokenizer::hf::DEFAULT_EOS)]
    pad_token: String,
}

#[derive(Debug, Args)]
struct InfoArgs {
    /// Checkpoint directory; shows the preset when omitted
    #[arg(long)]
    checkpoint: Option<PathBuf>,

    #[arg(long, default_value = "small")]
    preset: String,
}

#[derive(Debug, Serialize)]
struct JsonOutput<'a> {
    prompt: &'a str,
    text: String,
    tokens: Vec<u32>,
    generation_time_ms: u64,
    seed: Option<u64>,
    temperature: f32,
    top_k: Option<usize>,
    top_p: f32,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    match cli.command {
        Command::Train(args) => train(&args),
        Command::Generate(args) => generate(&args),
        Command::Info(args) => info(&args),
    }
}

fn load_tokenizer(args: &TokenizerArgs) -> Result<Box<dyn Tokenizer>> {
    match &args.tokenizer {
        Some(path) => {
            log::info!("loading tokenizer from {}", path.display());
            let special = SpecialTokens {
                pad: args.pad_token.clone(),
                eos: args.eos_token.clone(),
                sos: args.sos_token.clone(),
            };
            let tok = HfTokenizer::from_file(path, &special).context("Failed to load tokenizer")?;
            Ok(Box::new(tok))
        }
        None => Ok(Box::new(ByteTokenizer::new())),
    }
}

/// Align the model vocabulary and special ids with the tokenizer.
fn fit_to_tokenizer(mut config: ModelConfig, tok: &dyn Tokenizer) -> ModelConfig {
    config.vocab_size = tok.vocab_size();
    config.pad_token_id = tok.pad_id();
    config.eos_token_id = tok.eos_id();
    config.sos_token_id = tok.sos_id();
    config
}

fn train(args: &TrainArgs) -> Result<()> {
    let device = Device::Cpu;
    let tok = load_tokenizer(&args.tokenizer)?;

    let trainer_config = TrainerConfig {
        epochs: args.epochs,
        sample_every: args.sample_every,
        checkpoint_dir: Some(args.checkpoint.clone()),
        monitor: None,
        generation: GenerationConfig {
            max_new_tokens: 20,
            seed: Some(args.seed),
            ..GenerationConfig::default()
        },
    };

    let mut trainer = if checkpoint::exists(&args.checkpoint) {
        log::info!("resuming from {}", args.checkpoint.display());
        Trainer::resume(&args.checkpoint, &device, trainer_config)?
    } else {
        let config = fit_to_tokenizer(ModelConfig::preset(&args.preset)?, tok.as_ref());
        let model = ModelHead::seeded(config, args.seed, &device)?;
        let optimizer = AdamWConfig {
            lr: args.lr,
            weight_decay: args.weight_decay,
            ..AdamWConfig::default()
        };
        Trainer::new(model, optimizer, trainer_config)?
    };

    let model_config = trainer.model().config().clone();
    if model_config.vocab_size != tok.vocab_size() {
        anyhow::bail!(
            "checkpoint vocabulary ({}) does not match the tokenizer ({})",
            model_config.vocab_size,
            tok.vocab_size()
        );
    }
    let monitor = MonitorPrompt::encode(&args.prompt, trainer.model(), tok.as_ref())?;
    trainer = trainer.with_tokenizer(tok.as_ref()).with_monitor(monitor);

    let mut sinks: Vec<Box<dyn MonitorSink>> = vec![Box::new(LogSink)];
    if let Some(path) = &args.log_jsonl {
        sinks.push(Box::new(
            JsonlSink::create(path).with_context(|| format!("open {}", path.display()))?,
        ));
    }
    let mut sink = FanOut::new(sinks);

    let start = Instant::now();
    let summaries = if args.pairs || model_config.architecture == Architecture::EncoderDecoder {
        let pairs = load_pairs(&args.data_src)?;
        let data = PairDataset::from_pairs(&pairs, tok.as_ref(), model_config.block_size)?;
        log::info!("{} training pairs", data.len());
        trainer.fit(
            |epoch| data.batches(args.batch, Some(args.seed + epoch as u64), &device),
            &mut sink,
        )?
    } else {
        let texts = load_texts(&args.data_src)?;
        let data = TextDataset::from_texts(&texts, tok.as_ref(), model_config.block_size)?;
        log::info!("{} training windows", data.len());
        trainer.fit(
            |epoch| data.batches(args.batch, Some(args.seed + epoch as u64), &device),
            &mut sink,
        )?
    };

    if summaries.is_empty() {
        log::info!("nothing to do: checkpoint already at epoch {}", trainer.epoch());
    }
    log::info!(
        "training finished in {:.1}s at step {}",
        start.elapsed().as_secs_f64(),
        trainer.global_step()
    );
    Ok(())
}

fn generate(args: &GenerateArgs) -> Result<()> {
    let device = Device::Cpu;
    let tok = load_tokenizer(&args.tokenizer)?;
    let (model, meta) = checkpoint::load_model(&args.checkpoint, &device)?;
    log::debug!(
        "loaded checkpoint at epoch {} step {}",
        meta.epoch,
        meta.global_step
    );

    let mut prompt = vec![tok.sos_id()];
    prompt.extend(tok.encode(&args.prompt)?);
    let source = match (model.config().architecture, &args.source) {
        (Architecture::DecoderOnly, Some(_)) => {
            log::warn!("--source is ignored by decoder-only checkpoints");
            None
        }
        (Architecture::DecoderOnly, None) => None,
        (Architecture::EncoderDecoder, Some(text)) => Some(tok.encode(text)?),
        (Architecture::EncoderDecoder, None) => {
            anyhow::bail!("encoder-decoder checkpoints need --source")
        }
    };

    let config = GenerationConfig {
        max_new_tokens: args.max_new_tokens,
        temperature: args.temperature,
        top_p: args.top_p,
        top_k: args.top_k,
        eos_id: None,
        seed: args.seed,
    };

    let start = Instant::now();
    let generation = model.generate(prompt, source.as_deref(), config)?;
    match args.format {
        OutputFormat::Plain => {
            let mut stdout = io::stdout();
            let mut stream = DecodeStream::new(tok.as_ref());
            print!("{}", args.prompt);
            for token in generation {
                if let Some(text) = stream.push(token?)? {
                    print!("{text}");
                    stdout.flush()?;
                }
            }
            println!("{}", stream.finish()?);
        }
        OutputFormat::Json => {
            let tokens = generation.collect::<tiny_lm::Result<Vec<u32>>>()?;
            let payload = JsonOutput {
                prompt: &args.prompt,
                text: tok.decode(&tokens)?,
                tokens,
                generation_time_ms: start.elapsed().as_millis().try_into().unwrap_or(u64::MAX),
                seed: args.seed,
                temperature: args.temperature,
                top_k: args.top_k,
                top_p: args.top_p,
            };
            println!("{}", serde_json::to_string_pretty(&payload)?);
        }
    }
    Ok(())
}

fn info(args: &InfoArgs) -> Result<()> {
    let (config, source) = match &args.checkpoint {
        Some(dir) => {
            let meta = checkpoint::read_meta(dir)?;
            println!("Checkpoint: {}", dir.display());
            println!("  Epoch:       {}", meta.epoch);
            println!("  Global step: {}", meta.global_step);
            println!("  Optimizer:   lr={} weight_decay={}", meta.optimizer.lr, meta.optimizer.weight_decay);
            println!();
            (meta.config, "checkpoint")
        }
        None => (ModelConfig::preset(&args.preset)?, args.preset.as_str()),
    };
    config.validate()?;

    println!("Model configuration ({source}):");
    println!("  Architecture:    {:?}", config.architecture);
    println!("  Positions:       {:?}", config.positional);
    println!("  Vocabulary size: {} tokens", config.vocab_size);
    println!("  Context length:  {} tokens", config.block_size);
    println!("  Layers:          {}", config.n_layer);
    println!("  Attention heads: {}", config.n_head);
    println!("  Embedding dim:   {}", config.n_embd);
    println!(
        "  Special ids:     pad={} eos={} sos={}",
        config.pad_token_id, config.eos_token_id, config.sos_token_id
    );

    let model = ModelHead::seeded(config, 0, &Device::Cpu)?;
    println!("  Parameters:      {}", model.num_parameters());
    Ok(())
}
