mod data;
mod error;
mod generate;
mod lstm;
mod model;
mod store;
mod train;

use anyhow::Context;
use candle_core::Device;
use clap::{Parser, Subcommand};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::data::{read_sequences, ASCII_COUNT};
use crate::lstm::{Lstm, ModelConfig};
use crate::train::{CancelToken, TrainConfig};

#[derive(Parser)]
#[command(name = "char-rnn")]
#[command(about = "Character-level LSTM language model")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train on a directory of text files (ctrl+c to stop)
    Train {
        /// Directory of training files; dot-files are ignored
        #[arg(short, long)]
        data: PathBuf,
        /// Model file, resumed from when it already exists
        #[arg(short, long)]
        model: PathBuf,
        /// hidden neuron count
        #[arg(long, default_value = "512")]
        hidden: usize,
        /// LSTM layer count
        #[arg(long, default_value = "2")]
        layers: usize,
        /// step size
        #[arg(long, default_value = "0.001")]
        step: f64,
        /// SGD batch size
        #[arg(long, default_value = "32")]
        batch: usize,
        /// sample sort batch size
        #[arg(long, default_value = "128")]
        sortbatch: usize,
        #[arg(long)]
        max_iters: Option<usize>,
        #[arg(long, default_value = "0")]
        seed: u64,
    },

    /// Sample text from a trained model
    Generate {
        #[arg(short, long)]
        model: PathBuf,
        /// generated string length
        #[arg(long, default_value = "100")]
        length: usize,
        #[arg(long)]
        seed: Option<u64>,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let dev = Device::cuda_if_available(0)?;

    match cli.command {
        Commands::Train {
            data,
            model,
            hidden,
            layers,
            step,
            batch,
            sortbatch,
            max_iters,
            seed,
        } => {
            let training = TrainConfig {
                step_size: step,
                batch_size: batch,
                sort_batch_size: sortbatch,
                max_iterations: max_iters,
                seed,
            };
            let cfg = ModelConfig {
                hidden_size: hidden,
                layer_count: layers,
                vocab_size: ASCII_COUNT,
                training,
            };
            train(&data, &model, cfg, &dev)
        }
        Commands::Generate {
            model,
            length,
            seed,
        } => generate(&model, length, seed, &dev),
    }
}

fn train(data: &Path, model_path: &Path, cfg: ModelConfig, dev: &Device) -> anyhow::Result<()> {
    let mut model = if model_path.exists() {
        let bytes = store::load(model_path)?;
        let model = Lstm::from_bytes(&bytes, cfg.training, dev)
            .with_context(|| format!("loading {}", model_path.display()))?;
        info!(
            path = %model_path.display(),
            hidden = model.config().hidden_size,
            layers = model.config().layer_count,
            "resuming from saved model"
        );
        model
    } else {
        Lstm::new(cfg, dev)?
    };

    let samples = read_sequences(data)
        .with_context(|| format!("reading samples from {}", data.display()))?;
    info!(sequences = samples.len(), "loaded samples");

    let cancel = CancelToken::new();
    watch_interrupt(cancel.clone())?;
    model.train(&samples, &cancel, |_| {})?;

    store::save(model_path, &model.to_bytes()?)?;
    info!(
        path = %model_path.display(),
        format = model.serializer_type(),
        "saved {} model",
        model.name()
    );
    Ok(())
}

fn generate(model_path: &Path, length: usize, seed: Option<u64>, dev: &Device) -> anyhow::Result<()> {
    let bytes = store::load(model_path)?;
    let mut model = Lstm::from_bytes(&bytes, TrainConfig::default(), dev)
        .with_context(|| format!("loading {}", model_path.display()))?;
    let rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for ch in model.generate(length, rng)? {
        out.write_all(&[ch?])?;
    }
    writeln!(out)?;
    out.flush()?;
    Ok(())
}

/// First ctrl+c stops training after the in-flight batch; a second one aborts.
fn watch_interrupt(cancel: CancelToken) -> anyhow::Result<()> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("starting signal runtime")?;
    std::thread::spawn(move || {
        rt.block_on(async move {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            info!("interrupt received, stopping after the current batch");
            cancel.cancel();
            if tokio::signal::ctrl_c().await.is_ok() {
                std::process::exit(130);
            }
        })
    });
    Ok(())
}
