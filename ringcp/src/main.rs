use anyhow::{Context, Result};
use clap::Parser;
use ringcp::{copy_file, EngineConfig, EngineError};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(name = "ringcp")]
struct Cli {
    /// File to copy
    source: PathBuf,
    /// Where to write the copy
    destination: PathBuf,
    /// TOML configuration file (defaults to $RINGCP_CONFIG)
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Number of registered buffers
    #[arg(long)]
    buffers: Option<u16>,
    /// Capacity of each buffer in bytes
    #[arg(long)]
    buffer_size: Option<u32>,
    /// Submission queue entries
    #[arg(long)]
    queue_depth: Option<u32>,
    /// Request a kernel submission polling thread
    #[arg(long)]
    sqpoll: bool,
    /// Keep destination bytes past the end of the copied data
    #[arg(long)]
    no_truncate: bool,
}

impl Cli {
    fn engine_config(&self) -> Result<EngineConfig> {
        let mut config = EngineConfig::load(self.config.as_deref())?;
        if let Some(buffers) = self.buffers {
            config.buffer_count = buffers;
        }
        if let Some(buffer_size) = self.buffer_size {
            config.buffer_size = buffer_size;
        }
        if let Some(queue_depth) = self.queue_depth {
            config.queue_depth = queue_depth;
        }
        if self.sqpoll {
            config.sqpoll = true;
        }
        if self.no_truncate {
            config.truncate_destination = false;
        }
        config.validate()?;
        Ok(config)
    }
}

fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ringcp=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(&cli) {
        error!("{:#}", e);
        let code = e
            .downcast_ref::<EngineError>()
            .map(EngineError::exit_code)
            .unwrap_or(1);
        std::process::exit(code);
    }
}

fn run(cli: &Cli) -> Result<()> {
    let config = cli
        .engine_config()
        .context("Failed to load configuration")?;

    let stats = copy_file(&cli.source, &cli.destination, &config)
        .with_context(|| format!("Failed to copy {:?} to {:?}", cli.source, cli.destination))?;

    info!("{}", stats);
    Ok(())
}
