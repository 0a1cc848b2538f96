use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand};
use hotloop_core::{read_definitions, AppConfig, LoopRegistry, ReloadFailurePolicy, Runtime};
use tracing_subscriber::EnvFilter;

fn main() -> hotloop_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => run_live(args),
        Commands::Check { definitions } => run_check(&definitions),
    }
}

fn run_live(args: RunArgs) -> hotloop_core::Result<()> {
    let config = args.resolve_config()?;
    tracing::info!(definitions = %args.definitions.display(), "starting live session");

    let runtime = Runtime::boot(&config, &args.definitions)?;
    let registry = runtime.registry().clone();
    runtime.run_until(|| {
        wait_for_interrupt()?;
        tracing::info!("interrupt received");
        log_status(&registry);
        Ok(())
    })
}

fn run_check(definitions: &Path) -> hotloop_core::Result<()> {
    let parsed = read_definitions(definitions)?;
    println!("{}", serde_json::to_string_pretty(&parsed)?);
    tracing::info!(loops = parsed.loops.len(), "definitions are valid");
    Ok(())
}

fn wait_for_interrupt() -> hotloop_core::Result<()> {
    let signals = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    signals.block_on(tokio::signal::ctrl_c())?;
    Ok(())
}

fn log_status(registry: &LoopRegistry) {
    match registry.snapshot() {
        Ok(statuses) => {
            for status in statuses {
                tracing::info!(
                    loop_name = %status.name,
                    running = status.running,
                    ticks = status.ticks,
                    failures = status.failures,
                    "loop summary"
                );
            }
        }
        Err(err) => tracing::warn!(error = %err, "could not read loop status"),
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Live-coding loop sequencer", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Play the loops in a definition file, reloading it whenever it changes.
    Run(RunArgs),
    /// Validate a definition file and print the parsed loops as JSON.
    Check {
        /// Path to the JSON definition file.
        definitions: PathBuf,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Path to the JSON definition file to watch.
    definitions: PathBuf,
    /// Optional JSON configuration file; flags below override it.
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Initial tempo in beats per minute.
    #[arg(long)]
    bpm: Option<f64>,
    /// How often to check the definition file for changes, in milliseconds.
    #[arg(long)]
    poll_ms: Option<u64>,
    /// Keep the previous loops playing when a reload fails instead of going silent.
    #[arg(long)]
    keep_on_error: bool,
    #[arg(long)]
    sample_rate: Option<u32>,
    #[arg(long)]
    buffer_size: Option<usize>,
    #[arg(long)]
    channels: Option<u16>,
    /// Open the audio device for input as well as output.
    #[arg(long)]
    duplex: bool,
}

impl RunArgs {
    fn resolve_config(&self) -> hotloop_core::Result<AppConfig> {
        let mut config = match &self.config {
            Some(path) => AppConfig::load(path)?,
            None => AppConfig::default(),
        };

        if let Some(bpm) = self.bpm {
            config.transport.bpm = bpm;
        }
        if let Some(poll_ms) = self.poll_ms {
            config.reload.poll_interval_ms = poll_ms;
        }
        if self.keep_on_error {
            config.reload.on_failure = ReloadFailurePolicy::KeepPrevious;
        }
        if let Some(sample_rate) = self.sample_rate {
            config.audio.sample_rate = sample_rate;
        }
        if let Some(buffer_size) = self.buffer_size {
            config.audio.buffer_size = buffer_size;
        }
        if let Some(channels) = self.channels {
            config.audio.channels = channels;
        }
        if self.duplex {
            config.audio.duplex = true;
        }

        config.validate()?;
        Ok(config)
    }
}
