use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// diffusion-lora: LoRA training setup for latent diffusion models
#[derive(Parser, Debug)]
#[command(name = "diffusion-lora")]
#[command(about = "LoRA training setup for latent diffusion models")]
#[command(version)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand
    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Write a default training configuration
    InitConfig(InitConfigArgs),

    /// Show parameter groups and device placement for a configuration
    Plan(PlanArgs),

    /// Run setup and a number of simulated optimizer steps on a small random model
    Simulate(SimulateArgs),
}

/// Arguments for `init-config`
#[derive(Parser, Debug)]
pub struct InitConfigArgs {
    /// Output file
    #[arg(short, long, default_value = "train_config.json")]
    pub output: PathBuf,

    /// Overwrite an existing file
    #[arg(long)]
    pub force: bool,
}

/// Arguments for `plan`
#[derive(Parser, Debug)]
pub struct PlanArgs {
    /// Training configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Write the plan as JSON to this file
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

/// Arguments for `simulate`
#[derive(Parser, Debug)]
pub struct SimulateArgs {
    /// Training configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Output directory for metrics
    #[arg(short, long, default_value = "./output")]
    pub output: PathBuf,

    /// Number of epochs
    #[arg(short, long, default_value = "3")]
    pub epochs: usize,

    /// Optimizer steps per epoch
    #[arg(short, long, default_value = "10")]
    pub steps_per_epoch: usize,

    /// Report learning rates every N steps
    #[arg(long, default_value = "5")]
    pub report_every: usize,

    /// Tokenizer JSON file, the built-in word vocabulary otherwise
    #[arg(long)]
    pub tokenizer: Option<PathBuf>,

    /// Random seed
    #[arg(long, default_value = "42")]
    pub seed: u64,
}

/// Parse CLI arguments
pub fn parse_args() -> Cli {
    Cli::parse()
}

/// Setup logging based on verbosity
pub fn setup_logging(verbose: bool) {
    let filter = if verbose { "debug" } else { "info" };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}
