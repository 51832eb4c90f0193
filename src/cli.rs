use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "hamc", about = "Reconcile desired cluster resources against a live cluster")]
pub struct Cli {
    /// Path to the session file
    #[arg(short, long, default_value = "hamc.toml")]
    pub config: PathBuf,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Plain)]
    pub output: OutputFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(ValueEnum, Clone, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Plain,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Show the intents applying every changed resource would submit
    Plan {
        /// Live-state snapshot to diff against (defaults to cluster.snapshot)
        #[arg(long)]
        live: Option<PathBuf>,
    },

    /// Classify every resource as changed or unchanged
    Status {
        /// Live-state snapshot to diff against (defaults to cluster.snapshot)
        #[arg(long)]
        live: Option<PathBuf>,
    },

    /// List the resources a resource may share meta-attributes or operations with
    Refs {
        /// Registry key or cluster id
        resource: String,

        /// Live-state snapshot to load first (defaults to cluster.snapshot)
        #[arg(long)]
        live: Option<PathBuf>,
    },

    /// Load and validate the session file
    Check,
}
