use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "rkgc", version, about = "rk8s owner-reference garbage collector")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the garbage collector with config file
    Start {
        #[arg(short, long)]
        config: PathBuf,
        /// Overrides `garbage_collector.workers` from the config file
        #[arg(short, long)]
        workers: Option<usize>,
    },
    /// Print the resources the collector would monitor
    Resources {
        #[arg(short, long)]
        config: PathBuf,
    },
}
