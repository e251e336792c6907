use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "strata",
    about = "Strata: versioned entity-attribute-value store",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// SQLite database file. Without it the store lives in memory.
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    /// TOML file with store settings.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Truncate the store before running.
    #[arg(long, global = true)]
    pub reset: bool,

    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Command {
    /// Write an attribute in two slices and read it back from each
    Slices,
    /// Walk through a cached repository across slices
    Cache(CacheArgs),
    /// List stored slices with their lineage
    Info,
}

#[derive(clap::Args)]
pub struct CacheArgs {
    /// Number of people to create
    #[arg(long, default_value_t = 3)]
    pub people: u32,
}
