//! CLI argument parsing for gsg

use crate::config::Config;
use crate::error::Result;
use crate::retry::RetryConfig;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// gsg - copy, sync and lock objects across GCS, S3, R2 and local disk
#[derive(Parser, Debug)]
#[command(name = "gsg")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Commands,
}

/// Flags accepted by every command
#[derive(Args, Debug, Clone, Default)]
pub struct GlobalArgs {
    /// Run transfers on a multi-worker pool
    #[arg(short = 'm', long = "multi-thread", global = true)]
    pub multi_thread: bool,

    /// Workers per pool level with -m [default: 256]
    #[arg(short = 'c', long, global = true)]
    pub concurrency: Option<usize>,

    /// Download chunk size, e.g. 8M or 64MB [default: 16M]
    #[arg(long, global = true, value_name = "SIZE")]
    pub chunk_size: Option<String>,

    /// Increase logging verbosity (repeat for more)
    #[arg(id = "debug", long = "debug", action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Output logs as JSON
    #[arg(long, global = true)]
    pub json: bool,

    /// Show progress bars
    #[arg(long, global = true)]
    pub pretty: bool,

    /// Retry read-only commands up to N attempts
    #[arg(long, global = true, value_name = "N")]
    pub retries: Option<u32>,

    /// Configuration file path
    #[arg(long, global = true, env = "GSG_CONFIG")]
    pub config: Option<PathBuf>,
}

impl GlobalArgs {
    /// Load the config file and apply command-line overrides
    pub fn to_config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load_from(path)?,
            None => Config::load()?,
        };

        if self.multi_thread {
            config.multi_thread = true;
        }
        if let Some(concurrency) = self.concurrency {
            config.concurrency = concurrency;
        }
        if let Some(size) = &self.chunk_size {
            config.chunk_size = Config::parse_size(size)?;
        }
        if self.pretty {
            config.progress = true;
        }
        if let Some(attempts) = self.retries {
            config.retry.attempts = attempts;
        }
        Ok(config)
    }

    /// Retry policy for read-only commands: a single attempt unless
    /// `--retries` was given
    pub fn read_retry(&self, config: &Config) -> Result<RetryConfig> {
        match self.retries {
            Some(_) => config.retry.to_retry_config(),
            None => Ok(RetryConfig::once()),
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List objects and directories
    Ls(LsArgs),

    /// Show size, modification time and CRC32C of an object
    Stat(TargetArgs),

    /// Print the CRC32C of an object
    Hash(TargetArgs),

    /// Write an object to stdout
    Cat(TargetArgs),

    /// Copy objects or directories
    Cp(CopyArgs),

    /// Move objects or directories
    Mv(CopyArgs),

    /// Remove objects
    Rm(RmArgs),

    /// Show disk usage
    Du(DuArgs),

    /// Make a destination match a source
    Rsync(RsyncArgs),

    /// Acquire a distributed lock object
    Lock(LockArgs),

    /// Release a lock acquired with `lock`
    Unlock(TargetArgs),

    /// Show configuration
    Config(ConfigArgs),
}

impl Commands {
    /// True for commands that turn Ctrl+C into a cancellation instead of
    /// letting it end the process
    pub fn traps_interrupt(&self) -> bool {
        matches!(self, Commands::Lock(_))
    }
}

/// A single locator
#[derive(Args, Debug)]
pub struct TargetArgs {
    /// Local path or scheme://bucket/path
    pub target: String,
}

/// Arguments for the ls command
#[derive(Args, Debug)]
pub struct LsArgs {
    /// Local path or scheme://bucket/path
    pub target: String,

    /// List all levels below the target
    #[arg(short = 'r', long)]
    pub recursive: bool,
}

/// Arguments for the cp and mv commands
#[derive(Args, Debug)]
pub struct CopyArgs {
    /// Sources followed by the destination
    #[arg(required = true, num_args = 2..)]
    pub paths: Vec<String>,

    /// Copy directories
    #[arg(short = 'r', long)]
    pub recursive: bool,

    /// Verify CRC32C after each download
    #[arg(long)]
    pub checksum: bool,

    /// Print each copied object
    #[arg(short = 'v', long)]
    pub verbose: bool,
}

/// Arguments for the rm command
#[derive(Args, Debug)]
pub struct RmArgs {
    /// Local path or scheme://bucket/path
    pub target: String,

    /// Remove everything under a directory
    #[arg(short = 'r', long)]
    pub recursive: bool,
}

/// Arguments for the du command
#[derive(Args, Debug)]
pub struct DuArgs {
    /// Local path or scheme://bucket/path
    pub target: String,

    /// Print only the total
    #[arg(short = 's', long)]
    pub summarize: bool,

    /// Human-readable sizes
    #[arg(short = 'H', long = "human-readable")]
    pub human: bool,
}

/// Arguments for the rsync command
#[derive(Args, Debug)]
pub struct RsyncArgs {
    /// Source path or URI
    pub source: String,

    /// Destination path or URI
    pub destination: String,

    /// Descend into sub-directories
    #[arg(short = 'r', long)]
    pub recursive: bool,

    /// Delete extraneous objects from the destination
    #[arg(short = 'd', long)]
    pub delete: bool,

    /// Compare and verify CRC32C even when modification times match
    #[arg(long)]
    pub checksum: bool,

    /// Print each copied and deleted object
    #[arg(short = 'v', long)]
    pub verbose: bool,
}

/// Arguments for the lock command
#[derive(Args, Debug)]
pub struct LockArgs {
    /// Lock object path
    pub target: String,

    /// Seconds after which an unreleased lock may be reclaimed
    pub ttl: Option<u64>,
}

/// Arguments for the config command
#[derive(Args, Debug)]
pub struct ConfigArgs {
    /// Show the configuration file path
    #[arg(long)]
    pub path: bool,

    /// Create default configuration file
    #[arg(long)]
    pub init: bool,
}
