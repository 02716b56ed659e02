use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::filter::Directive;

#[derive(Debug, Parser)]
#[command(about = "ERC-4626 vault discovery, classification and history", long_about = None)]
pub struct CliCmd {
    /// JSON-RPC endpoint of the chain to index
    #[arg(long, env = "JSON_RPC_URL", global = true)]
    pub rpc_url: Option<String>,

    /// directory holding the checkpoint, features and points files
    #[arg(long, env = "VAULT_DATA_DIR", default_value = "data", global = true)]
    pub data_dir: PathBuf,

    #[command(flatten)]
    pub limits: LimitArgs,

    #[command(subcommand)]
    pub command: Command,

    #[command(flatten)]
    pub log: LogArgs,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// scans deposit/withdraw logs and updates the lead checkpoint
    Scan {
        /// defaults to the block after the checkpoint, or 0
        #[arg(short, long)]
        start_block: Option<u64>,
        /// defaults to the current chain tip
        #[arg(short, long)]
        end_block: Option<u64>,
        /// addresses never promoted to detections
        #[arg(long, value_delimiter = ',')]
        deny: Vec<String>,
    },
    /// probes every candidate lead and stores its feature set
    Classify {
        /// defaults to the current chain tip
        #[arg(short, long)]
        block: Option<u64>,
    },
    /// samples classified vaults across a block range into the points file
    History {
        #[arg(short, long)]
        start_block: u64,
        /// defaults to the current chain tip
        #[arg(short, long)]
        end_block: Option<u64>,
        #[arg(long, default_value_t = 7200)]
        step: u64,
        /// points buffered before each write
        #[arg(long, default_value_t = 500)]
        insert_size: usize,
    },
}

/// Overrides for the limits guessed from the endpoint.
#[derive(Debug, Clone, Copy, Args)]
#[command(next_help_heading = "Provider")]
pub struct LimitArgs {
    #[arg(long, default_value_t = 8, global = true)]
    pub workers: usize,

    #[arg(long, global = true)]
    pub max_block_span: Option<u64>,

    #[arg(long, global = true)]
    pub max_calls_per_request: Option<usize>,

    /// per request, in seconds
    #[arg(long, global = true)]
    pub timeout: Option<u64>,
}

/// Log flags shared by every subcommand. `-v` and `-q` move the level up or
/// down from info.
#[derive(Debug, Copy, Clone, Args)]
#[command(next_help_heading = "Logging")]
pub struct LogArgs {
    /// -v debug, -vv trace
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// -q warnings, -qq errors, -qqq nothing
    #[arg(short, long, action = ArgAction::Count, global = true, conflicts_with = "verbose")]
    quiet: u8,

    /// leave event targets out of log lines
    #[arg(long, global = true)]
    pub hide_target: bool,
}

impl LogArgs {
    pub fn level(&self) -> LevelFilter {
        match i16::from(self.verbose) - i16::from(self.quiet) {
            i16::MIN..=-3 => LevelFilter::OFF,
            -2 => LevelFilter::ERROR,
            -1 => LevelFilter::WARN,
            0 => LevelFilter::INFO,
            1 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        }
    }

    /// Scopes the level to this crate; off silences everything.
    pub fn directive(&self) -> Directive {
        let level = self.level();
        if level == LevelFilter::OFF {
            return level.into();
        }
        format!("vault_ingest={level}")
            .parse()
            .unwrap_or_else(|_| level.into())
    }
}
