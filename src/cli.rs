//! CLI argument definitions using clap derive macros.

use clap::Parser;
use std::path::PathBuf;
use workshop_dl::Config;

/// Download Steam Workshop items with several isolated steamcmd instances.
///
/// IDs are read from any file that quotes them (usually a JSON export).
/// Items that fail are retried over several passes and written to the
/// failed-IDs file for the next run.
#[derive(Parser, Debug)]
#[command(name = "workshop-dl")]
#[command(author, version, about)]
pub struct Args {
    /// JSON configuration file; missing keys take their defaults
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// File containing the quoted workshop IDs
    #[arg(long, default_value = "ImportedSkins.json")]
    pub ids: PathBuf,

    /// Parallel steamcmd instances on the first pass (1-64)
    #[arg(short = 'n', long, value_parser = clap::value_parser!(u16).range(1..=64))]
    pub instances: Option<u16>,

    /// Skip items already in the shared destination (`--skip-existing=false` to disable)
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub skip_existing: Option<bool>,

    /// Only download IDs listed in the failed-IDs file from the last run
    #[arg(long)]
    pub only_failed: bool,

    /// Path to the steamcmd executable
    #[arg(long)]
    pub tool: Option<PathBuf>,

    /// Retry passes after the first pass (0-10)
    #[arg(short = 'r', long, value_parser = clap::value_parser!(u32).range(0..=10))]
    pub max_retry_passes: Option<u32>,

    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,
}

impl Args {
    /// Apply command-line overrides on top of the file configuration
    pub fn apply(&self, config: &mut Config) {
        if let Some(instances) = self.instances {
            config.run.max_instances = usize::from(instances);
        }
        if let Some(skip) = self.skip_existing {
            config.run.skip_existing = skip;
        }
        if self.only_failed {
            config.run.only_previously_failed = true;
        }
        if let Some(tool) = &self.tool {
            config.tool.steamcmd_path = Some(tool.clone());
        }
        if let Some(passes) = self.max_retry_passes {
            config.run.max_retry_passes = passes;
        }
    }

    /// Default log filter when RUST_LOG is unset
    pub fn default_log_level(&self) -> &'static str {
        if self.quiet {
            "error"
        } else {
            match self.verbose {
                0 => "info",
                1 => "debug",
                _ => "trace",
            }
        }
    }
}
