use std::path::PathBuf;

use clap::{Parser, Subcommand};
use jjline::Config;

/// Settings that override the config file.
#[derive(clap::Args, Debug)]
pub struct ConfigOverrides {
    /// jj executable to run.
    #[arg(long = "jj", value_name = "PATH", global = true)]
    pub executable: Option<String>,

    /// Hard limit for each jj invocation, in milliseconds.
    #[arg(long, global = true)]
    pub timeout_ms: Option<u64>,

    /// Quiet period after repository changes before re-querying, in milliseconds.
    #[arg(long, global = true)]
    pub debounce_ms: Option<u64>,
}

impl ConfigOverrides {
    pub fn apply(&self, config: &mut Config) {
        if let Some(ref executable) = self.executable {
            config.executable.clone_from(executable);
        }
        if let Some(timeout_ms) = self.timeout_ms {
            config.timeout_ms = timeout_ms;
        }
        if let Some(debounce_ms) = self.debounce_ms {
            config.debounce_ms = debounce_ms;
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "jjline",
    about = "Low-latency Jujutsu commit metadata for editors and status lines",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Config file. Default: $XDG_CONFIG_HOME/jjline/config.toml.
    #[arg(long, value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Log debug output to stderr (RUST_LOG takes precedence).
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(flatten)]
    pub overrides: ConfigOverrides,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Track files and print their commit on every change.
    ///
    /// Reads `attach`, `detach`, `rename`, `disable` and `enable` commands
    /// from stdin, one per line.
    Watch {
        /// Files to attach at startup.
        #[arg(value_name = "FILE")]
        files: Vec<PathBuf>,

        /// Print one JSON object per event.
        #[arg(long)]
        json: bool,
    },

    /// Print the current commit for a file once.
    Status {
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Print the full projection as JSON.
        #[arg(long)]
        json: bool,
    },
}
