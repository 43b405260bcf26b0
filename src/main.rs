mod cli;

use anyhow::Result;
use clap::Parser;
use jjline::{commands, config};
use tokio::io::BufReader;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Command};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut config = match cli.config.clone().or_else(config::default_path) {
        Some(path) => config::load(&path)?,
        None => config::Config::default(),
    };
    cli.overrides.apply(&mut config);

    match cli.command {
        Command::Watch { files, json } => {
            commands::watch::watch(
                config,
                commands::watch::WatchOptions { files, json },
                BufReader::new(tokio::io::stdin()),
                std::io::stdout(),
            )
            .await?;
        }
        Command::Status { file, json } => {
            commands::status::status(&config, &file, json, &mut std::io::stdout())?;
        }
    }

    Ok(())
}

/// Log to stderr so stdout stays a clean line protocol.
fn init_tracing(verbose: bool) {
    let default = if verbose { "jjline=debug" } else { "jjline=warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
