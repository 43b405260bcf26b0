use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::commit::CommitSummary;
use crate::config::Config;
use crate::pipeline::resolution_dir;
use crate::process::{self, Invocation};
use crate::registry::Projection;

/// Print the current commit for `file` once, without watching.
///
/// Uses the blocking process mode; nothing else runs while it waits.
pub fn status(config: &Config, file: &Path, json: bool, writer: &mut impl Write) -> Result<()> {
    let lookup = Invocation::new(&config.executable, resolution_dir(file), config.timeout())
        .args(config.root_args());
    let root = process::run_blocking(&lookup)
        .check(&lookup.command_line())
        .with_context(|| format!("{} is not in a jj repository", file.display()))?;
    let root = PathBuf::from(root.stdout.trim());

    let query = Invocation::new(&config.executable, root, config.timeout())
        .args(config.query_args());
    let output = process::run_blocking(&query)
        .check(&format!("{} log", config.executable))
        .context("commit query failed")?;
    let summary =
        CommitSummary::parse(&output.stdout).context("unreadable commit query output")?;

    let projection = Projection::new(&summary);
    if json {
        serde_json::to_writer(&mut *writer, &projection)?;
        writeln!(writer)?;
    } else {
        writeln!(writer, "{}", projection.display)?;
    }
    Ok(())
}
