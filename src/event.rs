use std::path::PathBuf;

use serde::Serialize;
use tokio::sync::oneshot;

use crate::process::Output;
use crate::registry::{ConsumerId, Projection};

/// Unified event consumed by the pipeline's dispatch loop.
///
/// Host commands, filesystem notifications, timer expiry and process
/// completions all arrive here, so handlers never interleave.
#[derive(Debug)]
pub enum PipelineEvent {
    /// A consumer became interested in `path`.
    Attach { id: ConsumerId, path: PathBuf },
    /// A consumer is gone.
    Detach { id: ConsumerId },
    /// The consumer's file moved; re-resolve from scratch.
    Rename { id: ConsumerId, path: PathBuf },
    /// Administrative disable/enable of a consumer id.
    SetDisabled { id: ConsumerId, disabled: bool },
    /// Worktree-root resolution finished for the attach with this epoch.
    Resolved {
        id: ConsumerId,
        epoch: u64,
        output: Output,
    },
    /// Raw filesystem activity in a watched repository.
    FsChanged { repo: PathBuf, paths: Vec<PathBuf> },
    /// A repository's debounce timer expired.
    DebounceElapsed { repo: PathBuf, generation: u64 },
    /// A commit query finished for `root`.
    Queried { root: PathBuf, output: Output },
    /// Read the current projection of a consumer.
    Snapshot {
        id: ConsumerId,
        reply: oneshot::Sender<Option<Projection>>,
    },
    /// List repositories that currently have a live watch.
    WatchedRepos { reply: oneshot::Sender<Vec<PathBuf>> },
    /// Stop the dispatch loop.
    Shutdown,
}

/// Event published to consumers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ConsumerEvent {
    /// New commit data for one consumer.
    Updated { id: ConsumerId, projection: Projection },
    /// The consumer has no data (detached or outside any repository).
    Cleared { id: ConsumerId },
    /// A fan-out finished; displays should redraw.
    Refresh,
}
