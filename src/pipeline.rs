//! The attach → resolve → watch → query → fan-out loop.
//!
//! `Pipeline` owns the consumer registry and the repository watchers and is
//! driven by a single `mpsc` channel of `PipelineEvent`s. Hosts talk to it
//! through a cloneable `PipelineHandle`. Process completions and debounce
//! timers run as separate tasks whose only effect is to send an event back,
//! so all state changes happen one event at a time inside `run`.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};

use crate::commit::CommitSummary;
use crate::config::Config;
use crate::event::{ConsumerEvent, PipelineEvent};
use crate::process::{self, Invocation, Output, ProcessError};
use crate::registry::{ConsumerId, ConsumerState, EntryUpdate, Projection, Registry};
use crate::watcher::WatcherSet;

/// Buffered consumer events per subscriber before it starts lagging.
const EVENT_CAPACITY: usize = 256;

pub struct Pipeline {
    config: Config,
    registry: Registry,
    watchers: WatcherSet,
    tx: mpsc::UnboundedSender<PipelineEvent>,
    rx: mpsc::UnboundedReceiver<PipelineEvent>,
}

/// Host-side entry point into a running `Pipeline`.
#[derive(Clone)]
pub struct PipelineHandle {
    tx: mpsc::UnboundedSender<PipelineEvent>,
    events: broadcast::Sender<ConsumerEvent>,
}

impl Pipeline {
    pub fn new(config: Config) -> (Self, PipelineHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let watchers = WatcherSet::new(config.debounce(), config.watch_subdir.clone(), tx.clone());
        let registry = Registry::new(events.clone());
        let handle = PipelineHandle {
            tx: tx.clone(),
            events,
        };
        (
            Self {
                config,
                registry,
                watchers,
                tx,
                rx,
            },
            handle,
        )
    }

    /// Dispatch events until `Shutdown` arrives.
    pub async fn run(mut self) {
        while let Some(event) = self.rx.recv().await {
            if matches!(event, PipelineEvent::Shutdown) {
                break;
            }
            self.handle(event);
        }
        tracing::debug!("pipeline stopped");
    }

    pub fn handle(&mut self, event: PipelineEvent) {
        match event {
            PipelineEvent::Attach { id, path } => self.attach(id, path),
            PipelineEvent::Detach { id } => self.detach(id),
            PipelineEvent::Rename { id, path } => {
                // The new path may live in another repository entirely.
                self.detach(id);
                self.attach(id, path);
            }
            PipelineEvent::SetDisabled { id, disabled } => {
                self.registry.set_disabled(id, disabled);
                if disabled {
                    self.detach(id);
                }
            }
            PipelineEvent::Resolved { id, epoch, output } => self.on_resolved(id, epoch, output),
            PipelineEvent::FsChanged { repo, paths } => {
                self.watchers.on_fs_event(&repo, &paths);
            }
            PipelineEvent::DebounceElapsed { repo, generation } => {
                self.on_debounce(&repo, generation);
            }
            PipelineEvent::Queried { root, output } => self.on_queried(&root, output),
            PipelineEvent::Snapshot { id, reply } => {
                let _ = reply.send(self.registry.projection(id));
            }
            PipelineEvent::WatchedRepos { reply } => {
                let _ = reply.send(self.watchers.repos());
            }
            PipelineEvent::Shutdown => {}
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn watchers(&self) -> &WatcherSet {
        &self.watchers
    }

    fn attach(&mut self, id: ConsumerId, path: PathBuf) {
        let cwd = resolution_dir(&path);
        let Some(epoch) = self.registry.attach(id, path) else {
            tracing::debug!(consumer = %id, "already attached or disabled");
            return;
        };

        let invocation = Invocation::new(&self.config.executable, cwd, self.config.timeout())
            .args(self.config.root_args());
        let tx = self.tx.clone();
        process::spawn(invocation, move |output| {
            let _ = tx.send(PipelineEvent::Resolved { id, epoch, output });
        });
    }

    fn detach(&mut self, id: ConsumerId) {
        if self.registry.detach(id, &mut self.watchers).is_some() {
            tracing::debug!(consumer = %id, "detached");
        }
    }

    fn on_resolved(&mut self, id: ConsumerId, epoch: u64, output: Output) {
        if self.registry.get(id).is_none_or(|e| e.epoch != epoch) {
            tracing::debug!(consumer = %id, "discarding root lookup for a previous attach");
            return;
        }

        let command = format!("{} root", self.config.executable);
        let root = match output.check(&command) {
            Ok(output) if !output.stdout.trim().is_empty() => {
                PathBuf::from(output.stdout.trim())
            }
            Ok(_) => {
                tracing::warn!(consumer = %id, "{command} printed nothing");
                self.registry.clear(id);
                return;
            }
            Err(e @ ProcessError::TimedOut { .. }) => {
                tracing::warn!(consumer = %id, error = %e, "root lookup timed out");
                self.registry.clear(id);
                return;
            }
            Err(e) => {
                tracing::debug!(consumer = %id, error = %e, "not in a repository");
                self.registry.clear(id);
                return;
            }
        };

        let repo = repo_dir(&root);
        tracing::debug!(
            consumer = %id,
            root = %root.display(),
            repo = %repo.display(),
            "resolved repository"
        );
        self.registry.update(
            id,
            EntryUpdate {
                repo: Some(repo.clone()),
                root: Some(root.clone()),
                state: Some(ConsumerState::Watching),
                ..EntryUpdate::default()
            },
        );
        self.watchers.register(&repo, id);
        self.spawn_query(root);
    }

    fn on_debounce(&mut self, repo: &Path, generation: u64) {
        let Some(members) = self.watchers.take_fire(repo, generation) else {
            return;
        };
        // One query per distinct root, however many consumers share it.
        let roots: BTreeSet<PathBuf> = members
            .iter()
            .filter_map(|id| self.registry.get(*id)?.root.clone())
            .collect();
        tracing::debug!(repo = %repo.display(), roots = roots.len(), "repository changed");
        for root in roots {
            self.spawn_query(root);
        }
    }

    fn spawn_query(&self, root: PathBuf) {
        let invocation = Invocation::new(&self.config.executable, root.clone(), self.config.timeout())
            .args(self.config.query_args());
        let tx = self.tx.clone();
        process::spawn(invocation, move |output| {
            let _ = tx.send(PipelineEvent::Queried { root, output });
        });
    }

    fn on_queried(&mut self, root: &Path, output: Output) {
        let command = format!("{} log", self.config.executable);
        let output = match output.check(&command) {
            Ok(output) => output,
            Err(e) => {
                tracing::warn!(root = %root.display(), error = %e, "commit query failed; keeping previous data");
                return;
            }
        };
        let summary = match CommitSummary::parse(&output.stdout) {
            Ok(summary) => Arc::new(summary),
            Err(e) => {
                tracing::warn!(root = %root.display(), error = %e, "unreadable commit query output; keeping previous data");
                return;
            }
        };

        let consumers = self.registry.sharing_root(root);
        if consumers.is_empty() {
            tracing::debug!(root = %root.display(), "no consumers left for query result");
            return;
        }
        for id in consumers {
            self.registry.update(
                id,
                EntryUpdate {
                    summary: Some(Arc::clone(&summary)),
                    ..EntryUpdate::default()
                },
            );
        }
        self.registry.request_refresh();
    }
}

impl PipelineHandle {
    pub fn attach(&self, id: ConsumerId, path: impl Into<PathBuf>) {
        self.send(PipelineEvent::Attach {
            id,
            path: path.into(),
        });
    }

    pub fn detach(&self, id: ConsumerId) {
        self.send(PipelineEvent::Detach { id });
    }

    pub fn rename(&self, id: ConsumerId, path: impl Into<PathBuf>) {
        self.send(PipelineEvent::Rename {
            id,
            path: path.into(),
        });
    }

    pub fn set_disabled(&self, id: ConsumerId, disabled: bool) {
        self.send(PipelineEvent::SetDisabled { id, disabled });
    }

    pub fn shutdown(&self) {
        self.send(PipelineEvent::Shutdown);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConsumerEvent> {
        self.events.subscribe()
    }

    /// Current projection for `id`, or `None` if it has no commit data.
    pub async fn projection(&self, id: ConsumerId) -> Option<Projection> {
        let (reply, rx) = oneshot::channel();
        self.send(PipelineEvent::Snapshot { id, reply });
        rx.await.ok().flatten()
    }

    /// Repositories with a live watch.
    pub async fn watched_repos(&self) -> Vec<PathBuf> {
        let (reply, rx) = oneshot::channel();
        self.send(PipelineEvent::WatchedRepos { reply });
        rx.await.unwrap_or_default()
    }

    fn send(&self, event: PipelineEvent) {
        if self.tx.send(event).is_err() {
            tracing::debug!("pipeline is not running");
        }
    }
}

/// Directory the root lookup runs in for a consumer's file.
pub(crate) fn resolution_dir(path: &Path) -> PathBuf {
    if path.is_dir() {
        return path.to_path_buf();
    }
    path.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."))
        .to_path_buf()
}

/// Repository metadata directory for a worktree root: `<root>/.jj/repo`.
///
/// Secondary workspaces keep a file there holding the path of the shared
/// repository (relative to `.jj`, or absolute in older versions). The result
/// is canonicalized so every workspace of one repository maps to one key.
pub fn repo_dir(root: &Path) -> PathBuf {
    let dot_jj = root.join(".jj");
    let mut repo = dot_jj.join("repo");
    if repo.is_file()
        && let Ok(target) = std::fs::read_to_string(&repo)
    {
        repo = dot_jj.join(target.trim());
    }
    std::fs::canonicalize(&repo).unwrap_or(repo)
}
