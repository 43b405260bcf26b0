//! Shared per-repository filesystem watches with debouncing.
//!
//! There is one `RepoWatch` per repository path no matter how many consumers
//! live in it. Every non-lock filesystem event restarts the repository's
//! debounce timer; only a timer that runs out without being restarted
//! produces a `DebounceElapsed` event for the pipeline.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::event::PipelineEvent;
use crate::registry::ConsumerId;

/// Files with this suffix are transient lock artifacts, not state changes.
pub const LOCK_SUFFIX: &str = ".lock";

struct RepoWatch {
    /// `None` if the subscription could not be set up.
    subscription: Option<RecommendedWatcher>,
    timer: Option<JoinHandle<()>>,
    /// Bumped on every timer reset; a fire only counts for the current value.
    generation: u64,
    members: HashSet<ConsumerId>,
}

pub struct WatcherSet {
    entries: HashMap<PathBuf, RepoWatch>,
    debounce: Duration,
    watch_subdir: PathBuf,
    tx: mpsc::UnboundedSender<PipelineEvent>,
}

impl WatcherSet {
    pub fn new(
        debounce: Duration,
        watch_subdir: PathBuf,
        tx: mpsc::UnboundedSender<PipelineEvent>,
    ) -> Self {
        Self {
            entries: HashMap::new(),
            debounce,
            watch_subdir,
            tx,
        }
    }

    /// Directory actually subscribed to for `repo`.
    pub fn watch_target(&self, repo: &Path) -> PathBuf {
        repo.join(&self.watch_subdir)
    }

    /// Create the watch for `repo` unless one already exists.
    ///
    /// Best-effort: if the directory can't be watched the entry is still
    /// created so membership stays consistent; the repository then only
    /// refreshes on attach.
    pub fn ensure_watch(&mut self, repo: &Path) {
        if self.entries.contains_key(repo) {
            return;
        }
        let subscription = match self.subscribe(repo) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                tracing::warn!(
                    repo = %repo.display(),
                    error = %e,
                    "failed to watch repository; it will not refresh on changes"
                );
                None
            }
        };
        tracing::debug!(repo = %repo.display(), "watching repository");
        self.entries.insert(
            repo.to_path_buf(),
            RepoWatch {
                subscription,
                timer: None,
                generation: 0,
                members: HashSet::new(),
            },
        );
    }

    fn subscribe(&self, repo: &Path) -> notify::Result<RecommendedWatcher> {
        let tx = self.tx.clone();
        let key = repo.to_path_buf();
        let mut watcher =
            notify::recommended_watcher(move |res: notify::Result<notify::Event>| match res {
                // Reads (including our own queries listing the directory) are not changes.
                Ok(event) if matches!(event.kind, EventKind::Access(_)) => {}
                Ok(event) => {
                    let _ = tx.send(PipelineEvent::FsChanged {
                        repo: key.clone(),
                        paths: event.paths,
                    });
                }
                Err(e) => tracing::warn!(error = %e, "filesystem watch error"),
            })?;
        watcher.watch(&self.watch_target(repo), RecursiveMode::NonRecursive)?;
        Ok(watcher)
    }

    /// Add `id` to the members of `repo`, creating the watch if needed.
    pub fn register(&mut self, repo: &Path, id: ConsumerId) {
        self.ensure_watch(repo);
        if let Some(watch) = self.entries.get_mut(repo) {
            watch.members.insert(id);
        }
    }

    /// Remove `id` from `repo`; the last member leaving tears the watch down.
    pub fn unregister(&mut self, repo: &Path, id: ConsumerId) {
        let Some(watch) = self.entries.get_mut(repo) else {
            return;
        };
        watch.members.remove(&id);
        if watch.members.is_empty() {
            self.teardown(repo);
        }
    }

    /// Stop the timer and subscription for `repo` and forget it.
    /// A no-op if `repo` is not watched.
    pub fn teardown(&mut self, repo: &Path) {
        let Some(mut watch) = self.entries.remove(repo) else {
            return;
        };
        if let Some(timer) = watch.timer.take() {
            timer.abort();
        }
        // Dropping the watcher removes the OS-level watch.
        drop(watch.subscription.take());
        tracing::debug!(repo = %repo.display(), "stopped watching repository");
    }

    /// Feed raw filesystem activity. Returns `true` if the debounce timer
    /// was (re)started.
    pub fn on_fs_event(&mut self, repo: &Path, paths: &[PathBuf]) -> bool {
        let Some(watch) = self.entries.get_mut(repo) else {
            return false;
        };
        if !paths.is_empty() && paths.iter().all(|p| is_lock_file(p)) {
            return false;
        }

        if let Some(timer) = watch.timer.take() {
            timer.abort();
        }
        watch.generation += 1;

        let generation = watch.generation;
        let delay = self.debounce;
        let tx = self.tx.clone();
        let repo = repo.to_path_buf();
        watch.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(PipelineEvent::DebounceElapsed { repo, generation });
        }));
        true
    }

    /// Accept a timer expiry. Returns the members to refresh, or `None` if the
    /// repository is gone or the timer was superseded.
    pub fn take_fire(&mut self, repo: &Path, generation: u64) -> Option<Vec<ConsumerId>> {
        let watch = self.entries.get_mut(repo)?;
        if watch.generation != generation {
            return None;
        }
        watch.timer = None;
        let mut members: Vec<ConsumerId> = watch.members.iter().copied().collect();
        members.sort_unstable();
        Some(members)
    }

    pub fn is_watching(&self, repo: &Path) -> bool {
        self.entries.contains_key(repo)
    }

    pub fn has_subscription(&self, repo: &Path) -> bool {
        self.entries
            .get(repo)
            .is_some_and(|w| w.subscription.is_some())
    }

    pub fn has_pending_timer(&self, repo: &Path) -> bool {
        self.entries.get(repo).is_some_and(|w| w.timer.is_some())
    }

    pub fn repos(&self) -> Vec<PathBuf> {
        let mut repos: Vec<PathBuf> = self.entries.keys().cloned().collect();
        repos.sort();
        repos
    }
}

impl Drop for WatcherSet {
    fn drop(&mut self) {
        for watch in self.entries.values_mut() {
            if let Some(timer) = watch.timer.take() {
                timer.abort();
            }
        }
    }
}

fn is_lock_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.ends_with(LOCK_SUFFIX))
}
