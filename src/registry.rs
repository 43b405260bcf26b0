//! Per-consumer cached state.
//!
//! The registry is the single writer of `ConsumerEntry` values. Every merged
//! summary is published on the consumer event channel as it lands.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;

use crate::commit::CommitSummary;
use crate::event::ConsumerEvent;
use crate::watcher::WatcherSet;

/// Opaque consumer handle chosen by the host (e.g. an editor buffer number).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ConsumerId(pub u64);

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    /// Waiting for the worktree-root lookup.
    #[default]
    Resolving,
    /// Member of a repository watch; summary may still be pending.
    Watching,
    /// Root lookup failed. Stays this way until detached and re-attached.
    OutsideRepo,
}

#[derive(Debug, Clone)]
pub struct ConsumerEntry {
    pub id: ConsumerId,
    pub path: PathBuf,
    pub repo: Option<PathBuf>,
    pub root: Option<PathBuf>,
    pub summary: Option<Arc<CommitSummary>>,
    pub state: ConsumerState,
    /// Distinguishes this attach from earlier ones under the same id.
    pub epoch: u64,
}

/// Field-wise update; `None` fields leave the entry untouched.
#[derive(Debug, Default)]
pub struct EntryUpdate {
    pub repo: Option<PathBuf>,
    pub root: Option<PathBuf>,
    pub summary: Option<Arc<CommitSummary>>,
    pub state: Option<ConsumerState>,
}

/// What a consumer sees: the commit summary plus a ready-made display string.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Projection {
    #[serde(flatten)]
    pub summary: CommitSummary,
    pub display: String,
}

impl Projection {
    pub fn new(summary: &CommitSummary) -> Self {
        Self {
            summary: summary.clone(),
            display: summary.display(),
        }
    }
}

pub struct Registry {
    entries: HashMap<ConsumerId, ConsumerEntry>,
    disabled: HashSet<ConsumerId>,
    next_epoch: u64,
    events: broadcast::Sender<ConsumerEvent>,
}

impl Registry {
    pub fn new(events: broadcast::Sender<ConsumerEvent>) -> Self {
        Self {
            entries: HashMap::new(),
            disabled: HashSet::new(),
            next_epoch: 0,
            events,
        }
    }

    /// Start tracking `id`. Returns the attach epoch, or `None` if the
    /// consumer is already tracked or disabled.
    pub fn attach(&mut self, id: ConsumerId, path: PathBuf) -> Option<u64> {
        if self.entries.contains_key(&id) || self.disabled.contains(&id) {
            return None;
        }
        self.next_epoch += 1;
        let epoch = self.next_epoch;
        self.entries.insert(
            id,
            ConsumerEntry {
                id,
                path,
                repo: None,
                root: None,
                summary: None,
                state: ConsumerState::Resolving,
                epoch,
            },
        );
        Some(epoch)
    }

    /// Stop tracking `id` and leave its repository watch, tearing the watch
    /// down if this was its last member.
    pub fn detach(&mut self, id: ConsumerId, watchers: &mut WatcherSet) -> Option<ConsumerEntry> {
        let entry = self.entries.remove(&id)?;
        if let Some(repo) = &entry.repo {
            watchers.unregister(repo, id);
        }
        self.publish(ConsumerEvent::Cleared { id });
        Some(entry)
    }

    pub fn get(&self, id: ConsumerId) -> Option<&ConsumerEntry> {
        self.entries.get(&id)
    }

    /// Merge `update` into the entry. Returns `false` if `id` is not tracked.
    pub fn update(&mut self, id: ConsumerId, update: EntryUpdate) -> bool {
        let Some(entry) = self.entries.get_mut(&id) else {
            return false;
        };
        if let Some(repo) = update.repo {
            entry.repo = Some(repo);
        }
        if let Some(root) = update.root {
            entry.root = Some(root);
        }
        if let Some(state) = update.state {
            entry.state = state;
        }
        if let Some(summary) = update.summary {
            let projection = Projection::new(&summary);
            entry.summary = Some(summary);
            self.publish(ConsumerEvent::Updated { id, projection });
        }
        true
    }

    /// Forget everything known about `id`'s repository and mark it as
    /// outside any repository.
    pub fn clear(&mut self, id: ConsumerId) {
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        entry.repo = None;
        entry.root = None;
        entry.summary = None;
        entry.state = ConsumerState::OutsideRepo;
        self.publish(ConsumerEvent::Cleared { id });
    }

    pub fn set_disabled(&mut self, id: ConsumerId, disabled: bool) {
        if disabled {
            self.disabled.insert(id);
        } else {
            self.disabled.remove(&id);
        }
    }

    pub fn projection(&self, id: ConsumerId) -> Option<Projection> {
        let summary = self.entries.get(&id)?.summary.as_deref()?;
        Some(Projection::new(summary))
    }

    /// Consumers whose worktree root is `root`, in id order.
    pub fn sharing_root(&self, root: &Path) -> Vec<ConsumerId> {
        let mut ids: Vec<ConsumerId> = self
            .entries
            .values()
            .filter(|e| e.root.as_deref() == Some(root))
            .map(|e| e.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn request_refresh(&self) {
        self.publish(ConsumerEvent::Refresh);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn publish(&self, event: ConsumerEvent) {
        // No subscribers is fine; the host may only poll projections.
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;

    fn setup() -> (Registry, broadcast::Receiver<ConsumerEvent>, WatcherSet) {
        let (events, rx) = broadcast::channel(16);
        let (tx, _rx) = mpsc::unbounded_channel();
        let watchers = WatcherSet::new(Duration::from_millis(50), PathBuf::from("heads"), tx);
        (Registry::new(events), rx, watchers)
    }

    fn summary(prefix: &str, rest: &str) -> Arc<CommitSummary> {
        Arc::new(CommitSummary {
            change_id_prefix: prefix.into(),
            change_id_rest: rest.into(),
            ..CommitSummary::default()
        })
    }

    #[test]
    fn attach_is_a_noop_when_already_tracked() {
        let (mut registry, _rx, _w) = setup();
        let id = ConsumerId(1);
        assert!(registry.attach(id, "/a".into()).is_some());
        assert!(registry.attach(id, "/b".into()).is_none());
        assert_eq!(registry.get(id).unwrap().path, PathBuf::from("/a"));
    }

    #[test]
    fn attach_is_refused_while_disabled() {
        let (mut registry, _rx, _w) = setup();
        let id = ConsumerId(7);
        registry.set_disabled(id, true);
        assert!(registry.attach(id, "/a".into()).is_none());
        registry.set_disabled(id, false);
        assert!(registry.attach(id, "/a".into()).is_some());
    }

    #[test]
    fn epochs_increase_across_reattach() {
        let (mut registry, _rx, mut watchers) = setup();
        let id = ConsumerId(1);
        let first = registry.attach(id, "/a".into()).unwrap();
        registry.detach(id, &mut watchers);
        let second = registry.attach(id, "/a".into()).unwrap();
        assert!(second > first);
    }

    #[test]
    fn update_merges_fields_and_publishes() {
        let (mut registry, mut rx, _w) = setup();
        let id = ConsumerId(1);
        registry.attach(id, "/repo/file".into());

        registry.update(
            id,
            EntryUpdate {
                root: Some("/repo".into()),
                state: Some(ConsumerState::Watching),
                ..EntryUpdate::default()
            },
        );
        // No summary yet, so nothing to publish.
        assert!(rx.try_recv().is_err());

        registry.update(
            id,
            EntryUpdate {
                summary: Some(summary("ab", "cdefgh")),
                ..EntryUpdate::default()
            },
        );
        let entry = registry.get(id).unwrap();
        assert_eq!(entry.root.as_deref(), Some(Path::new("/repo")));
        assert_eq!(entry.state, ConsumerState::Watching);

        match rx.try_recv().unwrap() {
            ConsumerEvent::Updated { id: got, projection } => {
                assert_eq!(got, id);
                assert_eq!(projection.display, "abcdefgh");
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(registry.projection(id).unwrap().summary.change_id_prefix, "ab");
    }

    #[test]
    fn update_of_unknown_consumer_is_ignored() {
        let (mut registry, mut rx, _w) = setup();
        let applied = registry.update(
            ConsumerId(9),
            EntryUpdate {
                summary: Some(summary("a", "bcdefgh")),
                ..EntryUpdate::default()
            },
        );
        assert!(!applied);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn clear_marks_outside_repo() {
        let (mut registry, mut rx, _w) = setup();
        let id = ConsumerId(3);
        registry.attach(id, "/tmp/x".into());
        registry.clear(id);
        let entry = registry.get(id).unwrap();
        assert_eq!(entry.state, ConsumerState::OutsideRepo);
        assert!(registry.projection(id).is_none());
        assert!(matches!(rx.try_recv().unwrap(), ConsumerEvent::Cleared { .. }));
        // Still tracked, so a repeated attach does not retry.
        assert!(registry.attach(id, "/tmp/x".into()).is_none());
    }

    #[test]
    fn detach_leaves_the_repository_watch() {
        let (mut registry, _rx, mut watchers) = setup();
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().to_path_buf();
        let id = ConsumerId(1);

        registry.attach(id, repo.join("f")).unwrap();
        watchers.ensure_watch(&repo);
        watchers.register(&repo, id);
        registry.update(
            id,
            EntryUpdate {
                repo: Some(repo.clone()),
                ..EntryUpdate::default()
            },
        );

        let entry = registry.detach(id, &mut watchers).unwrap();
        assert_eq!(entry.id, id);
        assert!(registry.is_empty());
        assert!(!watchers.is_watching(&repo));
    }

    #[test]
    fn sharing_root_finds_all_members() {
        let (mut registry, _rx, _w) = setup();
        for (n, root) in [(1, "/r1"), (2, "/r2"), (3, "/r1")] {
            let id = ConsumerId(n);
            registry.attach(id, format!("{root}/f{n}").into());
            registry.update(
                id,
                EntryUpdate {
                    root: Some(root.into()),
                    ..EntryUpdate::default()
                },
            );
        }
        assert_eq!(
            registry.sharing_root(Path::new("/r1")),
            vec![ConsumerId(1), ConsumerId(3)]
        );
    }
}
