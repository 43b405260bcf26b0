use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::broadcast::error::RecvError;

use crate::config::Config;
use crate::event::ConsumerEvent;
use crate::pipeline::{Pipeline, PipelineHandle};
use crate::registry::ConsumerId;

pub struct WatchOptions {
    /// Files to attach before reading any commands.
    pub files: Vec<PathBuf>,
    /// Emit JSON lines instead of `path<TAB>display`.
    pub json: bool,
}

/// A line of host input.
#[derive(Debug, PartialEq, Eq)]
enum HostCommand {
    Attach(PathBuf),
    Detach(PathBuf),
    Rename(PathBuf, PathBuf),
    Disable(PathBuf),
    Enable(PathBuf),
}

impl HostCommand {
    /// Parse one input line. Blank lines yield `Ok(None)`.
    ///
    /// Single-path commands take the rest of the line as the path; `rename`
    /// separates its two paths with a tab, or with the first space if there
    /// is no tab.
    fn parse(line: &str) -> Result<Option<Self>> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        let (verb, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        let rest = rest.trim();
        if rest.is_empty() {
            bail!("`{verb}` needs a path");
        }

        let command = match verb {
            "attach" => HostCommand::Attach(rest.into()),
            "detach" => HostCommand::Detach(rest.into()),
            "disable" => HostCommand::Disable(rest.into()),
            "enable" => HostCommand::Enable(rest.into()),
            "rename" => {
                let (old, new) = rest
                    .split_once('\t')
                    .or_else(|| rest.split_once(' '))
                    .context("`rename` needs an old and a new path")?;
                HostCommand::Rename(old.trim().into(), new.trim().into())
            }
            other => bail!("unknown command `{other}`"),
        };
        Ok(Some(command))
    }
}

/// Path ↔ consumer id bookkeeping for the line protocol.
#[derive(Default)]
struct Consumers {
    by_path: HashMap<PathBuf, ConsumerId>,
    /// Kept after detach until the `Cleared` event has been printed.
    by_id: HashMap<ConsumerId, PathBuf>,
    /// Disabled ids keep their path mapping even when detached, so a later
    /// `attach` of the same path reuses the id and stays refused.
    disabled: HashSet<ConsumerId>,
    next_id: u64,
}

impl Consumers {
    fn id_for(&mut self, path: &Path) -> ConsumerId {
        if let Some(id) = self.by_path.get(path) {
            return *id;
        }
        self.next_id += 1;
        let id = ConsumerId(self.next_id);
        self.by_path.insert(path.to_path_buf(), id);
        self.by_id.insert(id, path.to_path_buf());
        id
    }

    fn apply(&mut self, command: HostCommand, handle: &PipelineHandle) {
        match command {
            HostCommand::Attach(path) => {
                let path = absolute(&path);
                handle.attach(self.id_for(&path), path);
            }
            HostCommand::Detach(path) => {
                let path = absolute(&path);
                let Some(&id) = self.by_path.get(&path) else {
                    return;
                };
                handle.detach(id);
                if !self.disabled.contains(&id) {
                    self.by_path.remove(&path);
                }
            }
            HostCommand::Rename(old, new) => {
                let (old, new) = (absolute(&old), absolute(&new));
                let Some(id) = self.by_path.remove(&old) else {
                    tracing::warn!(path = %old.display(), "rename of a file that is not attached");
                    return;
                };
                if let Some(displaced) = self.by_path.insert(new.clone(), id)
                    && displaced != id
                {
                    handle.detach(displaced);
                    self.disabled.remove(&displaced);
                }
                self.by_id.insert(id, new.clone());
                handle.rename(id, new);
            }
            HostCommand::Disable(path) => {
                let id = self.id_for(&absolute(&path));
                self.disabled.insert(id);
                handle.set_disabled(id, true);
            }
            HostCommand::Enable(path) => {
                let path = absolute(&path);
                let id = self.id_for(&path);
                self.disabled.remove(&id);
                handle.set_disabled(id, false);
                handle.attach(id, path);
            }
        }
    }

    fn path(&self, id: ConsumerId) -> Option<&Path> {
        self.by_id.get(&id).map(PathBuf::as_path)
    }

    /// Forget the path of `id` once it no longer names an attached file.
    fn prune(&mut self, id: ConsumerId) {
        if self
            .by_id
            .get(&id)
            .is_some_and(|path| self.by_path.get(path) != Some(&id))
        {
            self.by_id.remove(&id);
        }
    }

    /// Ids of every attached path, in id order.
    fn attached(&self) -> Vec<ConsumerId> {
        let mut ids: Vec<ConsumerId> = self.by_path.values().copied().collect();
        ids.sort_unstable();
        ids
    }
}

#[derive(Serialize)]
struct JsonLine<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    path: Option<&'a Path>,
    #[serde(flatten)]
    event: &'a ConsumerEvent,
}

/// Format one consumer event for output, or `None` if it prints nothing.
fn render(event: &ConsumerEvent, consumers: &Consumers, json: bool) -> Result<Option<String>> {
    let path = match event {
        ConsumerEvent::Updated { id, .. } | ConsumerEvent::Cleared { id } => consumers.path(*id),
        ConsumerEvent::Refresh => None,
    };
    if json {
        return Ok(Some(serde_json::to_string(&JsonLine { path, event })?));
    }
    let Some(path) = path else {
        return Ok(None);
    };
    let line = match event {
        ConsumerEvent::Updated { projection, .. } => {
            format!("{}\t{}", path.display(), projection.display)
        }
        ConsumerEvent::Cleared { .. } => format!("{}\t", path.display()),
        ConsumerEvent::Refresh => return Ok(None),
    };
    Ok(Some(line))
}

/// Print the current state of every attached consumer.
///
/// Used after the event stream dropped updates: the pipeline still has the
/// latest projection for each consumer, so nothing is lost for good.
async fn resync<W: Write>(
    consumers: &Consumers,
    handle: &PipelineHandle,
    json: bool,
    writer: &mut W,
) -> Result<()> {
    for id in consumers.attached() {
        let event = match handle.projection(id).await {
            Some(projection) => ConsumerEvent::Updated { id, projection },
            None => ConsumerEvent::Cleared { id },
        };
        if let Some(line) = render(&event, consumers, json)? {
            writeln!(writer, "{line}")?;
        }
    }
    writer.flush()?;
    Ok(())
}

/// Run the pipeline, attach `options.files`, then follow host commands on
/// `input` until it closes or Ctrl-C.
pub async fn watch<R, W>(config: Config, options: WatchOptions, input: R, mut writer: W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: Write,
{
    let (pipeline, handle) = Pipeline::new(config);
    let mut events = handle.subscribe();
    let task = tokio::spawn(pipeline.run());

    let mut consumers = Consumers::default();
    for file in options.files {
        consumers.apply(HostCommand::Attach(file), &handle);
    }

    let mut lines = input.lines();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line.context("failed to read commands")? {
                    Some(line) => match HostCommand::parse(&line) {
                        Ok(Some(command)) => consumers.apply(command, &handle),
                        Ok(None) => {}
                        Err(e) => tracing::warn!("{e}"),
                    },
                    // The host went away.
                    None => break,
                }
            }
            event = events.recv() => {
                match event {
                    Ok(event) => {
                        if let Some(line) = render(&event, &consumers, options.json)? {
                            writeln!(writer, "{line}")?;
                            writer.flush()?;
                        }
                        if let ConsumerEvent::Cleared { id } = event {
                            consumers.prune(id);
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "output fell behind; re-reading every consumer");
                        resync(&consumers, &handle, options.json, &mut writer).await?;
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            _ = &mut ctrl_c => break,
        }
    }

    handle.shutdown();
    task.await.context("pipeline task failed")?;
    Ok(())
}

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}
