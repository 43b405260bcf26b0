use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Template handed to `jj log -T`. Its output format is what
/// `CommitSummary::parse` reads.
pub const DEFAULT_TEMPLATE: &str = concat!(
    r#"pad_end(9, change_id.shortest(8).prefix()) ++ change_id.shortest(8).rest() ++ "\n""#,
    r#" ++ "empty=" ++ if(empty, "true", "false") ++ "\n""#,
    r#" ++ "conflict=" ++ if(conflict, "true", "false") ++ "\n""#,
    r#" ++ "divergent=" ++ if(divergent, "true", "false") ++ "\n""#,
    r#" ++ "immutable=" ++ if(immutable, "true", "false") ++ "\n""#,
    r#" ++ "local_bookmarks=" ++ local_bookmarks.map(|b| b.name()).join(",") ++ "\n""#,
    r#" ++ "remote_bookmarks=" ++ remote_bookmarks.map(|b| b.name() ++ "@" ++ b.remote()).join(",") ++ "\n""#,
);

/// Runtime configuration, usually from `~/.config/jjline/config.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// `jj` executable name or path.
    pub executable: String,
    /// Hard limit for every `jj` invocation.
    pub timeout_ms: u64,
    /// Quiet period after the last repository change before re-querying.
    pub debounce_ms: u64,
    /// Directory under the repository that is watched for changes.
    pub watch_subdir: PathBuf,
    /// Commit template passed through to `jj log -T`.
    pub template: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            executable: "jj".to_string(),
            timeout_ms: 30_000,
            debounce_ms: 50,
            watch_subdir: PathBuf::from("op_heads/heads"),
            template: DEFAULT_TEMPLATE.to_string(),
        }
    }
}

impl Config {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Arguments that print the absolute worktree root.
    pub fn root_args(&self) -> Vec<String> {
        vec!["root".to_string()]
    }

    /// Arguments that print the current commit in the template's format.
    ///
    /// `--ignore-working-copy` keeps the query from snapshotting, which would
    /// record a new operation and wake the watcher again.
    pub fn query_args(&self) -> Vec<String> {
        [
            "--ignore-working-copy",
            "--color",
            "never",
            "log",
            "--no-graph",
            "-r",
            "@",
            "-T",
        ]
        .into_iter()
        .map(String::from)
        .chain(std::iter::once(self.template.clone()))
        .collect()
    }
}

/// Default config file location, if a home or XDG directory is known.
pub fn default_path() -> Option<PathBuf> {
    if let Some(xdg) = std::env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        return Some(PathBuf::from(xdg).join("jjline").join("config.toml"));
    }
    let home = std::env::var_os("HOME")?;
    Some(
        PathBuf::from(home)
            .join(".config")
            .join("jjline")
            .join("config.toml"),
    )
}

/// Load configuration from `path`.
///
/// Falls back to defaults if the file is missing.
pub fn load(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(config)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load(&dir.path().join("config.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "executable = \"/opt/jj\"\ndebounce_ms = 120\n").unwrap();

        let config = load(&path).unwrap();
        assert_eq!(config.executable, "/opt/jj");
        assert_eq!(config.debounce(), Duration::from_millis(120));
        assert_eq!(config.timeout(), Duration::from_secs(30));
        assert_eq!(config.template, DEFAULT_TEMPLATE);
    }

    #[test]
    fn invalid_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "timeout_ms = \"soon\"\n").unwrap();
        let err = load(&path).unwrap_err();
        assert!(format!("{err:#}").contains("failed to parse"));
    }

    #[test]
    fn query_args_end_with_template() {
        let config = Config {
            template: "change_id".into(),
            ..Config::default()
        };
        let args = config.query_args();
        assert_eq!(args.last().map(String::as_str), Some("change_id"));
        assert!(args.contains(&"--ignore-working-copy".to_string()));
    }
}
