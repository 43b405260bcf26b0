//! Parsing of commit-query output into a `CommitSummary`.
//!
//! The query prints one line with the change id split in two: the shortest
//! unique prefix right-padded to a fixed block, then the remainder, so that
//! prefix and remainder together span `CHANGE_ID_WIDTH` characters. Optional
//! `key=value` lines after it carry pass-through commit properties.

use serde::Serialize;

/// Significant characters of the change id shown to the user.
pub const CHANGE_ID_WIDTH: usize = 8;

/// Snapshot of the current commit, as shown to consumers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CommitSummary {
    pub change_id_prefix: String,
    pub change_id_rest: String,
    pub empty: bool,
    pub conflict: bool,
    pub divergent: bool,
    pub immutable: bool,
    pub local_bookmarks: Vec<String>,
    pub remote_bookmarks: Vec<String>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("commit query produced no output")]
    Empty,
    #[error("expected a change id prefix and remainder, got {0:?}")]
    Malformed(String),
    #[error("change id remainder {0:?} leaves no room for a prefix")]
    RemainderTooLong(String),
}

impl CommitSummary {
    pub fn parse(output: &str) -> Result<Self, ParseError> {
        let mut lines = output.lines().skip_while(|l| l.trim().is_empty());
        let first = lines.next().ok_or(ParseError::Empty)?;

        let tokens: Vec<&str> = first.split_whitespace().collect();
        let [block, rest] = tokens[..] else {
            return Err(ParseError::Malformed(first.to_string()));
        };

        let unique_len = CHANGE_ID_WIDTH.saturating_sub(rest.chars().count());
        if unique_len == 0 {
            return Err(ParseError::RemainderTooLong(rest.to_string()));
        }

        let mut summary = CommitSummary {
            change_id_prefix: block.chars().take(unique_len).collect(),
            change_id_rest: rest.to_string(),
            ..CommitSummary::default()
        };

        for line in lines {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.trim();
            match key.trim() {
                "empty" => summary.empty = value == "true",
                "conflict" => summary.conflict = value == "true",
                "divergent" => summary.divergent = value == "true",
                "immutable" => summary.immutable = value == "true",
                "local_bookmarks" => summary.local_bookmarks = split_list(value),
                "remote_bookmarks" => summary.remote_bookmarks = split_list(value),
                _ => {}
            }
        }

        Ok(summary)
    }

    /// One-line rendering: change id, local bookmarks, then any flags.
    pub fn display(&self) -> String {
        let mut out = format!("{}{}", self.change_id_prefix, self.change_id_rest);
        for bookmark in &self.local_bookmarks {
            out.push(' ');
            out.push_str(bookmark);
        }

        let flags: Vec<&str> = [
            (self.conflict, "conflict"),
            (self.divergent, "divergent"),
            (self.empty, "empty"),
            (self.immutable, "immutable"),
        ]
        .into_iter()
        .filter_map(|(set, name)| set.then_some(name))
        .collect();
        if !flags.is_empty() {
            out.push_str(" (");
            out.push_str(&flags.join(", "));
            out.push(')');
        }
        out
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn prefix_length_follows_remainder_width() {
        let summary = CommitSummary::parse("abcdefgh rest").unwrap();
        assert_eq!(summary.change_id_prefix, "abcd");
        assert_eq!(summary.change_id_rest, "rest");
    }

    #[test]
    fn padded_block_parses() {
        let summary = CommitSummary::parse("kp       qxyzwvu\n").unwrap();
        assert_eq!(summary.change_id_prefix, "k");
        assert_eq!(summary.change_id_rest, "qxyzwvu");
    }

    #[test]
    fn empty_output_is_an_error() {
        assert_eq!(CommitSummary::parse(""), Err(ParseError::Empty));
        assert_eq!(CommitSummary::parse("  \n\n"), Err(ParseError::Empty));
    }

    #[test]
    fn single_token_is_an_error() {
        assert!(matches!(
            CommitSummary::parse("abcdefgh"),
            Err(ParseError::Malformed(_))
        ));
    }

    #[test]
    fn extra_tokens_are_an_error() {
        assert!(matches!(
            CommitSummary::parse("ab cdef gh"),
            Err(ParseError::Malformed(_))
        ));
    }

    #[test]
    fn overlong_remainder_is_an_error() {
        assert_eq!(
            CommitSummary::parse("a bcdefghij"),
            Err(ParseError::RemainderTooLong("bcdefghij".into()))
        );
    }

    #[test]
    fn properties_are_read_from_following_lines() {
        let output = "zs       ptlmox\n\
                      empty=true\n\
                      conflict=false\n\
                      divergent=true\n\
                      immutable=false\n\
                      local_bookmarks=main,feature\n\
                      remote_bookmarks=main@origin\n\
                      unknown=whatever";
        let summary = CommitSummary::parse(output).unwrap();
        assert_eq!(summary.change_id_prefix, "zs");
        assert!(summary.empty);
        assert!(!summary.conflict);
        assert!(summary.divergent);
        assert_eq!(summary.local_bookmarks, vec!["main", "feature"]);
        assert_eq!(summary.remote_bookmarks, vec!["main@origin"]);
    }

    #[test]
    fn empty_bookmark_list() {
        let summary = CommitSummary::parse("ab       cdef\nlocal_bookmarks=\n").unwrap();
        assert!(summary.local_bookmarks.is_empty());
    }

    #[test]
    fn display_plain() {
        let summary = CommitSummary::parse("ab       cdefgh").unwrap();
        insta::assert_snapshot!(summary.display(), @"abcdefgh");
    }

    #[test]
    fn display_with_bookmarks_and_flags() {
        let summary = CommitSummary::parse(
            "wq       nrstuv\nempty=true\nconflict=true\nlocal_bookmarks=main,wip",
        )
        .unwrap();
        insta::assert_snapshot!(summary.display(), @"wqnrstuv main wip (conflict, empty)");
    }
}
