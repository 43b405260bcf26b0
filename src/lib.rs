//! Low-latency Jujutsu commit metadata for editors and status lines.
//!
//! A [`pipeline::Pipeline`] watches each repository a consumer's file lives
//! in, re-runs one `jj log` per worktree root after changes settle, and
//! publishes the parsed [`commit::CommitSummary`] to every consumer sharing
//! that root.

pub mod commands;
pub mod commit;
pub mod config;
pub mod event;
pub mod pipeline;
pub mod process;
pub mod registry;
pub mod watcher;

pub use config::Config;
pub use event::ConsumerEvent;
pub use pipeline::{Pipeline, PipelineHandle};
pub use registry::{ConsumerId, Projection};
