use farmwatch_core::coerce::CoerceError;
use std::path::PathBuf;
use thiserror::Error;

mod cache;
mod query;
mod root;

pub use cache::{FileCache, Generation, MissingPolicy};
pub use query::{
    EventQuery, IssueCounts, IssueFilter, Store, TopicSummary, DEFAULT_EVENT_LIMIT,
    DEFAULT_MESSAGE_LIMIT, DEFAULT_TOPIC_LIMIT,
};
pub use root::{resolve_store_root, resolve_store_root_from_env, StorePaths, ROOT_ENV_VAR};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid store root override {path}: {reason}")]
    Config { path: PathBuf, reason: String },
    #[error("no {marker} directory found in {start} or any parent")]
    Discovery { start: PathBuf, marker: &'static str },
    #[error("store file missing: {path}")]
    Missing { path: PathBuf },
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupt store file {path} at line {line}: {source}")]
    Corrupt {
        path: PathBuf,
        line: usize,
        #[source]
        source: CoerceError,
    },
}

impl StoreError {
    /// Startup-fatal errors, as opposed to per-file query failures.
    pub fn is_config(&self) -> bool {
        matches!(self, StoreError::Config { .. } | StoreError::Discovery { .. })
    }
}
