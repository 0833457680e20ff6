use crate::storage::{Quark, Timestamp};
use thiserror::Error;

/// Errors surfaced by a [`StateSystem`](crate::storage::StateSystem).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("attribute not found: {path}")]
    AttributeNotFound { path: String },

    #[error("invalid quark: {0}")]
    InvalidQuark(Quark),

    #[error("timestamp {time} outside of [{start}, {end}]")]
    TimeRange {
        time: Timestamp,
        start: Timestamp,
        end: Timestamp,
    },

    #[error("out-of-order write on {path}: {time} is before last change at {last}")]
    OutOfOrder {
        path: String,
        time: Timestamp,
        last: Timestamp,
    },

    #[error("expected a {expected} state value, found {found}")]
    ValueType {
        expected: &'static str,
        found: &'static str,
    },

    #[error("state system has been disposed")]
    Disposed,
}

/// Errors raised while ingesting a single trace event.
///
/// None of these abort ingestion: the [`StateProvider`](crate::ingest::StateProvider)
/// logs and counts them, then moves on to the next event.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum IngestError {
    #[error("callpath {id} references unknown parent {parent}")]
    MissingParent { id: i64, parent: i64 },

    #[error("unknown event kind: {0}")]
    UnknownEventKind(String),

    #[error("{event} event: malformed field '{field}': {reason}")]
    MalformedField {
        event: &'static str,
        field: &'static str,
        reason: String,
    },

    #[error("callpath {id} conflicts with an earlier definition: {reason}")]
    CallpathConflict { id: i64, reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors raised by the incremental visual tree build.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BuildError {
    #[error("a visual tree build is already running for this trace")]
    AlreadyRunning,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors raised while reading a JSON-lines trace file.
#[derive(Error, Debug)]
pub enum TraceFileError {
    #[error("failed to read trace: {0}")]
    Io(#[from] std::io::Error),

    #[error("line {line}: {source}")]
    Json {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("this trace isn't a compatible Veritrace trace (domain: {domain:?})")]
    WrongDomain { domain: Option<String> },
}
