pub use anyhow::Error as RuntimeError;
use thiserror::Error;

use crate::core::DatumId;
use crate::engine::PendingReport;
use crate::value::{Key, KeyType};

/// Which of the two per-datum counters an operation touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefKind {
    Read,
    Write,
}

impl std::fmt::Display for RefKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RefKind::Read => f.write_str("read"),
            RefKind::Write => f.write_str("write"),
        }
    }
}

/// Errors raised by the datum store.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DataError {
    #[error("Double write to {id}{}", fmt_sub(.key))]
    DoubleWrite { id: DatumId, key: Option<Key> },

    #[error("Refcount underflow on {id}: {kind} count {current} changed by {change}")]
    RefcountUnderflow {
        id: DatumId,
        kind: RefKind,
        current: i64,
        change: i64,
    },

    #[error("Datum {0} not found")]
    NotFound(DatumId),

    #[error("Datum {0} is not closed yet")]
    NotClosed(DatumId),

    #[error("Datum {0} was closed without a value")]
    Unset(DatumId),

    #[error("Type mismatch: expected {expected}, actual {actual}")]
    TypeMismatch {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("Operation '{op}' is not supported on {kind} datum {id}")]
    WrongKind {
        id: DatumId,
        op: &'static str,
        kind: &'static str,
    },

    #[error("Key type mismatch on {id}: expected {expected:?}, actual {actual:?}")]
    KeyType {
        id: DatumId,
        expected: KeyType,
        actual: KeyType,
    },

    #[error("Struct {id} has no field {field}")]
    NoSuchField { id: DatumId, field: Key },

    #[error("Subscript {id}[{key}] not found")]
    NoSuchKey { id: DatumId, key: Key },

    #[error("Empty subscript path on {0}")]
    EmptyPath(DatumId),
}

fn fmt_sub(key: &Option<Key>) -> String {
    match key {
        Some(key) => format!("[{key}]"),
        None => String::new(),
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Couldn't read configuration file.\n{0}")]
    Io(#[from] std::io::Error),

    #[error("Couldn't parse configuration.\n{0}")]
    Json(#[from] serde_json::Error),

    #[error("Unknown work type '{0}'")]
    UnknownWorkType(String),

    #[error("Cluster layout has no ranks")]
    NoRanks,
}

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Couldn't encode checkpoint entry.\n{0}")]
    Encode(#[from] ciborium::ser::Error<std::io::Error>),

    #[error("Couldn't decode checkpoint entry.\n{0}")]
    Decode(#[from] ciborium::de::Error<std::io::Error>),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Data(#[from] DataError),

    #[error("Task '{task}':\n{source}")]
    TaskFailed {
        task: String,
        source: anyhow::Error,
    },

    #[error("Assertion failed in '{task}': {message}")]
    Assertion { task: String, message: String },

    #[error("No task body registered under '{0}'")]
    UnknownBody(String),

    #[error("Task '{task}' cannot be scheduled: {reason}")]
    InvalidTask { task: String, reason: String },

    #[error("Cyclic structure reached from {root} while waiting deep: {}", fmt_cycle(.cycle))]
    DeepWaitCycle { root: DatumId, cycle: Vec<DatumId> },

    #[error("Engine stalled with pending work:\n{0}")]
    Stalled(PendingReport),

    #[error("{first}{}", fmt_drain(.during_drain))]
    Failed {
        first: Box<EngineError>,
        during_drain: Vec<EngineError>,
    },

    #[error("Checkpoint store error:\n{0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Invalid configuration:\n{0}")]
    Config(#[from] ConfigError),

    #[error("Failed to build worker pool")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

fn fmt_cycle(cycle: &[DatumId]) -> String {
    cycle
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" -> ")
}

fn fmt_drain(errors: &[EngineError]) -> String {
    if errors.is_empty() {
        return String::new();
    }

    let mut out = format!("\n{} more failure(s) while draining:", errors.len());
    for err in errors {
        out.push_str("\n  ");
        out.push_str(&err.to_string());
    }
    out
}
