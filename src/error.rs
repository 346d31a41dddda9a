//! Error types for trueno-lineage
//!
//! Every error is local to the call that raised it and surfaced
//! synchronously. Nothing is retried.

use std::path::PathBuf;

use thiserror::Error;

use crate::run::RunId;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// trueno-lineage error types
#[derive(Error, Debug)]
pub enum Error {
    /// Unknown run identifier
    #[error("Run not found: {0}")]
    RunNotFound(RunId),

    /// Unknown artifact reference (missing registry entry or backing file)
    #[error("Artifact not found: {0}")]
    ArtifactNotFound(String),

    /// No registered codec can serialize the value
    #[error("Unsupported type: no codec registered for {0}")]
    UnsupportedType(String),

    /// Stored bytes cannot be decoded by the recorded codec
    #[error("Corrupted artifact at {path}: {reason}")]
    Corruption {
        /// Artifact path relative to the storage root
        path: String,
        /// What went wrong while decoding
        reason: String,
    },

    /// The wrapped callable returned an error or panicked
    #[error("Task '{task}' failed in run {run_id}: {source}")]
    TaskExecution {
        /// Run recorded as failed
        run_id: RunId,
        /// Task name
        task: String,
        /// The callable's own error, untouched
        source: anyhow::Error,
    },

    /// A run left `pending` a second time
    #[error("Run {0} is already committed")]
    AlreadyCommitted(RunId),

    /// An edge would point from a run to a later (or the same) run
    #[error("Lineage edge {producer} -> {consumer} violates run ordering (producer must be earlier)")]
    LineageOrder {
        /// Producing run
        producer: RunId,
        /// Consuming run
        consumer: RunId,
    },

    /// The run directory was not fresh
    #[error("Run directory already exists: {}", .0.display())]
    RunDirExists(PathBuf),

    /// `inputs` and `outputs` cannot be used as group names
    #[error("'{0}' is a reserved artifact group name")]
    ReservedGroup(String),

    /// Artifact groups are write-once
    #[error("Artifact group '{group}' already exists for run {run_id}")]
    GroupExists {
        /// Owning run
        run_id: RunId,
        /// Group name
        group: String,
    },

    /// Caller supplied something malformed
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Registry database error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// JSON (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// True for both flavours of "not found".
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::RunNotFound(_) | Self::ArtifactNotFound(_))
    }

    /// Run id carried by a `RunNotFound` error.
    #[must_use]
    pub const fn missing_run(&self) -> Option<RunId> {
        match self {
            Self::RunNotFound(run_id) => Some(*run_id),
            _ => None,
        }
    }

    /// Run id of a failed task execution, if this is one.
    #[must_use]
    pub const fn failed_run(&self) -> Option<RunId> {
        match self {
            Self::TaskExecution { run_id, .. } => Some(*run_id),
            _ => None,
        }
    }

    /// Unwrap the callable's original error.
    ///
    /// Returns `None` for errors that did not come from the callable.
    #[must_use]
    pub fn into_task_error(self) -> Option<anyhow::Error> {
        match self {
            Self::TaskExecution { source, .. } => Some(source),
            _ => None,
        }
    }
}
