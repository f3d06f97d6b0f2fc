// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the snapshot engine.
//!
//! Errors are categorized by their source (external command, configuration,
//! network, reconciliation) and carry enough context to identify the failing
//! dataset or command from a log line alone.
//!
//! # Error Categories
//!
//! | Error Type | Transient | Description |
//! |------------|-----------|-------------|
//! | `CommandFailed` | Yes | Nonzero exit from a zfs/ssh/hook invocation |
//! | `Unreachable` | Yes | Replication endpoint down after bounded retries |
//! | `Reconcile` | Yes | Missing remote dataset, resume replay failure |
//! | `ConfigInvalid` | No | Malformed schema/schedule, clashing options |
//! | `Io` | No | Trigger file or config file I/O failure |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Propagation Policy
//!
//! Transient errors are caught at the per-dataset boundary in
//! [`Manager::run_cycle`](crate::manager::Manager::run_cycle): the dataset is
//! logged and skipped for this cycle, the run continues. `ConfigInvalid` is
//! fatal at load time, before any dataset is processed.

use thiserror::Error;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors that can occur while scheduling, cleaning or replicating snapshots.
#[derive(Error, Debug)]
pub enum EngineError {
    /// An external command exited nonzero.
    ///
    /// Carries the full command line, exit code, and captured stderr.
    /// Transient: the same command usually succeeds on the next cycle.
    #[error("command failed with exit code {exit_code}: {command}: {stderr}")]
    CommandFailed {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    /// A replication endpoint could not be reached after bounded retries.
    ///
    /// Non-fatal: the dataset's networked action is deferred to the next
    /// cycle.
    #[error("endpoint '{host}:{port}' unreachable: {message}")]
    Unreachable {
        host: String,
        port: u16,
        message: String,
    },

    /// Malformed retention schema or schedule spec, or clashing options.
    ///
    /// Fatal at configuration load time; the process exits before any
    /// dataset is processed.
    #[error("configuration error: {0}")]
    ConfigInvalid(String),

    /// Timeline reconciliation could not proceed for this dataset.
    ///
    /// Missing remote dataset, unparsable listing output, and the like.
    /// The dataset's replication step is abandoned for this cycle.
    #[error("reconciliation error ({dataset}): {message}")]
    Reconcile { dataset: String, message: String },

    /// Filesystem I/O failure (trigger file, config file).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Unexpected internal error. Indicates a bug that needs investigation.
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Create a `Reconcile` error for a dataset.
    pub fn reconcile(dataset: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Reconcile {
            dataset: dataset.into(),
            message: message.into(),
        }
    }

    /// Check if this error is transient.
    ///
    /// Transient errors are expected to clear on a later cycle without
    /// operator intervention; non-transient errors indicate configuration
    /// problems or bugs.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::CommandFailed { .. } => true,
            Self::Unreachable { .. } => true,
            Self::Reconcile { .. } => true,
            Self::ConfigInvalid(_) => false,
            Self::Io(_) => false,
            Self::Internal(_) => false,
        }
    }
}
