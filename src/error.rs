use std::path::PathBuf;

use crate::types::{TrialId, TrialStatus};

/// Errors produced by the optimization driver and its collaborators.
///
/// Per-trial errors ([`InvalidParameter`](Error::InvalidParameter),
/// [`Render`](Error::Render), [`Execution`](Error::Execution),
/// [`Extraction`](Error::Extraction),
/// [`ExtractionTimeout`](Error::ExtractionTimeout),
/// [`TaskError`](Error::TaskError)) are recorded on the trial as a failure
/// reason and never abort a run. Errors for which [`Error::is_fatal`] holds
/// abort the run instead.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Returned when a variable declaration is malformed (empty bounds,
    /// duplicate name, non-monotonic cost model, ...).
    #[error("invalid declaration for '{variable}': {reason}")]
    InvalidDeclaration {
        /// The offending variable (or `fidelity`).
        variable: String,
        /// What is wrong with it.
        reason: String,
    },

    /// Returned when a point does not satisfy the declared search space.
    #[error("invalid value for '{variable}': {reason}")]
    InvalidParameter {
        /// The offending variable.
        variable: String,
        /// Why the value was rejected.
        reason: String,
    },

    /// Returned when a template placeholder has no declared variable.
    #[error("template placeholder '{0}' has no declared variable")]
    MissingVariable(String),

    /// Returned when a declared variable is not referenced by the template.
    #[error("declared variable '{0}' is not referenced by the template")]
    UnboundVariable(String),

    /// Returned when a template cannot be parsed or rendered.
    #[error(transparent)]
    Render(#[from] RenderError),

    /// Returned when the execution manager rejects or loses a job.
    #[error("execution failed: {0}")]
    Execution(String),

    /// Returned when no objective could be extracted from a run's output.
    #[error("extraction failed: {0}")]
    Extraction(String),

    /// Returned when extraction does not finish within the configured timeout.
    #[error("extraction timeout")]
    ExtractionTimeout,

    /// Returned when the history medium cannot be read or written.
    #[error("storage error at {}: {reason}", .path.display())]
    Storage {
        /// The file involved.
        path: PathBuf,
        /// The underlying I/O or serialization failure.
        reason: String,
    },

    /// Returned when a trial is asked to make an illegal status change.
    #[error("trial {trial} cannot move from {from} to {to}")]
    InvalidTransition {
        /// The trial.
        trial: TrialId,
        /// Its current status.
        from: TrialStatus,
        /// The rejected target status.
        to: TrialStatus,
    },

    /// Returned when a history file contains an unreadable or inconsistent entry.
    #[error("corrupt history {} at line {line}: {reason}", .path.display())]
    CorruptHistory {
        /// The history file.
        path: PathBuf,
        /// One-based line number of the offending entry.
        line: usize,
        /// What is inconsistent.
        reason: String,
    },

    /// Returned when a history file was written by an incompatible schema or
    /// for a different search space.
    #[error("incompatible history {}: {reason}", .path.display())]
    IncompatibleHistory {
        /// The history file.
        path: PathBuf,
        /// Why it cannot be used.
        reason: String,
    },

    /// Returned when another driver already holds the history.
    #[error("history {} is locked by another driver", .path.display())]
    LockConflict {
        /// The lock file that could not be acquired.
        path: PathBuf,
    },

    /// Returned when requesting the best trial but no trials have completed.
    #[error("no completed trials available")]
    NoCompletedTrials,

    /// Returned when an optimization directory configuration is invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// Returned when a spawned task panics or is aborted unexpectedly.
    #[error("async task error: {0}")]
    TaskError(String),

    /// Returned when an internal invariant is violated.
    #[error("internal error: {0}")]
    Internal(&'static str),
}

impl Error {
    pub(crate) fn storage(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::Storage {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Returns `true` for errors that must abort a run rather than fail a
    /// single trial: storage and history problems, declaration mismatches
    /// and broken invariants.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Storage { .. }
                | Self::CorruptHistory { .. }
                | Self::IncompatibleHistory { .. }
                | Self::LockConflict { .. }
                | Self::InvalidDeclaration { .. }
                | Self::MissingVariable(_)
                | Self::UnboundVariable(_)
                | Self::Config(_)
                | Self::InvalidTransition { .. }
                | Self::Internal(_)
        )
    }
}

/// Template parsing and rendering failures.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RenderError {
    /// A placeholder in the template has no substitution.
    #[error("no substitution for placeholder '{0}'")]
    MissingPlaceholder(String),

    /// The template text is not well formed.
    #[error("malformed template at {line}:{column}: {reason}")]
    Malformed {
        /// One-based line of the offending placeholder.
        line: usize,
        /// One-based column of the offending placeholder.
        column: usize,
        /// What is wrong with it.
        reason: String,
    },
}

pub type Result<T> = core::result::Result<T, Error>;
