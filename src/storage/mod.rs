//! History store backends.
//!
//! The [`HistoryStore`] trait defines how trial transitions are persisted and
//! replayed. The driver owns an `Arc<dyn HistoryStore>` and is its only
//! writer.
//!
//! # Available backends
//!
//! | Backend | Description |
//! |---------|-------------|
//! | [`MemoryStorage`] | In-memory log behind a read-write lock, for tests and dry runs |
//! | [`JournalStorage`] | JSONL file with an `fs2` exclusive lock, resumable |
//!
//! # Log model
//!
//! Every call to [`append`](HistoryStore::append) persists the full
//! [`TrialRecord`] as of one transition. [`load`](HistoryStore::load) folds
//! the log by trial id (last entry wins, ordered by first appearance) into a
//! [`HistorySnapshot`], checking that ids first appear in strictly
//! increasing order and that each later entry is a legal transition.
//!
//! # Implementing a custom backend
//!
//! Implement [`append`](HistoryStore::append) and
//! [`load`](HistoryStore::load); reuse [`HistorySnapshot::replay`] to get
//! the same consistency checks as the built-in backends.

mod journal;
mod memory;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use journal::{read_journal, JournalStorage};
pub use memory::MemoryStorage;

use crate::error::{Error, Result};
use crate::parameter::SearchSpace;
use crate::trial::TrialRecord;
use crate::types::{Direction, TrialId, TrialStatus};

/// Identifies a picopt history file.
pub const FORMAT: &str = "picopt-history";

/// Schema version written by this build.
pub const SCHEMA_VERSION: u32 = 2;

/// Durable, append-only ledger of trial transitions.
///
/// Implementations must be `Send + Sync`; concurrent appends for different
/// trials are allowed, appends are serialized internally.
pub trait HistoryStore: Send + Sync {
    /// Durably persist one transition of `record`.
    ///
    /// The call returns only once the entry is acknowledged by the medium.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the entry cannot be written.
    fn append(&self, record: &TrialRecord) -> Result<()>;

    /// Reconstruct the full ledger.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CorruptHistory`] if the log is inconsistent, or
    /// [`Error::Storage`] if it cannot be read.
    fn load(&self) -> Result<HistorySnapshot>;
}

impl<S: HistoryStore + ?Sized> HistoryStore for std::sync::Arc<S> {
    fn append(&self, record: &TrialRecord) -> Result<()> {
        (**self).append(record)
    }

    fn load(&self) -> Result<HistorySnapshot> {
        (**self).load()
    }
}

/// First line of a history file.
///
/// Records the schema version and what the history was written for, so a
/// resumed run can refuse a file that does not match its declarations.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistoryHeader {
    /// Always [`FORMAT`].
    pub format: String,
    /// Schema version of the entries that follow.
    pub version: u32,
    /// Direction of the optimization.
    pub direction: Direction,
    /// The declared search space.
    pub space: SearchSpace,
    /// When the history was created.
    pub created_at: DateTime<Utc>,
}

impl HistoryHeader {
    /// A current-version header for a new history.
    #[must_use]
    pub fn new(direction: Direction, space: SearchSpace) -> Self {
        Self {
            format: FORMAT.to_string(),
            version: SCHEMA_VERSION,
            direction,
            space,
            created_at: Utc::now(),
        }
    }

    /// Check that a history written under `self` can serve a run declaring
    /// `declared`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IncompatibleHistory`] on a format, version,
    /// direction or search-space mismatch.
    pub fn check_compatible(&self, declared: &HistoryHeader, path: &Path) -> Result<()> {
        self.check_readable(path)?;
        let incompatible = |reason: String| Error::IncompatibleHistory {
            path: path.to_path_buf(),
            reason,
        };
        if self.direction != declared.direction {
            return Err(incompatible(format!(
                "history was written to {:?}, run declares {:?}",
                self.direction, declared.direction
            )));
        }
        if self.space != declared.space {
            return Err(incompatible(
                "declared search space differs from the one recorded in history".to_string(),
            ));
        }
        Ok(())
    }

    /// Check that this build understands the format and schema version.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IncompatibleHistory`] for a foreign format or an
    /// unsupported version.
    pub fn check_readable(&self, path: &Path) -> Result<()> {
        if self.format != FORMAT {
            return Err(Error::IncompatibleHistory {
                path: path.to_path_buf(),
                reason: format!("unknown format '{}'", self.format),
            });
        }
        if !(1..=SCHEMA_VERSION).contains(&self.version) {
            return Err(Error::IncompatibleHistory {
                path: path.to_path_buf(),
                reason: format!(
                    "unsupported schema version {} (this build reads 1 to {SCHEMA_VERSION})",
                    self.version
                ),
            });
        }
        Ok(())
    }
}

/// One line of a history file.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum Entry {
    Header(HistoryHeader),
    Record(TrialRecord),
}

/// Borrowed form of [`Entry`] for writing.
#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum EntryRef<'a> {
    Header(&'a HistoryHeader),
    Record(&'a TrialRecord),
}

impl EntryRef<'_> {
    /// Serialize as one newline-terminated JSON line.
    pub(crate) fn to_line(&self) -> serde_json::Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

/// The folded ledger at one point in time.
///
/// Records are ordered by first appearance, which is strictly increasing
/// trial id.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HistorySnapshot {
    records: Vec<TrialRecord>,
}

impl HistorySnapshot {
    /// Fold a sequence of `(line, record)` log entries.
    ///
    /// `line` is only used for error messages.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CorruptHistory`] if an id first appears out of order,
    /// an entry is not a legal successor of the previous entry for the same
    /// trial, or a record breaks the objective/failure invariants.
    pub fn replay<I>(path: &Path, entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = (usize, TrialRecord)>,
    {
        let mut records: Vec<TrialRecord> = Vec::new();
        let mut index: HashMap<TrialId, usize> = HashMap::new();
        let corrupt = |line: usize, reason: String| Error::CorruptHistory {
            path: path.to_path_buf(),
            line,
            reason,
        };

        for (line, record) in entries {
            record
                .check_invariants()
                .map_err(|reason| corrupt(line, reason))?;
            match index.get(&record.id()) {
                Some(&i) => {
                    records[i]
                        .check_successor(&record)
                        .map_err(|reason| corrupt(line, reason))?;
                    records[i] = record;
                }
                None => {
                    if let Some(last) = records.last() {
                        if record.id() <= last.id() {
                            return Err(corrupt(
                                line,
                                format!(
                                    "trial id {} does not exceed earlier id {}",
                                    record.id(),
                                    last.id()
                                ),
                            ));
                        }
                    }
                    index.insert(record.id(), records.len());
                    records.push(record);
                }
            }
        }
        Ok(Self { records })
    }

    /// Build a snapshot from already-folded records.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CorruptHistory`] if ids are not strictly increasing.
    pub fn from_records(records: Vec<TrialRecord>) -> Result<Self> {
        Self::replay(
            &PathBuf::from("<records>"),
            records.into_iter().enumerate().map(|(i, r)| (i + 1, r)),
        )
    }

    /// All records in ledger order.
    #[must_use]
    pub fn records(&self) -> &[TrialRecord] {
        &self.records
    }

    /// Consume the snapshot.
    #[must_use]
    pub fn into_records(self) -> Vec<TrialRecord> {
        self.records
    }

    /// Look up a trial.
    #[must_use]
    pub fn get(&self, id: TrialId) -> Option<&TrialRecord> {
        self.records
            .binary_search_by_key(&id, TrialRecord::id)
            .ok()
            .map(|i| &self.records[i])
    }

    /// Number of trials.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// `true` if no trial was ever proposed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// The id the next proposal must use.
    #[must_use]
    pub fn next_id(&self) -> TrialId {
        self.records
            .last()
            .map_or(TrialId(0), |r| r.id().next())
    }

    /// Number of trials currently in `status`.
    #[must_use]
    pub fn count(&self, status: TrialStatus) -> usize {
        self.records.iter().filter(|r| r.status() == status).count()
    }
}
