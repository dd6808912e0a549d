use std::path::Path;

use parking_lot::RwLock;

use super::{HistorySnapshot, HistoryStore};
use crate::error::Result;
use crate::trial::TrialRecord;

/// In-memory history store.
///
/// Keeps the raw transition log in a `Vec` behind a read-write lock. Nothing
/// survives the process, which makes it the store of choice for tests and
/// dry runs.
#[derive(Default)]
pub struct MemoryStorage {
    log: RwLock<Vec<TrialRecord>>,
}

impl MemoryStorage {
    /// Creates a new, empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store pre-populated with a transition log, as if a previous
    /// run had appended `log` in order.
    #[must_use]
    pub fn with_log(log: Vec<TrialRecord>) -> Self {
        Self {
            log: RwLock::new(log),
        }
    }

    /// Number of appended transitions.
    #[must_use]
    pub fn entries(&self) -> usize {
        self.log.read().len()
    }

    /// A copy of the raw transition log.
    #[must_use]
    pub fn log(&self) -> Vec<TrialRecord> {
        self.log.read().clone()
    }
}

impl HistoryStore for MemoryStorage {
    fn append(&self, record: &TrialRecord) -> Result<()> {
        self.log.write().push(record.clone());
        Ok(())
    }

    fn load(&self) -> Result<HistorySnapshot> {
        let log = self.log.read();
        HistorySnapshot::replay(
            Path::new("<memory>"),
            log.iter().cloned().enumerate().map(|(i, r)| (i + 1, r)),
        )
    }
}
