//! JSONL-based journal history backend.

use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use parking_lot::Mutex;

use super::{Entry, EntryRef, HistoryHeader, HistorySnapshot, HistoryStore, SCHEMA_VERSION};
use crate::error::{Error, Result};
use crate::trial::TrialRecord;

/// A history store that appends trial transitions as JSON lines to a file.
///
/// The first line is a [`HistoryHeader`]; every following line is one
/// transition of one trial. Opening the journal takes an exclusive `fs2`
/// lock on `<path>.lock` that is held until the storage is dropped, so at
/// most one driver writes a history at a time.
///
/// A final line cut short by a crash (no trailing newline and not valid
/// JSON) is treated as never written: it is dropped on open and truncated
/// before the next append. Any other unreadable line is corruption.
///
/// # Examples
///
/// ```no_run
/// use picopt::parameter::{SearchSpace, VariableSpec};
/// use picopt::storage::{HistoryHeader, JournalStorage};
/// use picopt::Direction;
///
/// let space = SearchSpace::new(vec![VariableSpec::continuous("a0", 1.0, 4.0)], None).unwrap();
/// let header = HistoryHeader::new(Direction::Maximize, space);
/// let storage = JournalStorage::open("history.jsonl", header).unwrap();
/// ```
pub struct JournalStorage {
    path: PathBuf,
    header: HistoryHeader,
    /// Append handle; the mutex serializes in-process writes.
    file: Mutex<File>,
    lock: File,
}

/// A parsed history file.
struct ParsedJournal {
    header: HistoryHeader,
    entries: Vec<(usize, TrialRecord)>,
    /// Byte length of the intact prefix.
    valid_len: u64,
    /// A torn final line follows the intact prefix.
    torn: bool,
    /// The last intact line lacks its newline.
    unterminated: bool,
}

impl JournalStorage {
    /// Opens (or creates) the journal at `path` for a run declared by
    /// `declared`.
    ///
    /// A missing or empty file is initialized with `declared`. An existing
    /// file must carry a compatible header; a version 1 file is rewritten as
    /// the current version before use.
    ///
    /// # Errors
    ///
    /// - [`Error::LockConflict`] if another process holds the journal.
    /// - [`Error::IncompatibleHistory`] if the header is missing, has an
    ///   unsupported version, or was written for a different search space or
    ///   direction.
    /// - [`Error::CorruptHistory`] if a line cannot be read or replayed.
    /// - [`Error::Storage`] on I/O failure.
    pub fn open(path: impl AsRef<Path>, declared: HistoryHeader) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| Error::storage(parent, e))?;
        }
        let lock = acquire_lock(&path)?;

        let header = match parse_journal(&path)? {
            None => {
                rewrite(&path, &declared, core::iter::empty())?;
                tracing::debug!(path = %path.display(), "created history");
                declared
            }
            Some(parsed) => {
                parsed.header.check_compatible(&declared, &path)?;
                HistorySnapshot::replay(&path, parsed.entries.iter().cloned())?;

                if parsed.header.version < SCHEMA_VERSION {
                    let mut upgraded = parsed.header.clone();
                    upgraded.version = SCHEMA_VERSION;
                    rewrite(&path, &upgraded, parsed.entries.iter().map(|(_, r)| r))?;
                    tracing::info!(
                        path = %path.display(),
                        from = parsed.header.version,
                        to = SCHEMA_VERSION,
                        "upgraded history schema"
                    );
                    upgraded
                } else {
                    if parsed.torn {
                        tracing::warn!(
                            path = %path.display(),
                            valid_bytes = parsed.valid_len,
                            "dropping torn final history line"
                        );
                        truncate(&path, parsed.valid_len)?;
                    }
                    if parsed.unterminated {
                        let mut file = open_append(&path)?;
                        file.write_all(b"\n").map_err(|e| Error::storage(&path, e))?;
                    }
                    parsed.header
                }
            }
        };

        let file = open_append(&path)?;
        Ok(Self {
            path,
            header,
            file: Mutex::new(file),
            lock,
        })
    }

    /// The journal file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The header in effect (after any upgrade).
    #[must_use]
    pub fn header(&self) -> &HistoryHeader {
        &self.header
    }

    /// Rewrite the journal as its folded snapshot: one line per trial.
    ///
    /// The new file is written next to the journal and renamed over it, so a
    /// crash leaves either the old or the new log in place.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] on I/O failure, or the errors of
    /// [`load`](HistoryStore::load).
    pub fn compact(&self) -> Result<()> {
        let mut file = self.file.lock();
        let snapshot = self.load()?;
        rewrite(&self.path, &self.header, snapshot.records().iter())?;
        *file = open_append(&self.path)?;
        tracing::info!(
            path = %self.path.display(),
            trials = snapshot.len(),
            "compacted history"
        );
        Ok(())
    }
}

impl HistoryStore for JournalStorage {
    fn append(&self, record: &TrialRecord) -> Result<()> {
        let line = EntryRef::Record(record)
            .to_line()
            .map_err(|e| Error::storage(&self.path, e))?;

        let mut file = self.file.lock();
        file.write_all(line.as_bytes())
            .map_err(|e| Error::storage(&self.path, e))?;
        file.sync_data()
            .map_err(|e| Error::storage(&self.path, e))?;
        Ok(())
    }

    fn load(&self) -> Result<HistorySnapshot> {
        match parse_journal(&self.path)? {
            Some(parsed) => HistorySnapshot::replay(&self.path, parsed.entries),
            None => Ok(HistorySnapshot::default()),
        }
    }
}

impl Drop for JournalStorage {
    fn drop(&mut self) {
        let _ = self.lock.unlock();
    }
}

/// Read a journal without locking or modifying it.
///
/// Used by the query interface; a torn final line is ignored.
///
/// # Errors
///
/// Returns [`Error::Storage`] if the file does not exist or cannot be read,
/// [`Error::IncompatibleHistory`] if its header is missing or unsupported,
/// and [`Error::CorruptHistory`] if it cannot be replayed.
pub fn read_journal(path: impl AsRef<Path>) -> Result<(HistoryHeader, HistorySnapshot)> {
    let path = path.as_ref();
    let parsed = parse_journal(path)?
        .ok_or_else(|| Error::storage(path, "history file is empty or missing"))?;
    let snapshot = HistorySnapshot::replay(path, parsed.entries)?;
    Ok((parsed.header, snapshot))
}

fn lock_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".lock");
    PathBuf::from(name)
}

fn acquire_lock(path: &Path) -> Result<File> {
    let lock_path = lock_path(path);
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(&lock_path)
        .map_err(|e| Error::storage(&lock_path, e))?;
    match file.try_lock_exclusive() {
        Ok(()) => Ok(file),
        Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
            Err(Error::LockConflict { path: lock_path })
        }
        Err(e) => Err(Error::storage(&lock_path, e)),
    }
}

fn open_append(path: &Path) -> Result<File> {
    OpenOptions::new()
        .append(true)
        .open(path)
        .map_err(|e| Error::storage(path, e))
}

fn truncate(path: &Path, len: u64) -> Result<()> {
    let file = OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(|e| Error::storage(path, e))?;
    file.set_len(len).map_err(|e| Error::storage(path, e))?;
    file.sync_all().map_err(|e| Error::storage(path, e))
}

/// Atomically replace `path` with `header` followed by `records`.
fn rewrite<'a>(
    path: &Path,
    header: &HistoryHeader,
    records: impl Iterator<Item = &'a TrialRecord>,
) -> Result<()> {
    // Write to a temp file in the same directory, then rename.
    let parent = path.parent().unwrap_or(Path::new("."));
    let tmp_path = parent.join(format!(
        ".{}.tmp",
        path.file_name().unwrap_or_default().to_string_lossy()
    ));
    write_journal(&tmp_path, header, records).map_err(|e| Error::storage(&tmp_path, e))?;
    fs::rename(&tmp_path, path).map_err(|e| Error::storage(path, e))
}

fn write_journal<'a>(
    path: &Path,
    header: &HistoryHeader,
    records: impl Iterator<Item = &'a TrialRecord>,
) -> std::io::Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    let line = EntryRef::Header(header)
        .to_line()
        .map_err(std::io::Error::other)?;
    writer.write_all(line.as_bytes())?;
    for record in records {
        let line = EntryRef::Record(record)
            .to_line()
            .map_err(std::io::Error::other)?;
        writer.write_all(line.as_bytes())?;
    }
    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()
}

/// Parse a journal file. `None` means missing, empty, or holding nothing
/// but a torn header.
fn parse_journal(path: &Path) -> Result<Option<ParsedJournal>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::storage(path, e)),
    };

    let mut header: Option<HistoryHeader> = None;
    let mut entries = Vec::new();
    let mut valid_len = 0usize;
    let mut torn = false;
    let mut unterminated = false;

    for (index, chunk) in bytes.split_inclusive(|b| *b == b'\n').enumerate() {
        let line = index + 1;
        let complete = chunk.ends_with(b"\n");
        let body = chunk.trim_ascii();
        if body.is_empty() {
            valid_len += chunk.len();
            continue;
        }

        let entry = match serde_json::from_slice::<Entry>(body) {
            Ok(entry) => entry,
            Err(_) if !complete => {
                torn = true;
                break;
            }
            Err(e) if header.is_none() => {
                return Err(Error::IncompatibleHistory {
                    path: path.to_path_buf(),
                    reason: format!("missing or unreadable header: {e}"),
                });
            }
            Err(e) => {
                return Err(Error::CorruptHistory {
                    path: path.to_path_buf(),
                    line,
                    reason: e.to_string(),
                });
            }
        };

        match (entry, header.is_some()) {
            (Entry::Header(h), false) => {
                h.check_readable(path)?;
                header = Some(h);
            }
            (Entry::Header(_), true) => {
                return Err(Error::CorruptHistory {
                    path: path.to_path_buf(),
                    line,
                    reason: "unexpected second header".to_string(),
                });
            }
            (Entry::Record(_), false) => {
                return Err(Error::IncompatibleHistory {
                    path: path.to_path_buf(),
                    reason: "first line is not a history header".to_string(),
                });
            }
            (Entry::Record(record), true) => entries.push((line, record)),
        }
        valid_len += chunk.len();
        unterminated = !complete;
    }

    Ok(header.map(|header| ParsedJournal {
        header,
        entries,
        valid_len: valid_len as u64,
        torn,
        unterminated,
    }))
}
