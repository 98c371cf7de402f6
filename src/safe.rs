// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Retention safe management and manipulation.
//!
//! Oxisafe keeps the generational history of every tracked source file in one
//! place called the __safe__. The safe is a single directory holding one table
//! file per tracked source file, and every stored copy those tables still
//! refer to.
//!
//! # Safe Layout
//!
//! The safe can generally be placed anywhere on the user's file system.
//! However, the default location is `$XDG_DATA_HOME/oxisafe-store`. Every
//! tracked source file is given a short storage token derived from its
//! canonical path. Table files are named `<token> -- <file name>.ftab`, and
//! stored copies are named `<token> -- <epoch millis>.dat`. The modification
//! time of a stored copy always matches the timestamp in its name.
//!
//! Oxisafe only evaluates the top-level of the safe directory. Anything that
//! is not a table file or a stored copy is left alone.
//!
//! # Concurrency
//!
//! A safe can be shared between threads. Every operation holds the safe's lock
//! for its whole duration, so stores, promotions, and clears of different
//! source files never interleave. Two safes pointed at the same directory are
//! not coordinated in any way, so do not do that.

use crate::{
    config::SafeConfig,
    path::source_identity,
    schedule::{ScheduleError, SlotSchedule},
    table::{remove_if_exists, FileTable, TableError, TABLE_EXTENSION},
};

use chrono::Utc;
use parking_lot::Mutex;
use std::{
    collections::{HashMap, HashSet},
    fs,
    path::{Path, PathBuf},
};
use tracing::{debug, info, instrument, warn};

/// Directory-scoped container of file tables.
///
/// # Invariant
///
/// - Every file table shares the safe's slot schedule.
/// - Every file table is keyed by the canonical path of its source file.
#[derive(Debug)]
pub struct RetentionSafe {
    directory: PathBuf,
    schedule: SlotSchedule,
    state: Mutex<SafeState>,
}

#[derive(Debug)]
struct SafeState {
    tables: HashMap<PathBuf, FileTable>,
    clock: Option<i64>,
}

impl SafeState {
    fn now(&self) -> i64 {
        self.clock.unwrap_or_else(|| Utc::now().timestamp_millis())
    }
}

impl RetentionSafe {
    /// Open safe at target directory.
    ///
    /// Creates the directory if it does not exist yet. Loads up every table
    /// file found at the top-level of the directory. Table files that cannot
    /// be read or parsed are logged and skipped.
    ///
    /// # Errors
    ///
    /// - Return [`SafeError::InvalidDirectory`] if directory cannot be
    ///   created or inspected, or is not a directory.
    /// - Return [`SafeError::ReadOnlyDirectory`] if directory is not
    ///   writable.
    /// - Return [`SafeError::BadPattern`] if directory cannot be searched.
    #[instrument(skip(directory, schedule), level = "debug")]
    pub fn open(directory: impl AsRef<Path>, schedule: SlotSchedule) -> Result<Self> {
        let directory = prepare_directory(directory.as_ref())?;
        let tables = scan_tables(&directory, &schedule, Scan::Lenient)?;
        info!(
            "open safe {:?} with schedule {schedule} tracking {} files",
            directory.display(),
            tables.len()
        );

        Ok(Self {
            directory,
            schedule,
            state: Mutex::new(SafeState {
                tables,
                clock: None,
            }),
        })
    }

    /// Open safe described by configuration.
    ///
    /// # Errors
    ///
    /// - Return [`SafeError::Schedule`] if configured schedule is invalid.
    /// - Return any error [`RetentionSafe::open`] returns.
    pub fn from_config(config: &SafeConfig) -> Result<Self> {
        let schedule = config.schedule.build()?;
        Self::open(config.directory.as_path(), schedule)
    }

    /// Absolute path of safe directory.
    pub fn directory(&self) -> &Path {
        self.directory.as_path()
    }

    /// Slot schedule shared by every file table.
    pub fn schedule(&self) -> &SlotSchedule {
        &self.schedule
    }

    /// Store new copy of source file.
    ///
    /// Starts tracking the source file if it is not tracked yet. Returns path
    /// of the new stored copy.
    ///
    /// # Errors
    ///
    /// - Return [`SafeError::Table`] if source file cannot be copied, or if
    ///   stale copies cannot be deleted.
    /// - Return [`SafeError::WriteTable`] if table file cannot be written. The
    ///   new copy is still tracked in memory in that case.
    #[instrument(skip(self, path), level = "debug")]
    pub fn store(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        let source = source_identity(path.as_ref());
        let mut state = self.state.lock();
        let now = state.now();

        let mut table = match state.tables.remove(&source) {
            Some(table) => table,
            None => {
                info!("track new file {:?}", source.display());
                FileTable::new(&source, &self.schedule)
            }
        };
        let outcome = match table.store(&self.directory, &self.schedule, &source, now) {
            Ok(copy) => self.persist(&table).map(|()| copy),
            Err(err) => Err(err.into()),
        };

        // INVARIANT: Never keep a table around that holds nothing.
        if !table.referenced().is_empty() {
            state.tables.insert(source, table);
        }

        let copy = outcome?;
        info!("stored new copy {:?}", copy.display());

        Ok(copy)
    }

    /// Promote stored copies of one tracked source file.
    ///
    /// Returns true if any slot changed.
    ///
    /// # Errors
    ///
    /// - Return [`SafeError::NotTracked`] if source file is not tracked.
    /// - Return [`SafeError::Table`] if orphaned copies cannot be deleted.
    /// - Return [`SafeError::WriteTable`] if table file cannot be written.
    #[instrument(skip(self, path), level = "debug")]
    pub fn promote_file(&self, path: impl AsRef<Path>) -> Result<bool> {
        let source = source_identity(path.as_ref());
        let mut state = self.state.lock();
        let now = state.now();
        let table = state
            .tables
            .get_mut(&source)
            .ok_or(SafeError::NotTracked { path: source })?;

        let changed = table.promote(&self.directory, &self.schedule, now)?;
        self.persist(table)?;

        Ok(changed)
    }

    /// Promote stored copies of every tracked source file.
    ///
    /// Returns true if any slot of any table changed.
    ///
    /// # Errors
    ///
    /// - Return [`SafeError::Table`] if orphaned copies cannot be deleted.
    /// - Return [`SafeError::WriteTable`] if a table file cannot be written.
    #[instrument(skip(self), level = "debug")]
    pub fn promote(&self) -> Result<bool> {
        let mut state = self.state.lock();
        let now = state.now();

        let mut changed = false;
        for table in state.tables.values_mut() {
            if table.promote(&self.directory, &self.schedule, now)? {
                debug!("promoted {:?}", table.source().display());
                changed = true;
            }
            self.persist(table)?;
        }

        Ok(changed)
    }

    /// Stop tracking source file, deleting its stored copies and table file.
    ///
    /// Does nothing if source file is not tracked.
    ///
    /// # Errors
    ///
    /// - Return [`SafeError::Table`] if stored copies cannot be deleted.
    /// - Return [`SafeError::RemoveTable`] if table file cannot be deleted.
    #[instrument(skip(self, path), level = "debug")]
    pub fn clear_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let source = source_identity(path.as_ref());
        let mut state = self.state.lock();
        self.clear_tracked(&mut state, &source)
    }

    /// Stop tracking every source file.
    ///
    /// # Errors
    ///
    /// - Return any error [`RetentionSafe::clear_file`] returns.
    #[instrument(skip(self), level = "debug")]
    pub fn clear(&self) -> Result<()> {
        let mut state = self.state.lock();
        let sources = state.tables.keys().cloned().collect::<Vec<_>>();
        for source in sources {
            self.clear_tracked(&mut state, &source)?;
        }

        Ok(())
    }

    /// Check if source file is tracked.
    pub fn contains(&self, path: impl AsRef<Path>) -> bool {
        let path = path.as_ref();
        if path.as_os_str().is_empty() {
            return false;
        }

        let source = source_identity(path);
        self.state.lock().tables.contains_key(&source)
    }

    /// List stored copies of source file from youngest to oldest.
    ///
    /// Only copies that exist on disk are listed. Untracked source files have
    /// no history.
    pub fn history(&self, path: impl AsRef<Path>) -> Vec<PathBuf> {
        let source = source_identity(path.as_ref());
        let state = self.state.lock();
        let Some(table) = state.tables.get(&source) else {
            return Vec::new();
        };

        table
            .history()
            .into_iter()
            .map(|time| table.copy_path(&self.directory, time))
            .filter(|copy| {
                let exists = copy.is_file();
                if !exists {
                    warn!("stored copy {:?} is missing", copy.display());
                }
                exists
            })
            .collect()
    }

    /// Canonical paths of every tracked source file.
    pub fn files(&self) -> HashSet<PathBuf> {
        self.state.lock().tables.keys().cloned().collect()
    }

    /// Report slot occupancy of source file.
    ///
    /// Returns nothing if source file is not tracked.
    pub fn slots(&self, path: impl AsRef<Path>) -> Option<Vec<SlotEntry>> {
        let source = source_identity(path.as_ref());
        let state = self.state.lock();
        let table = state.tables.get(&source)?;

        Some(
            self.schedule
                .iter()
                .zip(table.slots())
                .map(|(slot, held)| SlotEntry {
                    label: slot.label.to_string(),
                    max_age: slot.max_age,
                    time: held.time,
                })
                .collect(),
        )
    }

    /// Fix the safe's notion of "now" in epoch milliseconds.
    ///
    /// A time of zero resumes the live clock.
    ///
    /// # Errors
    ///
    /// - Return [`SafeError::NegativeTime`] if time is negative.
    pub fn set_time_now(&self, time: i64) -> Result<()> {
        if time < 0 {
            return Err(SafeError::NegativeTime(time));
        }

        let mut state = self.state.lock();
        state.clock = (time != 0).then_some(time);
        debug!("clock override set to {:?}", state.clock);

        Ok(())
    }

    /// Current time of the safe in epoch milliseconds.
    pub fn time_now(&self) -> i64 {
        self.state.lock().now()
    }

    /// Fixed time of the safe, if the live clock is not in use.
    pub fn clock_override(&self) -> Option<i64> {
        self.state.lock().clock
    }

    /// Reload every table file from the safe directory.
    ///
    /// Unlike [`RetentionSafe::open`], any table file that cannot be read or
    /// parsed fails the whole reload, leaving tracked files as they were.
    ///
    /// # Errors
    ///
    /// - Return [`SafeError::ReadTable`] if a table file cannot be read.
    /// - Return [`SafeError::InvalidTable`] if a table file is malformed.
    /// - Return [`SafeError::ScanDirectory`] if directory cannot be searched.
    #[instrument(skip(self), level = "debug")]
    pub fn reload(&self) -> Result<()> {
        let mut state = self.state.lock();
        let tables = scan_tables(&self.directory, &self.schedule, Scan::Strict)?;
        info!("reloaded {} tables", tables.len());
        state.tables = tables;

        Ok(())
    }

    fn clear_tracked(&self, state: &mut SafeState, source: &Path) -> Result<()> {
        let Some(table) = state.tables.get(source) else {
            debug!("{:?} is not tracked, nothing to clear", source.display());
            return Ok(());
        };

        let removed = table.purge(&self.directory)?;
        let table_path = self.directory.join(table.table_file_name());
        remove_if_exists(&table_path).map_err(|err| SafeError::RemoveTable {
            source: err,
            path: table_path.clone(),
        })?;
        info!(
            "cleared {:?} with {removed} stored copies",
            source.display()
        );
        state.tables.remove(source);

        Ok(())
    }

    fn persist(&self, table: &FileTable) -> Result<()> {
        let path = self.directory.join(table.table_file_name());
        fs::write(&path, table.to_string()).map_err(|err| SafeError::WriteTable {
            source: err,
            path: path.clone(),
        })?;
        debug!("persisted table {:?}", path.display());

        Ok(())
    }
}

/// Slot occupancy report entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotEntry {
    pub label: String,
    pub max_age: u32,

    /// Epoch milliseconds of occupying copy, or zero if empty.
    pub time: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scan {
    Lenient,
    Strict,
}

fn prepare_directory(directory: &Path) -> Result<PathBuf> {
    let invalid = |err| SafeError::InvalidDirectory {
        source: err,
        path: directory.to_path_buf(),
    };

    mkdirp::mkdirp(directory).map_err(invalid)?;
    let directory = fs::canonicalize(directory).map_err(invalid)?;
    let metadata = fs::metadata(&directory).map_err(invalid)?;
    if !metadata.is_dir() {
        return Err(invalid(std::io::Error::other("not a directory")));
    }

    if metadata.permissions().readonly() {
        return Err(SafeError::ReadOnlyDirectory { path: directory });
    }

    Ok(directory)
}

fn scan_tables(
    directory: &Path,
    schedule: &SlotSchedule,
    scan: Scan,
) -> Result<HashMap<PathBuf, FileTable>> {
    let pattern = format!(
        "{}/*.{TABLE_EXTENSION}",
        glob::Pattern::escape(&directory.to_string_lossy())
    );

    let mut tables = HashMap::new();
    for entry in glob::glob(&pattern)? {
        let outcome = entry
            .map_err(SafeError::ScanDirectory)
            .and_then(|path| read_table(&path, schedule));
        let table = match (outcome, scan) {
            (Ok(table), _) => table,
            (Err(err), Scan::Strict) => return Err(err),
            (Err(err), Scan::Lenient) => {
                warn!("skip table: {err}");
                continue;
            }
        };

        if tables.contains_key(table.source()) {
            warn!(
                "skip duplicate table for {:?}",
                table.source().display()
            );
            continue;
        }
        debug!("load table for {:?}", table.source().display());
        tables.insert(table.source().to_path_buf(), table);
    }

    Ok(tables)
}

fn read_table(path: &Path, schedule: &SlotSchedule) -> Result<FileTable> {
    let content = fs::read_to_string(path).map_err(|err| SafeError::ReadTable {
        source: err,
        path: path.to_path_buf(),
    })?;

    FileTable::parse(content, schedule).map_err(|err| SafeError::InvalidTable {
        source: err,
        path: path.to_path_buf(),
    })
}

/// All possible error types for safe interaction.
#[derive(Debug, thiserror::Error)]
pub enum SafeError {
    /// Slot schedule is invalid.
    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    /// Safe directory cannot be created or is not a directory.
    #[error("invalid safe directory {:?}", .path.display())]
    InvalidDirectory {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Safe directory cannot be written to.
    #[error("safe directory {:?} is read-only", .path.display())]
    ReadOnlyDirectory { path: PathBuf },

    /// Source file is not tracked by the safe.
    #[error("{:?} is not tracked", .path.display())]
    NotTracked { path: PathBuf },

    /// Clock override cannot be negative.
    #[error("time {0} is negative")]
    NegativeTime(i64),

    /// Table file cannot be read from.
    #[error("failed to read table file {:?}", .path.display())]
    ReadTable {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Table file is malformed.
    #[error("invalid table file {:?}", .path.display())]
    InvalidTable {
        #[source]
        source: TableError,
        path: PathBuf,
    },

    /// Table file cannot be written to.
    #[error("failed to write table file {:?}", .path.display())]
    WriteTable {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Table file cannot be deleted.
    #[error("failed to remove table file {:?}", .path.display())]
    RemoveTable {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Safe directory cannot be turned into a search pattern.
    #[error(transparent)]
    BadPattern(#[from] glob::PatternError),

    /// Safe directory cannot be searched.
    #[error(transparent)]
    ScanDirectory(#[from] glob::GlobError),

    /// File table operation fails.
    #[error(transparent)]
    Table(#[from] TableError),
}

impl SafeError {
    /// Check if error can only be fixed by changing how the safe is set up.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Schedule(_) | Self::InvalidDirectory { .. } | Self::ReadOnlyDirectory { .. }
        )
    }

    /// Check if error came from a malformed table file.
    pub fn is_format(&self) -> bool {
        match self {
            Self::InvalidTable { source, .. } => source.is_format(),
            Self::Table(source) => source.is_format(),
            _ => false,
        }
    }
}

/// Friendly result alias :3
pub type Result<T, E = SafeError> = std::result::Result<T, E>;
