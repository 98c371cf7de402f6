// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Per-file retention table.
//!
//! Every source file tracked by a safe owns a __file table__. The table
//! records which stored copy currently occupies each slot of the safe's
//! [`SlotSchedule`]. Stored copies are plain byte-for-byte copies of the
//! source file, named after the millisecond timestamp they were taken at.
//!
//! # Promotion
//!
//! As time passes, copies climb the slot ladder. The ladder is scanned from
//! the oldest slot down to the second youngest slot. A slot whose occupant
//! grew older than the slot's maximum age (or that is empty) draws up the
//! copy held by the slot just below it, as long as that copy is strictly
//! younger. The scan repeats until a full pass draws nothing up, so one
//! promotion always leaves the ladder settled. Copies that no slot refers to
//! anymore are deleted from disk afterwards.
//!
//! Drawing up does not clear the younger slot. Thus, the same copy may sit
//! in several neighbouring slots at once. Only copies that lose every
//! reference are ever garbage collected.
//!
//! # Table File Layout
//!
//! Tables persist as small line-oriented UTF-8 files:
//!
//! ```text
//! # oxisafe file-table, 0
//! file = /home/user/notes.txt
//! token = 5d41402abc4b
//! D-1	1700000000000
//! D-2	1699900000000
//! ```
//!
//! Slot lines are sorted by label. Lines starting with '#', and lines that do
//! not look like `label<TAB>integer`, are skipped on read. Slot labels that
//! the current schedule does not know are skipped too, while schedule labels
//! missing from the file are treated as empty.

use crate::schedule::SlotSchedule;

use filetime::{set_file_mtime, FileTime};
use sha2::{Digest, Sha256};
use std::{
    collections::BTreeSet,
    fmt::{Display, Formatter, Result as FmtResult},
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};
use tracing::{debug, instrument, warn};

/// First line of every table file.
pub const TABLE_HEADER: &str = "# oxisafe file-table, 0";

/// Extension of persisted table files.
pub const TABLE_EXTENSION: &str = "ftab";

/// Extension of stored copy files.
pub const COPY_EXTENSION: &str = "dat";

/// Separates storage token from the rest of a file name.
pub const NAME_SEPARATOR: &str = " -- ";

const MILLIS_PER_DAY: i64 = 24 * 60 * 60 * 1000;
const TOKEN_LEN: usize = 12;
const ABBREVIATION_LEN: usize = 40;

/// Digest source path into a short storage token.
///
/// Stored copies and table files are named after this token rather than the
/// full source path.
pub fn storage_token(source: impl AsRef<Path>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source.as_ref().to_string_lossy().as_bytes());
    let mut token = hex::encode(hasher.finalize());
    token.truncate(TOKEN_LEN);
    token
}

/// Elapsed days between `time` and `now`.
///
/// Empty slots (time of zero) have no age. Any real copy is at least one day
/// old, so it can leave the youngest slot on the very next promotion.
pub fn age_in_days(time: i64, now: i64) -> i64 {
    if time == 0 {
        return 0;
    }

    ((now - time) / MILLIS_PER_DAY).max(1)
}

/// Slot of a file table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotTime {
    pub label: String,
    pub time: i64,
}

/// Retention table of a single tracked source file.
///
/// # Invariant
///
/// - Holds exactly one [`SlotTime`] per slot of the schedule it was built
///   with, in schedule order.
/// - A time of zero marks an empty slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileTable {
    source: PathBuf,
    token: String,
    slots: Vec<SlotTime>,
}

impl FileTable {
    /// Construct new empty file table for canonical source path.
    pub fn new(source: impl Into<PathBuf>, schedule: &SlotSchedule) -> Self {
        let source = source.into();
        let token = storage_token(&source);
        let slots = schedule
            .iter()
            .map(|slot| SlotTime {
                label: slot.label.to_string(),
                time: 0,
            })
            .collect();

        Self {
            source,
            token,
            slots,
        }
    }

    /// Parse persisted table file content.
    ///
    /// # Errors
    ///
    /// - Return [`TableError::MissingHeader`] if content is empty.
    /// - Return [`TableError::BadHeader`] if first line is not the table
    ///   header.
    /// - Return [`TableError::MissingSource`] if no source path is recorded.
    pub fn parse(content: impl AsRef<str>, schedule: &SlotSchedule) -> Result<Self> {
        let mut lines = content.as_ref().lines();
        let header = lines.next().ok_or(TableError::MissingHeader)?;
        if header.trim_end() != TABLE_HEADER {
            return Err(TableError::BadHeader {
                found: header.to_string(),
            });
        }

        let mut source = None;
        let mut token = None;
        let mut table_times = vec![0; schedule.len()];
        for line in lines {
            if line.starts_with('#') {
                continue;
            }

            if let Some(value) = line.strip_prefix("file = ") {
                source = Some(PathBuf::from(value));
                continue;
            }

            if let Some(value) = line.strip_prefix("token = ") {
                token = Some(value.trim().to_string());
                continue;
            }

            let Some((label, time)) = line.split_once('\t') else {
                continue;
            };
            let Ok(time) = time.trim().parse::<i64>() else {
                continue;
            };
            if time < 0 {
                continue;
            }

            match schedule.position(label.trim()) {
                Some(index) => table_times[index] = time,
                None => debug!("skip unknown slot label {label:?}"),
            }
        }

        let source = source.ok_or(TableError::MissingSource)?;
        let mut table = Self::new(source, schedule);
        if let Some(token) = token.filter(|token| !token.is_empty()) {
            table.token = token;
        }
        for (slot, time) in table.slots.iter_mut().zip(table_times) {
            slot.time = time;
        }

        Ok(table)
    }

    /// Canonical path of tracked source file.
    pub fn source(&self) -> &Path {
        self.source.as_path()
    }

    /// Storage token used to name files in the safe directory.
    pub fn token(&self) -> &str {
        self.token.as_str()
    }

    /// Slots from youngest to oldest.
    pub fn slots(&self) -> &[SlotTime] {
        self.slots.as_slice()
    }

    /// Time held by slot with given label.
    pub fn time_at(&self, label: impl AsRef<str>) -> Option<i64> {
        self.slots
            .iter()
            .find(|slot| slot.label == label.as_ref())
            .map(|slot| slot.time)
    }

    /// Distinct times of every stored copy still referenced by a slot.
    pub fn referenced(&self) -> BTreeSet<i64> {
        self.slots
            .iter()
            .map(|slot| slot.time)
            .filter(|time| *time != 0)
            .collect()
    }

    /// Check if any slot references a stored copy taken at `time`.
    pub fn is_referenced(&self, time: i64) -> bool {
        time != 0 && self.slots.iter().any(|slot| slot.time == time)
    }

    /// Times of referenced stored copies from youngest to oldest.
    pub fn history(&self) -> Vec<i64> {
        self.referenced().into_iter().rev().collect()
    }

    /// Path of stored copy taken at `time` inside safe directory.
    pub fn copy_path(&self, directory: impl AsRef<Path>, time: i64) -> PathBuf {
        directory.as_ref().join(format!(
            "{}{NAME_SEPARATOR}{time}.{COPY_EXTENSION}",
            self.token
        ))
    }

    /// Glob pattern matching every stored copy file of this table.
    ///
    /// Pattern is relative to the safe directory.
    pub fn copy_pattern(&self) -> String {
        format!(
            "{}{NAME_SEPARATOR}*.{COPY_EXTENSION}",
            glob::Pattern::escape(&self.token)
        )
    }

    /// Name of persisted table file inside safe directory.
    pub fn table_file_name(&self) -> String {
        format!(
            "{}{NAME_SEPARATOR}{}.{TABLE_EXTENSION}",
            self.token,
            abbreviate(&self.source)
        )
    }

    /// Promote stored copies through the slot ladder.
    ///
    /// Settles the ladder completely, then removes stored copies that are no
    /// longer referenced by any slot. Returns true if any slot changed.
    ///
    /// # Errors
    ///
    /// - Return [`TableError::RemoveCopy`] if an orphaned stored copy cannot
    ///   be deleted. Slots keep their settled state in that case.
    #[instrument(skip(self, directory, schedule), fields(token = %self.token), level = "debug")]
    pub fn promote(
        &mut self,
        directory: impl AsRef<Path>,
        schedule: &SlotSchedule,
        now: i64,
    ) -> Result<bool> {
        let before = self.referenced();
        let mut changed = false;

        // INVARIANT: Repeat full passes until nothing gets drawn up.
        loop {
            let mut drawn = false;
            for index in (1..self.slots.len()).rev() {
                let younger = self.slots[index - 1].time;
                let older = self.slots[index].time;
                if younger == 0 || younger == older {
                    continue;
                }

                let older_age = age_in_days(older, now);
                let expired = older_age > i64::from(schedule.max_age(index));
                if older == 0 || (expired && age_in_days(younger, now) < older_age) {
                    debug!(
                        "draw {younger} up into {} over {older}",
                        self.slots[index].label
                    );
                    self.slots[index].time = younger;
                    drawn = true;
                }
            }

            if !drawn {
                break;
            }
            changed = true;
        }

        let after = self.referenced();
        for orphan in before.difference(&after) {
            self.remove_copy(directory.as_ref(), *orphan)?;
        }

        Ok(changed)
    }

    /// Store new copy of source file into youngest slot.
    ///
    /// Settles the ladder, copies the source file into the safe directory
    /// stamped with `now`, places it in the youngest slot, and settles the
    /// ladder again. The copy that previously held the youngest slot is
    /// deleted if nothing refers to it anymore. Returns path of new copy.
    ///
    /// # Errors
    ///
    /// - Return [`TableError::CopySource`] if source file cannot be copied.
    /// - Return [`TableError::StampCopy`] if modification time of the new copy
    ///   cannot be set.
    /// - Return [`TableError::RemoveCopy`] if an orphaned copy cannot be
    ///   deleted.
    #[instrument(skip(self, directory, schedule, source), fields(token = %self.token), level = "debug")]
    pub fn store(
        &mut self,
        directory: impl AsRef<Path>,
        schedule: &SlotSchedule,
        source: impl AsRef<Path>,
        now: i64,
    ) -> Result<PathBuf> {
        let directory = directory.as_ref();
        self.promote(directory, schedule, now)?;
        let prior = self.slots[0].time;

        let copy = self.copy_path(directory, now);
        fs::copy(source.as_ref(), &copy).map_err(|err| TableError::CopySource {
            source: err,
            from: source.as_ref().to_path_buf(),
            to: copy.clone(),
        })?;
        let stamp = FileTime::from_unix_time(
            now.div_euclid(1000),
            (now.rem_euclid(1000) * 1_000_000) as u32,
        );
        set_file_mtime(&copy, stamp).map_err(|err| TableError::StampCopy {
            source: err,
            path: copy.clone(),
        })?;

        self.slots[0].time = now;
        self.promote(directory, schedule, now)?;

        if prior != now && prior != 0 && !self.is_referenced(prior) {
            self.remove_copy(directory, prior)?;
        }

        Ok(copy)
    }

    /// Delete every stored copy of this table from safe directory.
    ///
    /// Sweeps up stray copies carrying this table's storage token as well,
    /// e.g., copies left behind by an interrupted store. Slots are left as
    /// they are. Returns number of copies deleted.
    ///
    /// # Errors
    ///
    /// - Return [`TableError::BadPattern`] if safe directory cannot be turned
    ///   into a search pattern.
    /// - Return [`TableError::ScanCopies`] if safe directory cannot be
    ///   searched.
    /// - Return [`TableError::RemoveCopy`] if a stored copy cannot be
    ///   deleted.
    pub fn purge(&self, directory: impl AsRef<Path>) -> Result<usize> {
        let directory = directory.as_ref();
        let mut copies = self
            .referenced()
            .into_iter()
            .map(|time| self.copy_path(directory, time))
            .collect::<BTreeSet<_>>();

        let pattern = format!(
            "{}/{}",
            glob::Pattern::escape(&directory.to_string_lossy()),
            self.copy_pattern()
        );
        for entry in glob::glob(&pattern)? {
            copies.insert(entry?);
        }

        let mut removed = 0;
        for copy in copies {
            if remove_if_exists(&copy).map_err(|err| TableError::RemoveCopy {
                source: err,
                path: copy.clone(),
            })? {
                removed += 1;
            }
        }

        Ok(removed)
    }

    fn remove_copy(&self, directory: &Path, time: i64) -> Result<()> {
        let path = self.copy_path(directory, time);
        match remove_if_exists(&path) {
            Ok(true) => debug!("removed stored copy {:?}", path.display()),
            Ok(false) => warn!("stored copy {:?} already gone", path.display()),
            Err(err) => return Err(TableError::RemoveCopy { source: err, path }),
        }

        Ok(())
    }
}

impl Display for FileTable {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        writeln!(fmt, "{TABLE_HEADER}")?;
        writeln!(fmt, "file = {}", self.source.display())?;
        writeln!(fmt, "token = {}", self.token)?;

        let mut slots = self.slots.iter().collect::<Vec<_>>();
        slots.sort_by(|a, b| a.label.cmp(&b.label));
        for slot in slots {
            writeln!(fmt, "{}\t{}", slot.label, slot.time)?;
        }

        Ok(())
    }
}

/// Remove file, treating a missing file as already removed.
///
/// Returns true if the file existed.
pub(crate) fn remove_if_exists(path: &Path) -> std::io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}

/// Shorten source file name so it fits into a table file name.
fn abbreviate(source: &Path) -> String {
    let name = source
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unnamed".into());

    name.chars()
        .map(|ch| {
            if ch.is_alphanumeric() || matches!(ch, '.' | '-' | '_') {
                ch
            } else {
                '_'
            }
        })
        .take(ABBREVIATION_LEN)
        .collect()
}

/// File table error types.
#[derive(Debug, thiserror::Error)]
pub enum TableError {
    /// Table file has no content at all.
    #[error("table file is missing its header")]
    MissingHeader,

    /// Table file does not start with the expected header.
    #[error("table file has unrecognized header {found:?}")]
    BadHeader { found: String },

    /// Table file never names the source file it tracks.
    #[error("table file does not name its source file")]
    MissingSource,

    /// Source file cannot be copied into the safe.
    #[error("failed to copy {:?} into {:?}", .from.display(), .to.display())]
    CopySource {
        #[source]
        source: std::io::Error,
        from: PathBuf,
        to: PathBuf,
    },

    /// Modification time of stored copy cannot be set.
    #[error("failed to stamp modification time of {:?}", .path.display())]
    StampCopy {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Safe directory cannot be turned into a search pattern.
    #[error(transparent)]
    BadPattern(#[from] glob::PatternError),

    /// Safe directory cannot be searched for stored copies.
    #[error(transparent)]
    ScanCopies(#[from] glob::GlobError),

    /// Stored copy cannot be deleted.
    #[error("failed to remove stored copy {:?}", .path.display())]
    RemoveCopy {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },
}

impl TableError {
    /// Check if error came from a malformed table file.
    pub fn is_format(&self) -> bool {
        matches!(
            self,
            Self::MissingHeader | Self::BadHeader { .. } | Self::MissingSource
        )
    }
}

/// Friendly result alias :3
pub type Result<T, E = TableError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::{formatdoc, indoc};
    use pretty_assertions::assert_eq;

    const T0: i64 = 1_700_000_000_000;
    const HOUR: i64 = 60 * 60 * 1000;
    const DAY: i64 = 24 * HOUR;

    fn schedule() -> SlotSchedule {
        SlotSchedule::new(4, 3, 3).unwrap()
    }

    fn times(table: &FileTable) -> Vec<i64> {
        table.slots().iter().map(|slot| slot.time).collect()
    }

    #[test]
    fn age_in_days_rounds_up_to_one() {
        assert_eq!(age_in_days(0, T0), 0);
        assert_eq!(age_in_days(T0, T0), 1);
        assert_eq!(age_in_days(T0, T0 + DAY + HOUR), 1);
        assert_eq!(age_in_days(T0, T0 + 3 * DAY), 3);
    }

    #[test]
    fn storage_token_is_short_and_stable() {
        let token = storage_token("/home/blah/notes.txt");
        assert_eq!(token.len(), 12);
        assert_eq!(token, storage_token("/home/blah/notes.txt"));
        assert_ne!(token, storage_token("/home/blah/other.txt"));
    }

    #[test]
    fn file_table_first_store_fills_ladder() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let source = dir.path().join("notes.txt");
        fs::write(&source, "v1")?;
        let safe = dir.path().join("safe");
        fs::create_dir(&safe)?;

        let schedule = schedule();
        let mut table = FileTable::new(&source, &schedule);
        let copy = table.store(&safe, &schedule, &source, T0)?;

        assert_eq!(copy, table.copy_path(&safe, T0));
        assert_eq!(fs::read_to_string(&copy)?, "v1");
        assert_eq!(times(&table), vec![T0; 10]);
        assert_eq!(table.history(), vec![T0]);

        let mtime = FileTime::from_last_modification_time(&fs::metadata(&copy)?);
        assert_eq!(mtime.unix_seconds() * 1000, T0);

        Ok(())
    }

    #[test]
    fn file_table_daily_stores_climb_ladder() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let source = dir.path().join("notes.txt");
        fs::write(&source, "v")?;

        let schedule = schedule();
        let mut table = FileTable::new(&source, &schedule);
        table.store(dir.path(), &schedule, &source, T0)?;

        let t1 = T0 + DAY + 30 * 60 * 1000;
        table.store(dir.path(), &schedule, &source, t1)?;
        assert_eq!(table.history(), vec![t1, T0]);

        // Youngest copy of yesterday loses its only slot and gets removed.
        let t2 = t1 + DAY;
        table.store(dir.path(), &schedule, &source, t2)?;
        assert_eq!(table.history(), vec![t2, T0]);
        assert!(!table.copy_path(dir.path(), t1).exists());

        // D-2 expires and draws up yesterday's copy.
        let t3 = t2 + DAY;
        table.store(dir.path(), &schedule, &source, t3)?;
        assert_eq!(table.history(), vec![t3, t2, T0]);
        assert_eq!(table.time_at("D-2"), Some(t2));
        assert_eq!(table.time_at("D-3"), Some(T0));

        for time in table.history() {
            assert!(table.copy_path(dir.path(), time).exists());
        }

        Ok(())
    }

    #[test]
    fn file_table_promote_is_idempotent() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let source = dir.path().join("notes.txt");
        fs::write(&source, "v")?;

        let schedule = schedule();
        let mut table = FileTable::new(&source, &schedule);
        for day in 0..12 {
            table.store(dir.path(), &schedule, &source, T0 + day * DAY)?;
        }

        let now = T0 + 40 * DAY;
        table.promote(dir.path(), &schedule, now)?;
        let settled = table.clone();
        assert!(!table.promote(dir.path(), &schedule, now)?);
        assert_eq!(table, settled);

        Ok(())
    }

    #[test]
    fn file_table_never_exceeds_slot_budget() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let source = dir.path().join("notes.txt");
        fs::write(&source, "v")?;

        let schedule = schedule();
        let mut table = FileTable::new(&source, &schedule);
        for step in 0..200 {
            table.store(dir.path(), &schedule, &source, T0 + step * 5 * DAY / 2)?;
            assert!(table.referenced().len() <= schedule.len());
        }

        let on_disk = fs::read_dir(dir.path())?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().extension().is_some_and(|ext| ext == COPY_EXTENSION))
            .count();
        assert_eq!(on_disk, table.referenced().len());

        Ok(())
    }

    #[test]
    fn file_table_display() {
        let schedule = SlotSchedule::new(2, 1, 0).unwrap();
        let mut table = FileTable::new("/home/blah/notes.txt", &schedule);
        table.slots[0].time = 300;
        table.slots[1].time = 200;

        let result = table.to_string();
        let expect = formatdoc! {"
            # oxisafe file-table, 0
            file = /home/blah/notes.txt
            token = {token}
            D-1\t300
            D-2\t200
            M-1\t0
            ",
            token = storage_token("/home/blah/notes.txt"),
        };
        assert_eq!(result, expect);
    }

    #[test]
    fn file_table_parse() -> anyhow::Result<()> {
        let schedule = SlotSchedule::new(2, 1, 0)?;
        let content = indoc! {"
            # oxisafe file-table, 0
            # written by hand
            file = /home/blah/notes.txt
            token = abcdef012345
            D-1\t300
            W-9\t100
            D-2\tnot-a-number
            garbage line
        "};

        let table = FileTable::parse(content, &schedule)?;
        assert_eq!(table.source(), Path::new("/home/blah/notes.txt"));
        assert_eq!(table.token(), "abcdef012345");
        assert_eq!(times(&table), vec![300, 0, 0]);
        assert_eq!(table.table_file_name(), "abcdef012345 -- notes.txt.ftab");

        Ok(())
    }

    #[test]
    fn file_table_parse_rejects_bad_header() {
        let schedule = schedule();
        let result = FileTable::parse("# some other file, 0\nfile = /x\n", &schedule);
        assert!(matches!(result, Err(TableError::BadHeader { .. })));

        let result = FileTable::parse("", &schedule);
        assert!(matches!(result, Err(TableError::MissingHeader)));

        let result = FileTable::parse("# oxisafe file-table, 0\nD-1\t5\n", &schedule);
        assert!(matches!(result, Err(TableError::MissingSource)));
    }

    #[test]
    fn file_table_name_abbreviates_source() {
        let schedule = schedule();
        let table = FileTable::new(
            "/tmp/a very long name with spaces and more characters than allowed.txt",
            &schedule,
        );
        let name = table.table_file_name();
        assert!(name.starts_with(table.token()));
        assert!(name.ends_with(".ftab"));
        assert!(!name[table.token().len() + NAME_SEPARATOR.len()..].contains(' '));
    }
}
