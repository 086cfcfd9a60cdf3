//! Ledger module for loading and persisting per-item conversion state.
//!
//! The ledger is a CSV file with a header row. Each row tracks one work item
//! by its `Identifier`. Columns this crate does not know about are carried
//! through a rewrite unchanged and in their original position.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Key column matching an item directory name.
pub const IDENTIFIER_COLUMN: &str = "Identifier";
/// Completion column (`Y...`, `N...` or empty).
pub const FINISHED_COLUMN: &str = "Finished";
/// Count of successfully converted units.
pub const UNITS_COLUMN: &str = "Number of MP4 Files";
/// Semicolon-joined failure and advisory notes.
pub const NOTES_COLUMN: &str = "Notes";

/// Separator between entries of the notes log.
const NOTE_SEPARATOR: &str = "; ";

/// Errors that can occur while loading or persisting the ledger.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// The ledger file does not exist.
    #[error("Ledger not found: {}", .0.display())]
    NotFound(PathBuf),

    /// The ledger file exists but is not a usable CSV ledger.
    #[error("Malformed ledger {}: {reason}", path.display())]
    Format { path: PathBuf, reason: String },

    /// IO error while reading or writing the ledger.
    #[error("Ledger IO error: {0}")]
    Io(#[from] io::Error),
}

/// Completion state of a work item, derived from the `Finished` cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Finished {
    /// Item has never been attempted.
    Unknown,
    /// Last attempt left the item incomplete.
    No,
    /// Item was converted completely.
    Yes,
}

impl Finished {
    /// Parse a raw `Finished` cell: empty is unknown, a case-insensitive `Y` prefix is yes.
    pub fn from_cell(cell: &str) -> Self {
        let trimmed = cell.trim();
        if trimmed.is_empty() {
            Finished::Unknown
        } else if trimmed.starts_with(['y', 'Y']) {
            Finished::Yes
        } else {
            Finished::No
        }
    }
}

/// One ledger row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    /// Unique key; matches a directory name under the source root.
    pub identifier: String,
    /// Raw `Finished` cell.
    pub finished: String,
    /// Raw `Number of MP4 Files` cell.
    pub units_converted: String,
    /// Raw `Notes` cell.
    pub notes: String,
    /// Cells of unrecognised columns, in column order.
    extra: Vec<String>,
}

impl WorkItem {
    /// Create a fresh, never-attempted row.
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            finished: String::new(),
            units_converted: String::new(),
            notes: String::new(),
            extra: Vec::new(),
        }
    }

    /// Parsed completion state.
    pub fn finished_state(&self) -> Finished {
        Finished::from_cell(&self.finished)
    }

    /// True when the row is marked complete and must not be re-run.
    pub fn is_complete(&self) -> bool {
        self.finished_state() == Finished::Yes
    }

    /// Append a note to the log unless that exact entry is already present.
    pub fn append_note(&mut self, note: &str) {
        let note = note.trim();
        if note.is_empty() {
            return;
        }
        if self.has_note(note) {
            return;
        }
        if self.notes.trim().is_empty() {
            self.notes = note.to_string();
        } else {
            self.notes.push_str(NOTE_SEPARATOR);
            self.notes.push_str(note);
        }
    }

    /// True when `note` is a whole `; `-separated entry of the log. Entries may
    /// themselves contain `;`.
    fn has_note(&self, note: &str) -> bool {
        let notes = self.notes.trim();
        notes == note
            || notes.starts_with(&format!("{}{}", note, NOTE_SEPARATOR))
            || notes.ends_with(&format!("{}{}", NOTE_SEPARATOR, note))
            || notes.contains(&format!("{}{}{}", NOTE_SEPARATOR, note, NOTE_SEPARATOR))
    }
}

/// Column positions of the known fields within the header.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Columns {
    headers: Vec<String>,
    identifier: usize,
    finished: usize,
    units: usize,
    notes: usize,
}

impl Columns {
    fn standard() -> Self {
        Self {
            headers: vec![
                IDENTIFIER_COLUMN.to_string(),
                FINISHED_COLUMN.to_string(),
                UNITS_COLUMN.to_string(),
                NOTES_COLUMN.to_string(),
            ],
            identifier: 0,
            finished: 1,
            units: 2,
            notes: 3,
        }
    }

    fn is_known(&self, idx: usize) -> bool {
        idx == self.identifier || idx == self.finished || idx == self.units || idx == self.notes
    }

    fn row_from_cells(&self, cells: &[String]) -> WorkItem {
        let cell = |idx: usize| cells.get(idx).cloned().unwrap_or_default();
        let extra = (0..self.headers.len())
            .filter(|idx| !self.is_known(*idx))
            .map(cell)
            .collect();

        WorkItem {
            identifier: cell(self.identifier),
            finished: cell(self.finished),
            units_converted: cell(self.units),
            notes: cell(self.notes),
            extra,
        }
    }

    fn cells_from_row<'a>(&self, item: &'a WorkItem) -> Vec<&'a str> {
        let mut extra = item.extra.iter();
        (0..self.headers.len())
            .map(|idx| {
                if idx == self.identifier {
                    item.identifier.as_str()
                } else if idx == self.finished {
                    item.finished.as_str()
                } else if idx == self.units {
                    item.units_converted.as_str()
                } else if idx == self.notes {
                    item.notes.as_str()
                } else {
                    extra.next().map(String::as_str).unwrap_or("")
                }
            })
            .collect()
    }
}

/// In-memory ledger plus its optional backing file.
///
/// The ledger owns the canonical row sequence for a run; it is the only
/// component that serializes rows to disk.
#[derive(Debug, Clone)]
pub struct Ledger {
    path: Option<PathBuf>,
    columns: Columns,
    rows: Vec<WorkItem>,
    index: HashMap<String, usize>,
}

impl Ledger {
    /// Load a ledger from a CSV file.
    ///
    /// `Number of MP4 Files` and `Notes` are appended as trailing columns when
    /// the file lacks them; `Identifier` and `Finished` are required.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, LedgerError> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(LedgerError::NotFound(path.to_path_buf()));
        }

        let format_err = |reason: String| LedgerError::Format {
            path: path.to_path_buf(),
            reason,
        };

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_path(path)
            .map_err(|e| match e.into_kind() {
                csv::ErrorKind::Io(io_err) => LedgerError::Io(io_err),
                other => format_err(format!("{:?}", other)),
            })?;

        let mut headers: Vec<String> = reader
            .headers()
            .map_err(|e| format_err(e.to_string()))?
            .iter()
            .map(|h| h.trim_start_matches('\u{feff}').to_string())
            .collect();

        if headers.iter().all(|h| h.trim().is_empty()) {
            return Err(format_err("missing header row".to_string()));
        }

        let position = |headers: &[String], name: &str| headers.iter().position(|h| h == name);

        let identifier = position(&headers, IDENTIFIER_COLUMN)
            .ok_or_else(|| format_err(format!("missing '{}' column", IDENTIFIER_COLUMN)))?;
        let finished = position(&headers, FINISHED_COLUMN)
            .ok_or_else(|| format_err(format!("missing '{}' column", FINISHED_COLUMN)))?;
        let units = match position(&headers, UNITS_COLUMN) {
            Some(idx) => idx,
            None => {
                headers.push(UNITS_COLUMN.to_string());
                headers.len() - 1
            }
        };
        let notes = match position(&headers, NOTES_COLUMN) {
            Some(idx) => idx,
            None => {
                headers.push(NOTES_COLUMN.to_string());
                headers.len() - 1
            }
        };

        let columns = Columns {
            headers,
            identifier,
            finished,
            units,
            notes,
        };

        let mut rows = Vec::new();
        for (line, record) in reader.records().enumerate() {
            let record = record.map_err(|e| format_err(format!("row {}: {}", line + 1, e)))?;
            let cells: Vec<String> = record.iter().map(String::from).collect();
            rows.push(columns.row_from_cells(&cells));
        }

        let index = build_index(&rows).map_err(format_err)?;

        tracing::debug!(path = %path.display(), rows = rows.len(), "Loaded ledger");

        Ok(Self {
            path: Some(path.to_path_buf()),
            columns,
            rows,
            index,
        })
    }

    /// Build a ledger with no backing file, one fresh row per identifier.
    ///
    /// Used by the one-shot variant; [`Ledger::flush`] is a no-op. Repeated
    /// identifiers keep their first row.
    pub fn in_memory<I, S>(identifiers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut rows: Vec<WorkItem> = Vec::new();
        let mut index = HashMap::new();
        for id in identifiers {
            let id = id.into();
            if index.contains_key(&id) {
                continue;
            }
            index.insert(id.clone(), rows.len());
            rows.push(WorkItem::new(id));
        }

        Self {
            path: None,
            columns: Columns::standard(),
            rows,
            index,
        }
    }

    /// Path of the backing file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Column headers in file order.
    pub fn headers(&self) -> &[String] {
        &self.columns.headers
    }

    /// All rows in file order.
    pub fn items(&self) -> &[WorkItem] {
        &self.rows
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// True when the ledger has no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Look up a row by identifier.
    pub fn get(&self, identifier: &str) -> Option<&WorkItem> {
        self.index.get(identifier).map(|&idx| &self.rows[idx])
    }

    /// Replace the row with the same identifier. Returns false if no such row exists.
    pub fn update(&mut self, item: WorkItem) -> bool {
        match self.index.get(&item.identifier) {
            Some(&idx) => {
                let extra = std::mem::take(&mut self.rows[idx].extra);
                let mut item = item;
                if item.extra.is_empty() {
                    item.extra = extra;
                }
                self.rows[idx] = item;
                true
            }
            None => false,
        }
    }

    /// Write every row back to the backing file.
    ///
    /// The file is rewritten through a sibling temporary file and a rename, so
    /// readers never observe a partially written ledger.
    pub fn flush(&self) -> Result<(), LedgerError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let tmp_path = temp_path_for(path);
        let result = self.write_csv(&tmp_path).and_then(|()| {
            fs::rename(&tmp_path, path)?;
            Ok(())
        });

        if result.is_err() {
            let _ = fs::remove_file(&tmp_path);
        }

        result
    }

    fn write_csv(&self, target: &Path) -> Result<(), LedgerError> {
        let mut writer = csv::WriterBuilder::new()
            .from_path(target)
            .map_err(csv_to_io)?;

        writer
            .write_record(&self.columns.headers)
            .map_err(csv_to_io)?;
        for row in &self.rows {
            writer
                .write_record(self.columns.cells_from_row(row))
                .map_err(csv_to_io)?;
        }
        writer.flush()?;
        Ok(())
    }
}

fn build_index(rows: &[WorkItem]) -> Result<HashMap<String, usize>, String> {
    let mut index = HashMap::with_capacity(rows.len());
    for (idx, row) in rows.iter().enumerate() {
        if index.insert(row.identifier.clone(), idx).is_some() {
            return Err(format!("duplicate identifier '{}'", row.identifier));
        }
    }
    Ok(index)
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

fn csv_to_io(e: csv::Error) -> LedgerError {
    match e.into_kind() {
        csv::ErrorKind::Io(io_err) => LedgerError::Io(io_err),
        other => LedgerError::Io(io::Error::new(
            io::ErrorKind::Other,
            format!("{:?}", other),
        )),
    }
}
