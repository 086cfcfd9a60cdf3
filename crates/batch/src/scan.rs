//! Scanner module for discovering work items and their convertible units.
//!
//! Work items are directories under a source root: DVD image directories
//! (containing a `VIDEO_TS` folder) or directories holding loose media files.
//! This module finds them, enumerates each item's units, and filters the
//! candidates against the ledger to produce the remaining work set.

use crate::config::{DiscoveryConfig, SourceLayout};
use crate::encode::{Engine, EngineError, Unit};
use crate::job_executor::is_output_file_name;
use crate::ledger::Ledger;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

/// Marker on the engine's scan line that reports the title count.
pub const TITLE_COUNT_MARKER: &str = "scan: DVD has";

/// Errors that can occur while enumerating an item's units.
#[derive(Debug, Error)]
pub enum ScanError {
    /// The engine scan did not report a usable title count.
    #[error("Could not determine title count: {0}")]
    ScanParse(String),

    /// A files-layout item contains no media files.
    #[error("No video files found in {}", .0.display())]
    NoMedia(PathBuf),

    /// The engine could not be run.
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Discovery rules resolved from configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryRules {
    pub layout: SourceLayout,
    /// Lower-cased extensions including the leading dot.
    pub media_extensions: Vec<String>,
    pub disc_marker: String,
}

impl DiscoveryRules {
    pub fn new(layout: SourceLayout, config: &DiscoveryConfig) -> Self {
        let media_extensions = config
            .media_extensions
            .iter()
            .map(|ext| {
                let ext = ext.trim().to_lowercase();
                if ext.starts_with('.') {
                    ext
                } else {
                    format!(".{}", ext)
                }
            })
            .collect();

        Self {
            layout,
            media_extensions,
            disc_marker: config.disc_marker.clone(),
        }
    }

    /// Checks if a file has a recognised media extension (case-insensitive).
    pub fn is_media_file(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| {
                let ext_lower = format!(".{}", ext.to_lowercase());
                self.media_extensions.contains(&ext_lower)
            })
            .unwrap_or(false)
    }

    /// True when `dir` holds the disc marker directory.
    pub fn is_disc_image(&self, dir: &Path) -> bool {
        dir.join(&self.disc_marker).is_dir()
    }

    /// True when any media file exists anywhere beneath `dir`.
    pub fn has_media(&self, dir: &Path) -> bool {
        media_walker(dir)
            .any(|entry| entry.file_type().is_file() && self.is_media_file(entry.path()))
    }

    /// The candidate predicate for the configured layout.
    pub fn is_candidate(&self, dir: &Path) -> bool {
        match self.layout {
            SourceLayout::Disc => self.is_disc_image(dir),
            SourceLayout::Files => self.has_media(dir),
        }
    }
}

/// A discovered work item location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    /// Directory base name; the ledger key.
    pub identifier: String,
    pub path: PathBuf,
}

impl Candidate {
    fn from_path(path: &Path) -> Option<Self> {
        let identifier = path.file_name()?.to_str()?.to_string();
        Some(Self {
            identifier,
            path: path.to_path_buf(),
        })
    }
}

fn is_hidden(name: &std::ffi::OsStr) -> bool {
    name.to_str().map(|n| n.starts_with('.')).unwrap_or(false)
}

fn media_walker(dir: &Path) -> impl Iterator<Item = walkdir::DirEntry> {
    WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !is_hidden(entry.file_name()))
        .filter_map(|e| e.ok())
}

/// Finds candidate work items under `root`, in file-name order.
///
/// - Disc layout walks the whole tree (root included) and admits every
///   directory that contains the disc marker, without descending into it.
/// - Files layout admits each immediate subdirectory with media beneath it.
///
/// Hidden directories are never candidates.
pub fn find_candidates(root: &Path, rules: &DiscoveryRules) -> Vec<Candidate> {
    let mut candidates = Vec::new();

    match rules.layout {
        SourceLayout::Disc => {
            let mut walker = WalkDir::new(root).sort_by_file_name().into_iter();
            while let Some(entry) = walker.next() {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        tracing::warn!(error = %e, "Skipping unreadable directory entry");
                        continue;
                    }
                };
                if !entry.file_type().is_dir() {
                    continue;
                }
                if entry.depth() > 0 && is_hidden(entry.file_name()) {
                    walker.skip_current_dir();
                    continue;
                }
                if rules.is_disc_image(entry.path()) {
                    if let Some(candidate) = Candidate::from_path(entry.path()) {
                        candidates.push(candidate);
                    }
                    walker.skip_current_dir();
                }
            }
        }
        SourceLayout::Files => {
            let mut dirs: Vec<PathBuf> = match fs::read_dir(root) {
                Ok(entries) => entries
                    .filter_map(|e| e.ok())
                    .filter(|e| !is_hidden(&e.file_name()))
                    .map(|e| e.path())
                    .filter(|p| p.is_dir())
                    .collect(),
                Err(e) => {
                    tracing::warn!(root = %root.display(), error = %e, "Cannot read source root");
                    Vec::new()
                }
            };
            dirs.sort();

            candidates.extend(
                dirs.iter()
                    .filter(|dir| rules.has_media(dir))
                    .filter_map(|dir| Candidate::from_path(dir)),
            );
        }
    }

    candidates
}

/// Extracts the title count from engine scan diagnostics.
///
/// Uses the last line containing `scan: DVD has`; its 5th whitespace token is
/// the count. Returns `None` when the line is absent or the count is not a
/// positive integer.
pub fn parse_title_count(scan_output: &str) -> Option<u32> {
    let line = scan_output
        .lines()
        .filter(|line| line.contains(TITLE_COUNT_MARKER))
        .last()?;

    let count: u32 = line.split_whitespace().nth(4)?.parse().ok()?;
    (count > 0).then_some(count)
}

/// Lists every media file beneath `dir`, sorted by path.
pub fn list_media_files(dir: &Path, rules: &DiscoveryRules) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = media_walker(dir)
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| rules.is_media_file(entry.path()))
        .map(|entry| entry.into_path())
        .collect();
    files.sort();
    files
}

/// An output the driver writes for this item, left by an earlier run.
fn is_previous_output(item_path: &Path, identifier: &str, file: &Path) -> bool {
    file.parent() == Some(item_path)
        && file
            .file_name()
            .and_then(|n| n.to_str())
            .map(|name| is_output_file_name(identifier, name))
            .unwrap_or(false)
}

/// Enumerates the ordered units of one item.
///
/// Disc items are scanned with the engine; files items list their media,
/// minus the item's own outputs from earlier runs. The result is never empty.
pub fn enumerate_units(
    item_path: &Path,
    rules: &DiscoveryRules,
    engine: &dyn Engine,
) -> Result<Vec<Unit>, ScanError> {
    match rules.layout {
        SourceLayout::Disc => {
            let output = engine.scan(item_path)?;
            let count = parse_title_count(&output).ok_or_else(|| {
                ScanError::ScanParse(format!(
                    "no '{}' line in scan output of {}",
                    TITLE_COUNT_MARKER,
                    item_path.display()
                ))
            })?;
            Ok((1..=count).map(Unit::Title).collect())
        }
        SourceLayout::Files => {
            let identifier = item_path.file_name().and_then(|n| n.to_str());
            let files: Vec<PathBuf> = list_media_files(item_path, rules)
                .into_iter()
                .filter(|file| match identifier {
                    Some(id) if is_previous_output(item_path, id, file) => {
                        tracing::debug!(
                            path = %file.display(),
                            "Skipping output of an earlier run"
                        );
                        false
                    }
                    _ => true,
                })
                .collect();
            if files.is_empty() {
                return Err(ScanError::NoMedia(item_path.to_path_buf()));
            }
            Ok(files.into_iter().map(Unit::File).collect())
        }
    }
}

/// The remaining work set plus everything that was excluded from it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkPlan {
    /// Items to convert, in discovery order.
    pub items: Vec<Candidate>,
    /// Identifiers skipped because the ledger marks them finished.
    pub already_complete: Vec<String>,
    /// On disk, but no ledger row.
    pub not_in_ledger: Vec<Candidate>,
    /// Unfinished ledger rows whose directory was not found.
    pub missing_on_disk: Vec<String>,
    /// Unfinished ledger rows whose directory exists but has nothing to convert.
    pub invalid: Vec<Candidate>,
    /// Later directories sharing an identifier with an earlier candidate.
    pub duplicates: Vec<Candidate>,
}

impl WorkPlan {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }
}

/// Filters candidates against the ledger.
///
/// A candidate is remaining work iff its ledger row exists and is not marked
/// finished (`Y` prefix). Every exclusion other than "already complete" is
/// logged as a warning.
pub fn plan_work(
    root: &Path,
    candidates: Vec<Candidate>,
    ledger: &Ledger,
    rules: &DiscoveryRules,
) -> WorkPlan {
    let mut plan = WorkPlan::default();
    let mut seen = HashSet::new();

    for candidate in candidates {
        if !seen.insert(candidate.identifier.clone()) {
            tracing::warn!(
                identifier = %candidate.identifier,
                path = %candidate.path.display(),
                "Duplicate item directory, keeping the first one found"
            );
            plan.duplicates.push(candidate);
            continue;
        }

        match ledger.get(&candidate.identifier) {
            Some(row) if row.is_complete() => {
                plan.already_complete.push(candidate.identifier)
            }
            Some(_) => plan.items.push(candidate),
            None => {
                tracing::warn!(
                    identifier = %candidate.identifier,
                    path = %candidate.path.display(),
                    "Directory has no ledger row, skipping"
                );
                plan.not_in_ledger.push(candidate);
            }
        }
    }

    let unseen: Vec<&str> = ledger
        .items()
        .iter()
        .filter(|row| !row.is_complete() && !seen.contains(&row.identifier))
        .map(|row| row.identifier.as_str())
        .collect();
    let mut located = locate_item_dirs(root, &unseen, rules);

    for identifier in unseen {
        if let Some(dir) = located.remove(identifier) {
            tracing::warn!(
                identifier,
                path = %dir.display(),
                layout = %rules.layout,
                "Directory has nothing to convert"
            );
            plan.invalid.push(Candidate {
                identifier: identifier.to_string(),
                path: dir,
            });
        } else {
            tracing::warn!(
                identifier,
                root = %root.display(),
                "Directory not found for ledger row"
            );
            plan.missing_on_disk.push(identifier.to_string());
        }
    }

    plan
}

/// Finds the directories of ledger rows that discovery did not admit.
///
/// Files-layout items sit directly under `root`. Disc-layout items may be
/// nested, so the tree is walked once the same way discovery walks it; the
/// first directory with a matching name wins.
fn locate_item_dirs(
    root: &Path,
    identifiers: &[&str],
    rules: &DiscoveryRules,
) -> HashMap<String, PathBuf> {
    let mut found = HashMap::new();
    if identifiers.is_empty() {
        return found;
    }

    match rules.layout {
        SourceLayout::Files => {
            for id in identifiers {
                let dir = root.join(id);
                if dir.is_dir() {
                    found.insert(id.to_string(), dir);
                }
            }
        }
        SourceLayout::Disc => {
            let wanted: HashSet<&str> = identifiers.iter().copied().collect();
            let mut walker = WalkDir::new(root).sort_by_file_name().into_iter();
            while let Some(entry) = walker.next() {
                let Ok(entry) = entry else {
                    continue;
                };
                if entry.depth() == 0 || !entry.file_type().is_dir() {
                    continue;
                }
                if is_hidden(entry.file_name()) {
                    walker.skip_current_dir();
                    continue;
                }
                if let Some(name) = entry.file_name().to_str() {
                    if wanted.contains(name) && !found.contains_key(name) {
                        found.insert(name.to_string(), entry.path().to_path_buf());
                    }
                }
                if rules.is_disc_image(entry.path()) {
                    walker.skip_current_dir();
                }
            }
        }
    }

    found
}
