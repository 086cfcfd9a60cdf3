//! Item conversion driver
//!
//! Converts one work item: enumerates its units, runs the engine once per unit
//! strictly in order, and folds the per-unit outcomes into a single verdict
//! for the item's ledger row.

use crate::classify::{ProgressTracker, UnitNotice};
use crate::encode::{Engine, EngineError, Unit, UnitExit};
use crate::ledger::WorkItem;
use crate::report::RunObserver;
use crate::scan::{enumerate_units, Candidate, DiscoveryRules, ScanError};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Note recorded when a disc scan does not report a title count.
pub const SCAN_FAILED_NOTE: &str = "Failed to determine title count";
/// Note recorded when a files item has no media left to convert.
pub const NO_MEDIA_NOTE: &str = "No video files found";
/// Advisory recorded when any unit produced a corruption warning.
pub const CORRUPTION_NOTE: &str = "Files might be corrupt";

/// Extension of every output file.
const OUTPUT_EXTENSION: &str = "mp4";
/// Separates the item identifier from the unit index in multi-unit output names.
const TITLE_SUFFIX: &str = "-Title_";

/// Error type for item conversion
#[derive(Debug, Error)]
pub enum ItemError {
    /// The engine could not be launched; no later item can succeed either
    #[error("Engine unavailable: {0}")]
    EngineUnavailable(EngineError),

    /// The engine started but talking to it failed
    #[error("Engine error: {0}")]
    Engine(EngineError),
}

impl ItemError {
    /// Fatal errors stop the whole batch instead of failing one item.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ItemError::EngineUnavailable(_))
    }
}

impl From<EngineError> for ItemError {
    fn from(e: EngineError) -> Self {
        match e {
            e @ EngineError::Launch { .. } => ItemError::EngineUnavailable(e),
            e => ItemError::Engine(e),
        }
    }
}

/// Stage of an item in the conversion state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemStage {
    /// Determining the item's units
    Scanning,
    /// Running the engine on unit `unit` (1-based) of `total`
    Converting { unit: usize, total: usize },
    /// Folding unit outcomes into the verdict
    Aggregating,
    /// Verdict computed
    Done,
}

impl ItemStage {
    pub fn as_str(&self) -> &str {
        match self {
            ItemStage::Scanning => "scanning",
            ItemStage::Converting { .. } => "converting",
            ItemStage::Aggregating => "aggregating",
            ItemStage::Done => "done",
        }
    }
}

/// Result of converting one unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitOutcome {
    /// 1-based position of the unit within its item.
    pub index: usize,
    pub exit: UnitExit,
    pub corrupted: bool,
    pub last_percent: u8,
}

impl UnitOutcome {
    pub fn success(&self) -> bool {
        self.exit.success()
    }
}

/// Derived pass/fail status of an item, written back to its ledger row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemVerdict {
    /// True iff every unit converted.
    pub finished: bool,
    /// Units attempted.
    pub units_total: u32,
    /// Successfully converted units; `None` leaves the ledger cell untouched.
    pub units_converted: Option<u32>,
    /// Notes to append to the row, in order.
    pub notes: Vec<String>,
}

impl ItemVerdict {
    /// Fold per-unit outcomes. Depends only on the outcomes themselves.
    pub fn from_outcomes(outcomes: &[UnitOutcome]) -> Self {
        let failed: Vec<String> = outcomes
            .iter()
            .filter(|o| !o.success())
            .map(|o| o.index.to_string())
            .collect();
        let succeeded = outcomes.len() - failed.len();

        let mut notes = Vec::new();
        if !failed.is_empty() {
            notes.push(format!("Failed to convert titles: {}", failed.join(", ")));
        }
        if outcomes.iter().any(|o| o.corrupted) {
            notes.push(CORRUPTION_NOTE.to_string());
        }

        Self {
            finished: !outcomes.is_empty() && failed.is_empty(),
            units_total: outcomes.len() as u32,
            units_converted: Some(succeeded as u32),
            notes,
        }
    }

    /// No units could be determined; nothing was attempted.
    pub fn scan_failed(note: &str) -> Self {
        Self {
            finished: false,
            units_total: 0,
            units_converted: Some(0),
            notes: vec![note.to_string()],
        }
    }

    /// Something unexpected broke the item; the unit count is left as it was.
    pub fn unexpected(identifier: &str, reason: &str) -> Self {
        Self {
            finished: false,
            units_total: 0,
            units_converted: None,
            notes: vec![format!(
                "Unexpected error processing directory {}: {}",
                identifier, reason
            )],
        }
    }

    /// Write the verdict into a ledger row. Applying it again changes nothing.
    pub fn apply_to(&self, item: &mut WorkItem) {
        item.finished = if self.finished { "Y" } else { "N" }.to_string();
        if let Some(count) = self.units_converted {
            item.units_converted = count.to_string();
        }
        for note in &self.notes {
            item.append_note(note);
        }
    }
}

/// Output file name for unit `index` (1-based) of `total`.
///
/// A single-unit item is named after the item; otherwise each unit gets a
/// `-Title_<n>` suffix.
pub fn output_file_name(identifier: &str, index: usize, total: usize) -> String {
    if total == 1 {
        format!("{}.{}", identifier, OUTPUT_EXTENSION)
    } else {
        format!("{}{}{}.{}", identifier, TITLE_SUFFIX, index, OUTPUT_EXTENSION)
    }
}

/// True when `file_name` is one of the names [`output_file_name`] produces for
/// `identifier`, for any unit count.
pub fn is_output_file_name(identifier: &str, file_name: &str) -> bool {
    let Some(stem) = file_name
        .strip_suffix(OUTPUT_EXTENSION)
        .and_then(|rest| rest.strip_suffix('.'))
    else {
        return false;
    };
    if stem == identifier {
        return true;
    }
    stem.strip_prefix(identifier)
        .and_then(|rest| rest.strip_prefix(TITLE_SUFFIX))
        .map(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
        .unwrap_or(false)
}

/// Output path for a unit: next to the source, inside the item directory.
pub fn output_path(item: &Candidate, index: usize, total: usize) -> PathBuf {
    item.path.join(output_file_name(&item.identifier, index, total))
}

/// Converts work items one at a time.
pub struct ItemDriver {
    engine: Arc<dyn Engine>,
    rules: DiscoveryRules,
    observer: Arc<dyn RunObserver>,
}

impl ItemDriver {
    pub fn new(
        engine: Arc<dyn Engine>,
        rules: DiscoveryRules,
        observer: Arc<dyn RunObserver>,
    ) -> Self {
        Self {
            engine,
            rules,
            observer,
        }
    }

    /// Run the full state machine for one item.
    ///
    /// Scan failures and failed units are part of the verdict. Only engine
    /// errors come back as `Err`, and only [`ItemError::EngineUnavailable`] is fatal.
    pub fn convert_item(&self, item: &Candidate) -> Result<ItemVerdict, ItemError> {
        self.enter(item, ItemStage::Scanning);

        let units = match enumerate_units(&item.path, &self.rules, self.engine.as_ref()) {
            Ok(units) => units,
            Err(ScanError::Engine(e)) => return Err(e.into()),
            Err(e) => {
                let note = match e {
                    ScanError::NoMedia(_) => NO_MEDIA_NOTE,
                    _ => SCAN_FAILED_NOTE,
                };
                tracing::warn!(identifier = %item.identifier, error = %e, "Skipping item");
                self.enter(item, ItemStage::Done);
                return Ok(ItemVerdict::scan_failed(note));
            }
        };

        tracing::info!(
            identifier = %item.identifier,
            units = units.len(),
            "Found units to convert"
        );

        let total = units.len();
        let mut outcomes = Vec::with_capacity(total);
        for (offset, unit) in units.iter().enumerate() {
            let index = offset + 1;
            self.enter(item, ItemStage::Converting { unit: index, total });

            let output = output_path(item, index, total);
            let outcome = self.convert_unit(item, unit, index, &output)?;

            if outcome.success() {
                tracing::info!(
                    identifier = %item.identifier,
                    unit = index,
                    output = %output.display(),
                    "Unit converted"
                );
            } else {
                tracing::warn!(
                    identifier = %item.identifier,
                    unit = index,
                    code = ?outcome.exit.code,
                    stalled = outcome.exit.stalled,
                    "Unit failed to convert"
                );
            }

            self.observer.unit_finished(item, &outcome, &output);
            outcomes.push(outcome);
        }

        self.enter(item, ItemStage::Aggregating);
        let verdict = ItemVerdict::from_outcomes(&outcomes);
        self.enter(item, ItemStage::Done);

        Ok(verdict)
    }

    fn enter(&self, item: &Candidate, stage: ItemStage) {
        tracing::debug!(identifier = %item.identifier, stage = stage.as_str(), "Item stage");
        self.observer.stage(item, &stage);
    }

    fn convert_unit(
        &self,
        item: &Candidate,
        unit: &Unit,
        index: usize,
        output: &Path,
    ) -> Result<UnitOutcome, ItemError> {
        if matches!(unit, Unit::File(input) if input == output) {
            tracing::error!(
                identifier = %item.identifier,
                unit = index,
                path = %output.display(),
                "Unit input is its own output, not converting"
            );
            return Ok(UnitOutcome {
                index,
                exit: UnitExit {
                    code: None,
                    stalled: false,
                },
                corrupted: false,
                last_percent: 0,
            });
        }

        tracing::debug!(identifier = %item.identifier, unit = %unit, "Starting engine");

        let mut process = self.engine.convert(&item.path, unit, output)?;
        let mut tracker = ProgressTracker::new();

        for line in process.by_ref() {
            match tracker.observe(&line) {
                Some(UnitNotice::Progress(percent)) => {
                    self.observer.unit_progress(item, index, percent);
                }
                Some(UnitNotice::Corruption) => {
                    tracing::warn!(
                        identifier = %item.identifier,
                        unit = index,
                        "Source might be corrupt"
                    );
                    self.observer.unit_corrupt(item, index);
                }
                None => {}
            }
        }

        let exit = process.finish()?;

        Ok(UnitOutcome {
            index,
            exit,
            corrupted: tracker.corrupted(),
            last_percent: tracker.last_percent(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DiscoveryConfig, SourceLayout};
    use crate::encode::UnitProcess;
    use crate::report::NullObserver;
    use proptest::prelude::*;
    use std::io;
    use std::sync::Mutex;

    /// Scripted engine: fixed scan output, per-title output lines and exit codes.
    struct ScriptedEngine {
        scan_output: String,
        units: Vec<(Vec<String>, i32)>,
        convert_calls: Mutex<Vec<(Unit, PathBuf)>>,
        launch_fails: bool,
    }

    struct ScriptedRun {
        lines: std::vec::IntoIter<String>,
        code: i32,
    }

    impl Iterator for ScriptedRun {
        type Item = String;
        fn next(&mut self) -> Option<String> {
            self.lines.next()
        }
    }

    impl UnitProcess for ScriptedRun {
        fn finish(self: Box<Self>) -> Result<UnitExit, EngineError> {
            Ok(UnitExit {
                code: Some(self.code),
                stalled: false,
            })
        }
    }

    impl ScriptedEngine {
        fn new(scan_output: &str, units: Vec<(Vec<&str>, i32)>) -> Self {
            Self {
                scan_output: scan_output.to_string(),
                units: units
                    .into_iter()
                    .map(|(lines, code)| (lines.into_iter().map(String::from).collect(), code))
                    .collect(),
                convert_calls: Mutex::new(Vec::new()),
                launch_fails: false,
            }
        }

        fn calls(&self) -> Vec<(Unit, PathBuf)> {
            self.convert_calls.lock().unwrap().clone()
        }
    }

    impl Engine for ScriptedEngine {
        fn scan(&self, _source: &Path) -> Result<String, EngineError> {
            if self.launch_fails {
                return Err(EngineError::Launch {
                    program: "HandBrakeCLI".to_string(),
                    source: io::Error::new(io::ErrorKind::NotFound, "not found"),
                });
            }
            Ok(self.scan_output.clone())
        }

        fn convert(
            &self,
            _item_path: &Path,
            unit: &Unit,
            output: &Path,
        ) -> Result<Box<dyn UnitProcess>, EngineError> {
            let mut calls = self.convert_calls.lock().unwrap();
            let (lines, code) = self.units[calls.len()].clone();
            calls.push((unit.clone(), output.to_path_buf()));
            Ok(Box::new(ScriptedRun {
                lines: lines.into_iter(),
                code,
            }))
        }
    }

    fn disc_driver(engine: Arc<ScriptedEngine>) -> ItemDriver {
        ItemDriver::new(
            engine,
            DiscoveryRules::new(SourceLayout::Disc, &DiscoveryConfig::default()),
            Arc::new(NullObserver),
        )
    }

    fn item(id: &str) -> Candidate {
        Candidate {
            identifier: id.to_string(),
            path: PathBuf::from(format!("/dvds/{}", id)),
        }
    }

    fn outcome(index: usize, code: i32, corrupted: bool) -> UnitOutcome {
        UnitOutcome {
            index,
            exit: UnitExit {
                code: Some(code),
                stalled: false,
            },
            corrupted,
            last_percent: 100,
        }
    }

    #[test]
    fn test_item_stage_as_str() {
        assert_eq!(ItemStage::Scanning.as_str(), "scanning");
        assert_eq!(ItemStage::Converting { unit: 1, total: 2 }.as_str(), "converting");
        assert_eq!(ItemStage::Aggregating.as_str(), "aggregating");
        assert_eq!(ItemStage::Done.as_str(), "done");
    }

    #[test]
    fn test_recognises_own_output_names() {
        assert!(is_output_file_name("M", "M.mp4"));
        assert!(is_output_file_name("M", "M-Title_1.mp4"));
        assert!(is_output_file_name("M", "M-Title_12.mp4"));
        assert!(!is_output_file_name("M", "M-Title_.mp4"));
        assert!(!is_output_file_name("M", "M-Title_1a.mp4"));
        assert!(!is_output_file_name("M", "MX.mp4"));
        assert!(!is_output_file_name("M", "M.mpg"));
        assert!(!is_output_file_name("M", "other.mp4"));
    }

    #[test]
    fn test_unit_reading_its_own_output_is_not_converted() {
        let engine = Arc::new(ScriptedEngine::new("", vec![]));
        let driver = ItemDriver::new(
            engine.clone(),
            DiscoveryRules::new(SourceLayout::Files, &DiscoveryConfig::default()),
            Arc::new(NullObserver),
        );
        let output = PathBuf::from("/videos/M/M-Title_1.mp4");

        let outcome = driver
            .convert_unit(&item("M"), &Unit::File(output.clone()), 1, &output)
            .unwrap();

        assert!(!outcome.success());
        assert!(engine.calls().is_empty());
    }

    #[test]
    fn test_output_file_names() {
        assert_eq!(output_file_name("X", 1, 1), "X.mp4");
        assert_eq!(output_file_name("X", 1, 3), "X-Title_1.mp4");
        assert_eq!(output_file_name("X", 2, 3), "X-Title_2.mp4");
        assert_eq!(output_file_name("X", 3, 3), "X-Title_3.mp4");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_output_names_are_distinct_and_numbered(
            id in "[A-Za-z0-9_]{1,20}",
            total in 1usize..40,
        ) {
            let names: Vec<String> =
                (1..=total).map(|i| output_file_name(&id, i, total)).collect();
            let unique: std::collections::HashSet<_> = names.iter().collect();
            prop_assert_eq!(unique.len(), total);

            if total == 1 {
                prop_assert_eq!(&names[0], &format!("{}.mp4", id));
            } else {
                for (i, name) in names.iter().enumerate() {
                    prop_assert_eq!(name, &format!("{}-Title_{}.mp4", id, i + 1));
                }
            }
            for name in &names {
                prop_assert!(is_output_file_name(&id, name));
            }
        }

        // Applying the verdict derived from the same outcomes, any number of
        // times, always yields the same row.
        #[test]
        fn prop_verdict_is_idempotent(
            codes in prop::collection::vec((0i32..3, proptest::bool::ANY), 1..8),
            initial_notes in prop_oneof![
                Just(String::new()),
                Just("from an earlier run".to_string()),
            ],
            repeats in 1usize..4,
        ) {
            let outcomes: Vec<UnitOutcome> = codes
                .iter()
                .enumerate()
                .map(|(i, (code, corrupt))| outcome(i + 1, *code, *corrupt))
                .collect();

            let mut once = WorkItem::new("X");
            once.notes = initial_notes.clone();
            ItemVerdict::from_outcomes(&outcomes).apply_to(&mut once);

            let mut many = WorkItem::new("X");
            many.notes = initial_notes;
            for _ in 0..repeats {
                ItemVerdict::from_outcomes(&outcomes).apply_to(&mut many);
            }

            prop_assert_eq!(&once, &many);
            prop_assert_eq!(
                once.is_complete(),
                outcomes.iter().all(|o| o.success())
            );
        }

        // Error text is free-form and may itself contain the note separator.
        #[test]
        fn prop_unexpected_verdict_is_idempotent(
            reason in "[a-z]{1,8}(; ?[a-z]{1,8}){0,3}",
            initial_notes in prop_oneof![
                Just(String::new()),
                Just("Failed to convert titles: 1".to_string()),
            ],
            repeats in 2usize..5,
        ) {
            let verdict = ItemVerdict::unexpected("X", &reason);

            let mut once = WorkItem::new("X");
            once.notes = initial_notes.clone();
            verdict.apply_to(&mut once);

            let mut many = WorkItem::new("X");
            many.notes = initial_notes;
            for _ in 0..repeats {
                verdict.apply_to(&mut many);
            }

            prop_assert_eq!(&once, &many);
            prop_assert!(once.notes.ends_with(&reason));
        }
    }

    #[test]
    fn test_verdict_mixed_success() {
        let verdict = ItemVerdict::from_outcomes(&[outcome(1, 0, false), outcome(2, 1, false)]);
        let mut row = WorkItem::new("X");
        verdict.apply_to(&mut row);

        assert_eq!(row.finished, "N");
        assert_eq!(row.units_converted, "1");
        assert_eq!(row.notes, "Failed to convert titles: 2");
    }

    #[test]
    fn test_verdict_corruption_with_success() {
        let verdict = ItemVerdict::from_outcomes(&[outcome(1, 0, true)]);
        let mut row = WorkItem::new("X");
        verdict.apply_to(&mut row);

        assert_eq!(row.finished, "Y");
        assert_eq!(row.units_converted, "1");
        assert_eq!(row.notes, CORRUPTION_NOTE);
    }

    #[test]
    fn test_unexpected_verdict_with_semicolon_applies_once() {
        let verdict = ItemVerdict::unexpected("X", "read failed; disk gone");
        let mut row = WorkItem::new("X");
        verdict.apply_to(&mut row);
        verdict.apply_to(&mut row);

        assert_eq!(row.notes, "Unexpected error processing directory X: read failed; disk gone");
    }

    #[test]
    fn test_unexpected_verdict_keeps_unit_count() {
        let mut row = WorkItem::new("X");
        row.units_converted = "2".to_string();
        row.notes = "older".to_string();
        ItemVerdict::unexpected("X", "boom").apply_to(&mut row);

        assert_eq!(row.finished, "N");
        assert_eq!(row.units_converted, "2");
        assert_eq!(row.notes, "older; Unexpected error processing directory X: boom");
    }

    #[test]
    fn test_driver_scan_failure_runs_no_conversions() {
        let engine = Arc::new(ScriptedEngine::new("[t] scan: no titles here\n", vec![]));
        let driver = disc_driver(engine.clone());

        let verdict = driver.convert_item(&item("X")).unwrap();

        assert!(!verdict.finished);
        assert!(verdict.notes[0].contains("Failed to determine title count"));
        assert!(engine.calls().is_empty());
    }

    #[test]
    fn test_driver_mixed_success() {
        let engine = Arc::new(ScriptedEngine::new(
            "[t] scan: DVD has 2 title(s)\n",
            vec![
                (vec!["Encoding: task 1 of 1, 50.00 %"], 0),
                (vec!["Encoding: task 1 of 1, 10.00 %"], 1),
            ],
        ));
        let driver = disc_driver(engine.clone());

        let verdict = driver.convert_item(&item("X")).unwrap();

        assert!(!verdict.finished);
        assert_eq!(verdict.units_converted, Some(1));
        assert_eq!(verdict.notes, vec!["Failed to convert titles: 2"]);
        assert_eq!(
            engine.calls(),
            vec![
                (Unit::Title(1), PathBuf::from("/dvds/X/X-Title_1.mp4")),
                (Unit::Title(2), PathBuf::from("/dvds/X/X-Title_2.mp4")),
            ]
        );
    }

    #[test]
    fn test_driver_single_title_corruption_still_succeeds() {
        let engine = Arc::new(ScriptedEngine::new(
            "[t] scan: DVD has 1 title(s)\n",
            vec![(
                vec![
                    "libdvdread: CHECK_VALUE failed in nav_read.c:262",
                    "Encoding: task 1 of 1, 100.00 %",
                    "libdvdread: CHECK_VALUE failed in nav_read.c:262",
                ],
                0,
            )],
        ));
        let driver = disc_driver(engine.clone());

        let verdict = driver.convert_item(&item("X")).unwrap();

        assert!(verdict.finished);
        assert_eq!(verdict.units_converted, Some(1));
        assert_eq!(verdict.notes, vec![CORRUPTION_NOTE]);
        assert_eq!(engine.calls()[0].1, PathBuf::from("/dvds/X/X.mp4"));
    }

    #[test]
    fn test_driver_launch_failure_is_fatal() {
        let mut engine = ScriptedEngine::new("", vec![]);
        engine.launch_fails = true;
        let driver = disc_driver(Arc::new(engine));

        let err = driver.convert_item(&item("X")).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_io_engine_error_is_not_fatal() {
        let err: ItemError =
            EngineError::Io(io::Error::new(io::ErrorKind::BrokenPipe, "pipe")).into();
        assert!(!err.is_fatal());
    }
}
