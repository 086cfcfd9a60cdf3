//! Classifier module for engine output lines.
//!
//! Turns raw diagnostic lines from the transcoding engine into progress
//! updates and corruption warnings. Classification is a pure function of a
//! single line; [`ProgressTracker`] layers the per-unit reporting policy on top.

/// Marker present on every encoding progress line.
pub const PROGRESS_MARKER: &str = "Encoding: task";

/// Diagnostic emitted when the engine hits a read/consistency failure on the source.
pub const CORRUPTION_MARKER: &str = "libdvdread: CHECK_VALUE failed";

/// Classification of a single output line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassifiedEvent {
    /// Encoding progress in whole percent (0-100).
    Progress(u8),
    /// The source may be damaged.
    CorruptionWarning,
    /// Nothing of interest.
    Ignore,
}

/// Classifies one raw output line.
///
/// Progress lines look like
/// `Encoding: task 1 of 1, 45.67 % (120.50 fps, avg 118.20 fps, ETA 00h05m12s)`;
/// the percent is the last token before the first `%`. Lines that carry the
/// progress marker but cannot be parsed are ignored.
pub fn classify_line(line: &str) -> ClassifiedEvent {
    if line.contains(CORRUPTION_MARKER) {
        return ClassifiedEvent::CorruptionWarning;
    }

    if line.contains(PROGRESS_MARKER) && line.contains('%') {
        return parse_percent(line)
            .map(ClassifiedEvent::Progress)
            .unwrap_or(ClassifiedEvent::Ignore);
    }

    ClassifiedEvent::Ignore
}

fn parse_percent(line: &str) -> Option<u8> {
    let before = line.trim().split('%').next()?;
    let token = before.split_whitespace().last()?;
    let value: f64 = token.parse().ok()?;

    if !value.is_finite() || !(0.0..=100.0).contains(&value) {
        return None;
    }

    Some(value.trunc() as u8)
}

/// Something the operator should be told about while a unit converts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitNotice {
    /// Percent strictly increased since the last report.
    Progress(u8),
    /// First corruption warning for this unit.
    Corruption,
}

/// Per-unit reporting state.
///
/// Progress is reported only when the whole percent strictly increases, and
/// corruption at most once; the corruption flag stays set for the unit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgressTracker {
    last_percent: u8,
    corrupted: bool,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one line; returns a notice when the operator should hear about it.
    pub fn observe(&mut self, line: &str) -> Option<UnitNotice> {
        match classify_line(line) {
            ClassifiedEvent::Progress(percent) if percent > self.last_percent => {
                self.last_percent = percent;
                Some(UnitNotice::Progress(percent))
            }
            ClassifiedEvent::CorruptionWarning if !self.corrupted => {
                self.corrupted = true;
                Some(UnitNotice::Corruption)
            }
            _ => None,
        }
    }

    /// Highest percent reported so far.
    pub fn last_percent(&self) -> u8 {
        self.last_percent
    }

    /// Whether any corruption warning was seen.
    pub fn corrupted(&self) -> bool {
        self.corrupted
    }
}
