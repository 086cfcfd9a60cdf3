//! Operator-facing reporting for a batch run.
//!
//! The driver and runner announce what they are doing through [`RunObserver`];
//! [`ConsoleReporter`] turns that into banners and a live progress line on stdout.

use crate::job_executor::{ItemStage, ItemVerdict, UnitOutcome};
use crate::scan::Candidate;
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

const BANNER_WIDTH: usize = 70;

/// Receives run events. Every method defaults to doing nothing.
pub trait RunObserver: Send + Sync {
    /// Item `current` (1-based) of `total` is about to start.
    fn item_started(&self, _current: usize, _total: usize, _item: &Candidate) {}

    fn stage(&self, _item: &Candidate, _stage: &ItemStage) {}

    /// Percent strictly increased for unit `unit`.
    fn unit_progress(&self, _item: &Candidate, _unit: usize, _percent: u8) {}

    /// First corruption warning for unit `unit`.
    fn unit_corrupt(&self, _item: &Candidate, _unit: usize) {}

    fn unit_finished(&self, _item: &Candidate, _outcome: &UnitOutcome, _output: &Path) {}

    /// Verdict is final and the ledger has been written (or the write failed).
    fn item_finished(
        &self,
        _current: usize,
        _total: usize,
        _item: &Candidate,
        _verdict: &ItemVerdict,
    ) {
    }
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl RunObserver for NullObserver {}

/// Prints banners and a carriage-return progress indicator.
#[derive(Debug, Default)]
pub struct ConsoleReporter {
    // A progress line is on screen without a trailing newline.
    progress_open: Mutex<bool>,
}

impl ConsoleReporter {
    pub fn new() -> Self {
        Self::default()
    }

    fn close_progress_line(&self) {
        if let Ok(mut open) = self.progress_open.lock() {
            if *open {
                println!();
                *open = false;
            }
        }
    }
}

impl RunObserver for ConsoleReporter {
    fn item_started(&self, current: usize, total: usize, item: &Candidate) {
        println!("{}", "=".repeat(BANNER_WIDTH));
        println!(
            "Processing {} of {}: {} at {} ...",
            current,
            total,
            item.identifier,
            item.path.display()
        );
    }

    fn stage(&self, _item: &Candidate, stage: &ItemStage) {
        if let ItemStage::Converting { unit, total } = stage {
            println!("Processing title {} of {}...", unit, total);
        }
    }

    fn unit_progress(&self, _item: &Candidate, _unit: usize, percent: u8) {
        let mut stdout = std::io::stdout().lock();
        let _ = write!(stdout, "\rProgress: {}%", percent);
        let _ = stdout.flush();
        if let Ok(mut open) = self.progress_open.lock() {
            *open = true;
        }
    }

    fn unit_corrupt(&self, item: &Candidate, unit: usize) {
        self.close_progress_line();
        println!("Warning: Title {} of {} might be corrupt.", unit, item.identifier);
    }

    fn unit_finished(&self, item: &Candidate, outcome: &UnitOutcome, output: &Path) {
        self.close_progress_line();
        let name = output
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if outcome.success() {
            println!("Title {} successfully converted to {}", outcome.index, name);
        } else {
            println!(
                "Error: Failed to convert title {} of {} to MP4",
                outcome.index, item.identifier
            );
        }
    }

    fn item_finished(
        &self,
        _current: usize,
        _total: usize,
        item: &Candidate,
        verdict: &ItemVerdict,
    ) {
        self.close_progress_line();
        match verdict.units_converted {
            Some(converted) if verdict.units_total > 0 => println!(
                "Completed processing directory: {}. {} of {} titles converted.",
                item.identifier, converted, verdict.units_total
            ),
            _ => println!(
                "Finished {} without converting: {}",
                item.identifier,
                verdict.notes.join("; ")
            ),
        }
        println!("{}", "=".repeat(BANNER_WIDTH));
    }
}
