//! Batch runner for the MP4 batch converter
//!
//! Prepares the remaining work set and converts it item by item, writing the
//! ledger after every item so an interrupted run loses at most the item that
//! was in flight.

use crate::job_executor::{ItemDriver, ItemError, ItemVerdict};
use crate::ledger::{Ledger, LedgerError, WorkItem};
use crate::report::RunObserver;
use crate::scan::{find_candidates, plan_work, Candidate, DiscoveryRules, WorkPlan};
use std::any::Any;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Error type for batch operations
#[derive(Debug, Error)]
pub enum BatchError {
    /// Source root is missing or not a directory
    #[error("{} is not a valid directory", .0.display())]
    InvalidSourceRoot(PathBuf),

    /// Ledger could not be loaded
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// Nothing under the source root looks like a work item
    #[error("No {layout} items found in {}", root.display())]
    NoCandidates { root: PathBuf, layout: String },

    /// The engine cannot be launched; the run stopped
    #[error("Batch stopped: {0}")]
    EngineUnavailable(ItemError),
}

/// Ledger and remaining work set for a run.
#[derive(Debug)]
pub struct PreparedRun {
    pub ledger: Ledger,
    pub plan: WorkPlan,
}

/// Validate the inputs, load (or synthesize) the ledger and compute the work set.
///
/// Without a ledger path every discovered item is remaining work and the
/// ledger only lives in memory.
pub fn prepare_run(
    source_root: &Path,
    ledger_path: Option<&Path>,
    rules: &DiscoveryRules,
) -> Result<PreparedRun, BatchError> {
    if !source_root.is_dir() {
        return Err(BatchError::InvalidSourceRoot(source_root.to_path_buf()));
    }

    let ledger = match ledger_path {
        Some(path) => Some(Ledger::load(path)?),
        None => None,
    };

    tracing::info!(
        root = %source_root.display(),
        layout = %rules.layout,
        "Searching for work items"
    );
    let candidates = find_candidates(source_root, rules);
    if candidates.is_empty() {
        return Err(BatchError::NoCandidates {
            root: source_root.to_path_buf(),
            layout: rules.layout.to_string(),
        });
    }
    tracing::info!(found = candidates.len(), "Discovered candidate items");

    let ledger = match ledger {
        Some(ledger) => ledger,
        None => Ledger::in_memory(candidates.iter().map(|c| c.identifier.clone())),
    };

    let plan = plan_work(source_root, candidates, &ledger, rules);
    Ok(PreparedRun { ledger, plan })
}

/// Totals for a finished run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Items attempted; equals the size of the work set.
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Ledger writes that failed (not retried).
    pub persist_failures: usize,
}

/// Everything one run needs, passed explicitly rather than held globally.
pub struct RunContext {
    pub ledger: Ledger,
    pub driver: Arc<ItemDriver>,
    pub observer: Arc<dyn RunObserver>,
}

/// Converts the work set one item at a time.
pub struct BatchRunner {
    ctx: RunContext,
}

impl BatchRunner {
    pub fn new(ctx: RunContext) -> Self {
        Self { ctx }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ctx.ledger
    }

    pub fn into_ledger(self) -> Ledger {
        self.ctx.ledger
    }

    /// Run every item of the plan in order.
    ///
    /// Item failures of any kind become ledger state; only an engine that
    /// cannot be launched stops the run, leaving the in-flight row unchanged.
    pub async fn run(&mut self, plan: &WorkPlan) -> Result<RunSummary, BatchError> {
        let total = plan.len();
        let mut summary = RunSummary::default();

        for (offset, item) in plan.items.iter().enumerate() {
            let current = offset + 1;
            self.ctx.observer.item_started(current, total, item);
            tracing::info!(
                identifier = %item.identifier,
                current,
                total,
                "Processing item"
            );

            let verdict = self.run_item(item).await?;

            summary.attempted += 1;
            if verdict.finished {
                summary.succeeded += 1;
            } else {
                summary.failed += 1;
            }

            if !self.commit(item, &verdict) {
                summary.persist_failures += 1;
            }

            self.ctx.observer.item_finished(current, total, item, &verdict);
        }

        tracing::info!(
            attempted = summary.attempted,
            succeeded = summary.succeeded,
            failed = summary.failed,
            persist_failures = summary.persist_failures,
            "Batch finished"
        );

        Ok(summary)
    }

    /// Drive one item on a blocking thread, absorbing everything but fatal errors.
    async fn run_item(&self, item: &Candidate) -> Result<ItemVerdict, BatchError> {
        let driver = Arc::clone(&self.ctx.driver);
        let owned = item.clone();
        let result = tokio::task::spawn_blocking(move || driver.convert_item(&owned)).await;

        match result {
            Ok(Ok(verdict)) => Ok(verdict),
            Ok(Err(e)) if e.is_fatal() => {
                tracing::error!(
                    identifier = %item.identifier,
                    error = %e,
                    "Engine unavailable, stopping"
                );
                Err(BatchError::EngineUnavailable(e))
            }
            Ok(Err(e)) => {
                tracing::error!(
                    identifier = %item.identifier,
                    error = %e,
                    "Item failed unexpectedly"
                );
                Ok(ItemVerdict::unexpected(&item.identifier, &e.to_string()))
            }
            Err(join_err) => {
                let reason = match join_err.try_into_panic() {
                    Ok(payload) => panic_message(payload.as_ref()),
                    Err(join_err) => join_err.to_string(),
                };
                tracing::error!(
                    identifier = %item.identifier,
                    reason = %reason,
                    "Item task panicked"
                );
                Ok(ItemVerdict::unexpected(&item.identifier, &reason))
            }
        }
    }

    /// Apply the verdict to the item's row and flush. Returns false if the flush failed.
    fn commit(&mut self, item: &Candidate, verdict: &ItemVerdict) -> bool {
        let mut row = self
            .ctx
            .ledger
            .get(&item.identifier)
            .cloned()
            .unwrap_or_else(|| WorkItem::new(item.identifier.clone()));
        verdict.apply_to(&mut row);

        if !self.ctx.ledger.update(row) {
            tracing::warn!(identifier = %item.identifier, "No ledger row to update");
        }

        match self.ctx.ledger.flush() {
            Ok(()) => {
                if let Some(path) = self.ctx.ledger.path() {
                    tracing::debug!(path = %path.display(), "Ledger updated");
                }
                true
            }
            Err(e) => {
                tracing::error!(
                    identifier = %item.identifier,
                    error = %e,
                    "Failed to update ledger"
                );
                false
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
