//! MP4 batch converter
//!
//! Resumable batch conversion of DVD images and loose media directories to MP4
//! through an external transcoding engine, tracked in a CSV ledger.

pub mod batch;
pub mod classify;
pub mod encode;
pub mod job_executor;
pub mod ledger;
pub mod report;
pub mod scan;
pub mod startup;

pub use batch::{prepare_run, BatchError, BatchRunner, PreparedRun, RunContext, RunSummary};
pub use classify::{classify_line, ClassifiedEvent, ProgressTracker, UnitNotice};
pub use encode::{Engine, EngineError, HandBrake, Unit, UnitExit, UnitProcess};
pub use job_executor::{
    is_output_file_name, output_file_name, ItemDriver, ItemError, ItemStage, ItemVerdict,
    UnitOutcome,
};
pub use ledger::{Finished, Ledger, LedgerError, WorkItem};
pub use mp4_batch_config as config;
pub use mp4_batch_config::{Config, SourceLayout};
pub use report::{ConsoleReporter, NullObserver, RunObserver};
pub use scan::{find_candidates, plan_work, Candidate, DiscoveryRules, ScanError, WorkPlan};
pub use startup::{check_engine_available, run_startup_checks, StartupError};
