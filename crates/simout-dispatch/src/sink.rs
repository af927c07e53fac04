use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use simout_core::errors::SimoutError;
use simout_core::{OutputRecord, RecordKind, RunCoordinate};

use crate::ledger::ProgressLedger;

/// How a sink treats runs the ledger marks as completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResumePolicy {
    /// Completed runs are not reopened for the sink and none of their
    /// records reach it.
    #[default]
    SkipCompleted,
    /// The sink receives completed runs again, e.g. because its output is
    /// not persisted between executions.
    Reprocess,
}

/// Pluggable consumer of output records.
///
/// Sinks are shared between every concurrently executing run, so every method
/// may be called from many threads at once for different coordinates. Any
/// state shared across runs must be synchronized by the sink itself.
pub trait OutputSink: Send + Sync {
    /// Name used in logs and error reports.
    fn name(&self) -> &str;

    /// Record kinds the sink wants to receive.
    ///
    /// Queried once per experiment execution.
    fn handled_kinds(&self) -> BTreeSet<RecordKind>;

    /// Resumability decision for completed runs, queried with the kinds.
    fn resume_policy(&self) -> ResumePolicy {
        ResumePolicy::SkipCompleted
    }

    /// Called once before any run opens; reconciles pre-existing output.
    fn open_experiment(&self, ledger: &dyn ProgressLedger) -> Result<(), SimoutError>;

    /// Called before the first record of a run is delivered.
    fn open_simulation(&self, coordinate: RunCoordinate) -> Result<(), SimoutError>;

    /// Consumes one record. Must not block on I/O.
    fn handle(&self, record: &Arc<dyn OutputRecord>) -> Result<(), SimoutError>;

    /// Called once no further records for the run will arrive.
    fn close_simulation(&self, coordinate: RunCoordinate) -> Result<(), SimoutError>;

    /// Called once after every run has closed; releases held resources.
    fn close_experiment(&self) -> Result<(), SimoutError>;
}
