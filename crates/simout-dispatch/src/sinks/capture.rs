use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use simout_core::errors::{ErrorInfo, SimoutError};
use simout_core::{OutputRecord, RecordKind, RunCoordinate};
use tracing::debug;

use crate::ledger::ProgressLedger;
use crate::sink::{OutputSink, ResumePolicy};

/// Lifecycle call observed by a [`CaptureSink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// `open_experiment`, with the number of completed runs in the ledger.
    ExperimentOpened {
        /// Completed runs reported by the ledger.
        completed: usize,
    },
    /// `open_simulation`.
    SimulationOpened(RunCoordinate),
    /// `close_simulation`.
    SimulationClosed(RunCoordinate),
    /// `close_experiment`.
    ExperimentClosed,
}

/// Sink retaining every record it handles, keyed by run.
///
/// Retained output survives across executions when the same instance is
/// reused; `open_experiment` drops the output of runs the ledger does not
/// mark as completed, since those runs will execute again.
pub struct CaptureSink {
    name: String,
    kinds: BTreeSet<RecordKind>,
    policy: ResumePolicy,
    retained: DashMap<RunCoordinate, Vec<Arc<dyn OutputRecord>>>,
    handle_calls: DashMap<RunCoordinate, u64>,
    total: AtomicU64,
    events: Mutex<Vec<LifecycleEvent>>,
}

impl CaptureSink {
    /// Creates a sink interested in the given kinds.
    pub fn new<I, K>(name: impl Into<String>, kinds: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<RecordKind>,
    {
        Self {
            name: name.into(),
            kinds: kinds.into_iter().map(Into::into).collect(),
            policy: ResumePolicy::SkipCompleted,
            retained: DashMap::new(),
            handle_calls: DashMap::new(),
            total: AtomicU64::new(0),
            events: Mutex::new(Vec::new()),
        }
    }

    /// Overrides the resume policy.
    pub fn with_policy(mut self, policy: ResumePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Records currently retained for a run, in delivery order.
    pub fn records(&self, coordinate: RunCoordinate) -> Vec<Arc<dyn OutputRecord>> {
        self.retained
            .get(&coordinate)
            .map(|records| records.value().clone())
            .unwrap_or_default()
    }

    /// Runs with retained output, ascending.
    pub fn retained_runs(&self) -> Vec<RunCoordinate> {
        let mut runs: Vec<_> = self.retained.iter().map(|entry| *entry.key()).collect();
        runs.sort_unstable();
        runs
    }

    /// Number of `handle` calls ever received for a run.
    pub fn handled(&self, coordinate: RunCoordinate) -> u64 {
        self.handle_calls
            .get(&coordinate)
            .map(|count| *count.value())
            .unwrap_or(0)
    }

    /// Number of `handle` calls ever received.
    pub fn total_handled(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Lifecycle calls observed so far, in call order.
    pub fn lifecycle_events(&self) -> Vec<LifecycleEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    fn log_event(&self, event: LifecycleEvent) -> Result<(), SimoutError> {
        self.events
            .lock()
            .map_err(|_| {
                SimoutError::Sink(
                    ErrorInfo::new("sink.poisoned", "event log poisoned")
                        .with_sink(self.name.clone()),
                )
            })?
            .push(event);
        Ok(())
    }
}

impl OutputSink for CaptureSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn handled_kinds(&self) -> BTreeSet<RecordKind> {
        self.kinds.clone()
    }

    fn resume_policy(&self) -> ResumePolicy {
        self.policy
    }

    fn open_experiment(&self, ledger: &dyn ProgressLedger) -> Result<(), SimoutError> {
        let before = self.retained.len();
        self.retained
            .retain(|coordinate, _| ledger.is_completed(*coordinate));
        debug!(
            sink = %self.name,
            dropped = before - self.retained.len(),
            kept = self.retained.len(),
            "reconciled retained output"
        );
        self.log_event(LifecycleEvent::ExperimentOpened {
            completed: ledger.completed().len(),
        })
    }

    fn open_simulation(&self, coordinate: RunCoordinate) -> Result<(), SimoutError> {
        self.retained.insert(coordinate, Vec::new());
        self.log_event(LifecycleEvent::SimulationOpened(coordinate))
    }

    fn handle(&self, record: &Arc<dyn OutputRecord>) -> Result<(), SimoutError> {
        let coordinate = record.coordinate();
        self.retained
            .entry(coordinate)
            .or_default()
            .push(Arc::clone(record));
        *self.handle_calls.entry(coordinate).or_insert(0) += 1;
        self.total.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn close_simulation(&self, coordinate: RunCoordinate) -> Result<(), SimoutError> {
        self.log_event(LifecycleEvent::SimulationClosed(coordinate))
    }

    fn close_experiment(&self) -> Result<(), SimoutError> {
        self.log_event(LifecycleEvent::ExperimentClosed)
    }
}
