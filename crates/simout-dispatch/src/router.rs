//! Experiment and run lifecycle sequencing plus record fan-out.
//!
//! The router caches each sink's declared kinds and resume policy once per
//! execution, keeps one slot per run coordinate, and never holds a lock
//! shared between runs while a sink is being called.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock, RwLock};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use simout_core::errors::{ErrorInfo, SimoutError};
use simout_core::{OutputRecord, RecordKind, RunCoordinate};
use tracing::{debug, info, trace, warn};

use crate::config::{DispatchConfig, SinkFailurePolicy};
use crate::ledger::{MemoryLedger, ProgressLedger};
use crate::sink::{OutputSink, ResumePolicy};

/// Experiment level state of a router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ExperimentPhase {
    /// Sinks may still be registered.
    NotStarted = 0,
    /// `open_experiment` is forwarding to sinks.
    Opening = 1,
    /// Run level calls are accepted.
    Open = 2,
    /// `close_experiment` is forwarding to sinks.
    Closing = 3,
    /// Terminal state.
    Closed = 4,
}

impl ExperimentPhase {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => ExperimentPhase::NotStarted,
            1 => ExperimentPhase::Opening,
            2 => ExperimentPhase::Open,
            3 => ExperimentPhase::Closing,
            _ => ExperimentPhase::Closed,
        }
    }
}

/// Summary returned when a run closes.
///
/// Sealing it with [`CompletionRecord::from_receipt`](crate::CompletionRecord::from_receipt)
/// produces the ledger entry that lets the next execution skip the run. Only
/// complete receipts can be sealed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReceipt {
    /// Closed run.
    pub coordinate: RunCoordinate,
    /// Records routed while the run was open.
    pub records_routed: u64,
    /// Sinks that opened the run, in registration order.
    pub sinks: Vec<String>,
    /// Sink calls for the run that failed, or were skipped after a failure
    /// under the fail-fast policy.
    #[serde(default)]
    pub failed_deliveries: u64,
    /// True when the ledger already marked the run as completed.
    pub resumed: bool,
}

impl RunReceipt {
    /// True when every sink call made for the run succeeded.
    pub fn is_complete(&self) -> bool {
        self.failed_deliveries == 0
    }
}

struct SinkEntry {
    sink: Arc<dyn OutputSink>,
    kinds: BTreeSet<RecordKind>,
    policy: ResumePolicy,
}

struct ExperimentCache {
    entries: Vec<SinkEntry>,
    completed: BTreeSet<RunCoordinate>,
}

struct RunGate {
    accepting: bool,
    // Sinks whose `open_simulation` succeeded.
    targets: Vec<usize>,
}

struct RunSlot {
    // Shared by `route`; exclusive while `open_run` installs the targets and
    // in `close_run`.
    gate: RwLock<RunGate>,
    // Set from insertion until `close_run`, so a second open is refused even
    // while the first is still opening sinks.
    open: AtomicBool,
    routed: AtomicU64,
    failed: AtomicU64,
    resumed: bool,
}

impl RunSlot {
    fn new(resumed: bool) -> Self {
        Self {
            gate: RwLock::new(RunGate {
                accepting: false,
                targets: Vec::new(),
            }),
            open: AtomicBool::new(true),
            routed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            resumed,
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

/// Outcome of calling one operation on a sequence of sinks.
struct FanOut {
    operation: &'static str,
    coordinate: Option<RunCoordinate>,
    succeeded: Vec<usize>,
    failures: Vec<(String, SimoutError)>,
    skipped: usize,
}

impl FanOut {
    fn missed(&self) -> u64 {
        (self.failures.len() + self.skipped) as u64
    }

    /// Indices of the sinks called successfully, or a `Sink` error naming
    /// every sink that failed.
    fn into_result(self) -> Result<Vec<usize>, SimoutError> {
        if self.failures.is_empty() {
            return Ok(self.succeeded);
        }
        let names: Vec<&str> = self.failures.iter().map(|(name, _)| name.as_str()).collect();
        let mut info = ErrorInfo::new(
            format!("sink.{}_failed", self.operation),
            format!(
                "{} sink(s) failed during {}",
                self.failures.len(),
                self.operation
            ),
        )
        .with_context("sinks", names.join(","));
        if let Some(coordinate) = self.coordinate {
            info = info.with_coordinate(coordinate);
        }
        if self.skipped > 0 {
            info = info.with_context("skipped", self.skipped.to_string());
        }
        for (name, err) in &self.failures {
            info = info.with_cause(name, err);
        }
        Err(SimoutError::Sink(info))
    }
}

fn lifecycle(code: &str, message: impl Into<String>) -> ErrorInfo {
    ErrorInfo::new(code, message)
}

/// Routes output records from concurrently executing runs to registered sinks.
pub struct DispatchRouter {
    config: DispatchConfig,
    sinks: Vec<Arc<dyn OutputSink>>,
    phase: AtomicU8,
    cache: OnceLock<ExperimentCache>,
    runs: DashMap<RunCoordinate, Arc<RunSlot>>,
}

impl std::fmt::Debug for DispatchRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchRouter")
            .field("phase", &self.phase())
            .field("sinks", &self.sink_names())
            .field("runs", &self.runs.len())
            .finish_non_exhaustive()
    }
}

impl Default for DispatchRouter {
    fn default() -> Self {
        Self::new(DispatchConfig::default())
    }
}

impl DispatchRouter {
    /// Creates a router with no registered sinks.
    pub fn new(config: DispatchConfig) -> Self {
        Self {
            config,
            sinks: Vec::new(),
            phase: AtomicU8::new(ExperimentPhase::NotStarted as u8),
            cache: OnceLock::new(),
            runs: DashMap::new(),
        }
    }

    /// Configuration the router was built with.
    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Registers a sink. Only valid before the experiment opens.
    pub fn register(&mut self, sink: Arc<dyn OutputSink>) -> Result<(), SimoutError> {
        if self.phase() != ExperimentPhase::NotStarted {
            return Err(SimoutError::Lifecycle(
                lifecycle(
                    "lifecycle.registration_closed",
                    "sinks must be registered before the experiment opens",
                )
                .with_sink(sink.name()),
            ));
        }
        self.sinks.push(sink);
        Ok(())
    }

    /// Current experiment phase.
    pub fn phase(&self) -> ExperimentPhase {
        ExperimentPhase::from_raw(self.phase.load(Ordering::Acquire))
    }

    /// Names of the registered sinks in registration order.
    pub fn sink_names(&self) -> Vec<String> {
        self.sinks.iter().map(|sink| sink.name().to_string()).collect()
    }

    /// Coordinates of runs currently open, ascending.
    pub fn open_runs(&self) -> Vec<RunCoordinate> {
        let mut open: Vec<_> = self
            .runs
            .iter()
            .filter(|entry| entry.value().is_open())
            .map(|entry| *entry.key())
            .collect();
        open.sort_unstable();
        open
    }

    /// Opens the experiment, caching sink declarations and forwarding the ledger.
    ///
    /// Sink kinds and resume policies are queried exactly once here.
    pub fn open_experiment(&self, ledger: &dyn ProgressLedger) -> Result<(), SimoutError> {
        self.transition(
            ExperimentPhase::NotStarted,
            ExperimentPhase::Opening,
            "open_experiment",
        )?;

        let empty = MemoryLedger::new();
        let effective: &dyn ProgressLedger = if self.config.resume { ledger } else { &empty };
        let entries = self
            .sinks
            .iter()
            .map(|sink| SinkEntry {
                sink: Arc::clone(sink),
                kinds: sink.handled_kinds(),
                policy: sink.resume_policy(),
            })
            .collect();
        let completed: BTreeSet<_> = effective.completed().into_iter().collect();
        let completed_runs = completed.len();
        if self
            .cache
            .set(ExperimentCache { entries, completed })
            .is_err()
        {
            return Err(SimoutError::Lifecycle(lifecycle(
                "lifecycle.experiment_reopened",
                "experiment declarations were already cached",
            )));
        }

        let cache = self.cache()?;
        let outcome = fan_out(
            "open_experiment",
            None,
            cache.entries.iter().enumerate(),
            SinkFailurePolicy::Collect,
            |sink| sink.open_experiment(effective),
        );
        self.phase
            .store(ExperimentPhase::Open as u8, Ordering::Release);
        info!(
            sinks = cache.entries.len(),
            completed_runs,
            resume = self.config.resume,
            "experiment opened"
        );
        outcome.into_result().map(|_| ())
    }

    /// Opens a run.
    ///
    /// Sinks are opened for the run unless the ledger marks it completed and
    /// their resume policy skips completed runs. Only sinks whose
    /// `open_simulation` succeeds receive the run's records and its close;
    /// the others count as failed deliveries on the receipt.
    pub fn open_run(&self, coordinate: RunCoordinate) -> Result<(), SimoutError> {
        self.ensure_open("open_run", Some(coordinate))?;
        let cache = self.cache()?;
        let resumed = cache.completed.contains(&coordinate);
        let slot = Arc::new(RunSlot::new(resumed));

        match self.runs.entry(coordinate) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_open() {
                    return Err(SimoutError::Lifecycle(
                        lifecycle("lifecycle.run_already_open", "run is already open")
                            .with_coordinate(coordinate)
                            .with_hint("close the run before opening it again"),
                    ));
                }
                occupied.insert(Arc::clone(&slot));
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Arc::clone(&slot));
            }
        }

        // `close_experiment` may have begun between the first check and the
        // insert; it either saw the slot or we see its phase.
        if let Err(err) = self.ensure_open("open_run", Some(coordinate)) {
            self.runs.remove(&coordinate);
            return Err(err);
        }

        let outcome = fan_out(
            "open_simulation",
            Some(coordinate),
            cache
                .entries
                .iter()
                .enumerate()
                .filter(|(_, entry)| !resumed || entry.policy == ResumePolicy::Reprocess),
            self.config.failure_policy,
            |sink| sink.open_simulation(coordinate),
        );
        slot.failed.fetch_add(outcome.missed(), Ordering::Relaxed);
        {
            let mut gate = slot.gate.write().map_err(|_| poisoned(coordinate))?;
            gate.targets = outcome.succeeded.clone();
            gate.accepting = true;
        }

        debug!(
            %coordinate,
            resumed,
            sinks = outcome.succeeded.len(),
            missed = outcome.missed(),
            "run opened"
        );
        outcome.into_result().map(|_| ())
    }

    /// Delivers a record to every sink of its run that handles its kind.
    ///
    /// Returns the number of sinks that received the record.
    pub fn route(&self, record: Arc<dyn OutputRecord>) -> Result<usize, SimoutError> {
        let coordinate = record.coordinate();
        self.ensure_open("route", Some(coordinate))?;
        let slot = self
            .runs
            .get(&coordinate)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| run_not_open("route", coordinate))?;
        let gate = slot.gate.read().map_err(|_| poisoned(coordinate))?;
        if !gate.accepting {
            return Err(run_not_open("route", coordinate));
        }
        let cache = self.cache()?;
        let kind = record.kind();
        slot.routed.fetch_add(1, Ordering::Relaxed);
        let outcome = fan_out(
            "handle",
            Some(coordinate),
            gate.targets
                .iter()
                .map(|&idx| (idx, &cache.entries[idx]))
                .filter(|(_, entry)| entry.kinds.contains(kind)),
            self.config.failure_policy,
            |sink| sink.handle(&record),
        );
        // Counted before the gate drops so `close_run` sees it.
        slot.failed.fetch_add(outcome.missed(), Ordering::Relaxed);
        drop(gate);
        let delivered = outcome.into_result().map(|sinks| sinks.len());
        trace!(%coordinate, %kind, delivered = ?delivered.as_ref().ok(), "record routed");
        delivered
    }

    /// Closes a run once every in-flight delivery for it has finished.
    ///
    /// A receipt is returned even when some deliveries failed; check
    /// [`RunReceipt::is_complete`] before recording the run as completed.
    pub fn close_run(&self, coordinate: RunCoordinate) -> Result<RunReceipt, SimoutError> {
        self.ensure_open("close_run", Some(coordinate))?;
        let slot = self
            .runs
            .get(&coordinate)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| run_not_open("close_run", coordinate))?;
        let targets = {
            let mut gate = slot.gate.write().map_err(|_| poisoned(coordinate))?;
            if !gate.accepting {
                return Err(run_not_open("close_run", coordinate));
            }
            gate.accepting = false;
            slot.open.store(false, Ordering::Release);
            std::mem::take(&mut gate.targets)
        };

        let cache = self.cache()?;
        let outcome = fan_out(
            "close_simulation",
            Some(coordinate),
            targets.iter().map(|&idx| (idx, &cache.entries[idx])),
            self.config.failure_policy,
            |sink| sink.close_simulation(coordinate),
        );
        slot.failed.fetch_add(outcome.missed(), Ordering::Relaxed);
        let receipt = RunReceipt {
            coordinate,
            records_routed: slot.routed.load(Ordering::Relaxed),
            sinks: targets
                .iter()
                .map(|&idx| cache.entries[idx].sink.name().to_string())
                .collect(),
            failed_deliveries: slot.failed.load(Ordering::Relaxed),
            resumed: slot.resumed,
        };
        debug!(
            %coordinate,
            records = receipt.records_routed,
            failed = receipt.failed_deliveries,
            resumed = receipt.resumed,
            "run closed"
        );
        outcome.into_result()?;
        Ok(receipt)
    }

    /// Closes the experiment, forwarding to every sink exactly once.
    ///
    /// Fails without touching the sinks while any run is still open.
    pub fn close_experiment(&self) -> Result<(), SimoutError> {
        self.transition(
            ExperimentPhase::Open,
            ExperimentPhase::Closing,
            "close_experiment",
        )?;
        let still_open = self.open_runs();
        if !still_open.is_empty() {
            self.phase
                .store(ExperimentPhase::Open as u8, Ordering::Release);
            let listed: Vec<String> = still_open.iter().map(ToString::to_string).collect();
            return Err(SimoutError::Lifecycle(
                lifecycle(
                    "lifecycle.runs_still_open",
                    "every run must close before the experiment closes",
                )
                .with_context("runs", listed.join(" ")),
            ));
        }

        let cache = self.cache()?;
        let outcome = fan_out(
            "close_experiment",
            None,
            cache.entries.iter().enumerate(),
            SinkFailurePolicy::Collect,
            |sink| sink.close_experiment(),
        );
        self.phase
            .store(ExperimentPhase::Closed as u8, Ordering::Release);
        info!(runs = self.runs.len(), "experiment closed");
        outcome.into_result().map(|_| ())
    }

    fn cache(&self) -> Result<&ExperimentCache, SimoutError> {
        self.cache.get().ok_or_else(|| {
            SimoutError::Lifecycle(lifecycle(
                "lifecycle.experiment_not_open",
                "experiment has not been opened",
            ))
        })
    }

    fn transition(
        &self,
        from: ExperimentPhase,
        to: ExperimentPhase,
        operation: &str,
    ) -> Result<(), SimoutError> {
        self.phase
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|actual| {
                SimoutError::Lifecycle(
                    lifecycle(
                        "lifecycle.invalid_phase",
                        format!("{operation} requires phase {from:?}"),
                    )
                    .with_context("phase", format!("{:?}", ExperimentPhase::from_raw(actual))),
                )
            })
    }

    fn ensure_open(
        &self,
        operation: &str,
        coordinate: Option<RunCoordinate>,
    ) -> Result<(), SimoutError> {
        let phase = self.phase();
        if phase == ExperimentPhase::Open {
            return Ok(());
        }
        let mut info = lifecycle(
            "lifecycle.experiment_not_open",
            format!("{operation} requires an open experiment"),
        )
        .with_context("phase", format!("{phase:?}"));
        if let Some(coordinate) = coordinate {
            info = info.with_coordinate(coordinate);
        }
        Err(SimoutError::Lifecycle(info))
    }
}

/// Calls `call` on each sink in turn, honouring the failure policy.
fn fan_out<'a, I, F>(
    operation: &'static str,
    coordinate: Option<RunCoordinate>,
    mut entries: I,
    policy: SinkFailurePolicy,
    mut call: F,
) -> FanOut
where
    I: Iterator<Item = (usize, &'a SinkEntry)>,
    F: FnMut(&dyn OutputSink) -> Result<(), SimoutError>,
{
    let mut outcome = FanOut {
        operation,
        coordinate,
        succeeded: Vec::new(),
        failures: Vec::new(),
        skipped: 0,
    };
    let mut stopped = false;
    for (idx, entry) in &mut entries {
        match call(entry.sink.as_ref()) {
            Ok(()) => outcome.succeeded.push(idx),
            Err(err) => {
                let name = entry.sink.name().to_string();
                warn!(sink = %name, operation, ?coordinate, error = %err, "sink failed");
                outcome.failures.push((name, err));
                if policy == SinkFailurePolicy::FailFast {
                    stopped = true;
                    break;
                }
            }
        }
    }
    if stopped {
        outcome.skipped = entries.count();
    }
    outcome
}

fn run_not_open(operation: &str, coordinate: RunCoordinate) -> SimoutError {
    SimoutError::Lifecycle(
        lifecycle(
            "lifecycle.run_not_open",
            format!("{operation} requires an open run"),
        )
        .with_coordinate(coordinate),
    )
}

fn poisoned(coordinate: RunCoordinate) -> SimoutError {
    SimoutError::Lifecycle(
        lifecycle("lifecycle.poisoned", "run gate poisoned by a panicking sink")
            .with_coordinate(coordinate),
    )
}
