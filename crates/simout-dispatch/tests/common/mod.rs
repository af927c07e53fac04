#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use simout_core::errors::{ErrorInfo, SimoutError};
use simout_core::{OutputRecord, RecordKind, RunCoordinate, SampleRecord};
use simout_dispatch::{OutputSink, ProgressLedger};

pub const INVENTORY: &str = "Inventory";
pub const DEBUG: &str = "Debug";

pub fn coord(scenario: u32, replication: u32) -> RunCoordinate {
    RunCoordinate::new(scenario, replication).expect("valid coordinate")
}

pub fn inventory(coordinate: RunCoordinate, stock: f64) -> Arc<dyn OutputRecord> {
    Arc::new(SampleRecord::new(coordinate, INVENTORY).with_value("stock", stock))
}

pub fn debug_line(coordinate: RunCoordinate) -> Arc<dyn OutputRecord> {
    Arc::new(SampleRecord::new(coordinate, DEBUG))
}

/// Sink stub counting every call it receives.
///
/// It also asserts the per-run bracket itself: a record for a run it does not
/// consider open, or an open after the experiment closed, is reported as a
/// violation.
pub struct CountingSink {
    name: String,
    kinds: BTreeSet<RecordKind>,
    refuse_open: bool,
    pub kind_queries: AtomicUsize,
    pub experiment_opens: AtomicUsize,
    pub experiment_closes: AtomicUsize,
    state: Mutex<CountingState>,
}

#[derive(Default)]
struct CountingState {
    experiment_closed: bool,
    open: BTreeSet<RunCoordinate>,
    opened: BTreeMap<RunCoordinate, usize>,
    closed: BTreeMap<RunCoordinate, usize>,
    handled: BTreeMap<RunCoordinate, usize>,
    violations: Vec<String>,
}

impl CountingSink {
    pub fn new(name: &str, kinds: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            kinds: kinds.iter().map(|kind| RecordKind::new(*kind)).collect(),
            refuse_open: false,
            kind_queries: AtomicUsize::new(0),
            experiment_opens: AtomicUsize::new(0),
            experiment_closes: AtomicUsize::new(0),
            state: Mutex::new(CountingState::default()),
        }
    }

    /// A sink whose `open_simulation` always fails, leaving the run unopened.
    pub fn refusing_open(name: &str, kinds: &[&str]) -> Self {
        Self {
            refuse_open: true,
            ..Self::new(name, kinds)
        }
    }

    pub fn handled(&self, coordinate: RunCoordinate) -> usize {
        let state = self.state.lock().unwrap();
        state.handled.get(&coordinate).copied().unwrap_or(0)
    }

    pub fn total_handled(&self) -> usize {
        self.state.lock().unwrap().handled.values().sum()
    }

    pub fn opened(&self, coordinate: RunCoordinate) -> usize {
        let state = self.state.lock().unwrap();
        state.opened.get(&coordinate).copied().unwrap_or(0)
    }

    pub fn closed(&self, coordinate: RunCoordinate) -> usize {
        let state = self.state.lock().unwrap();
        state.closed.get(&coordinate).copied().unwrap_or(0)
    }

    pub fn violations(&self) -> Vec<String> {
        self.state.lock().unwrap().violations.clone()
    }
}

impl OutputSink for CountingSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn handled_kinds(&self) -> BTreeSet<RecordKind> {
        self.kind_queries.fetch_add(1, Ordering::SeqCst);
        self.kinds.clone()
    }

    fn open_experiment(&self, _ledger: &dyn ProgressLedger) -> Result<(), SimoutError> {
        self.experiment_opens.fetch_add(1, Ordering::SeqCst);
        self.state.lock().unwrap().experiment_closed = false;
        Ok(())
    }

    fn open_simulation(&self, coordinate: RunCoordinate) -> Result<(), SimoutError> {
        let mut state = self.state.lock().unwrap();
        if state.experiment_closed {
            state.violations.push(format!("opened {coordinate} after experiment close"));
        }
        if self.refuse_open {
            return Err(SimoutError::Sink(
                ErrorInfo::new("sink.open_refused", "cannot allocate run output")
                    .with_coordinate(coordinate),
            ));
        }
        if !state.open.insert(coordinate) {
            state.violations.push(format!("reopened {coordinate}"));
        }
        *state.opened.entry(coordinate).or_insert(0) += 1;
        Ok(())
    }

    fn handle(&self, record: &Arc<dyn OutputRecord>) -> Result<(), SimoutError> {
        let coordinate = record.coordinate();
        let mut state = self.state.lock().unwrap();
        if !state.open.contains(&coordinate) {
            state.violations.push(format!("record outside bracket {coordinate}"));
        }
        if !self.kinds.contains(record.kind()) {
            state.violations.push(format!("unwanted kind {}", record.kind()));
        }
        *state.handled.entry(coordinate).or_insert(0) += 1;
        Ok(())
    }

    fn close_simulation(&self, coordinate: RunCoordinate) -> Result<(), SimoutError> {
        let mut state = self.state.lock().unwrap();
        if !state.open.remove(&coordinate) {
            state.violations.push(format!("closed unopened {coordinate}"));
        }
        *state.closed.entry(coordinate).or_insert(0) += 1;
        Ok(())
    }

    fn close_experiment(&self) -> Result<(), SimoutError> {
        self.state.lock().unwrap().experiment_closed = true;
        self.experiment_closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Sink whose `handle` always fails; lifecycle calls succeed.
pub struct FailingSink {
    name: String,
    pub handle_calls: AtomicUsize,
    pub experiment_closes: AtomicUsize,
}

impl FailingSink {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            handle_calls: AtomicUsize::new(0),
            experiment_closes: AtomicUsize::new(0),
        }
    }
}

impl OutputSink for FailingSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn handled_kinds(&self) -> BTreeSet<RecordKind> {
        BTreeSet::from([RecordKind::new(INVENTORY)])
    }

    fn open_experiment(&self, _ledger: &dyn ProgressLedger) -> Result<(), SimoutError> {
        Ok(())
    }

    fn open_simulation(&self, _coordinate: RunCoordinate) -> Result<(), SimoutError> {
        Ok(())
    }

    fn handle(&self, _record: &Arc<dyn OutputRecord>) -> Result<(), SimoutError> {
        self.handle_calls.fetch_add(1, Ordering::SeqCst);
        Err(SimoutError::Sink(ErrorInfo::new(
            "sink.store_unavailable",
            "backing store rejected the write",
        )))
    }

    fn close_simulation(&self, _coordinate: RunCoordinate) -> Result<(), SimoutError> {
        Ok(())
    }

    fn close_experiment(&self) -> Result<(), SimoutError> {
        self.experiment_closes.fetch_add(1, Ordering::SeqCst);
        Err(SimoutError::Sink(ErrorInfo::new(
            "sink.flush_failed",
            "could not flush on close",
        )))
    }
}
