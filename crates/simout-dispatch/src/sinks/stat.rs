use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use dashmap::DashMap;
use simout_core::errors::{ErrorInfo, SimoutError};
use simout_core::{OutputRecord, RecordKind, RunCoordinate};
use simout_stat::{DescriptiveStat, SampleAccumulator};
use tracing::debug;

use crate::ledger::ProgressLedger;
use crate::sink::OutputSink;

/// Sink summarising one numeric field of one record kind across all runs.
///
/// Samples are accumulated per run in isolation and published to the
/// experiment wide view when the run closes. Published runs are kept across
/// executions of the same instance; `open_experiment` discards those the
/// ledger does not mark as completed.
pub struct StatSink {
    name: String,
    kind: RecordKind,
    field: String,
    in_flight: DashMap<RunCoordinate, SampleAccumulator>,
    published: DashMap<RunCoordinate, SampleAccumulator>,
}

impl StatSink {
    /// Creates a sink summarising `field` of records of `kind`.
    pub fn new(
        name: impl Into<String>,
        kind: impl Into<RecordKind>,
        field: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            field: field.into(),
            in_flight: DashMap::new(),
            published: DashMap::new(),
        }
    }

    /// Summary over every published run.
    ///
    /// Runs are merged in coordinate order, so the result does not depend on
    /// the order in which runs closed.
    pub fn summary(&self) -> Result<DescriptiveStat, SimoutError> {
        let ordered: BTreeMap<RunCoordinate, SampleAccumulator> = self
            .published
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect();
        let mut total = SampleAccumulator::new();
        for acc in ordered.values() {
            total.merge(acc);
        }
        total.summarize()
    }

    /// Summary of a single published run.
    pub fn run_summary(
        &self,
        coordinate: RunCoordinate,
    ) -> Result<Option<DescriptiveStat>, SimoutError> {
        match self.published.get(&coordinate) {
            Some(acc) => acc.value().summarize().map(Some),
            None => Ok(None),
        }
    }

    /// Runs whose samples are part of the summary, ascending.
    pub fn published_runs(&self) -> Vec<RunCoordinate> {
        let mut runs: Vec<_> = self.published.iter().map(|entry| *entry.key()).collect();
        runs.sort_unstable();
        runs
    }
}

impl OutputSink for StatSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn handled_kinds(&self) -> BTreeSet<RecordKind> {
        BTreeSet::from([self.kind.clone()])
    }

    fn open_experiment(&self, ledger: &dyn ProgressLedger) -> Result<(), SimoutError> {
        self.in_flight.clear();
        self.published
            .retain(|coordinate, _| ledger.is_completed(*coordinate));
        Ok(())
    }

    fn open_simulation(&self, coordinate: RunCoordinate) -> Result<(), SimoutError> {
        self.in_flight.insert(coordinate, SampleAccumulator::new());
        Ok(())
    }

    fn handle(&self, record: &Arc<dyn OutputRecord>) -> Result<(), SimoutError> {
        let coordinate = record.coordinate();
        let value = record.value(&self.field).ok_or_else(|| {
            SimoutError::Sink(
                ErrorInfo::new("sink.missing_field", "record lacks the summarised field")
                    .with_sink(self.name.clone())
                    .with_context("field", self.field.clone())
                    .with_coordinate(coordinate),
            )
        })?;
        self.in_flight.entry(coordinate).or_default().push(value);
        Ok(())
    }

    fn close_simulation(&self, coordinate: RunCoordinate) -> Result<(), SimoutError> {
        let acc = self
            .in_flight
            .remove(&coordinate)
            .map(|(_, acc)| acc)
            .unwrap_or_default();
        debug!(sink = %self.name, %coordinate, samples = acc.count(), "run published");
        self.published.insert(coordinate, acc);
        Ok(())
    }

    fn close_experiment(&self) -> Result<(), SimoutError> {
        self.in_flight.clear();
        Ok(())
    }
}
