use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::coord::RunCoordinate;

/// Registered tag identifying a family of output records.
///
/// Kinds are plain values handed around explicitly by the engine and the sink
/// configuration; sinks match on them instead of inspecting concrete types.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordKind(String);

impl RecordKind {
    /// Creates a kind tag from its textual label.
    pub fn new(label: impl Into<String>) -> Self {
        Self(label.into())
    }

    /// Returns the textual label of the kind.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RecordKind {
    fn from(label: &str) -> Self {
        Self::new(label)
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Immutable unit of output emitted by a simulation run.
///
/// Implementations must be fully immutable: records are shared between sinks
/// and threads as `Arc<dyn OutputRecord>` without further synchronization.
pub trait OutputRecord: fmt::Debug + Send + Sync + 'static {
    /// Returns the coordinate of the run that produced the record.
    fn coordinate(&self) -> RunCoordinate;

    /// Returns the kind tag used for routing.
    fn kind(&self) -> &RecordKind;

    /// Returns a named numeric field, if the record carries one.
    fn value(&self, _field: &str) -> Option<f64> {
        None
    }

    /// Exposes the concrete record for sinks that know the variant.
    fn as_any(&self) -> &dyn Any;
}

/// General purpose record carrying a map of named numeric samples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleRecord {
    /// Run that emitted the sample.
    pub coordinate: RunCoordinate,
    /// Kind tag used for routing.
    pub kind: RecordKind,
    /// Named numeric values.
    #[serde(default)]
    pub values: BTreeMap<String, f64>,
}

impl SampleRecord {
    /// Creates an empty sample for the given run and kind.
    pub fn new(coordinate: RunCoordinate, kind: impl Into<RecordKind>) -> Self {
        Self {
            coordinate,
            kind: kind.into(),
            values: BTreeMap::new(),
        }
    }

    /// Adds a named value to the sample.
    pub fn with_value(mut self, field: impl Into<String>, value: f64) -> Self {
        self.values.insert(field.into(), value);
        self
    }
}

impl OutputRecord for SampleRecord {
    fn coordinate(&self) -> RunCoordinate {
        self.coordinate
    }

    fn kind(&self) -> &RecordKind {
        &self.kind
    }

    fn value(&self, field: &str) -> Option<f64> {
        self.values.get(field).copied()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
