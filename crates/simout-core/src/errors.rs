//! Structured error types shared across simout crates.
//!
//! Every failure carries an [`ErrorInfo`] with a stable dotted code
//! (`<family>.<reason>`) and string context. Run and sink identities have
//! dedicated context keys so callers can tell which run must be repeated.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::coord::RunCoordinate;

/// Context key holding the run coordinate an error refers to.
pub const COORDINATE_KEY: &str = "coordinate";
/// Context key holding the sink an error refers to.
pub const SINK_KEY: &str = "sink";
const CAUSE_PREFIX: &str = "cause.";

/// Structured payload attached to every [`SimoutError`] variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Stable machine readable error code.
    pub code: String,
    /// Human readable diagnostic message.
    pub message: String,
    /// Contextual key value pairs (coordinates, sink names, per-sink causes).
    #[serde(default)]
    pub context: BTreeMap<String, String>,
    /// Optional remediation hint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl ErrorInfo {
    /// Creates a payload with the provided code and message.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            context: BTreeMap::new(),
            hint: None,
        }
    }

    /// Adds a context entry.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Tags the payload with the run it concerns.
    pub fn with_coordinate(self, coordinate: RunCoordinate) -> Self {
        self.with_context(COORDINATE_KEY, coordinate.to_string())
    }

    /// Tags the payload with the sink it concerns.
    pub fn with_sink(self, sink: impl Into<String>) -> Self {
        self.with_context(SINK_KEY, sink)
    }

    /// Records the error a named sink reported, under `cause.<sink>`.
    pub fn with_cause(self, sink: &str, cause: &SimoutError) -> Self {
        self.with_context(format!("{CAUSE_PREFIX}{sink}"), cause.to_string())
    }

    /// Sets a remediation hint.
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    /// Looks up a context value.
    pub fn context_value(&self, key: &str) -> Option<&str> {
        self.context.get(key).map(String::as_str)
    }

    /// Sinks with a recorded cause, in name order.
    pub fn failed_sinks(&self) -> impl Iterator<Item = &str> {
        self.context
            .keys()
            .filter_map(|key| key.strip_prefix(CAUSE_PREFIX))
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        let mut entries = self.context.iter();
        if let Some((key, value)) = entries.next() {
            write!(f, " {{{key}={value}")?;
            for (key, value) in entries {
                write!(f, ", {key}={value}")?;
            }
            f.write_str("}")?;
        }
        if let Some(hint) = &self.hint {
            write!(f, "; hint: {hint}")?;
        }
        Ok(())
    }
}

/// Canonical error type for output collection and aggregation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(tag = "family", content = "detail")]
pub enum SimoutError {
    /// Statistic construction errors (invariant violations).
    #[error("stat error {0}")]
    Stat(ErrorInfo),
    /// Experiment or run lifecycle ordering violations.
    #[error("lifecycle error {0}")]
    Lifecycle(ErrorInfo),
    /// Failures reported by an output sink.
    #[error("sink error {0}")]
    Sink(ErrorInfo),
    /// Progress ledger persistence and integrity errors.
    #[error("ledger error {0}")]
    Ledger(ErrorInfo),
    /// Configuration loading errors.
    #[error("config error {0}")]
    Config(ErrorInfo),
    /// Serialization and schema errors.
    #[error("serde error {0}")]
    Serde(ErrorInfo),
}

impl SimoutError {
    /// Returns the payload describing the error.
    pub fn info(&self) -> &ErrorInfo {
        match self {
            SimoutError::Stat(info)
            | SimoutError::Lifecycle(info)
            | SimoutError::Sink(info)
            | SimoutError::Ledger(info)
            | SimoutError::Config(info)
            | SimoutError::Serde(info) => info,
        }
    }

    /// Stable error code of the payload.
    pub fn code(&self) -> &str {
        &self.info().code
    }

    /// Run the error concerns, when it names one.
    pub fn coordinate(&self) -> Option<&str> {
        self.info().context_value(COORDINATE_KEY)
    }
}
