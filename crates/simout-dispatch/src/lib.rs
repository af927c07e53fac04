#![deny(missing_docs)]
#![doc = "Output dispatch from concurrently executing simulation runs to pluggable sinks, with resumable experiments."]

pub mod codec;
/// Router configuration loading.
pub mod config;
pub mod ledger;
pub mod router;
/// Sink capability contract.
pub mod sink;
pub mod sinks;

pub use config::{load_config, DispatchConfig, SinkFailurePolicy};
pub use ledger::{CompletionRecord, FileLedger, LedgerBackend, MemoryLedger, ProgressLedger};
pub use router::{DispatchRouter, ExperimentPhase, RunReceipt};
pub use sink::{OutputSink, ResumePolicy};
pub use sinks::{CaptureSink, LifecycleEvent, StatSink};
