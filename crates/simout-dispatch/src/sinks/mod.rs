//! Ready made sinks.

mod capture;
mod stat;

pub use capture::{CaptureSink, LifecycleEvent};
pub use stat::StatSink;
