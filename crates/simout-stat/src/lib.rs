#![deny(missing_docs)]
#![doc = "Numerically robust aggregation primitives for simulation output."]

/// Streaming Welford accumulator feeding descriptive statistics.
pub mod accumulator;
/// Validated immutable summary statistics and their builder.
pub mod descriptive;
/// Kahan compensated summation.
pub mod summation;

pub use accumulator::SampleAccumulator;
pub use descriptive::{DescriptiveStat, DescriptiveStatBuilder};
pub use summation::CompensatedSummation;
