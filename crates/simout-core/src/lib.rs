#![deny(missing_docs)]
#![doc = "Core identifiers, record model and error types for simulation output collection."]

pub mod errors;

mod coord;
mod record;

pub use coord::RunCoordinate;
pub use errors::{ErrorInfo, SimoutError};
pub use record::{OutputRecord, RecordKind, SampleRecord};
