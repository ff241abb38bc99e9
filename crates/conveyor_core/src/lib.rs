//! CONVEYOR Core Types
//!
//! This crate contains pure types with no I/O and no runtime dependency:
//! identifiers for pipeline stages and scheduled tasks, and the error
//! taxonomy shared by every other crate.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod id;

// Re-exports
pub use error::{PipelineError, PipelineResult};
pub use id::{CollectionId, TaskSeq};
