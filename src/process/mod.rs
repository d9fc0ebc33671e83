//! Worker processes: config artifacts and process supervision.

pub mod artifact;
pub mod runner;

pub use artifact::ArtifactWriter;
pub use runner::{ExitOutcome, OutputEvent, OutputStream, ProcessHandle, StreamKind, spawn};
