//! Worker output processing: formatting and duplicate suppression.

pub mod dedup;
pub mod format;

pub use dedup::Deduplicator;
pub use format::{FormattedLine, LogFormatter, Signal, format_line};
