//! Collapses runs of identical formatted lines.
//!
//! Workers poll in tight loops and print the same status line over and over.
//! A run of identical messages is reported once, then as a
//! "(repeated N times)" entry every fifth repeat after the first line, and
//! once more when the run ends after two or more unreported repeats.

use crate::instances::model::{LogEntry, LogKind};

/// Repetitions between two "(repeated N times)" reports.
pub const REPORT_EVERY: u32 = 5;

/// Per-run duplicate suppression state. Reset on every start.
#[derive(Debug, Default)]
pub struct Deduplicator {
    last: Option<(String, LogKind)>,
    /// Repeats seen after the first occurrence of `last`.
    repeats: u32,
}

impl Deduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one formatted line. Returns the entries to store and broadcast.
    pub fn observe(&mut self, message: &str, kind: LogKind) -> Vec<LogEntry> {
        if let Some((last, _)) = &self.last
            && last == message
        {
            self.repeats += 1;
            if self.repeats % REPORT_EVERY == 0 {
                return vec![repeated(message, kind, self.repeats)];
            }
            return Vec::new();
        }

        let mut out = self.flush();
        out.push(LogEntry::new(message, kind));
        self.last = Some((message.to_string(), kind));
        self.repeats = 0;
        out
    }

    /// End the current run, reporting an unreported repeat count if any.
    pub fn flush(&mut self) -> Vec<LogEntry> {
        let repeats = std::mem::take(&mut self.repeats);
        match self.last.take() {
            Some((message, kind)) if repeats >= 2 && repeats % REPORT_EVERY != 0 => {
                vec![repeated(&message, kind, repeats)]
            }
            _ => Vec::new(),
        }
    }
}

fn repeated(message: &str, kind: LogKind, repeats: u32) -> LogEntry {
    LogEntry::new(format!("{message} (repeated {repeats} times)"), kind)
}
