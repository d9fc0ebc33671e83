//! Bounded per-instance log history.

use crate::config::HistoryLimits;

use super::model::LogEntry;

/// Ordered log history that compacts itself once it grows past its cap.
#[derive(Debug, Clone)]
pub struct LogHistory {
    entries: Vec<LogEntry>,
    limits: HistoryLimits,
}

impl LogHistory {
    pub fn new(limits: HistoryLimits) -> Self {
        Self {
            entries: Vec::new(),
            limits,
        }
    }

    /// Append an entry. Returns the number of entries discarded if the push
    /// triggered a compaction.
    pub fn push(&mut self, entry: LogEntry) -> Option<usize> {
        self.entries.push(entry);
        self.compact()
    }

    /// Collapse everything but the newest `tail` entries into one summary
    /// entry when the history is longer than `cap`. One-way.
    pub fn compact(&mut self) -> Option<usize> {
        if self.entries.len() <= self.limits.cap {
            return None;
        }

        let discarded = self.entries.len() - self.limits.tail;
        let tail = self.entries.split_off(discarded);
        self.entries.clear();
        self.entries.push(LogEntry::info(format!(
            "… {discarded} earlier log entries were compacted"
        )));
        self.entries.extend(tail);
        Some(discarded)
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instances::model::LogKind;

    fn filled(n: usize) -> LogHistory {
        let mut history = LogHistory::new(HistoryLimits::default());
        for i in 0..n {
            history.push(LogEntry::info(format!("line {i}")));
        }
        history
    }

    #[test]
    fn stays_untouched_up_to_cap() {
        let history = filled(500);
        assert_eq!(history.len(), 500);
        assert_eq!(history.entries()[0].message, "line 0");
    }

    #[test]
    fn compacts_to_summary_plus_tail() {
        let history = filled(501);
        assert_eq!(history.len(), 101);

        let summary = &history.entries()[0];
        assert_eq!(summary.kind, LogKind::Info);
        assert!(summary.message.contains("401"), "{}", summary.message);

        // Tail is the newest 100 originals, in order.
        assert_eq!(history.entries()[1].message, "line 401");
        assert_eq!(history.entries()[100].message, "line 500");
    }

    #[test]
    fn push_reports_discarded_count() {
        let mut history = filled(500);
        assert_eq!(history.push(LogEntry::info("overflow")), Some(401));
        assert_eq!(history.push(LogEntry::info("next")), None);
    }

    #[test]
    fn summary_is_itself_subject_to_later_compaction() {
        let limits = HistoryLimits { cap: 5, tail: 2 };
        let mut history = LogHistory::new(limits);
        for i in 0..6 {
            history.push(LogEntry::info(format!("a{i}")));
        }
        // summary(4) + a4 + a5
        assert_eq!(history.len(), 3);
        for i in 0..3 {
            history.push(LogEntry::info(format!("b{i}")));
        }
        // 6 entries > 5: summary(4) + b1 + b2
        assert_eq!(history.len(), 3);
        assert!(history.entries()[0].message.contains('4'));
        assert_eq!(history.entries()[2].message, "b2");
    }
}
