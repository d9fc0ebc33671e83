//! Worker output formatting.
//!
//! Raw worker lines go through three steps:
//! - strip the logging prefix (`YYYY-MM-DD HH:MM:SS,mmm` and a level token)
//! - drop noise (debug records, blank lines, separators)
//! - evaluate the ordered rule table, first match wins
//!
//! A rewrite that yields text some other rule would still change is fed back
//! through the table, so every emitted message is a fixed point. Formatting
//! is a pure function of the raw line and its stream kind.

use std::sync::LazyLock;

use regex::Regex;

use crate::instances::model::LogKind;

/// Something the supervisor should react to beyond logging the line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// The worker reported that its goal was reached (booking confirmed).
    Success,
}

/// What a matching rule does with the line.
#[derive(Debug, Clone)]
pub enum RuleAction {
    /// Replace the line using a regex replacement template (`$1` etc.).
    Rewrite(String),
    /// Keep the message text, only classify it.
    Keep,
    /// Never emit or store the line.
    Suppress,
}

/// A single formatting rule with a compiled regex.
#[derive(Debug, Clone)]
pub struct FormatRule {
    /// Short identifier used in debug logs and tests.
    pub name: &'static str,
    pub regex: Regex,
    pub action: RuleAction,
    /// Classification; `None` inherits the level token or stream kind.
    pub kind: Option<LogKind>,
    pub signal: Option<Signal>,
}

/// Result of formatting one raw line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormattedLine {
    pub message: String,
    pub kind: LogKind,
    pub signal: Option<Signal>,
}

/// Python `logging` asctime prefix, optionally followed by a dash separator.
static TIMESTAMP_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2},\d{3}\s*(?:-\s*)?").unwrap()
});

/// Level token that may follow the timestamp.
static LEVEL_AFTER_TIMESTAMP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\[?(DEBUG|INFO|WARNING|WARN|ERROR|CRITICAL)\]?(?:\s*[-:|]\s*|\s+|$)").unwrap()
});

/// `logging.basicConfig()` default shape: `LEVEL:logger:message`.
static LEVEL_BASIC_CONFIG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(DEBUG|INFO|WARNING|ERROR|CRITICAL):[\w.]*:").unwrap()
});

/// Lines made only of separator characters.
static SEPARATOR: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[=\-_*~#. ]+$").unwrap());

/// Upper bound on rewrite chains such as a heading wrapping a protocol phrase.
const MAX_PASSES: usize = 4;

/// Shared formatter with the default rule table.
static DEFAULT_FORMATTER: LazyLock<LogFormatter> = LazyLock::new(LogFormatter::default_rules);

/// Format with the default rule table.
pub fn format_line(raw: &str, kind: LogKind) -> Option<FormattedLine> {
    DEFAULT_FORMATTER.format(raw, kind)
}

/// Ordered, first-match-wins rule table.
pub struct LogFormatter {
    rules: Vec<FormatRule>,
}

impl LogFormatter {
    /// Create a formatter with the worker protocol rules.
    pub fn default_rules() -> Self {
        let mut formatter = Self::empty();

        // ── Noise ───────────────────────────────────────────────────────
        formatter.suppress(
            "deprecation",
            r"(?i)\b(DeprecationWarning|PendingDeprecationWarning|FutureWarning)\b|\bis deprecated\b",
        );
        formatter.suppress("warnings-call", r"^warnings\.warn\(");
        formatter.suppress(
            "http-connection",
            r#"^(Starting new HTTPS? connection|Resetting dropped connection|https?://\S+ "(GET|POST|PUT|PATCH|DELETE|HEAD) )"#,
        );
        formatter.suppress("request-dump", r"^Request \{");
        formatter.suppress("response-dump", r"(?i)^(Response:|<!DOCTYPE|<html\b|<head\b|<body\b|<script\b|<meta\b)");
        formatter.suppress("traceback-frame", r#"^File ".*", line \d+"#);

        // ── Outcome ─────────────────────────────────────────────────────
        formatter.push(FormatRule {
            name: "booking-confirmed",
            regex: rule_regex(r"(?i)appointment successfully (booked|scheduled)"),
            action: RuleAction::Rewrite("🎉 Appointment successfully booked!".into()),
            kind: Some(LogKind::Info),
            signal: Some(Signal::Success),
        });

        // ── Notification bodies echoed by the worker ────────────────────
        formatter.rewrite("html-field", r"^<p><strong>([^<]+?):?</strong>\s*(.*?)</p>$", "• $1: $2", None);
        formatter.rewrite("html-heading", r"^<h\d>(.*?)</h\d>$", "$1", None);
        formatter.suppress("html-tag", r"^</?[a-zA-Z][^>]*>$");

        // ── Worker protocol ─────────────────────────────────────────────
        // Substring matches in table order, so "Get available dates ASC"
        // lands on the dates phrase.
        let info = Some(LogKind::Info);
        for (name, pattern, phrase) in [
            ("sign-in", r"Get sign in", "🔐 Signing into your account..."),
            ("credentials", r"Post si(ng|gn) in", "🔑 Verifying credentials..."),
            (
                "current-appointment",
                r"Get current appointment",
                "📅 Fetching your current appointment details...",
            ),
            (
                "facility-missing",
                r"Not found facility_id",
                "⚠️ No facility selected - will auto-select one",
            ),
            (
                "asc-facility-missing",
                r"Not found asc_facility_id",
                "⚠️ No ASC facility selected - will auto-select one",
            ),
            (
                "dates-search",
                r"Get available date",
                "🔍 Searching for available appointment dates...",
            ),
            (
                "no-dates",
                r"No available dates",
                "😔 No appointment dates available at this time",
            ),
            ("times-search", r"Get available time", "🕒 Checking available time slots..."),
            (
                "no-times",
                r"No available times",
                "😔 No time slots available for this date",
            ),
            ("server-busy", r"Server is busy", "⏳ Server is busy, waiting for response..."),
            // Whole word only: "Booked At" and friends are not booking attempts.
            ("book", r"\bBook\b", "📝 Attempting to book appointment..."),
            ("session-expired", r"Get 401", "🔄 Session expired - reconnecting..."),
            ("csrf", r"Init csrf", "🔒 Initializing secure session..."),
            (
                "asc-in-request",
                r"Add ASC date and time to request",
                "🏢 Including ASC appointment in the booking request",
            ),
        ] {
            formatter.rewrite(name, pattern, phrase, info);
        }

        // ── Failures ────────────────────────────────────────────────────
        let error = Some(LogKind::Error);
        formatter.classify("traceback", r"^Traceback \(most recent call last\)", error);
        formatter.classify("exception", r"^(❌|[\w.]*(Error|Exception)\b:)", error);
        formatter.classify("failure", r"(?i)\bfail(ed|ure)\b", error);

        formatter
    }

    /// Create an empty formatter (for testing).
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// Append a rule at the lowest priority.
    pub fn push(&mut self, rule: FormatRule) {
        self.rules.push(rule);
    }

    fn suppress(&mut self, name: &'static str, pattern: &str) {
        self.push(FormatRule {
            name,
            regex: rule_regex(pattern),
            action: RuleAction::Suppress,
            kind: None,
            signal: None,
        });
    }

    fn rewrite(&mut self, name: &'static str, pattern: &str, template: &str, kind: Option<LogKind>) {
        self.push(FormatRule {
            name,
            regex: rule_regex(pattern),
            action: RuleAction::Rewrite(template.into()),
            kind,
            signal: None,
        });
    }

    fn classify(&mut self, name: &'static str, pattern: &str, kind: Option<LogKind>) {
        self.push(FormatRule {
            name,
            regex: rule_regex(pattern),
            action: RuleAction::Keep,
            kind,
            signal: None,
        });
    }

    pub fn rules(&self) -> &[FormatRule] {
        &self.rules
    }

    /// Format one raw line. `None` means the line is suppressed.
    pub fn format(&self, raw: &str, stream_kind: LogKind) -> Option<FormattedLine> {
        let mut text = raw.to_string();
        let mut kind = None;
        let mut signal = None;
        let mut matched = false;

        for _ in 0..MAX_PASSES {
            let step = self.pass(&text)?;
            matched |= step.matched;
            kind = step.kind.or(kind);
            signal = step.signal.or(signal);
            if step.text == text {
                break;
            }
            text = step.text;
        }

        let fallback = if matched { stream_kind } else { LogKind::Info };
        Some(FormattedLine {
            message: text,
            kind: kind.unwrap_or(fallback),
            signal,
        })
    }

    /// One trip through prefix stripping, noise filtering and the rule table.
    fn pass(&self, raw: &str) -> Option<Pass> {
        let (message, level) = strip_prefix(raw);
        if level == Some(Level::Debug) {
            return None;
        }

        let message = message.trim();
        if message.is_empty() || SEPARATOR.is_match(message) {
            return None;
        }

        let level_kind = level.map(Level::kind);

        // Already-clean messages are fixed points.
        if let Some(rule) = self.rules.iter().find(|r| is_static_replacement(r, message)) {
            return Some(Pass {
                text: message.to_string(),
                kind: rule.kind.or(level_kind),
                signal: rule.signal,
                matched: true,
            });
        }

        let Some(rule) = self.rules.iter().find(|r| r.regex.is_match(message)) else {
            return Some(Pass {
                text: message.to_string(),
                kind: level_kind,
                signal: None,
                matched: false,
            });
        };

        let text = match &rule.action {
            RuleAction::Suppress => return None,
            RuleAction::Keep => message.to_string(),
            // Rewrites replace the whole line, not just the matched span.
            RuleAction::Rewrite(template) => expand(&rule.regex, message, template),
        };

        let text = text.trim().to_string();
        if text.is_empty() {
            return None;
        }

        Some(Pass {
            text,
            kind: rule.kind.or(level_kind),
            signal: rule.signal,
            matched: true,
        })
    }
}

struct Pass {
    text: String,
    kind: Option<LogKind>,
    signal: Option<Signal>,
    matched: bool,
}

/// Compile a rule regex. Patterns are compile-time constants, so a failure
/// here is a programming error caught by the rule table tests.
fn rule_regex(pattern: &str) -> Regex {
    Regex::new(pattern).unwrap_or_else(|e| panic!("invalid format rule {pattern:?}: {e}"))
}

/// Whether `message` already equals a rule's literal (placeholder-free) output.
fn is_static_replacement(rule: &FormatRule, message: &str) -> bool {
    match &rule.action {
        RuleAction::Rewrite(template) => !template.contains('$') && template == message,
        _ => false,
    }
}

/// Expand `template` against the first match.
fn expand(regex: &Regex, message: &str, template: &str) -> String {
    let mut out = String::new();
    if let Some(caps) = regex.captures(message) {
        caps.expand(template, &mut out);
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Level {
    Debug,
    Info,
    Warning,
    Error,
}

impl Level {
    fn parse(token: &str) -> Option<Self> {
        match token {
            "DEBUG" => Some(Self::Debug),
            "INFO" => Some(Self::Info),
            "WARNING" | "WARN" => Some(Self::Warning),
            "ERROR" | "CRITICAL" => Some(Self::Error),
            _ => None,
        }
    }

    fn kind(self) -> LogKind {
        match self {
            Self::Error => LogKind::Error,
            Self::Debug | Self::Info | Self::Warning => LogKind::Info,
        }
    }
}

/// Strip the timestamp and level prefix, returning the remaining message.
fn strip_prefix(raw: &str) -> (&str, Option<Level>) {
    let line = raw.trim_end_matches(['\r', '\n']);

    if let Some(m) = TIMESTAMP_PREFIX.find(line) {
        let rest = &line[m.end()..];
        if let Some(caps) = LEVEL_AFTER_TIMESTAMP.captures(rest) {
            let level = caps.get(1).and_then(|t| Level::parse(t.as_str()));
            let end = caps.get(0).map_or(0, |whole| whole.end());
            return (&rest[end..], level);
        }
        return (rest, None);
    }

    if let Some(caps) = LEVEL_BASIC_CONFIG.captures(line) {
        let level = caps.get(1).and_then(|t| Level::parse(t.as_str()));
        let end = caps.get(0).map_or(0, |whole| whole.end());
        return (&line[end..], level);
    }

    (line, None)
}
