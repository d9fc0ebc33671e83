//! Configuration types.

use std::path::PathBuf;

use chrono::Local;

use crate::error::ConfigError;

/// Default maximum number of log entries kept per instance.
pub const DEFAULT_HISTORY_CAP: usize = 500;

/// Default number of newest entries kept when a history is compacted.
pub const DEFAULT_HISTORY_TAIL: usize = 100;

/// Default broadcast channel capacity for the event bus.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// How the worker executable is invoked. The artifact path is appended as the
/// final positional argument.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub working_dir: Option<PathBuf>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            working_dir: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_working_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = Some(dir);
        self
    }
}

/// Value source for a config default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DefaultValue {
    /// Today's local date as `YYYY-MM-DD`, resolved at start time.
    Today,
    Literal(String),
}

impl DefaultValue {
    fn resolve(&self) -> String {
        match self {
            Self::Today => Local::now().format("%Y-%m-%d").to_string(),
            Self::Literal(v) => v.clone(),
        }
    }
}

/// Defaults filled into an instance config at start time, for absent keys only.
#[derive(Debug, Clone)]
pub struct ConfigDefaults {
    entries: Vec<(String, DefaultValue)>,
}

impl ConfigDefaults {
    /// No defaults at all.
    pub fn none() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Add (or replace) a default.
    pub fn with(mut self, key: impl Into<String>, value: DefaultValue) -> Self {
        let key = key.into();
        self.entries.retain(|(k, _)| *k != key);
        self.entries.push((key, value));
        self
    }

    /// Resolve every default to a concrete `(key, value)` pair.
    pub fn resolve(&self) -> Vec<(String, String)> {
        self.entries
            .iter()
            .map(|(k, v)| (k.clone(), v.resolve()))
            .collect()
    }
}

impl Default for ConfigDefaults {
    fn default() -> Self {
        Self::none()
            .with("MIN_DATE", DefaultValue::Today)
            .with("NEED_ASC", DefaultValue::Literal("False".into()))
    }
}

/// Log history bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryLimits {
    /// Compaction triggers once the history grows past this many entries.
    pub cap: usize,
    /// Newest entries kept verbatim by a compaction.
    pub tail: usize,
}

impl Default for HistoryLimits {
    fn default() -> Self {
        Self {
            cap: DEFAULT_HISTORY_CAP,
            tail: DEFAULT_HISTORY_TAIL,
        }
    }
}

/// Supervisor configuration.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// HTTP/WebSocket listen port.
    pub port: u16,
    /// Root for the snapshot file and config artifacts.
    pub data_dir: PathBuf,
    pub worker: WorkerCommand,
    pub defaults: ConfigDefaults,
    pub history: HistoryLimits,
    pub event_capacity: usize,
    /// Directory for rolling log files (stderr only when unset).
    pub log_dir: Option<PathBuf>,
}

impl SupervisorConfig {
    /// Config with default limits rooted at `data_dir`.
    pub fn new(data_dir: impl Into<PathBuf>, worker: WorkerCommand) -> Self {
        Self {
            port: 3000,
            data_dir: data_dir.into(),
            worker,
            defaults: ConfigDefaults::default(),
            history: HistoryLimits::default(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
            log_dir: None,
        }
    }

    /// Build config from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let port: u16 = std::env::var("SUPERVISOR_PORT")
            .or_else(|_| std::env::var("PORT"))
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(3000);

        let data_dir = std::env::var("SUPERVISOR_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data"));

        let program =
            std::env::var("SUPERVISOR_WORKER_PROGRAM").unwrap_or_else(|_| "python3".to_string());
        let args: Vec<String> = std::env::var("SUPERVISOR_WORKER_ARGS")
            .unwrap_or_else(|_| "-u main.py".to_string())
            .split_whitespace()
            .map(str::to_string)
            .collect();

        let mut worker = WorkerCommand::new(program).with_args(args);
        let env_spec = std::env::var("SUPERVISOR_WORKER_ENV")
            .unwrap_or_else(|_| "PYTHONUNBUFFERED=1".to_string());
        for (k, v) in parse_pairs("SUPERVISOR_WORKER_ENV", &env_spec)? {
            worker = worker.with_env(k, v);
        }
        if let Ok(dir) = std::env::var("SUPERVISOR_WORKER_DIR") {
            worker = worker.with_working_dir(PathBuf::from(dir));
        }

        let mut defaults = ConfigDefaults::default();
        if let Ok(spec) = std::env::var("SUPERVISOR_CONFIG_DEFAULTS") {
            for (k, v) in parse_pairs("SUPERVISOR_CONFIG_DEFAULTS", &spec)? {
                defaults = defaults.with(k, DefaultValue::Literal(v));
            }
        }

        let history = HistoryLimits {
            cap: parse_env("SUPERVISOR_HISTORY_CAP", DEFAULT_HISTORY_CAP)?,
            tail: parse_env("SUPERVISOR_HISTORY_TAIL", DEFAULT_HISTORY_TAIL)?,
        };
        validate_history(history)?;

        let event_capacity = parse_env("SUPERVISOR_EVENT_CAPACITY", DEFAULT_EVENT_CAPACITY)?;
        if event_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                key: "SUPERVISOR_EVENT_CAPACITY".into(),
                message: "must be greater than zero".into(),
            });
        }

        let log_dir = std::env::var("SUPERVISOR_LOG_DIR").ok().map(PathBuf::from);

        Ok(Self {
            port,
            data_dir,
            worker,
            defaults,
            history,
            event_capacity,
            log_dir,
        })
    }

    /// Path of the persisted snapshot.
    pub fn snapshot_path(&self) -> PathBuf {
        self.data_dir.join("instances.json")
    }

    /// Directory holding generated config artifacts.
    pub fn artifact_dir(&self) -> PathBuf {
        self.data_dir.join("artifacts")
    }
}

/// Reject history bounds that would make compaction meaningless.
pub fn validate_history(limits: HistoryLimits) -> Result<(), ConfigError> {
    if limits.cap == 0 {
        return Err(ConfigError::InvalidValue {
            key: "SUPERVISOR_HISTORY_CAP".into(),
            message: "must be greater than zero".into(),
        });
    }
    if limits.tail >= limits.cap {
        return Err(ConfigError::InvalidValue {
            key: "SUPERVISOR_HISTORY_TAIL".into(),
            message: format!("must be smaller than the cap ({})", limits.cap),
        });
    }
    Ok(())
}

fn parse_env(key: &str, default: usize) -> Result<usize, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
            key: key.into(),
            message: format!("expected a non-negative integer, got {raw:?}"),
        }),
        Err(_) => Ok(default),
    }
}

/// Parse `K=V,K=V` lists. Empty items are skipped.
pub fn parse_pairs(key: &str, spec: &str) -> Result<Vec<(String, String)>, ConfigError> {
    spec.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|item| {
            item.split_once('=')
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                .filter(|(k, _)| !k.is_empty())
                .ok_or_else(|| ConfigError::InvalidValue {
                    key: key.into(),
                    message: format!("expected KEY=VALUE, got {item:?}"),
                })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_pairs_skips_blanks() {
        let pairs = parse_pairs("X", "A=1, B = two ,,").unwrap();
        assert_eq!(
            pairs,
            vec![("A".into(), "1".into()), ("B".into(), "two".into())]
        );
    }

    #[test]
    fn parse_pairs_rejects_missing_equals() {
        let err = parse_pairs("X", "A=1,oops").unwrap_err();
        assert!(err.to_string().contains("oops"));
    }

    #[test]
    fn history_tail_must_be_below_cap() {
        assert!(validate_history(HistoryLimits::default()).is_ok());
        assert!(validate_history(HistoryLimits { cap: 10, tail: 10 }).is_err());
        assert!(validate_history(HistoryLimits { cap: 0, tail: 0 }).is_err());
    }

    #[test]
    fn default_defaults_fill_min_date_and_asc_flag() {
        let resolved = ConfigDefaults::default().resolve();
        let keys: Vec<&str> = resolved.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["MIN_DATE", "NEED_ASC"]);
        let min_date = &resolved[0].1;
        assert!(chrono::NaiveDate::parse_from_str(min_date, "%Y-%m-%d").is_ok());
        assert_eq!(resolved[1].1, "False");
    }

    #[test]
    fn with_replaces_existing_default() {
        let defaults = ConfigDefaults::default().with("NEED_ASC", DefaultValue::Literal("True".into()));
        let resolved = defaults.resolve();
        assert_eq!(resolved.len(), 2);
        assert!(resolved.contains(&("NEED_ASC".into(), "True".into())));
    }
}
