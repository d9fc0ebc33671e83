//! Instance data model — records, log entries, and WebSocket event types.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Opaque instance identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Sort key that orders numeric ids by value and everything else after.
    pub(crate) fn creation_order(&self) -> (u64, &str) {
        (self.0.parse().unwrap_or(u64::MAX), &self.0)
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle status of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Not running; either never started or stopped by the user.
    Stopped,
    /// A worker process is live.
    Running,
    /// The worker exited with code 0.
    Completed,
    /// The worker failed to launch or exited abnormally.
    Error,
}

impl InstanceStatus {
    /// Status a finished run settles into.
    pub fn from_exit_code(code: i32) -> Self {
        if code == 0 { Self::Completed } else { Self::Error }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// Severity of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogKind {
    Info,
    Error,
}

/// One formatted, user-facing log line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub message: String,
    pub kind: LogKind,
    /// When the supervisor generated the entry.
    pub timestamp: DateTime<Utc>,
}

impl LogEntry {
    pub fn new(message: impl Into<String>, kind: LogKind) -> Self {
        Self {
            message: message.into(),
            kind,
            timestamp: Utc::now(),
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(message, LogKind::Info)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(message, LogKind::Error)
    }
}

/// Ordered string → string mapping supplied by the caller.
///
/// Serialized as a JSON object whose key order is the insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceConfig {
    entries: Vec<(String, String)>,
}

impl InstanceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite a key, keeping its original position on overwrite.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    /// Fill each absent key from `defaults`. Returns the keys that were added.
    pub fn fill_defaults(&mut self, defaults: &[(String, String)]) -> Vec<String> {
        let mut filled = Vec::new();
        for (key, value) in defaults {
            if !self.contains_key(key) {
                self.entries.push((key.clone(), value.clone()));
                filled.push(key.clone());
            }
        }
        filled
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for InstanceConfig {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut config = Self::new();
        for (k, v) in iter {
            config.insert(k, v);
        }
        config
    }
}

impl Serialize for InstanceConfig {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (k, v) in &self.entries {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for InstanceConfig {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ConfigVisitor;

        impl<'de> Visitor<'de> for ConfigVisitor {
            type Value = InstanceConfig;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of string keys to scalar values")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut config = InstanceConfig::new();
                while let Some((key, value)) = access.next_entry::<String, ConfigValue>()? {
                    config.insert(key, value.0);
                }
                Ok(config)
            }
        }

        deserializer.deserialize_map(ConfigVisitor)
    }
}

/// Accepts strings, numbers and booleans from dashboard forms; stored as text.
struct ConfigValue(String);

impl<'de> Deserialize<'de> for ConfigValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match serde_json::Value::deserialize(deserializer)? {
            serde_json::Value::String(s) => Ok(Self(s)),
            serde_json::Value::Null => Ok(Self(String::new())),
            v @ (serde_json::Value::Bool(_) | serde_json::Value::Number(_)) => {
                Ok(Self(v.to_string()))
            }
            other => Err(serde::de::Error::custom(format!(
                "config values must be scalars, got {other}"
            ))),
        }
    }
}

/// Point-in-time copy of an instance, as returned by `list()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceView {
    pub id: InstanceId,
    pub config: InstanceConfig,
    pub start_time: Option<DateTime<Utc>>,
    pub status: InstanceStatus,
    pub log_history: Vec<LogEntry>,
}

/// Events pushed to observers over WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SupervisorEvent {
    /// A formatted entry was appended to an instance's history.
    LogAppended {
        id: InstanceId,
        message: String,
        kind: LogKind,
        timestamp: DateTime<Utc>,
    },
    /// Observers should clear their rendered log for this instance.
    LogsCleared { id: InstanceId },
    /// An instance changed status.
    StatusChanged {
        id: InstanceId,
        status: InstanceStatus,
    },
    InstanceCreated { id: InstanceId },
    InstanceRemoved { id: InstanceId },
    /// Full snapshot (sent on connect and after a lagging client is resynced).
    InstancesSync { instances: Vec<InstanceView> },
}

impl SupervisorEvent {
    pub fn log_appended(id: &InstanceId, entry: &LogEntry) -> Self {
        Self::LogAppended {
            id: id.clone(),
            message: entry.message.clone(),
            kind: entry.kind,
            timestamp: entry.timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_preserves_insertion_order_through_json() {
        let json = r#"{"EMAIL":"a@b.c","PASSWORD":"x","COUNTRY":"ca","MIN_DATE":"2025-01-01"}"#;
        let config: InstanceConfig = serde_json::from_str(json).unwrap();
        let keys: Vec<&str> = config.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["EMAIL", "PASSWORD", "COUNTRY", "MIN_DATE"]);
        assert_eq!(serde_json::to_string(&config).unwrap(), json);
    }

    #[test]
    fn config_accepts_scalar_values() {
        let config: InstanceConfig =
            serde_json::from_str(r#"{"NEED_ASC":true,"FACILITY_ID":94,"MAX_DATE":null}"#).unwrap();
        assert_eq!(config.get("NEED_ASC"), Some("true"));
        assert_eq!(config.get("FACILITY_ID"), Some("94"));
        assert_eq!(config.get("MAX_DATE"), Some(""));
    }

    #[test]
    fn config_rejects_nested_values() {
        let err = serde_json::from_str::<InstanceConfig>(r#"{"A":{"b":1}}"#).unwrap_err();
        assert!(err.to_string().contains("scalars"));
    }

    #[test]
    fn fill_defaults_only_touches_absent_keys() {
        let mut config: InstanceConfig = [("MIN_DATE", "2030-01-01")].into_iter().collect();
        let filled = config.fill_defaults(&[
            ("MIN_DATE".into(), "2020-01-01".into()),
            ("NEED_ASC".into(), "False".into()),
        ]);
        assert_eq!(filled, vec!["NEED_ASC".to_string()]);
        assert_eq!(config.get("MIN_DATE"), Some("2030-01-01"));
        assert_eq!(config.get("NEED_ASC"), Some("False"));
    }

    #[test]
    fn event_tags_are_kebab_case() {
        let id = InstanceId::new("42");
        let entry = LogEntry::error("boom");
        let json = serde_json::to_value(SupervisorEvent::log_appended(&id, &entry)).unwrap();
        assert_eq!(json["type"], "log-appended");
        assert_eq!(json["id"], "42");
        assert_eq!(json["kind"], "error");

        let json = serde_json::to_value(SupervisorEvent::LogsCleared { id }).unwrap();
        assert_eq!(json["type"], "logs-cleared");
    }

    #[test]
    fn view_uses_camel_case_fields() {
        let view = InstanceView {
            id: InstanceId::new("1"),
            config: InstanceConfig::new(),
            start_time: None,
            status: InstanceStatus::Stopped,
            log_history: Vec::new(),
        };
        let json = serde_json::to_value(&view).unwrap();
        assert!(json.get("startTime").is_some());
        assert!(json.get("logHistory").is_some());
        assert_eq!(json["status"], "stopped");
    }

    #[test]
    fn exit_code_classification() {
        assert_eq!(InstanceStatus::from_exit_code(0), InstanceStatus::Completed);
        assert_eq!(InstanceStatus::from_exit_code(1), InstanceStatus::Error);
        assert_eq!(InstanceStatus::from_exit_code(-1), InstanceStatus::Error);
    }
}
