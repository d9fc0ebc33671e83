//! Lifecycle notifications.
//!
//! The registry calls a [`Notifier`] on key transitions. Delivery is best
//! effort: failures are reported back into the instance's log, never retried.

pub mod email;
pub mod webhook;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{NotifyError, Result};
use crate::instances::model::{InstanceConfig, InstanceId};

pub use email::{EmailNotifier, EmailNotifyConfig};
pub use webhook::WebhookNotifier;

/// Config keys whose values never leave the supervisor.
const SECRET_MARKERS: &[&str] = &["PASSWORD", "SECRET", "TOKEN"];

const REDACTED: &str = "********";

/// Transitions a notifier can be told about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEvent {
    Started,
    /// The worker reported reaching its goal (booking confirmed).
    Succeeded,
    /// Exit code 0.
    Completed,
    /// Spawn failure, non-zero exit or abnormal termination.
    Errored,
    /// Stopped by the user.
    Stopped,
}

impl LifecycleEvent {
    pub const ALL: [LifecycleEvent; 5] = [
        Self::Started,
        Self::Succeeded,
        Self::Completed,
        Self::Errored,
        Self::Stopped,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Succeeded => "succeeded",
            Self::Completed => "completed",
            Self::Errored => "errored",
            Self::Stopped => "stopped",
        }
    }

    /// Subject line for a notification about `label`.
    pub fn subject(self, label: &str) -> String {
        match self {
            Self::Started => format!("▶️ Worker {label} started"),
            Self::Succeeded => format!("🎉 Visa Appointment Successfully Scheduled by {label}!"),
            Self::Completed => format!("✅ Worker {label} finished"),
            Self::Errored => format!("⚠️ Worker {label} failed"),
            Self::Stopped => format!("⏹️ Worker {label} stopped"),
        }
    }
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LifecycleEvent {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|e| e.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown lifecycle event {s:?}"))
    }
}

/// Parse a comma-separated event list such as `succeeded,errored`.
pub fn parse_events(spec: &str) -> std::result::Result<Vec<LifecycleEvent>, String> {
    spec.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::parse::<LifecycleEvent>)
        .collect()
}

/// Everything a notifier gets to see about a transition.
#[derive(Debug, Clone, Serialize)]
pub struct NotifyContext {
    pub instance_id: InstanceId,
    pub event: LifecycleEvent,
    /// Human-readable detail (exit code, error text, success line).
    pub message: String,
    /// Instance config with secret-looking values redacted.
    pub config: Vec<(String, String)>,
    pub timestamp: DateTime<Utc>,
}

impl NotifyContext {
    pub fn new(
        instance_id: InstanceId,
        event: LifecycleEvent,
        message: impl Into<String>,
        config: &InstanceConfig,
    ) -> Self {
        let config = config
            .iter()
            .map(|(k, v)| {
                let value = if is_secret_key(k) { REDACTED } else { v };
                (k.to_string(), value.to_string())
            })
            .collect();

        Self {
            instance_id,
            event,
            message: message.into(),
            config,
            timestamp: Utc::now(),
        }
    }

    /// Short name for the instance: its account email when configured.
    pub fn label(&self) -> String {
        self.config
            .iter()
            .find(|(k, v)| k == "EMAIL" && !v.is_empty())
            .map(|(_, v)| v.clone())
            .unwrap_or_else(|| self.instance_id.to_string())
    }

    pub fn subject(&self) -> String {
        self.event.subject(&self.label())
    }
}

fn is_secret_key(key: &str) -> bool {
    let upper = key.to_ascii_uppercase();
    SECRET_MARKERS.iter().any(|m| upper.contains(m))
}

/// Outbound notification transport.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Notifier name for logs and errors (e.g. "email", "webhook").
    fn name(&self) -> &str;

    /// Whether this notifier wants to hear about `event` at all.
    fn accepts(&self, _event: LifecycleEvent) -> bool {
        true
    }

    /// Deliver one notification.
    async fn notify(&self, ctx: &NotifyContext) -> std::result::Result<(), NotifyError>;
}

/// Pick the notifier configured in the environment: email when `SMTP_HOST`
/// is set, otherwise a webhook when `NOTIFY_WEBHOOK_URL` is set.
pub fn from_env() -> Result<Option<Arc<dyn Notifier>>> {
    if let Some(config) = EmailNotifyConfig::from_env()? {
        return email_notifier(config).map(Some);
    }
    Ok(WebhookNotifier::from_env()?.map(|webhook| Arc::new(webhook) as Arc<dyn Notifier>))
}

fn email_notifier(config: EmailNotifyConfig) -> Result<Arc<dyn Notifier>> {
    let notifier = EmailNotifier::new(config);
    notifier.validate()?;
    Ok(Arc::new(notifier))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secrets_are_redacted() {
        let config: InstanceConfig = [
            ("EMAIL", "a@b.c"),
            ("PASSWORD", "hunter2"),
            ("api_token", "t"),
            ("COUNTRY", "ca"),
        ]
        .into_iter()
        .collect();
        let ctx = NotifyContext::new(InstanceId::new("1"), LifecycleEvent::Started, "", &config);

        let values: Vec<&str> = ctx.config.iter().map(|(_, v)| v.as_str()).collect();
        assert_eq!(values, vec!["a@b.c", REDACTED, REDACTED, "ca"]);
    }

    #[test]
    fn label_prefers_email() {
        let config: InstanceConfig = [("EMAIL", "a@b.c")].into_iter().collect();
        let ctx = NotifyContext::new(InstanceId::new("9"), LifecycleEvent::Succeeded, "", &config);
        assert_eq!(ctx.label(), "a@b.c");
        assert!(ctx.subject().contains("a@b.c"));

        let ctx = NotifyContext::new(
            InstanceId::new("9"),
            LifecycleEvent::Errored,
            "",
            &InstanceConfig::new(),
        );
        assert_eq!(ctx.label(), "9");
    }

    #[test]
    fn parses_event_lists() {
        assert_eq!(
            parse_events("succeeded, ERRORED,,").unwrap(),
            vec![LifecycleEvent::Succeeded, LifecycleEvent::Errored]
        );
        assert!(parse_events("exploded").is_err());
    }

    #[test]
    fn unparseable_email_address_fails_startup() {
        let config = EmailNotifyConfig {
            smtp_host: "smtp.example.com".into(),
            smtp_port: 587,
            username: String::new(),
            password: secrecy::SecretString::from(""),
            from_address: "bot@example.com".into(),
            to_address: "nobody".into(),
            events: vec![LifecycleEvent::Succeeded],
        };
        let Err(err) = email_notifier(config) else {
            panic!("expected a misconfigured notifier");
        };
        assert!(matches!(
            err,
            crate::error::Error::Notify(NotifyError::Misconfigured { .. })
        ));
    }

    #[test]
    fn valid_email_config_builds_email_notifier() {
        let config = EmailNotifyConfig {
            smtp_host: "smtp.example.com".into(),
            smtp_port: 587,
            username: String::new(),
            password: secrecy::SecretString::from(""),
            from_address: "bot@example.com".into(),
            to_address: "me@example.com".into(),
            events: vec![LifecycleEvent::Succeeded],
        };
        let notifier = email_notifier(config).unwrap();
        assert_eq!(notifier.name(), "email");
    }

    #[test]
    fn event_serializes_snake_case() {
        let json = serde_json::to_value(LifecycleEvent::Succeeded).unwrap();
        assert_eq!(json, "succeeded");
    }
}
