//! SMTP notifications via lettre.

use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use secrecy::{ExposeSecret, SecretString};

use super::{LifecycleEvent, Notifier, NotifyContext, parse_events};
use crate::error::{ConfigError, NotifyError};

// ── Configuration ───────────────────────────────────────────────────

/// Email notifier configuration, built from environment variables.
#[derive(Debug, Clone)]
pub struct EmailNotifyConfig {
    pub smtp_host: String,
    pub smtp_port: u16,
    pub username: String,
    pub password: SecretString,
    pub from_address: String,
    pub to_address: String,
    /// Events that produce an email.
    pub events: Vec<LifecycleEvent>,
}

impl EmailNotifyConfig {
    /// Build config from environment variables.
    /// Returns `Ok(None)` if `SMTP_HOST` is not set (email notifications disabled).
    pub fn from_env() -> Result<Option<Self>, ConfigError> {
        let Ok(smtp_host) = std::env::var("SMTP_HOST") else {
            return Ok(None);
        };

        let smtp_port: u16 = std::env::var("SMTP_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(587);

        let username = std::env::var("SMTP_USER").unwrap_or_default();
        let password = SecretString::from(std::env::var("SMTP_PASSWORD").unwrap_or_default());
        let from_address = std::env::var("SENDER_EMAIL").unwrap_or_else(|_| username.clone());
        let to_address = std::env::var("NOTIFICATION_EMAIL")
            .map_err(|_| ConfigError::MissingEnvVar("NOTIFICATION_EMAIL".into()))?;

        let events = match std::env::var("NOTIFY_EVENTS") {
            Ok(spec) => parse_events(&spec).map_err(|message| ConfigError::InvalidValue {
                key: "NOTIFY_EVENTS".into(),
                message,
            })?,
            Err(_) => vec![LifecycleEvent::Succeeded, LifecycleEvent::Errored],
        };

        Ok(Some(Self {
            smtp_host,
            smtp_port,
            username,
            password,
            from_address,
            to_address,
            events,
        }))
    }
}

// ── Notifier ────────────────────────────────────────────────────────

/// Sends one HTML email per accepted lifecycle event.
pub struct EmailNotifier {
    config: EmailNotifyConfig,
}

impl EmailNotifier {
    pub fn new(config: EmailNotifyConfig) -> Self {
        Self { config }
    }

    /// Fail early on sender or recipient addresses lettre cannot parse.
    pub fn validate(&self) -> Result<(), NotifyError> {
        self.mailboxes().map(|_| ())
    }

    fn mailboxes(&self) -> Result<(Mailbox, Mailbox), NotifyError> {
        let from = self.config.from_address.parse().map_err(|e| NotifyError::Misconfigured {
            name: "email".into(),
            reason: format!("Invalid from address: {e}"),
        })?;
        let to = self.config.to_address.parse().map_err(|e| NotifyError::Misconfigured {
            name: "email".into(),
            reason: format!("Invalid to address: {e}"),
        })?;
        Ok((from, to))
    }

    fn build_message(&self, ctx: &NotifyContext) -> Result<Message, NotifyError> {
        let (from, to) = self.mailboxes()?;
        Message::builder()
            .from(from)
            .to(to)
            .subject(ctx.subject())
            .header(ContentType::TEXT_HTML)
            .body(render_html(ctx))
            .map_err(|e| NotifyError::DeliveryFailed {
                name: "email".into(),
                reason: format!("Failed to build email: {e}"),
            })
    }
}

#[async_trait]
impl Notifier for EmailNotifier {
    fn name(&self) -> &str {
        "email"
    }

    fn accepts(&self, event: LifecycleEvent) -> bool {
        self.config.events.contains(&event)
    }

    async fn notify(&self, ctx: &NotifyContext) -> Result<(), NotifyError> {
        let email = self.build_message(ctx)?;

        let creds = Credentials::new(
            self.config.username.clone(),
            self.config.password.expose_secret().to_string(),
        );
        let transport = SmtpTransport::starttls_relay(&self.config.smtp_host)
            .map_err(|e| NotifyError::Misconfigured {
                name: "email".into(),
                reason: format!("SMTP relay error: {e}"),
            })?
            .port(self.config.smtp_port)
            .credentials(creds)
            .build();

        tokio::task::spawn_blocking(move || transport.send(&email))
            .await
            .map_err(|e| NotifyError::DeliveryFailed {
                name: "email".into(),
                reason: format!("SMTP task failed: {e}"),
            })?
            .map_err(|e| NotifyError::DeliveryFailed {
                name: "email".into(),
                reason: format!("SMTP send failed: {e}"),
            })?;

        tracing::info!(
            instance_id = %ctx.instance_id,
            event = %ctx.event,
            "Notification email sent to {}",
            self.config.to_address
        );
        Ok(())
    }
}

/// HTML body: heading, detail line, then one paragraph per config field.
pub fn render_html(ctx: &NotifyContext) -> String {
    let mut html = format!("<h2>{}</h2>\n", escape(&ctx.subject()));
    if !ctx.message.is_empty() {
        html.push_str(&format!("<p>{}</p>\n", escape(&ctx.message)));
    }
    html.push_str(&field("Instance", ctx.instance_id.as_str()));
    html.push_str(&field("Event", ctx.event.as_str()));
    for (key, value) in &ctx.config {
        html.push_str(&field(key, value));
    }
    html.push_str(&field("Time", &ctx.timestamp.to_rfc3339()));
    html
}

fn field(name: &str, value: &str) -> String {
    format!(
        "<p><strong>{}:</strong> {}</p>\n",
        escape(name),
        escape(value)
    )
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instances::model::{InstanceConfig, InstanceId};

    fn config(events: Vec<LifecycleEvent>) -> EmailNotifyConfig {
        EmailNotifyConfig {
            smtp_host: "smtp.example.com".into(),
            smtp_port: 587,
            username: "bot@example.com".into(),
            password: SecretString::from("pw"),
            from_address: "bot@example.com".into(),
            to_address: "me@example.com".into(),
            events,
        }
    }

    fn ctx() -> NotifyContext {
        let config: InstanceConfig = [("EMAIL", "a@b.c"), ("PASSWORD", "x<y")]
            .into_iter()
            .collect();
        NotifyContext::new(
            InstanceId::new("42"),
            LifecycleEvent::Succeeded,
            "🎉 Appointment successfully booked!",
            &config,
        )
    }

    #[test]
    fn body_lists_fields_and_hides_secrets() {
        let html = render_html(&ctx());
        assert!(html.starts_with("<h2>🎉 Visa Appointment Successfully Scheduled by a@b.c!</h2>"));
        assert!(html.contains("<p><strong>EMAIL:</strong> a@b.c</p>"));
        assert!(html.contains("<p><strong>Instance:</strong> 42</p>"));
        assert!(!html.contains("x&lt;y"));
    }

    #[test]
    fn accepts_only_configured_events() {
        let notifier = EmailNotifier::new(config(vec![LifecycleEvent::Succeeded]));
        assert!(notifier.accepts(LifecycleEvent::Succeeded));
        assert!(!notifier.accepts(LifecycleEvent::Started));
    }

    #[test]
    fn builds_message_for_valid_addresses() {
        let notifier = EmailNotifier::new(config(LifecycleEvent::ALL.to_vec()));
        assert!(notifier.build_message(&ctx()).is_ok());
    }

    #[test]
    fn invalid_address_is_misconfiguration() {
        let mut cfg = config(LifecycleEvent::ALL.to_vec());
        cfg.to_address = "not an address".into();
        let notifier = EmailNotifier::new(cfg);
        let err = notifier.build_message(&ctx()).unwrap_err();
        assert!(matches!(err, NotifyError::Misconfigured { .. }));
        assert!(notifier.validate().is_err());
    }

    #[test]
    fn escapes_markup() {
        assert_eq!(escape("<b>&\"</b>"), "&lt;b&gt;&amp;&quot;&lt;/b&gt;");
    }
}
