//! JSON webhook notifications.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use super::{LifecycleEvent, Notifier, NotifyContext, parse_events};
use crate::error::{ConfigError, NotifyError};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// POSTs `{event, subject, context}` to a fixed URL.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
    events: Vec<LifecycleEvent>,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, events: Vec<LifecycleEvent>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            url: url.into(),
            events,
        }
    }

    /// Returns `Ok(None)` if `NOTIFY_WEBHOOK_URL` is not set.
    /// `NOTIFY_EVENTS` filters events; every event is sent by default.
    pub fn from_env() -> Result<Option<Self>, ConfigError> {
        let Ok(url) = std::env::var("NOTIFY_WEBHOOK_URL") else {
            return Ok(None);
        };
        let events = match std::env::var("NOTIFY_EVENTS") {
            Ok(spec) => parse_events(&spec).map_err(|message| ConfigError::InvalidValue {
                key: "NOTIFY_EVENTS".into(),
                message,
            })?,
            Err(_) => LifecycleEvent::ALL.to_vec(),
        };
        Ok(Some(Self::new(url, events)))
    }

    pub fn payload(ctx: &NotifyContext) -> serde_json::Value {
        json!({
            "event": ctx.event,
            "subject": ctx.subject(),
            "context": ctx,
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    fn name(&self) -> &str {
        "webhook"
    }

    fn accepts(&self, event: LifecycleEvent) -> bool {
        self.events.contains(&event)
    }

    async fn notify(&self, ctx: &NotifyContext) -> Result<(), NotifyError> {
        let resp = self
            .client
            .post(&self.url)
            .json(&Self::payload(ctx))
            .send()
            .await
            .map_err(|e| NotifyError::DeliveryFailed {
                name: "webhook".into(),
                reason: e.to_string(),
            })?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(NotifyError::DeliveryFailed {
                name: "webhook".into(),
                reason: format!("HTTP {status}: {body}"),
            });
        }

        tracing::debug!(instance_id = %ctx.instance_id, event = %ctx.event, "Webhook delivered");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use axum::Router;
    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::routing::post;

    use crate::instances::model::{InstanceConfig, InstanceId};

    fn ctx(event: LifecycleEvent) -> NotifyContext {
        let config: InstanceConfig = [("EMAIL", "a@b.c"), ("PASSWORD", "pw")]
            .into_iter()
            .collect();
        NotifyContext::new(InstanceId::new("5"), event, "exit code 1", &config)
    }

    async fn start_receiver(status: StatusCode) -> (String, Arc<Mutex<Vec<serde_json::Value>>>) {
        let received = Arc::new(Mutex::new(Vec::new()));
        let app = Router::new()
            .route(
                "/hook",
                post(
                    move |State(store): State<Arc<Mutex<Vec<serde_json::Value>>>>,
                          axum::Json(body): axum::Json<serde_json::Value>| async move {
                        store.lock().unwrap().push(body);
                        status
                    },
                ),
            )
            .with_state(received.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}/hook"), received)
    }

    #[test]
    fn payload_carries_redacted_context() {
        let payload = WebhookNotifier::payload(&ctx(LifecycleEvent::Errored));
        assert_eq!(payload["event"], "errored");
        assert_eq!(payload["context"]["instance_id"], "5");
        let config = payload["context"]["config"].to_string();
        assert!(!config.contains("\"pw\""), "{config}");
    }

    #[tokio::test]
    async fn posts_json_to_url() {
        let (url, received) = start_receiver(StatusCode::OK).await;
        let notifier = WebhookNotifier::new(url, LifecycleEvent::ALL.to_vec());
        notifier.notify(&ctx(LifecycleEvent::Errored)).await.unwrap();

        let received = received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0]["context"]["message"], "exit code 1");
    }

    #[tokio::test]
    async fn non_success_status_is_delivery_failure() {
        let (url, _received) = start_receiver(StatusCode::INTERNAL_SERVER_ERROR).await;
        let notifier = WebhookNotifier::new(url, LifecycleEvent::ALL.to_vec());
        let err = notifier.notify(&ctx(LifecycleEvent::Started)).await.unwrap_err();
        assert!(matches!(err, NotifyError::DeliveryFailed { .. }));
    }

    #[test]
    fn filters_events() {
        let notifier = WebhookNotifier::new("http://localhost/", vec![LifecycleEvent::Stopped]);
        assert!(notifier.accepts(LifecycleEvent::Stopped));
        assert!(!notifier.accepts(LifecycleEvent::Completed));
    }
}
