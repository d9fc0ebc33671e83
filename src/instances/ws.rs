//! WebSocket server + REST endpoints for the instance registry.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{
        Path, Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use tokio::sync::broadcast::error::RecvError;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

use super::model::{InstanceConfig, InstanceId, SupervisorEvent};
use super::registry::InstanceRegistry;
use crate::error::InstanceError;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<InstanceRegistry>,
}

/// Build the Axum router with the instance WebSocket and REST routes.
pub fn instance_routes(registry: Arc<InstanceRegistry>) -> Router {
    let state = AppState { registry };

    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .route("/api/instances", get(list_instances).post(create_instance))
        .route("/api/instances/{id}", axum::routing::delete(delete_instance))
        .route("/api/instances/{id}/start", post(start_instance))
        .route("/api/instances/{id}/restart", post(start_instance))
        .route("/api/instances/{id}/stop", post(stop_instance))
        .route("/api/instances/{id}/clear-logs", post(clear_logs))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "worker-supervisor"
    }))
}

// ── WebSocket ───────────────────────────────────────────────────────────

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    info!("WebSocket client connecting");
    ws.on_upgrade(|socket| handle_socket(socket, state.registry))
}

async fn handle_socket(mut socket: WebSocket, registry: Arc<InstanceRegistry>) {
    info!("WebSocket client connected");

    // Subscribe before the snapshot so nothing falls between the two.
    let mut rx = registry.subscribe();

    if !send_sync(&mut socket, &registry).await {
        warn!("Failed to send initial sync, client disconnected");
        return;
    }

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        if !send_event(&mut socket, &event).await {
                            debug!("Client disconnected during send");
                            break;
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        warn!(missed = n, "WS client lagged behind broadcast");
                        if !send_sync(&mut socket, &registry).await {
                            break;
                        }
                    }
                    Err(RecvError::Closed) => {
                        debug!("Broadcast channel closed");
                        break;
                    }
                }
            }

            result = socket.recv() => {
                match result {
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("WebSocket client disconnected");
                        break;
                    }
                    Some(Ok(Message::Text(text))) => {
                        debug!(text = %text.as_str(), "Ignoring client message; the event stream is read-only");
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    info!("WebSocket connection closed");
}

async fn send_sync(socket: &mut WebSocket, registry: &InstanceRegistry) -> bool {
    let sync = SupervisorEvent::InstancesSync {
        instances: registry.list().await,
    };
    send_event(socket, &sync).await
}

/// Returns `false` once the client is gone.
async fn send_event(socket: &mut WebSocket, event: &SupervisorEvent) -> bool {
    match serde_json::to_string(event) {
        Ok(json) => socket.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            warn!(error = %e, "Failed to serialize event");
            true
        }
    }
}

// ── REST Endpoints ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct CreateRequest {
    #[serde(default)]
    config: InstanceConfig,
    /// Start the new instance right away.
    #[serde(default)]
    start: bool,
}

#[derive(Debug, Default, Deserialize)]
struct DeleteQuery {
    #[serde(default)]
    force: bool,
}

async fn list_instances(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.registry.list().await)
}

async fn create_instance(
    State(state): State<AppState>,
    Json(body): Json<CreateRequest>,
) -> Response {
    let id = state.registry.create(body.config).await;

    if !body.start {
        let view = state.registry.get_view(&id).await;
        let status = view.map(|v| v.status).ok();
        return (
            StatusCode::CREATED,
            Json(serde_json::json!({"id": id, "status": status})),
        )
            .into_response();
    }

    match state.registry.start(&id).await {
        Ok(status) => (
            StatusCode::CREATED,
            Json(serde_json::json!({"id": id, "status": status})),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

async fn start_instance(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let id = InstanceId::new(id);
    match state.registry.start(&id).await {
        Ok(status) => Json(serde_json::json!({"id": id, "status": status})).into_response(),
        Err(e) => error_response(e),
    }
}

async fn stop_instance(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.registry.stop(&InstanceId::new(id)).await {
        Ok(()) => Json(serde_json::json!({"success": true})).into_response(),
        Err(e) => error_response(e),
    }
}

async fn clear_logs(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.registry.clear_logs(&InstanceId::new(id)).await {
        Ok(()) => Json(serde_json::json!({"success": true})).into_response(),
        Err(e) => error_response(e),
    }
}

async fn delete_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<DeleteQuery>,
) -> Response {
    match state.registry.delete(&InstanceId::new(id), query.force).await {
        Ok(()) => Json(serde_json::json!({"success": true})).into_response(),
        Err(e) => error_response(e),
    }
}

fn error_response(error: InstanceError) -> Response {
    let status = match error {
        InstanceError::NotFound { .. } => StatusCode::NOT_FOUND,
        InstanceError::AlreadyRunning { .. } | InstanceError::StillRunning { .. } => {
            StatusCode::CONFLICT
        }
    };
    (status, Json(serde_json::json!({"error": error.to_string()}))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use crate::config::{SupervisorConfig, WorkerCommand};
    use crate::store::JsonFileStore;

    fn app(dir: &std::path::Path) -> (Router, Arc<InstanceRegistry>) {
        let config = SupervisorConfig::new(dir, WorkerCommand::new("true"));
        let store = Arc::new(JsonFileStore::new(config.snapshot_path()));
        let registry = InstanceRegistry::new(&config, store, None);
        (instance_routes(registry.clone()), registry)
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let tmp = tempfile::tempdir().unwrap();
        let (app, _) = app(tmp.path());
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn create_returns_201_with_stopped_status() {
        let tmp = tempfile::tempdir().unwrap();
        let (app, registry) = app(tmp.path());
        let request = Request::post("/api/instances")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"config":{"EMAIL":"a@b.c"}}"#))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let json = body_json(response).await;
        assert_eq!(json["status"], "stopped");

        let list = registry.list().await;
        assert_eq!(list.len(), 1);
        assert_eq!(json["id"], list[0].id.as_str());
    }

    #[tokio::test]
    async fn unknown_instance_is_404() {
        let tmp = tempfile::tempdir().unwrap();
        let (app, _) = app(tmp.path());
        for (method, uri) in [
            ("POST", "/api/instances/nope/start"),
            ("POST", "/api/instances/nope/restart"),
            ("POST", "/api/instances/nope/stop"),
            ("POST", "/api/instances/nope/clear-logs"),
            ("DELETE", "/api/instances/nope?force=true"),
        ] {
            let request = Request::builder()
                .method(method)
                .uri(uri)
                .body(Body::empty())
                .unwrap();
            let response = app.clone().oneshot(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "{method} {uri}");
            assert!(body_json(response).await["error"].is_string());
        }
    }

    #[tokio::test]
    async fn malformed_config_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let (app, registry) = app(tmp.path());
        let request = Request::post("/api/instances")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"config":{"A":{"nested":true}}}"#))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert!(response.status().is_client_error());
        assert!(registry.list().await.is_empty());
    }

    #[test]
    fn errors_map_to_status_codes() {
        let cases = [
            (InstanceError::NotFound { id: "1".into() }, StatusCode::NOT_FOUND),
            (InstanceError::AlreadyRunning { id: "1".into() }, StatusCode::CONFLICT),
            (InstanceError::StillRunning { id: "1".into() }, StatusCode::CONFLICT),
        ];
        for (error, expected) in cases {
            assert_eq!(error_response(error).status(), expected);
        }
    }
}
