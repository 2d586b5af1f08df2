// WG Tunnel Manager - REST API Module
// Lifecycle endpoints and the event stream

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
    routing::{delete, get, post},
    Json, Router,
};
use chrono::Utc;
use futures::{stream, Stream, StreamExt};
use serde::Serialize;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, error, info};

use wg_tunnel_common::{
    Error, ExportResult, ImportRequest, ImportResult, LifecycleResult, StatusCheck, TunnelEvent,
};

use crate::manager::TunnelManager;

/// Shared application state
pub struct AppState {
    pub manager: TunnelManager,
    pub shutdown_tx: tokio::sync::broadcast::Sender<()>,
}

/// Body for failures of endpoints without a result type of their own
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    code: &'static str,
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/tunnels", get(list_tunnels).post(import_config))
        .route("/api/tunnels/:name", delete(remove_config))
        .route("/api/tunnels/:name/config", get(export_config))
        .route("/api/tunnels/:name/activate", post(activate_tunnel))
        .route("/api/tunnels/:name/deactivate", post(deactivate_tunnel))
        .route("/api/tunnels/:name/status", post(check_tunnel_status))
        .route("/api/status", post(check_all_status))
        .route("/api/events", get(event_stream))
        .with_state(state)
}

fn status_for(error: &Error) -> StatusCode {
    match error {
        Error::Busy(_) => StatusCode::CONFLICT,
        Error::ConfigNotFound(_) => StatusCode::NOT_FOUND,
        Error::InvalidName(_) | Error::InvalidConfigFormat(_) => StatusCode::BAD_REQUEST,
        Error::MechanismNotFound { .. } | Error::ExternalProcess { .. } => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(error: &Error) -> Response {
    (
        status_for(error),
        Json(ErrorResponse {
            error: error.to_string(),
            code: error.code(),
        }),
    )
        .into_response()
}

/// Health check endpoint
async fn health() -> &'static str {
    "OK"
}

/// List stored tunnels with their last known state
async fn list_tunnels(State(state): State<Arc<AppState>>) -> Response {
    match state.manager.list_configs() {
        Ok(tunnels) => Json(tunnels).into_response(),
        Err(e) => {
            error!("Failed to list tunnels: {}", e);
            error_response(&e)
        }
    }
}

async fn import_config(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ImportRequest>,
) -> Response {
    info!("API: Import request for {}", request.source_name);

    match state
        .manager
        .import_config(&request.source_name, &request.text)
    {
        Ok(name) => (
            StatusCode::CREATED,
            Json(ImportResult {
                success: true,
                name: Some(name),
                ..Default::default()
            }),
        )
            .into_response(),
        Err(e) => {
            error!("Import of {} failed: {}", request.source_name, e);
            (
                status_for(&e),
                Json(ImportResult {
                    success: false,
                    error: Some(e.to_string()),
                    code: Some(e.code().to_string()),
                    ..Default::default()
                }),
            )
                .into_response()
        }
    }
}

async fn export_config(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Response {
    match state.manager.export_config(&name) {
        Ok(text) => Json(ExportResult {
            success: true,
            text: Some(text.to_string()),
            ..Default::default()
        })
        .into_response(),
        Err(e) => {
            error!("Export of {} failed: {}", name, e);
            (
                status_for(&e),
                Json(ExportResult {
                    success: false,
                    error: Some(e.to_string()),
                    code: Some(e.code().to_string()),
                    ..Default::default()
                }),
            )
                .into_response()
        }
    }
}

async fn remove_config(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Response {
    info!("API: Remove request for {}", name);
    lifecycle_response(&name, state.manager.remove_config(&name).map(|()| (None, false)))
}

async fn activate_tunnel(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Response {
    info!("API: Activate request for {}", name);
    let result = state
        .manager
        .activate(&name)
        .await
        .map(|t| (t.mechanism, t.pending));
    lifecycle_response(&name, result)
}

async fn deactivate_tunnel(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Response {
    info!("API: Deactivate request for {}", name);
    let result = state
        .manager
        .deactivate(&name)
        .await
        .map(|t| (t.mechanism, t.pending));
    lifecycle_response(&name, result)
}

fn lifecycle_response(
    name: &str,
    result: wg_tunnel_common::Result<(Option<wg_tunnel_common::MechanismKind>, bool)>,
) -> Response {
    match result {
        Ok((mechanism, pending)) => {
            Json(LifecycleResult::succeeded(mechanism, pending)).into_response()
        }
        Err(e) => {
            debug!("Lifecycle request for {} failed: {}", name, e);
            (status_for(&e), Json(LifecycleResult::failed(&e))).into_response()
        }
    }
}

async fn check_tunnel_status(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Response {
    status_check_response(state.manager.check_status(Some(&name)))
}

async fn check_all_status(State(state): State<Arc<AppState>>) -> Response {
    status_check_response(state.manager.check_status(None))
}

fn status_check_response(result: wg_tunnel_common::Result<()>) -> Response {
    match result {
        Ok(()) => (StatusCode::ACCEPTED, Json(StatusCheck { checking: true })).into_response(),
        Err(e) => error_response(&e),
    }
}

/// GET /api/events  → SSE stream of tunnel events
pub async fn event_stream(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    // Subscribe before reading the warning so nothing falls in between
    let rx = state.manager.subscribe();
    let mut shutdown_rx = state.shutdown_tx.subscribe();

    let replay = state
        .manager
        .privilege_warning()
        .map(TunnelEvent::privilege_warning)
        .and_then(|event| to_sse(&event))
        .map(Ok);

    let tunnel_events = BroadcastStream::new(rx).filter_map(|msg| async move {
        match msg {
            Ok(event) => to_sse(&event).map(Ok),
            Err(lagged) => {
                // Slow client; later events still arrive
                debug!("Event stream lagged: {:?}, continuing", lagged);
                None
            }
        }
    });

    let merged = stream::iter(replay).chain(stream::select(tunnel_events, heartbeat_stream()));

    let shutdown_aware = merged.take_until(async move {
        let _ = shutdown_rx.recv().await;
    });

    Sse::new(shutdown_aware)
}

fn to_sse(event: &TunnelEvent) -> Option<Event> {
    match serde_json::to_string(event) {
        Ok(json) => Some(Event::default().data(json)),
        Err(e) => {
            error!("Failed to serialize event: {e}");
            None
        }
    }
}

fn heartbeat_stream() -> impl Stream<Item = Result<Event, Infallible>> + Send + Sync + 'static {
    tokio_stream::wrappers::IntervalStream::new(tokio::time::interval(heartbeat_interval()))
        .map(|_| Ok(Event::default().data(heartbeat_payload())))
}

fn heartbeat_payload() -> String {
    match serde_json::to_string(&TunnelEvent::Heartbeat {
        timestamp: Utc::now(),
    }) {
        Ok(j) => j,
        Err(e) => {
            error!("Failed to serialize heartbeat: {e}");
            "{}".to_string()
        }
    }
}

#[cfg(not(test))]
fn heartbeat_interval() -> Duration {
    Duration::from_secs(10)
}

#[cfg(test)]
fn heartbeat_interval() -> Duration {
    Duration::from_millis(100)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{harness, Harness, ScriptedRunner, SAMPLE_CONFIG};
    use axum::body::{to_bytes, Body};
    use axum::http::{Method, Request};
    use tower::ServiceExt;

    async fn app() -> (Harness, Router) {
        let h = harness(true).await;
        let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
        let state = Arc::new(AppState {
            manager: h.manager.clone(),
            shutdown_tx,
        });
        (h, create_router(state))
    }

    async fn call(
        router: &Router,
        method: Method,
        uri: &str,
        body: Option<String>,
    ) -> (StatusCode, serde_json::Value) {
        let mut request = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                request = request.header("content-type", "application/json");
                Body::from(json)
            }
            None => Body::empty(),
        };
        let response = router
            .clone()
            .oneshot(request.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null))
    }

    #[tokio::test]
    async fn heartbeat_stream_emits() {
        let mut stream = heartbeat_stream();
        let _evt = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("heartbeat timed out")
            .expect("stream ended");

        let json = heartbeat_payload();
        assert!(json.contains("heartbeat"), "heartbeat payload missing marker");
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(&Error::Busy("office".into())), StatusCode::CONFLICT);
        assert_eq!(
            status_for(&Error::ConfigNotFound("office".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(&Error::InvalidConfigFormat("empty".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&Error::ExternalProcess {
                name: "office".into(),
                action: "activate".into(),
                diagnostics: "boom".into()
            }),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status_for(&Error::Encryption("bad".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn test_import_then_list() {
        let (_h, router) = app().await;
        let body = serde_json::json!({ "source_name": "office.conf", "text": SAMPLE_CONFIG });
        let (status, json) = call(&router, Method::POST, "/api/tunnels", Some(body.to_string())).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(json["success"], true);
        assert_eq!(json["name"], "office");

        let (status, json) = call(&router, Method::GET, "/api/tunnels", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json[0]["name"], "office");
    }

    #[tokio::test]
    async fn test_invalid_import_is_bad_request() {
        let (_h, router) = app().await;
        let body = serde_json::json!({ "source_name": "office.conf", "text": "[Peer]\n" });
        let (status, json) = call(&router, Method::POST, "/api/tunnels", Some(body.to_string())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["success"], false);
        assert_eq!(json["code"], "InvalidConfigFormat");
    }

    #[tokio::test]
    async fn test_activate_reports_mechanism() {
        let (h, router) = app().await;
        h.runner.respond("wireguard", ScriptedRunner::exit(0, "", ""));
        h.seed("office", SAMPLE_CONFIG);

        let (status, json) = call(&router, Method::POST, "/api/tunnels/office/activate", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["success"], true);
        assert_eq!(json["pending"], true);
        assert_eq!(json["mechanism"], "primary_executable");
    }

    #[tokio::test]
    async fn test_unknown_tunnel_is_not_found() {
        let (_h, router) = app().await;
        let (status, json) = call(&router, Method::POST, "/api/tunnels/ghost/deactivate", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["code"], "ConfigNotFound");

        let (status, _) = call(&router, Method::GET, "/api/tunnels/ghost/config", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_status_check_is_accepted() {
        let (_h, router) = app().await;
        let (status, json) = call(&router, Method::POST, "/api/status", None).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(json["checking"], true);
    }
}
