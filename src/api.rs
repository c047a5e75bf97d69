//! HTTP control API
//!
//! ```text
//! GET  /instances                 all sessions, keyed by id
//! GET  /instances/{id}            one session
//! GET  /instances/{id}/qr         current pairing code (?format=text for a terminal image)
//! POST /instances/{id}/connect    start or resume a session
//! POST /instances/{id}/send       {to, text}
//! POST /instances/{id}/disconnect drop a session
//! GET  /health                    liveness probe
//! ```

use axum::{
    Json, Router,
    body::Body,
    extract::{Path, Query, State, rejection::JsonRejection},
    http::{Request, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

use crate::error::EngineError;
use crate::qr;
use crate::registry::SessionRegistry;
use crate::types::{
    ConnectResponse, ErrorResponse, InstanceView, QrResponse, SendRequest, SessionId,
    SuccessResponse,
};

/// Control API state
#[derive(Clone)]
pub struct ApiState {
    pub registry: Arc<SessionRegistry>,
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!("Request failed: {}", self);
        }
        let body = ErrorResponse {
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/instances", get(list_instances))
        .route("/instances/{id}", get(get_instance))
        .route("/instances/{id}/qr", get(get_qr))
        .route("/instances/{id}/connect", post(connect))
        .route("/instances/{id}/send", post(send))
        .route("/instances/{id}/disconnect", post(disconnect))
        .route("/health", get(health_check))
        .layer(middleware::from_fn(log_request))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Run the control API server
pub async fn run_server(addr: SocketAddr, state: ApiState) -> anyhow::Result<()> {
    let app = router(state);

    info!("🌐 Control API listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn log_request(req: Request<Body>, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let response = next.run(req).await;

    info!("🌐 HTTP {} {} -> {}", method, path, response.status());
    response
}

async fn health_check() -> Json<serde_json::Value> {
    Json(json!({ "status": "alive" }))
}

async fn list_instances(State(state): State<ApiState>) -> Json<BTreeMap<SessionId, InstanceView>> {
    Json(state.registry.list().await)
}

async fn get_instance(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<InstanceView>, EngineError> {
    state
        .registry
        .get(&id)
        .await
        .map(Json)
        .ok_or(EngineError::NotFound)
}

#[derive(Debug, Deserialize)]
struct QrParams {
    format: Option<String>,
}

async fn get_qr(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Query(params): Query<QrParams>,
) -> Result<Response, EngineError> {
    let view = state.registry.get(&id).await.ok_or(EngineError::NotFound)?;

    match params.format.as_deref() {
        None | Some("json") => Ok(Json(QrResponse { code: view.qr }).into_response()),
        Some("text") => {
            if view.qr.is_empty() {
                return Ok((StatusCode::NO_CONTENT, ()).into_response());
            }
            let block =
                qr::render_terminal(&view.qr).map_err(|e| EngineError::Payload(e.to_string()))?;
            Ok((
                [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
                block,
            )
                .into_response())
        }
        Some(other) => Err(EngineError::Payload(format!("unsupported format {other:?}"))),
    }
}

async fn connect(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<ConnectResponse>, EngineError> {
    info!("📲 [{}] Connect requested", id);
    let status = state.registry.connect(&id).await?;
    Ok(Json(ConnectResponse {
        message: "starting".to_string(),
        status,
    }))
}

async fn send(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    payload: Result<Json<SendRequest>, JsonRejection>,
) -> Response {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => {
            warn!("[{}] Rejected send body: {}", id, rejection.body_text());
            let body = ErrorResponse {
                error: rejection.body_text(),
            };
            return (StatusCode::BAD_REQUEST, Json(body)).into_response();
        }
    };

    match state.registry.send(&id, &request.to, &request.text).await {
        Ok(receipt) => {
            info!("📤 [{}] Sent {} to {}", id, receipt.id, request.to);
            Json(SuccessResponse { success: true }).into_response()
        }
        Err(e) => e.into_response(),
    }
}

async fn disconnect(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<SuccessResponse>, EngineError> {
    state.registry.disconnect(&id).await?;
    info!("🔌 [{}] Session disconnected", id);
    Ok(Json(SuccessResponse { success: true }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::testing::FakeFactory;
    use crate::client::{ClientError, Event};
    use crate::dispatcher::WebhookDispatcher;
    use crate::filter::SenderFilter;
    use crate::storage::CredentialStore;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    fn test_app() -> (Router, Arc<FakeFactory>) {
        let store = Arc::new(CredentialStore::open_in_memory().unwrap());
        let factory = Arc::new(FakeFactory::default());
        let shutdown = CancellationToken::new();
        let dispatcher = WebhookDispatcher::new(
            "http://127.0.0.1:9/hook",
            Duration::from_millis(200),
            shutdown.clone(),
        )
        .unwrap();
        let registry = SessionRegistry::new(
            store,
            factory.clone(),
            dispatcher,
            Arc::new(SenderFilter::parse("100")),
            shutdown,
            Duration::from_secs(5),
        );
        let state = ApiState {
            registry: Arc::new(registry),
        };
        (router(state), factory)
    }

    async fn call(
        app: &Router,
        method: &str,
        uri: &str,
        body: Option<&str>,
    ) -> (StatusCode, serde_json::Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if body.is_some() {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
        }
        let request = builder
            .body(Body::from(body.unwrap_or_default().to_string()))
            .unwrap();

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _) = test_app();
        let (status, body) = call(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "status": "alive" }));
    }

    #[tokio::test]
    async fn test_cold_pairing_flow() {
        let (app, factory) = test_app();

        let (status, body) = call(&app, "POST", "/instances/111/connect", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "message": "starting", "status": "CONNECTING" }));

        let client = factory.last().unwrap();
        client.push_qr("abc").await;
        for _ in 0..50 {
            let (_, qr) = call(&app, "GET", "/instances/111/qr", None).await;
            if qr["code"] == "abc" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let (_, qr) = call(&app, "GET", "/instances/111/qr", None).await;
        assert_eq!(qr, json!({ "code": "abc" }));

        client.emit(Event::Connected);

        let (status, body) = call(&app, "GET", "/instances", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            json!({ "111": { "id": "111", "status": "CONNECTED", "qr": "" } })
        );
    }

    #[tokio::test]
    async fn test_connect_conflict() {
        let (app, factory) = test_app();
        call(&app, "POST", "/instances/111/connect", None).await;

        let (status, body) = call(&app, "POST", "/instances/111/connect", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({ "error": "AlreadyConnecting" }));

        factory.last().unwrap().emit(Event::Connected);
        let (status, body) = call(&app, "POST", "/instances/111/connect", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({ "error": "AlreadyConnected" }));
        assert_eq!(factory.created(), 1);
    }

    #[tokio::test]
    async fn test_send_paths() {
        let (app, factory) = test_app();

        let body = r#"{"to":"5551234@s.whatsapp.net","text":"hi"}"#;
        let (status, reply) = call(&app, "POST", "/instances/111/send", Some(body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(reply, json!({ "error": "NotConnected" }));

        call(&app, "POST", "/instances/111/connect", None).await;
        let client = factory.last().unwrap();
        client.emit(Event::Connected);

        let (status, reply) = call(&app, "POST", "/instances/111/send", Some(body)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(reply, json!({ "success": true }));
        let sent = client.sent.lock().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0.to_string(), "5551234@s.whatsapp.net");
        assert_eq!(sent[0].1.conversation, "hi");

        let bad_to = r#"{"to":"not a jid","text":"hi"}"#;
        let (status, reply) = call(&app, "POST", "/instances/111/send", Some(bad_to)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(reply, json!({ "error": "InvalidRecipient" }));

        let (status, reply) = call(&app, "POST", "/instances/111/send", Some("{nope")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(reply["error"].is_string());

        *client.send_error.lock() = Some(ClientError::Rejected("server said no".to_string()));
        let (status, reply) = call(&app, "POST", "/instances/111/send", Some(body)).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(reply, json!({ "error": "send rejected: server said no" }));
    }

    #[tokio::test]
    async fn test_qr_text_rendering() {
        let (app, factory) = test_app();
        call(&app, "POST", "/instances/111/connect", None).await;

        let empty = Request::builder()
            .uri("/instances/111/qr?format=text")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(empty).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        factory.last().unwrap().push_qr("2@abc").await;
        for _ in 0..50 {
            let (_, qr) = call(&app, "GET", "/instances/111/qr", None).await;
            if qr["code"] == "2@abc" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let request = Request::builder()
            .uri("/instances/111/qr?format=text")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/plain; charset=utf-8"
        );
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert_eq!(text, qr::render_terminal("2@abc").unwrap());

        let (status, body) = call(&app, "GET", "/instances/111/qr?format=svg", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("svg"));
    }

    #[tokio::test]
    async fn test_unknown_instance() {
        let (app, _) = test_app();
        for uri in ["/instances/nope", "/instances/nope/qr"] {
            let (status, body) = call(&app, "GET", uri, None).await;
            assert_eq!(status, StatusCode::NOT_FOUND);
            assert_eq!(body, json!({ "error": "NotFound" }));
        }
        let (status, _) = call(&app, "POST", "/instances/nope/disconnect", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_disconnect_removes_instance() {
        let (app, factory) = test_app();
        call(&app, "POST", "/instances/111/connect", None).await;

        let (status, body) = call(&app, "POST", "/instances/111/disconnect", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "success": true }));
        assert_eq!(factory.last().unwrap().disconnects.load(std::sync::atomic::Ordering::SeqCst), 1);

        let (_, list) = call(&app, "GET", "/instances", None).await;
        assert_eq!(list, json!({}));
    }

    #[tokio::test]
    async fn test_connect_failure_is_server_error() {
        let (app, factory) = test_app();
        factory
            .fail_connect
            .store(true, std::sync::atomic::Ordering::SeqCst);

        let (status, body) = call(&app, "POST", "/instances/111/connect", None).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["error"].as_str().unwrap().contains("connection refused"));

        let (_, view) = call(&app, "GET", "/instances/111", None).await;
        assert_eq!(view["status"], "DISCONNECTED");
    }
}
