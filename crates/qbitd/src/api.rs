use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::Path;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::get;
use axum::routing::post;
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::engine::Engine;
use crate::engine::EngineError;
use crate::engine::SwitchAction;

/// Response for the /v1/ping endpoint
#[derive(Serialize)]
struct PingResponse {
    status: String,
}

/// Response for the /v1/info endpoint
#[derive(Serialize)]
struct InfoResponse {
    version: String,
    hostname: String,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

fn error_response(status: StatusCode, error: impl ToString) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
        .into_response()
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    version: &'static str,
    engine: Arc<Engine>,
}

/// Handler for GET /v1/ping
#[tracing::instrument]
async fn ping() -> impl IntoResponse {
    tracing::debug!("Handling /v1/ping request");
    (
        StatusCode::OK,
        Json(PingResponse {
            status: "ok".to_string(),
        }),
    )
}

/// Handler for GET /v1/info
#[tracing::instrument(skip(state))]
async fn info(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    tracing::debug!("Handling /v1/info request");

    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    (
        StatusCode::OK,
        Json(InfoResponse {
            version: state.version.to_string(),
            hostname,
        }),
    )
}

/// Handler for GET /v1/state
#[tracing::instrument(skip(state))]
async fn engine_state(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    tracing::debug!("Handling /v1/state request");
    let snapshot = state.engine.state_snapshot();
    (StatusCode::OK, Json(crate::engine::State::clone(&snapshot)))
}

/// Handler for POST /v1/switches/:entity_id/:action
#[tracing::instrument(skip(state))]
async fn switch_command(
    State(state): State<Arc<AppState>>,
    Path((entity_id, action)): Path<(String, String)>,
) -> Response {
    let Ok(action) = SwitchAction::from_str(&action) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            format!("unknown switch action: {}", action),
        );
    };

    match state.engine.switch_command(&entity_id, action).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e @ EngineError::UnknownEntity(_)) => error_response(StatusCode::NOT_FOUND, e),
        Err(e @ EngineError::IntegrationUnavailable(_)) => {
            error_response(StatusCode::SERVICE_UNAVAILABLE, e)
        }
        Err(e @ EngineError::Command(_)) => {
            tracing::warn!("Switch command for {} failed: {}", entity_id, e);
            error_response(StatusCode::BAD_GATEWAY, e)
        }
    }
}

/// Create the API router with all endpoints
fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/ping", get(ping))
        .route("/v1/info", get(info))
        .route("/v1/state", get(engine_state))
        .route("/v1/switches/:entity_id/:action", post(switch_command))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP API server
///
/// This function will bind to the specified address and serve the API endpoints.
/// It will run until the provided shutdown signal is triggered.
///
/// # Arguments
/// * `listen` - The IP address to listen on (e.g., "127.0.0.1")
/// * `port` - The port to listen on (e.g., 8565)
/// * `engine` - Engine whose state is served and which executes switch commands
/// * `shutdown_rx` - A oneshot receiver that will trigger graceful shutdown
///
/// # Returns
/// Returns Ok(()) if the server shuts down gracefully, or an error if startup fails
pub async fn serve(
    listen: String,
    port: u16,
    engine: Arc<Engine>,
    shutdown_rx: tokio::sync::oneshot::Receiver<()>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let version = env!("CARGO_PKG_VERSION");

    let state = Arc::new(AppState { version, engine });
    let app = create_router(state);

    let addr: SocketAddr = format!("{}:{}", listen, port).parse()?;
    tracing::info!("Starting HTTP API server on {}", addr);

    let listener = TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            shutdown_rx.await.ok();
            tracing::info!("HTTP API server shutting down gracefully");
        })
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::error::Error;
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::engine::FromIntegrationMessage;
    use crate::engine::FromIntegrationSender;
    use crate::engine::Integration;
    use crate::engine::SetupError;
    use crate::engine::ToIntegrationMessage;

    /// Integration with one switch that either obeys or rejects every command
    struct StubIntegration {
        reject: bool,
    }

    #[async_trait]
    impl Integration for StubIntegration {
        fn name(&self) -> &str {
            "stub"
        }

        async fn setup(&mut self, tx: FromIntegrationSender) -> Result<(), SetupError> {
            for msg in [
                FromIntegrationMessage::EntityDiscovered {
                    entity_id: "switch.stub".to_string(),
                    unique_id: "stub-1".to_string(),
                    platform: "switch".to_string(),
                    translation_key: None,
                    integration_name: "stub".to_string(),
                    device: None,
                },
                FromIntegrationMessage::SwitchStateChanged {
                    entity_id: "switch.stub".to_string(),
                    on: false,
                },
            ] {
                tx.send(msg)
                    .await
                    .map_err(|e| SetupError::Failed(Box::new(e)))?;
            }
            Ok(())
        }

        async fn handle_message(
            &mut self,
            msg: ToIntegrationMessage,
        ) -> Result<(), Box<dyn Error + Send>> {
            let ToIntegrationMessage::SwitchCommand { reply, .. } = msg;
            let result = if self.reject {
                Err("remote unreachable".to_string())
            } else {
                Ok(())
            };
            let _ = reply.send(result);
            Ok(())
        }

        async fn shutdown(&mut self) -> Result<(), Box<dyn Error + Send>> {
            Ok(())
        }
    }

    async fn router(reject: bool) -> Router {
        let engine = Arc::new(Engine::new());
        engine.register_integration("stub".to_string(), Box::new(StubIntegration { reject }));
        let runner = engine.clone();
        tokio::spawn(async move { runner.run().await });

        tokio::time::timeout(Duration::from_secs(5), async {
            while !engine.state_snapshot().switches.contains_key("switch.stub") {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("stub switch never appeared");

        create_router(Arc::new(AppState {
            version: "test",
            engine,
        }))
    }

    async fn send(app: Router, method: &str, uri: &str) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    #[tokio::test]
    async fn test_ping() {
        let (status, body) = send(router(false).await, "GET", "/v1/ping").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_info_reports_version() {
        let (status, body) = send(router(false).await, "GET", "/v1/info").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["version"], "test");
        assert!(body["hostname"].is_string());
    }

    #[tokio::test]
    async fn test_state_lists_switches() {
        let (status, body) = send(router(false).await, "GET", "/v1/state").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["switches"]["switch.stub"]["on"], false);
        assert_eq!(body["entities"]["switch.stub"]["unique_id"], "stub-1");
        assert_eq!(body["entities"]["switch.stub"]["integration"], "stub");
    }

    #[tokio::test]
    async fn test_switch_command_succeeds() {
        let (status, body) = send(
            router(false).await,
            "POST",
            "/v1/switches/switch.stub/turn_on",
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(body.is_null());
    }

    #[tokio::test]
    async fn test_unknown_entity_is_not_found() {
        let (status, body) = send(
            router(false).await,
            "POST",
            "/v1/switches/switch.missing/toggle",
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("switch.missing"));
    }

    #[tokio::test]
    async fn test_unknown_action_is_bad_request() {
        let (status, _) = send(
            router(false).await,
            "POST",
            "/v1/switches/switch.stub/explode",
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_failed_command_is_bad_gateway() {
        let (status, body) = send(
            router(true).await,
            "POST",
            "/v1/switches/switch.stub/turn_off",
        )
        .await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert!(body["error"]
            .as_str()
            .unwrap()
            .contains("remote unreachable"));
    }
}
