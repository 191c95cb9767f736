use crate::dispatcher::SyncCore;
use crate::errors::{AppError, AppResult};
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;

pub const MAX_BODY_BYTES: usize = 200 * 1024 * 1024;
pub const ACKNOWLEDGEMENT: &str = "Data received";
const USAGE: &str = "Please post data for ScriptSync to this endpoint";

pub fn router(core: Arc<SyncCore>) -> Router {
    Router::new()
        .route("/", get(usage).post(receive).options(preflight))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(core)
}

/// Serves the request endpoint until `shutdown` flips to true.
pub async fn serve_http(
    listener: TcpListener,
    core: Arc<SyncCore>,
    mut shutdown: watch::Receiver<bool>,
) -> AppResult<()> {
    axum::serve(listener, router(core))
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .map_err(|error| AppError::Transport(error.to_string()))
}

async fn usage() -> Response {
    with_cors(StatusCode::OK, USAGE.to_string())
}

async fn preflight() -> Response {
    with_cors(StatusCode::NO_CONTENT, String::new())
}

async fn receive(State(core): State<Arc<SyncCore>>, body: String) -> Response {
    if !core.is_running() {
        return with_cors(StatusCode::SERVICE_UNAVAILABLE, "ScriptSync is stopped".to_string());
    }
    match core.handle_request_body(&body).await {
        Ok(()) => with_cors(StatusCode::OK, ACKNOWLEDGEMENT.to_string()),
        Err(error) => {
            tracing::warn!(error = %error, "request failed");
            with_cors(status_for(&error), error.to_string())
        }
    }
}

fn status_for(error: &AppError) -> StatusCode {
    match error {
        AppError::MalformedMessage(_) => StatusCode::BAD_REQUEST,
        AppError::NotARecord(_) => StatusCode::UNPROCESSABLE_ENTITY,
        AppError::NoChannel | AppError::Transport(_) => StatusCode::BAD_GATEWAY,
        AppError::Remote(_) | AppError::Persistence(_) | AppError::Internal(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn with_cors(status: StatusCode, body: String) -> Response {
    (
        status,
        [
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
            (header::ACCESS_CONTROL_ALLOW_METHODS, "POST"),
        ],
        body,
    )
        .into_response()
}
