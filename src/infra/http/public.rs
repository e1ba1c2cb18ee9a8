use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    middleware,
    response::{Html, IntoResponse, Response},
    routing::get,
};
use tracing::debug;

use crate::application::error::ErrorReport;
use crate::application::render::RenderService;

use super::middleware::{log_responses, set_request_context};
use super::ssr::{SsrState, ssr_gateway};

/// Serves the untouched client entry document: the pass-through target for
/// every request the gateway declines or fails to render.
pub struct ClientShell {
    index_path: PathBuf,
}

impl ClientShell {
    pub fn new(index_path: PathBuf) -> Self {
        Self { index_path }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub render: Arc<RenderService>,
    pub shell: Arc<ClientShell>,
}

pub fn build_router(state: AppState, ssr: SsrState) -> Router {
    Router::new()
        .route("/_health/pool", get(pool_health))
        .fallback(client_shell)
        .with_state(state)
        .layer(middleware::from_fn_with_state(ssr, ssr_gateway))
        .layer(middleware::from_fn(log_responses))
        .layer(middleware::from_fn(set_request_context))
}

async fn pool_health(State(state): State<AppState>) -> Response {
    Json(state.render.pool().diagnostics()).into_response()
}

async fn client_shell(State(state): State<AppState>) -> Response {
    match tokio::fs::read_to_string(&state.shell.index_path).await {
        Ok(document) => Html(document).into_response(),
        Err(error) => {
            debug!(
                target: "vetrina::http::shell",
                path = %state.shell.index_path.display(),
                error = %error,
                "client shell entry document unavailable"
            );
            let mut response = StatusCode::NOT_FOUND.into_response();
            ErrorReport::from_error(
                "infra::http::client_shell",
                StatusCode::NOT_FOUND,
                &error,
            )
            .attach(&mut response);
            response
        }
    }
}
