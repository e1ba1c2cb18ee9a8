//! The SSR gateway middleware: classify, render, or stand aside.
//!
//! Every inbound request passes through here before routing. Renderable
//! document requests are answered from the pool; everything else, and every
//! internal failure, falls through to the regular handler chain so the
//! client transparently gets client-side rendering instead of an error.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{Method, Request, StatusCode, header},
    middleware::Next,
    response::{Html, IntoResponse, Response},
};
use metrics::counter;
use tracing::{debug, warn};

use crate::application::error::ErrorReport;
use crate::application::render::{
    RenderRequest, RenderService, VisitorIdentity, normalize_path,
};
use crate::infra::assets::AssetResolver;

const TARGET: &str = "vetrina::http::ssr";

/// File extensions answered by static handlers, never the render pipeline.
const STATIC_EXTENSIONS: &[&str] = &[
    "js", "css", "png", "jpg", "jpeg", "gif", "ico", "svg", "json", "woff", "woff2", "ttf", "map",
];

/// Request-filtering rules for the gateway, assembled from configuration.
#[derive(Debug, Clone)]
pub struct ClassificationPolicy {
    /// Substrings marking API and system endpoints that must never be
    /// server-rendered.
    pub bypass_markers: Vec<String>,
    /// Header carrying the visitor identity a render is performed for.
    pub visitor_header: String,
}

#[derive(Clone)]
pub struct SsrState {
    pub render: Arc<RenderService>,
    pub assets: Arc<AssetResolver>,
    pub policy: Arc<ClassificationPolicy>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Classification {
    /// Source maps are answered 404 outright rather than leaking through.
    RejectSourceMap,
    PassThrough(&'static str),
    InternalAsset,
    Render,
}

fn classify(
    method: &Method,
    raw_path: &str,
    accept: Option<&str>,
    policy: &ClassificationPolicy,
    internal_marker: &str,
) -> Classification {
    let bare = normalize_path(raw_path);

    if bare.ends_with(".map") {
        return Classification::RejectSourceMap;
    }
    if method != Method::GET {
        return Classification::PassThrough("non-get");
    }
    // Environments fetch their own build assets through the gateway, so the
    // marker wins over the plain static-extension bypass.
    if raw_path.contains(internal_marker) {
        return Classification::InternalAsset;
    }
    if has_static_extension(bare) {
        return Classification::PassThrough("static-extension");
    }
    if policy
        .bypass_markers
        .iter()
        .any(|marker| raw_path.contains(marker.as_str()))
    {
        return Classification::PassThrough("bypass-marker");
    }

    match accept {
        Some(value) if value.contains("text/html") => Classification::Render,
        _ => Classification::PassThrough("accept-header"),
    }
}

fn has_static_extension(bare_path: &str) -> bool {
    match bare_path.rsplit_once('.') {
        Some((_, extension)) => STATIC_EXTENSIONS
            .iter()
            .any(|known| known.eq_ignore_ascii_case(extension)),
        None => false,
    }
}

pub async fn ssr_gateway(
    State(state): State<SsrState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let method = request.method().clone();
    let raw_path = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());
    let accept = request
        .headers()
        .get(header::ACCEPT)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    let classification = classify(
        &method,
        &raw_path,
        accept.as_deref(),
        &state.policy,
        state.assets.marker(),
    );

    match classification {
        Classification::RejectSourceMap => {
            let mut response = StatusCode::NOT_FOUND.into_response();
            ErrorReport::from_message(
                "infra::http::ssr_gateway",
                StatusCode::NOT_FOUND,
                "Source maps are not served",
            )
            .attach(&mut response);
            response
        }
        Classification::PassThrough(reason) => {
            counter!("vetrina_ssr_passthrough_total").increment(1);
            debug!(target: TARGET, path = %raw_path, reason, "request bypasses rendering");
            next.run(request).await
        }
        Classification::InternalAsset => match state.assets.resolve(&raw_path).await {
            Some(response) => response,
            None => {
                counter!("vetrina_ssr_passthrough_total").increment(1);
                next.run(request).await
            }
        },
        Classification::Render => {
            let visitor = VisitorIdentity::from_header(
                request
                    .headers()
                    .get(state.policy.visitor_header.as_str())
                    .and_then(|value| value.to_str().ok()),
            );
            let render_request = RenderRequest {
                path: raw_path.clone(),
                visitor,
            };

            match state.render.render(&render_request).await {
                Ok(document) => {
                    counter!("vetrina_ssr_rendered_total").increment(1);
                    debug!(
                        target: TARGET,
                        path = %raw_path,
                        route = %document.route,
                        "request answered with server-rendered markup"
                    );
                    Html(document.html).into_response()
                }
                Err(error) => {
                    // Every pipeline failure degrades to client-side
                    // rendering; the visitor never sees an error page.
                    counter!("vetrina_ssr_render_failures_total").increment(1);
                    warn!(
                        target: TARGET,
                        path = %raw_path,
                        error = %error,
                        "render failed; falling back to client-side rendering"
                    );
                    next.run(request).await
                }
            }
        }
    }
}
