//! Internal asset short-circuit.
//!
//! Rendering environments request build assets through the gateway itself
//! while a document is in flight; those paths carry a configured marker and
//! are answered straight from the client build directory instead of going
//! through the render pipeline.

use std::path::{Path, PathBuf};

use axum::{
    body::Body,
    http::{HeaderValue, Response, StatusCode, header},
};
use bytes::Bytes;
use mime_guess::Mime;
use tracing::debug;

use crate::application::render::normalize_path;

const TARGET: &str = "vetrina::assets";

pub struct AssetResolver {
    root: PathBuf,
    marker: String,
}

impl AssetResolver {
    pub fn new(root: PathBuf, marker: String) -> Self {
        Self { root, marker }
    }

    pub fn marker(&self) -> &str {
        &self.marker
    }

    pub fn matches(&self, path: &str) -> bool {
        path.contains(&self.marker)
    }

    /// Resolve a marked request path against the asset directory.
    ///
    /// Only the file name after the marker is honored, so a request can never
    /// escape the asset root. `None` lets the caller fall through to the
    /// regular non-SSR handler.
    pub async fn resolve(&self, request_path: &str) -> Option<Response<Body>> {
        let bare = normalize_path(request_path);
        let relative = bare.rsplit(&self.marker).next().unwrap_or(bare);
        let file_name = Path::new(relative).file_name()?;

        let candidate = self.root.join(file_name);
        match tokio::fs::read(&candidate).await {
            Ok(contents) => {
                let mime = mime_guess::from_path(&candidate).first_or_octet_stream();
                Some(build_response(Bytes::from(contents), mime))
            }
            Err(error) => {
                debug!(
                    target: TARGET,
                    path = %candidate.display(),
                    error = %error,
                    "internal asset not readable; falling through"
                );
                None
            }
        }
    }
}

fn build_response(bytes: Bytes, mime: Mime) -> Response<Body> {
    let len = bytes.len();
    let mut response = Response::new(Body::from(bytes));
    *response.status_mut() = StatusCode::OK;

    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(mime.as_ref()) {
        headers.insert(header::CONTENT_TYPE, value);
    }
    if let Ok(value) = HeaderValue::from_str(&len.to_string()) {
        headers.insert(header::CONTENT_LENGTH, value);
    }
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("public, max-age=3600"),
    );

    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn asset_dir(files: &[(&str, &[u8])]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().expect("create temp dir");
        for (name, contents) in files {
            std::fs::write(dir.path().join(name), contents).expect("write asset");
        }
        dir
    }

    #[tokio::test]
    async fn resolves_marked_paths_by_file_name() {
        let dir = asset_dir(&[("app.js", b"console.log(1);")]);
        let resolver = AssetResolver::new(dir.path().to_path_buf(), "/public/".to_string());
        assert!(resolver.matches("/workspace/public/v7/app.js"));

        let response = resolver
            .resolve("/workspace/public/v7/app.js?cache=1")
            .await
            .expect("asset resolved");
        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .expect("content type present");
        assert!(content_type.contains("javascript"));
    }

    #[tokio::test]
    async fn missing_assets_fall_through() {
        let dir = asset_dir(&[]);
        let resolver = AssetResolver::new(dir.path().to_path_buf(), "/public/".to_string());
        assert!(resolver.resolve("/public/ghost.css").await.is_none());
    }

    #[tokio::test]
    async fn traversal_is_flattened_to_the_file_name() {
        let dir = asset_dir(&[("safe.css", b"body{}")]);
        let resolver = AssetResolver::new(dir.path().to_path_buf(), "/public/".to_string());

        // Only the basename is honored, so the parent traversal is inert.
        assert!(resolver.resolve("/public/../../etc/safe.css").await.is_some());
        assert!(resolver.resolve("/public/../../etc/passwd").await.is_none());
    }
}
