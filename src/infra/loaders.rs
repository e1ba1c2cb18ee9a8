//! Route loader implementations backed by upstream HTTP services.

use async_trait::async_trait;
use reqwest::header::{ACCEPT, HeaderMap, HeaderValue};

use crate::application::render::{LoaderError, RouteLoader};

/// Fetches a JSON document from a fixed upstream URL.
///
/// This is the configuration-driven loader: each `[[ssr.routes]]` entry with
/// a `data_url` becomes one of these, sharing a single client.
pub struct HttpJsonLoader {
    client: reqwest::Client,
    url: String,
}

impl HttpJsonLoader {
    pub fn new(client: reqwest::Client, url: String) -> Self {
        Self { client, url }
    }

    pub fn shared_client() -> Result<reqwest::Client, LoaderError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|err| LoaderError::Upstream(format!("failed to build http client: {err}")))
    }
}

#[async_trait]
impl RouteLoader for HttpJsonLoader {
    async fn load(&self) -> Result<serde_json::Value, LoaderError> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|err| LoaderError::Upstream(err.to_string()))?;

        let response = response
            .error_for_status()
            .map_err(|err| LoaderError::Upstream(err.to_string()))?;

        response
            .json::<serde_json::Value>()
            .await
            .map_err(|err| LoaderError::Decode(err.to_string()))
    }
}
