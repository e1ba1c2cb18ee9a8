//! Bundled shell implementation of the rendering contract.
//!
//! Serves the client build's entry document with the pre-fetched payload and
//! active route spliced in for rehydration. It runs no application code, so
//! it is immediately stable; a real headless engine replaces it behind the
//! same trait without touching pool or pipeline.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;

use super::environment::{
    EnvironmentError, EnvironmentFactory, RenderEnvironment, RequestState, Stability,
    VisitorIdentity,
};

const STATE_SCRIPT_ID: &str = "vetrina-initial-data";

pub struct ShellEnvironment {
    document: String,
    route: Option<String>,
    payload: Option<serde_json::Value>,
    visitor: VisitorIdentity,
}

impl ShellEnvironment {
    pub fn new(document: String) -> Self {
        Self {
            document,
            route: None,
            payload: None,
            visitor: VisitorIdentity::Anonymous,
        }
    }

    fn state_script(&self) -> String {
        let payload = match &self.payload {
            Some(value) => escape_for_inline_script(&value.to_string()),
            None => "null".to_string(),
        };
        let route = self
            .route
            .as_deref()
            .map(|route| escape_for_inline_script(&serde_json::Value::from(route).to_string()))
            .unwrap_or_else(|| "null".to_string());

        format!(
            "<script id=\"{STATE_SCRIPT_ID}\">window.__INITIAL_DATA__ = {payload};window.__ACTIVE_ROUTE__ = {route};</script>"
        )
    }
}

/// Escape `<` so a payload containing `</script>` cannot terminate the
/// injected tag early.
fn escape_for_inline_script(json: &str) -> String {
    json.replace('<', "\\u003c")
}

#[async_trait]
impl RenderEnvironment for ShellEnvironment {
    async fn inject_state(&mut self, state: &RequestState) -> Result<(), EnvironmentError> {
        self.payload = state.payload.clone();
        self.visitor = state.visitor.clone();
        Ok(())
    }

    async fn set_route(&mut self, route: &str) -> Result<(), EnvironmentError> {
        self.route = Some(route.to_string());
        Ok(())
    }

    async fn wait_until_stable(&mut self, _timeout: Duration) -> Stability {
        // A static shell has no in-flight rendering work to wait on.
        Stability::Stable
    }

    async fn extract_styles(&mut self) -> Result<(), EnvironmentError> {
        Ok(())
    }

    async fn serialize(&mut self) -> Result<String, EnvironmentError> {
        let script = self.state_script();
        match self.document.rfind("</body>") {
            Some(index) => {
                let mut output = String::with_capacity(self.document.len() + script.len());
                output.push_str(&self.document[..index]);
                output.push_str(&script);
                output.push_str(&self.document[index..]);
                Ok(output)
            }
            None => Ok(format!("{}{script}", self.document)),
        }
    }

    fn clear_state(&mut self) {
        self.payload = None;
        self.route = None;
        self.visitor = VisitorIdentity::Anonymous;
    }

    async fn dispose(&mut self) {}
}

/// Builds shell environments by re-reading the entry document, so each
/// pooled instance starts from the pristine on-disk build output.
pub struct ShellEnvironmentFactory {
    index_path: PathBuf,
}

impl ShellEnvironmentFactory {
    pub fn new(index_path: PathBuf) -> Self {
        Self { index_path }
    }
}

#[async_trait]
impl EnvironmentFactory for ShellEnvironmentFactory {
    async fn create(&self) -> Result<Box<dyn RenderEnvironment>, EnvironmentError> {
        let document = tokio::fs::read_to_string(&self.index_path).await?;
        Ok(Box::new(ShellEnvironment::new(document)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOCUMENT: &str = "<!DOCTYPE html><html><body><div id=\"root\"></div></body></html>";

    fn state(payload: serde_json::Value) -> RequestState {
        RequestState {
            visitor: VisitorIdentity::Anonymous,
            payload: Some(payload),
        }
    }

    #[tokio::test]
    async fn serializes_payload_and_route_before_body_close() {
        let mut shell = ShellEnvironment::new(DOCUMENT.to_string());
        shell
            .inject_state(&state(serde_json::json!({"x": 1})))
            .await
            .expect("inject");
        shell.set_route("contact").await.expect("route");

        let html = shell.serialize().await.expect("serialize");
        assert!(html.contains("window.__INITIAL_DATA__ = {\"x\":1}"));
        assert!(html.contains("window.__ACTIVE_ROUTE__ = \"contact\""));

        let script_at = html.find(STATE_SCRIPT_ID).expect("script present");
        let body_close_at = html.rfind("</body>").expect("body close present");
        assert!(script_at < body_close_at);
    }

    #[tokio::test]
    async fn cleared_state_does_not_leak_into_next_serialization() {
        let mut shell = ShellEnvironment::new(DOCUMENT.to_string());
        shell
            .inject_state(&state(serde_json::json!({"x": 1})))
            .await
            .expect("inject");
        shell.clear_state();

        let html = shell.serialize().await.expect("serialize");
        assert!(!html.contains("\"x\":1"));
        assert!(html.contains("window.__INITIAL_DATA__ = null"));
    }

    #[tokio::test]
    async fn payload_cannot_break_out_of_the_script_tag() {
        let mut shell = ShellEnvironment::new(DOCUMENT.to_string());
        shell
            .inject_state(&state(serde_json::json!({
                "html": "</script><script>alert(1)</script>"
            })))
            .await
            .expect("inject");

        let html = shell.serialize().await.expect("serialize");
        assert!(!html.contains("</script><script>alert(1)"));
        assert!(html.contains("\\u003c/script"));
    }

    #[tokio::test]
    async fn document_without_body_close_still_gets_state() {
        let mut shell = ShellEnvironment::new("<p>bare fragment</p>".to_string());
        shell
            .inject_state(&state(serde_json::json!(42)))
            .await
            .expect("inject");

        let html = shell.serialize().await.expect("serialize");
        assert!(html.contains("window.__INITIAL_DATA__ = 42"));
    }
}
