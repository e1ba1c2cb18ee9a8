//! Contract between the pool/pipeline and a headless rendering engine.
//!
//! The gateway never depends on a concrete engine: anything able to host the
//! client application behind this trait can be pooled. The bundled
//! [`crate::application::render::shell::ShellEnvironment`] is the degenerate
//! built-in implementation; a real DOM engine plugs in the same way.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Identity of the visitor a render is performed for.
///
/// Environments are reused across unrelated requests, so the active identity
/// is part of the injected per-request state and must be cleared with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VisitorIdentity {
    Anonymous,
    Known(String),
}

impl VisitorIdentity {
    /// Parse the raw header value; absent or the sentinel `0-0` means anonymous.
    pub fn from_header(value: Option<&str>) -> Self {
        match value {
            None | Some("") | Some("0-0") => Self::Anonymous,
            Some(identity) => Self::Known(identity.to_string()),
        }
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self, Self::Known(_))
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Anonymous => "0-0",
            Self::Known(identity) => identity.as_str(),
        }
    }
}

/// Per-request state handed to an environment before navigation.
///
/// The payload doubles as the client-side rehydration blob: the environment
/// must make it visible both to the in-flight application instance and to the
/// serialized markup.
#[derive(Debug, Clone)]
pub struct RequestState {
    pub visitor: VisitorIdentity,
    pub payload: Option<serde_json::Value>,
}

impl RequestState {
    pub fn anonymous() -> Self {
        Self {
            visitor: VisitorIdentity::Anonymous,
            payload: None,
        }
    }
}

/// Outcome of waiting for the hosted application to finish rendering.
///
/// Stability is signaled by the hosted application itself; the timeout is a
/// safety bound, not a failure, and the pipeline serializes either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stability {
    Stable,
    TimedOut,
}

#[derive(Debug, Error)]
pub enum EnvironmentError {
    #[error("environment construction failed: {0}")]
    Construction(String),
    #[error("state injection failed: {0}")]
    Inject(String),
    #[error("route synchronization failed: {0}")]
    Route(String),
    #[error("markup serialization failed: {0}")]
    Serialize(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A stateful headless rendering environment.
///
/// Exactly one requester drives an environment at a time; the pool enforces
/// this by handing out owned leases, so implementations need no internal
/// locking and take `&mut self` throughout.
#[async_trait]
pub trait RenderEnvironment: Send {
    /// Make `state` available to the running application instance and to the
    /// serialized output.
    async fn inject_state(&mut self, state: &RequestState) -> Result<(), EnvironmentError>;

    /// Instruct the hosted application to navigate without reloading.
    async fn set_route(&mut self, route: &str) -> Result<(), EnvironmentError>;

    /// Resolve once the hosted application has removed its loading marker, or
    /// once `timeout` elapses, whichever comes first.
    async fn wait_until_stable(&mut self, timeout: Duration) -> Stability;

    /// Best-effort copy of runtime-computed styling state into serializable
    /// markup. Failures are logged by the caller and never abort a render.
    async fn extract_styles(&mut self) -> Result<(), EnvironmentError>;

    async fn serialize(&mut self) -> Result<String, EnvironmentError>;

    /// Drop all per-request state injected since the last clear so the next,
    /// unrelated request starts from a clean document.
    fn clear_state(&mut self);

    async fn dispose(&mut self);
}

/// Constructor for pooled environments, called during warm-up and retirement
/// replacement. The pool serializes calls; implementations may rely on never
/// being invoked concurrently.
#[async_trait]
pub trait EnvironmentFactory: Send + Sync {
    async fn create(&self) -> Result<Box<dyn RenderEnvironment>, EnvironmentError>;
}
