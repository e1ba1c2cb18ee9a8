//! Route registry: which application paths get data pre-fetched, and how
//! request paths map onto application route names.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("upstream request failed: {0}")]
    Upstream(String),
    #[error("payload decode failed: {0}")]
    Decode(String),
}

/// Asynchronous data loader attached to a route; its payload is injected
/// into the environment and serialized for client-side rehydration.
#[async_trait]
pub trait RouteLoader: Send + Sync {
    async fn load(&self) -> Result<serde_json::Value, LoaderError>;
}

/// How a registered path wants to be pre-fetched.
#[derive(Clone)]
pub enum RouteBinding {
    Loader(Arc<dyn RouteLoader>),
    /// Registered route that renders without any pre-fetched data.
    NoPrefetch,
}

/// Exact-match mapping from normalized request path to its binding.
///
/// Pure lookup, no side effects. Callers own normalization: paths must have
/// their query string stripped before they get here.
#[derive(Default)]
pub struct RouteLoaderRegistry {
    entries: HashMap<String, RouteBinding>,
}

impl RouteLoaderRegistry {
    pub fn builder() -> RouteLoaderRegistryBuilder {
        RouteLoaderRegistryBuilder::default()
    }

    pub fn lookup(&self, normalized_path: &str) -> Option<&RouteBinding> {
        self.entries.get(normalized_path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Default)]
pub struct RouteLoaderRegistryBuilder {
    entries: HashMap<String, RouteBinding>,
}

impl RouteLoaderRegistryBuilder {
    pub fn loader(mut self, path: impl Into<String>, loader: Arc<dyn RouteLoader>) -> Self {
        self.entries.insert(path.into(), RouteBinding::Loader(loader));
        self
    }

    pub fn no_prefetch(mut self, path: impl Into<String>) -> Self {
        self.entries.insert(path.into(), RouteBinding::NoPrefetch);
        self
    }

    pub fn build(self) -> RouteLoaderRegistry {
        RouteLoaderRegistry {
            entries: self.entries,
        }
    }
}

/// Strip the query string; registry keys and route resolution both work on
/// the bare path.
pub fn normalize_path(path: &str) -> &str {
    path.split_once('?').map_or(path, |(bare, _)| bare)
}

/// Data-driven mapping from request path to application route name: the last
/// non-empty path segment when it names a known route, the default otherwise.
#[derive(Debug, Clone)]
pub struct RouteTable {
    known: Vec<String>,
    default_route: String,
}

impl RouteTable {
    pub fn new(known: Vec<String>, default_route: String) -> Self {
        Self {
            known,
            default_route,
        }
    }

    pub fn resolve<'a>(&'a self, normalized_path: &'a str) -> &'a str {
        let last_segment = normalized_path
            .split('/')
            .filter(|segment| !segment.is_empty())
            .next_back();

        match last_segment {
            Some(segment) if self.known.iter().any(|route| route == segment) => segment,
            _ => &self.default_route,
        }
    }

    pub fn default_route(&self) -> &str {
        &self.default_route
    }
}
