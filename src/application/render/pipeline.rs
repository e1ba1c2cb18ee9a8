//! The render pipeline: pre-fetch route data, acquire an environment, drive
//! it through a render, and always hand it back.

use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, histogram};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::environment::{EnvironmentError, RequestState, Stability, VisitorIdentity};
use super::pool::{AcquireError, EnvironmentPool, LeasedEnvironment};
use super::registry::{RouteBinding, RouteLoaderRegistry, RouteTable, normalize_path};

const TARGET: &str = "vetrina::render";

#[derive(Debug, Error)]
pub enum RenderError {
    #[error(transparent)]
    Acquire(#[from] AcquireError),
    #[error(transparent)]
    Environment(#[from] EnvironmentError),
}

/// Ephemeral description of one render, built from the inbound request after
/// classification.
#[derive(Debug, Clone)]
pub struct RenderRequest {
    /// Request path, query string and all; the pipeline normalizes it.
    pub path: String,
    pub visitor: VisitorIdentity,
}

#[derive(Debug, Clone)]
pub struct RenderedDocument {
    pub html: String,
    pub route: String,
    pub stability: Stability,
}

pub struct RenderService {
    pool: Arc<EnvironmentPool>,
    registry: Arc<RouteLoaderRegistry>,
    routes: RouteTable,
    stability_timeout: Duration,
}

impl RenderService {
    pub fn new(
        pool: Arc<EnvironmentPool>,
        registry: Arc<RouteLoaderRegistry>,
        routes: RouteTable,
        stability_timeout: Duration,
    ) -> Self {
        Self {
            pool,
            registry,
            routes,
            stability_timeout,
        }
    }

    pub fn pool(&self) -> &Arc<EnvironmentPool> {
        &self.pool
    }

    /// Render one request end to end.
    ///
    /// Suspends on (at most) the pool acquire, the route loader, and the
    /// stability wait. The leased environment is released on every exit
    /// path, including mid-drive failures.
    pub async fn render(&self, request: &RenderRequest) -> Result<RenderedDocument, RenderError> {
        // Deferred warm-up: the first eligible request pays for pool
        // construction, never the host's own startup.
        self.pool.init().await;

        let started = Instant::now();
        let path = normalize_path(&request.path);
        let payload = self.prefetch(path).await;
        let route = self.routes.resolve(path).to_string();

        let state = RequestState {
            visitor: request.visitor.clone(),
            payload,
        };

        let mut lease = self.pool.acquire().await?;
        let outcome = Self::drive(&mut lease, &state, &route, self.stability_timeout).await;
        self.pool.release(lease);

        let (html, stability) = outcome?;
        histogram!("vetrina_ssr_render_ms").record(started.elapsed().as_secs_f64() * 1_000.0);

        Ok(RenderedDocument {
            html,
            route,
            stability,
        })
    }

    /// Invoke the registered loader for `path`, degrading to an empty payload
    /// on failure so the render proceeds regardless.
    async fn prefetch(&self, path: &str) -> Option<serde_json::Value> {
        match self.registry.lookup(path) {
            Some(RouteBinding::Loader(loader)) => match loader.load().await {
                Ok(payload) => Some(payload),
                Err(error) => {
                    counter!("vetrina_ssr_loader_failures_total").increment(1);
                    warn!(
                        target: TARGET,
                        path,
                        error = %error,
                        "route loader failed; rendering without pre-fetched data"
                    );
                    None
                }
            },
            Some(RouteBinding::NoPrefetch) => None,
            None => {
                debug!(target: TARGET, path, "no data loader registered for path");
                None
            }
        }
    }

    async fn drive(
        lease: &mut LeasedEnvironment,
        state: &RequestState,
        route: &str,
        stability_timeout: Duration,
    ) -> Result<(String, Stability), RenderError> {
        let environment_id = lease.meta().id;
        let env = lease.environment();

        env.inject_state(state).await?;
        env.set_route(route).await?;

        let stability = env.wait_until_stable(stability_timeout).await;
        if stability == Stability::TimedOut {
            counter!("vetrina_ssr_stability_timeouts_total").increment(1);
            warn!(
                target: TARGET,
                environment = %environment_id,
                route,
                timeout_ms = stability_timeout.as_millis() as u64,
                "hosted application never signaled stability; serializing anyway"
            );
        }

        if let Err(error) = env.extract_styles().await {
            // Style extraction is best-effort: the document is still usable,
            // just possibly unstyled until hydration.
            warn!(
                target: TARGET,
                environment = %environment_id,
                error = %error,
                "style extraction failed before serialization"
            );
        }

        let html = env.serialize().await?;
        Ok((html, stability))
    }
}
