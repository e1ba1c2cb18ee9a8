mod middleware;
mod public;
mod ssr;

pub use public::{AppState, ClientShell, build_router};
pub use ssr::{ClassificationPolicy, SsrState, ssr_gateway};
