//! HTTP frontend of the Parallax router.
//!
//! A reverse proxy that asks the architecture-aware balancer for a
//! target on every `/invoke/<function>` request, forwards the request,
//! and on the way back feeds the worker's execution report into the
//! bandit and its reported free memory into the node-metric cache. A
//! background refresher keeps the target set in sync with the registry.

pub mod config;
pub mod error;
pub mod feedback;
pub mod functions;
pub mod proxy;
pub mod refresh;
pub mod registry;
pub mod server;

pub use config::RouterConfig;
pub use error::GatewayError;
pub use server::run;
