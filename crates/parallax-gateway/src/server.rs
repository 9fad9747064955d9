//! Server wiring: builds the dispatch pipeline and serves the proxy.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{RegistryConfig, RouterConfig};
use crate::error::GatewayError;
use crate::feedback::{spawn_feedback_worker, FeedbackEvent};
use crate::functions::{CachingFunctionProvider, FunctionStore, StaticFunctionStore};
use crate::proxy;
use crate::refresh::run_refresher;
use crate::registry::{HttpNodeRegistry, HttpStatusProber, NodeRegistry, StaticNodeRegistry};
use parallax_router::mab::{BanditManager, ContextStorage};
use parallax_router::metrics::NodeMetricCache;
use parallax_router::ring::{FreeMemoryChecker, MemoryChecker};
use parallax_router::{ArchAwareBalancer, StatusProber};

/// Capacity of the queue between the response path and the bandit
/// update worker. Updates beyond it are dropped, not awaited; learning
/// must never back-pressure client responses.
const FEEDBACK_QUEUE_DEPTH: usize = 1024;

/// Shared request-handling state.
pub struct AppState {
    pub balancer: Arc<ArchAwareBalancer>,
    pub metrics: Arc<NodeMetricCache>,
    pub feedback_tx: mpsc::Sender<FeedbackEvent>,
    pub upstream_timeout: Duration,
}

/// Builds the proxy's route table.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/invoke/{function}", post(proxy::invoke))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "healthy" }))
}

/// Runs the router until the cancellation token fires.
pub async fn run(config: RouterConfig, cancel: CancellationToken) -> Result<(), GatewayError> {
    let metrics = Arc::new(NodeMetricCache::new());
    let bandits = Arc::new(BanditManager::new(
        config.mab_policy,
        config.ucb1_c,
        config.mab_linucb_alpha,
    ));
    let contexts = Arc::new(ContextStorage::new());

    let store: Arc<dyn FunctionStore> =
        Arc::new(StaticFunctionStore::new(config.functions.clone(), None));
    let functions = Arc::new(CachingFunctionProvider::new(
        store,
        Duration::from_secs(config.function_cache_ttl_secs),
    ));

    let prober: Arc<dyn StatusProber> = Arc::new(HttpStatusProber::new(Duration::from_secs(
        config.status_timeout_secs,
    )));
    let mem_checker: Arc<dyn MemoryChecker> =
        Arc::new(FreeMemoryChecker::new(Arc::clone(&metrics)));

    let balancer = Arc::new(ArchAwareBalancer::new(
        config.replicas,
        config.lb_mode,
        mem_checker,
        functions,
        Arc::clone(&prober),
        Arc::clone(&metrics),
        Arc::clone(&bandits),
        Arc::clone(&contexts),
    ));

    let registry: Arc<dyn NodeRegistry> = match &config.registry {
        RegistryConfig::Static { nodes } => Arc::new(StaticNodeRegistry::new(nodes)),
        RegistryConfig::Discovery { endpoint } => Arc::new(HttpNodeRegistry::new(
            endpoint.clone(),
            Duration::from_secs(config.upstream_timeout_secs),
        )),
    };

    let initial = registry
        .nodes_in_area(&config.region)
        .await
        .map_err(|e| GatewayError::Registry(format!("cannot retrieve targets: {e}")))?;
    tracing::info!(count = initial.len(), region = %config.region, "initialising targets");
    for node in &initial {
        balancer.add_target(node.to_target()).await;
    }

    let (feedback_tx, feedback_rx) = mpsc::channel(FEEDBACK_QUEUE_DEPTH);
    let feedback_worker =
        spawn_feedback_worker(Arc::clone(&bandits), Arc::clone(&contexts), feedback_rx);

    let refresher = tokio::spawn(run_refresher(
        Arc::clone(&balancer),
        registry,
        prober,
        Arc::clone(&metrics),
        config.region.clone(),
        Duration::from_secs(config.lb_refresh_interval),
        initial,
        cancel.clone(),
    ));

    let state = Arc::new(AppState {
        balancer,
        metrics,
        feedback_tx,
        upstream_timeout: Duration::from_secs(config.upstream_timeout_secs),
    });
    let app = router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.api_port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(GatewayError::Io)?;
    tracing::info!(address = %addr, mode = ?config.lb_mode, "router listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(GatewayError::Io)?;

    // The refresher exits on the cancellation token; the feedback
    // worker when the last sender (inside the app state) is dropped.
    let _ = refresher.await;
    let _ = feedback_worker.await;
    Ok(())
}
