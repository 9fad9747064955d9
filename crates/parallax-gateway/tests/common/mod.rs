//! Shared fixtures for gateway integration tests.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio::sync::mpsc;

use parallax_gateway::config::FunctionConfig;
use parallax_gateway::feedback::spawn_feedback_worker;
use parallax_gateway::functions::{CachingFunctionProvider, FunctionStore, StaticFunctionStore};
use parallax_gateway::registry::HttpStatusProber;
use parallax_gateway::server::{router, AppState};
use parallax_router::mab::{BanditManager, ContextStorage, PolicyKind};
use parallax_router::metrics::{unix_now, NodeMetricCache};
use parallax_router::ring::{FreeMemoryChecker, MemoryChecker};
use parallax_router::types::{Architecture, ProxyTarget};
use parallax_router::{ArchAwareBalancer, LbMode, StatusProber};

/// How a mock worker answers invocations.
#[derive(Debug, Clone)]
pub struct WorkerBehaviour {
    pub name: String,
    pub arch: Architecture,
    pub total_mem: i64,
    pub free_mem: i64,
    pub duration_secs: f64,
    pub warm: bool,
}

impl WorkerBehaviour {
    pub fn new(name: &str, arch: Architecture) -> Self {
        Self {
            name: name.to_owned(),
            arch,
            total_mem: 4096,
            free_mem: 3072,
            duration_secs: 0.12,
            warm: true,
        }
    }
}

/// Spawns a worker double serving `/invoke/{function}` and `/status`
/// on an ephemeral port.
pub async fn spawn_worker(behaviour: WorkerBehaviour) -> SocketAddr {
    let behaviour = Arc::new(behaviour);
    let app = Router::new()
        .route("/invoke/{function}", post(worker_invoke))
        .route("/status", get(worker_status))
        .with_state(behaviour);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn worker_invoke(
    State(behaviour): State<Arc<WorkerBehaviour>>,
    headers: HeaderMap,
    _body: Bytes,
) -> Response {
    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/json")
        .header("Serverledge-Node-Name", &behaviour.name)
        .header("Serverledge-Node-Arch", behaviour.arch.as_str())
        .header("Serverledge-Free-Mem", behaviour.free_mem.to_string());
    if let Some(request_id) = headers.get("Serverledge-MAB-Request-ID") {
        builder = builder.header("Serverledge-MAB-Request-ID", request_id);
    }

    let body = format!(
        r#"{{"ExecutionReport": {{"Duration": {}, "Output": "ok"}}, "IsWarmStart": {}}}"#,
        behaviour.duration_secs, behaviour.warm
    );
    builder.body(Body::from(body)).unwrap()
}

async fn worker_status(State(behaviour): State<Arc<WorkerBehaviour>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "TotalMemory": behaviour.total_mem,
        "UsedMemory": behaviour.total_mem - behaviour.free_mem,
        "LastUpdateTime": unix_now(),
    }))
}

/// A fully wired gateway with handles onto its internals.
pub struct TestGateway {
    pub app: Router,
    pub balancer: Arc<ArchAwareBalancer>,
    pub metrics: Arc<NodeMetricCache>,
    pub bandits: Arc<BanditManager>,
    pub contexts: Arc<ContextStorage>,
}

impl TestGateway {
    pub async fn build(
        mode: LbMode,
        functions: Vec<(&str, &[Architecture])>,
        targets: Vec<ProxyTarget>,
    ) -> Self {
        let metrics = Arc::new(NodeMetricCache::new());
        let bandits = Arc::new(BanditManager::new(
            PolicyKind::Ucb1,
            std::f64::consts::SQRT_2,
            0.1,
        ));
        let contexts = Arc::new(ContextStorage::new());

        let function_configs: HashMap<String, FunctionConfig> = functions
            .into_iter()
            .map(|(name, archs)| {
                let config = FunctionConfig {
                    memory_mb: 128,
                    runtime: "python314".to_owned(),
                    supported_archs: Some(archs.to_vec()),
                    image: None,
                };
                (name.to_owned(), config)
            })
            .collect();
        let store = Arc::new(StaticFunctionStore::new(function_configs, None));
        let provider = Arc::new(CachingFunctionProvider::new(
            store as Arc<dyn FunctionStore>,
            Duration::from_secs(60),
        ));

        let prober = Arc::new(HttpStatusProber::new(Duration::from_secs(2)));
        let balancer = Arc::new(ArchAwareBalancer::new(
            16,
            mode,
            Arc::new(FreeMemoryChecker::new(Arc::clone(&metrics))) as Arc<dyn MemoryChecker>,
            provider,
            Arc::clone(&prober) as Arc<dyn StatusProber>,
            Arc::clone(&metrics),
            Arc::clone(&bandits),
            Arc::clone(&contexts),
        ));
        for target in targets {
            balancer.add_target(target).await;
        }

        let (feedback_tx, feedback_rx) = mpsc::channel(64);
        let _worker = spawn_feedback_worker(Arc::clone(&bandits), Arc::clone(&contexts), feedback_rx);

        let state = Arc::new(AppState {
            balancer: Arc::clone(&balancer),
            metrics: Arc::clone(&metrics),
            feedback_tx,
            upstream_timeout: Duration::from_secs(5),
        });

        Self {
            app: router(state),
            balancer,
            metrics,
            bandits,
            contexts,
        }
    }

    /// Waits until the feedback worker has consumed every stored
    /// decision context, i.e. the asynchronous updates have landed.
    pub async fn wait_for_feedback(&self) {
        for _ in 0..100 {
            if self.contexts.is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("feedback worker did not drain decision contexts in time");
    }
}
