//! Function descriptors: store, read-through cache, and supported
//! architecture resolution.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::RwLock;

use crate::config::FunctionConfig;
use crate::error::GatewayError;
use parallax_router::types::{Architecture, FunctionDescriptor};
use parallax_router::FunctionProvider;

/// KV key prefix under which image-architecture lookups are cached.
pub const IMAGE_ARCH_KEY_PREFIX: &str = "/serverledge/image_architectures/";

/// Runtime a function provides its own image for.
pub const CUSTOM_RUNTIME: &str = "custom";

/// A built-in runtime environment.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeInfo {
    pub image: &'static str,
    pub architectures: &'static [Architecture],
}

/// Catalogue of built-in runtimes and the architectures their images
/// are published for.
pub fn runtime_info(runtime: &str) -> Option<RuntimeInfo> {
    const BOTH: &[Architecture] = &[Architecture::Amd64, Architecture::Arm64];
    match runtime {
        "python314" => Some(RuntimeInfo {
            image: "fmuschera/serverledge-python314",
            architectures: BOTH,
        }),
        "nodejs17ng" => Some(RuntimeInfo {
            image: "fmuschera/serverledge-nodejs17ng",
            architectures: BOTH,
        }),
        "java21" => Some(RuntimeInfo {
            image: "fmuschera/serverledge-java21",
            architectures: BOTH,
        }),
        _ => None,
    }
}

/// Looks up function descriptors in the function store.
#[async_trait]
pub trait FunctionStore: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<FunctionDescriptor>, GatewayError>;
}

/// Shared key-value store used to cache image-introspection results.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, GatewayError>;
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), GatewayError>;
}

/// In-memory `KvStore` for single-process deployments and tests.
#[derive(Debug, Default)]
pub struct MemoryKv {
    data: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, GatewayError> {
        Ok(self.data.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), GatewayError> {
        self.data.write().await.insert(key.to_owned(), value.to_vec());
        Ok(())
    }
}

/// Queries the image registry for the platforms an image is published
/// for, already filtered to the architectures the platform schedules
/// on.
#[async_trait]
pub trait ImageArchClient: Send + Sync {
    async fn image_architectures(&self, image: &str)
        -> Result<Vec<Architecture>, GatewayError>;
}

/// Caches image-architecture lookups in the shared KV store, keyed
/// `/serverledge/image_architectures/<image>`. A cache hit skips the
/// registry round-trip entirely.
pub struct CachingImageArchResolver {
    client: Arc<dyn ImageArchClient>,
    kv: Arc<dyn KvStore>,
}

impl CachingImageArchResolver {
    pub fn new(client: Arc<dyn ImageArchClient>, kv: Arc<dyn KvStore>) -> Self {
        Self { client, kv }
    }

    pub async fn supported_architectures(
        &self,
        image: &str,
    ) -> Result<Vec<Architecture>, GatewayError> {
        let key = format!("{IMAGE_ARCH_KEY_PREFIX}{image}");

        match self.kv.get(&key).await {
            Ok(Some(raw)) => match serde_json::from_slice::<Vec<Architecture>>(&raw) {
                Ok(archs) => return Ok(archs),
                Err(e) => {
                    tracing::warn!(%image, error = %e, "undecodable cached architectures, re-fetching");
                }
            },
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(%image, error = %e, "architecture cache unavailable, re-fetching");
            }
        }

        let archs = self.client.image_architectures(image).await?;
        if archs.is_empty() {
            return Err(GatewayError::Config(format!(
                "no supported architecture found for image {image}"
            )));
        }

        // Best-effort cache fill; a KV hiccup costs one extra
        // round-trip later, nothing else.
        match serde_json::to_vec(&archs) {
            Ok(raw) => {
                if let Err(e) = self.kv.put(&key, &raw).await {
                    tracing::warn!(%image, error = %e, "failed to cache image architectures");
                }
            }
            Err(e) => tracing::warn!(%image, error = %e, "failed to encode image architectures"),
        }

        Ok(archs)
    }
}

/// Function store populated from the configuration file. Descriptors
/// whose configuration omits `supported_archs` resolve them from the
/// runtime catalogue, or by image introspection for custom runtimes.
pub struct StaticFunctionStore {
    functions: HashMap<String, FunctionConfig>,
    images: Option<Arc<CachingImageArchResolver>>,
}

impl StaticFunctionStore {
    pub fn new(
        functions: HashMap<String, FunctionConfig>,
        images: Option<Arc<CachingImageArchResolver>>,
    ) -> Self {
        Self { functions, images }
    }

    async fn resolve_archs(
        &self,
        name: &str,
        config: &FunctionConfig,
    ) -> Result<Vec<Architecture>, GatewayError> {
        if let Some(info) = runtime_info(&config.runtime) {
            return Ok(info.architectures.to_vec());
        }

        let image = config.image.as_deref().ok_or_else(|| {
            GatewayError::Config(format!("function {name} has a custom runtime but no image"))
        })?;
        let resolver = self.images.as_ref().ok_or_else(|| {
            GatewayError::Config(format!(
                "function {name} needs image introspection but no image registry is configured"
            ))
        })?;
        resolver.supported_architectures(image).await
    }
}

#[async_trait]
impl FunctionStore for StaticFunctionStore {
    async fn get(&self, name: &str) -> Result<Option<FunctionDescriptor>, GatewayError> {
        let Some(config) = self.functions.get(name) else {
            return Ok(None);
        };

        let supported_archs = match &config.supported_archs {
            Some(archs) if !archs.is_empty() => archs.clone(),
            _ => self.resolve_archs(name, config).await?,
        };

        Ok(Some(FunctionDescriptor {
            name: name.to_owned(),
            memory_mb: config.memory_mb,
            supported_archs,
            runtime: config.runtime.clone(),
        }))
    }
}

struct CacheEntry {
    descriptor: Option<FunctionDescriptor>,
    cached_at: Instant,
}

/// TTL read-through cache in front of a [`FunctionStore`]; this is what
/// the balancer consults on every dispatch. Negative results are cached
/// too, so a storm of requests for an unknown function does not hammer
/// the store.
pub struct CachingFunctionProvider {
    store: Arc<dyn FunctionStore>,
    entries: DashMap<String, CacheEntry>,
    ttl: Duration,
}

impl CachingFunctionProvider {
    pub fn new(store: Arc<dyn FunctionStore>, ttl: Duration) -> Self {
        Self {
            store,
            entries: DashMap::new(),
            ttl,
        }
    }
}

#[async_trait]
impl FunctionProvider for CachingFunctionProvider {
    async fn lookup(&self, name: &str) -> Option<FunctionDescriptor> {
        if let Some(entry) = self.entries.get(name) {
            if entry.cached_at.elapsed() < self.ttl {
                return entry.descriptor.clone();
            }
        }

        match self.store.get(name).await {
            Ok(descriptor) => {
                self.entries.insert(
                    name.to_owned(),
                    CacheEntry {
                        descriptor: descriptor.clone(),
                        cached_at: Instant::now(),
                    },
                );
                descriptor
            }
            Err(e) => {
                // Store errors are not cached; the next lookup retries.
                tracing::warn!(function = %name, error = %e, "function store lookup failed");
                None
            }
        }
    }
}
