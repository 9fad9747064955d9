//! Router configuration: TOML file plus environment overrides.
//!
//! The recognised environment keys mirror the platform's configuration
//! names (`REPLICAS`, `LB_MODE`, `MAB_POLICY`, ...) and take precedence
//! over the file.

use std::collections::HashMap;
use std::path::Path;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::Deserialize;
use thiserror::Error;

use parallax_router::mab::PolicyKind;
use parallax_router::types::Architecture;
use parallax_router::LbMode;

/// Default configuration file next to the binary.
pub const DEFAULT_CONFIG_PATH: &str = "parallax.toml";

/// Environment variables recognised as overrides, matched
/// case-insensitively against these field names.
const ENV_KEYS: [&str; 8] = [
    "replicas",
    "lb_mode",
    "mab_policy",
    "mab_linucb_alpha",
    "ucb1_c",
    "lb_refresh_interval",
    "api_port",
    "region",
];

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("configuration error: {0}")]
    Figment(Box<figment::Error>),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouterConfig {
    /// Virtual replicas per node on each hash ring.
    #[serde(default = "default_replicas")]
    pub replicas: usize,

    /// Architecture-selection mode.
    #[serde(default)]
    pub lb_mode: LbMode,

    /// Bandit algorithm for functions that run on both architectures.
    #[serde(default)]
    pub mab_policy: PolicyKind,

    /// LinUCB exploration parameter.
    #[serde(default = "default_linucb_alpha")]
    pub mab_linucb_alpha: f64,

    /// UCB1 exploration constant.
    #[serde(default = "default_ucb1_c")]
    pub ucb1_c: f64,

    /// Seconds between registry reconciliations.
    #[serde(default = "default_refresh_interval")]
    pub lb_refresh_interval: u64,

    /// Port the proxy listens on.
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Registry area whose nodes this router serves.
    #[serde(default = "default_region")]
    pub region: String,

    /// Where the node set comes from.
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Known functions, keyed by name.
    #[serde(default)]
    pub functions: HashMap<String, FunctionConfig>,

    /// Timeout for the `/status` probe of a single node, in seconds.
    #[serde(default = "default_status_timeout")]
    pub status_timeout_secs: u64,

    /// Timeout for proxied invocations and registry calls, in seconds.
    #[serde(default = "default_upstream_timeout")]
    pub upstream_timeout_secs: u64,

    /// TTL of the function-descriptor read-through cache, in seconds.
    #[serde(default = "default_function_cache_ttl")]
    pub function_cache_ttl_secs: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            replicas: default_replicas(),
            lb_mode: LbMode::default(),
            mab_policy: PolicyKind::default(),
            mab_linucb_alpha: default_linucb_alpha(),
            ucb1_c: default_ucb1_c(),
            lb_refresh_interval: default_refresh_interval(),
            api_port: default_api_port(),
            region: default_region(),
            registry: RegistryConfig::default(),
            functions: HashMap::new(),
            status_timeout_secs: default_status_timeout(),
            upstream_timeout_secs: default_upstream_timeout(),
            function_cache_ttl_secs: default_function_cache_ttl(),
        }
    }
}

impl RouterConfig {
    /// Loads configuration from the default path.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Loads configuration from a TOML file, letting the recognised
    /// environment variables override file values.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::raw().only(&ENV_KEYS))
            .extract::<Self>()
            .map_err(ConfigError::from)
    }

    /// Parses configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Figment::new()
            .merge(Toml::string(content))
            .extract::<Self>()
            .map_err(ConfigError::from)
    }
}

/// Node-set source.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum RegistryConfig {
    /// Nodes listed directly in the configuration (dev and tests).
    Static {
        #[serde(default)]
        nodes: Vec<StaticNodeConfig>,
    },
    /// HTTP discovery endpoint serving the registry's node list.
    Discovery { endpoint: String },
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self::Static { nodes: Vec::new() }
    }
}

/// One statically configured node.
#[derive(Debug, Clone, Deserialize)]
pub struct StaticNodeConfig {
    pub name: String,
    pub url: String,
    pub arch: Architecture,
}

/// One configured function.
#[derive(Debug, Clone, Deserialize)]
pub struct FunctionConfig {
    /// Memory demand of one invocation, in MB.
    pub memory_mb: i64,

    /// Runtime environment the function is packaged for.
    #[serde(default = "default_runtime")]
    pub runtime: String,

    /// Architectures the function runs on. When omitted, resolved from
    /// the runtime catalogue or by introspecting the image.
    #[serde(default)]
    pub supported_archs: Option<Vec<Architecture>>,

    /// Container image for `custom`-runtime functions.
    #[serde(default)]
    pub image: Option<String>,
}

const fn default_replicas() -> usize {
    16
}

fn default_linucb_alpha() -> f64 {
    0.1
}

fn default_ucb1_c() -> f64 {
    std::f64::consts::SQRT_2
}

const fn default_refresh_interval() -> u64 {
    30
}

const fn default_api_port() -> u16 {
    1323
}

fn default_region() -> String {
    "default".to_owned()
}

const fn default_status_timeout() -> u64 {
    5
}

const fn default_upstream_timeout() -> u64 {
    30
}

const fn default_function_cache_ttl() -> u64 {
    60
}

fn default_runtime() -> String {
    "custom".to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_platform_conventions() {
        let config = RouterConfig::parse("").unwrap();
        assert_eq!(config.replicas, 16);
        assert_eq!(config.lb_mode, LbMode::Mab);
        assert_eq!(config.mab_policy, PolicyKind::Ucb1);
        assert!((config.mab_linucb_alpha - 0.1).abs() < f64::EPSILON);
        assert_eq!(config.lb_refresh_interval, 30);
        assert_eq!(config.api_port, 1323);
        assert!(config.functions.is_empty());
        assert!(matches!(
            config.registry,
            RegistryConfig::Static { ref nodes } if nodes.is_empty()
        ));
    }

    #[test]
    fn parses_modes_and_policies() {
        let config = RouterConfig::parse(
            r#"
                lb_mode = "RoundRobin"
                mab_policy = "LinUCB"
                mab_linucb_alpha = 0.5
                ucb1_c = 3.0
            "#,
        )
        .unwrap();
        assert_eq!(config.lb_mode, LbMode::RoundRobin);
        assert_eq!(config.mab_policy, PolicyKind::LinUcb);
        assert!((config.mab_linucb_alpha - 0.5).abs() < f64::EPSILON);
        assert!((config.ucb1_c - 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn parses_static_registry_and_functions() {
        let config = RouterConfig::parse(
            r#"
                api_port = 9000

                [registry]
                mode = "static"
                nodes = [
                    { name = "arm1", url = "http://10.0.0.1:1323", arch = "arm64" },
                    { name = "x86_1", url = "http://10.0.0.2:1323", arch = "amd64" },
                ]

                [functions.resize]
                memory_mb = 256
                runtime = "python314"

                [functions.transcode]
                memory_mb = 512
                runtime = "custom"
                image = "registry.local/transcode:3"
                supported_archs = ["amd64"]
            "#,
        )
        .unwrap();

        assert_eq!(config.api_port, 9000);
        match &config.registry {
            RegistryConfig::Static { nodes } => {
                assert_eq!(nodes.len(), 2);
                assert_eq!(nodes[0].arch, Architecture::Arm64);
            }
            _ => panic!("expected static registry"),
        }

        let resize = &config.functions["resize"];
        assert_eq!(resize.memory_mb, 256);
        assert!(resize.supported_archs.is_none());

        let transcode = &config.functions["transcode"];
        assert_eq!(
            transcode.supported_archs.as_deref(),
            Some(&[Architecture::Amd64][..])
        );
        assert_eq!(transcode.image.as_deref(), Some("registry.local/transcode:3"));
    }

    #[test]
    fn parses_discovery_registry() {
        let config = RouterConfig::parse(
            r#"
                [registry]
                mode = "discovery"
                endpoint = "http://registry.local:2379/nodes"
            "#,
        )
        .unwrap();
        match &config.registry {
            RegistryConfig::Discovery { endpoint } => {
                assert_eq!(endpoint, "http://registry.local:2379/nodes");
            }
            _ => panic!("expected discovery registry"),
        }
    }
}
