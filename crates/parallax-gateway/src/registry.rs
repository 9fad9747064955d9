//! Node registry and status-probe clients.

use std::time::Duration;

use async_trait::async_trait;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{header, Method, Request};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::net::TcpStream;

use crate::config::StaticNodeConfig;
use crate::error::GatewayError;
use parallax_router::types::{Architecture, NodeStatus, ProxyTarget};
use parallax_router::StatusProber;

/// A node as advertised by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NodeRegistration {
    #[serde(rename = "Key")]
    pub key: String,
    #[serde(rename = "APIUrl")]
    pub api_url: String,
    #[serde(rename = "Arch")]
    pub arch: Architecture,
}

impl NodeRegistration {
    pub fn to_target(&self) -> ProxyTarget {
        ProxyTarget::new(
            self.key.clone(),
            self.api_url.trim_end_matches('/').to_owned(),
            self.arch,
        )
    }
}

/// Enumerates the worker nodes of an area.
#[async_trait]
pub trait NodeRegistry: Send + Sync {
    async fn nodes_in_area(&self, region: &str) -> Result<Vec<NodeRegistration>, GatewayError>;
}

/// Registry fixed at configuration time.
#[derive(Debug, Clone, Default)]
pub struct StaticNodeRegistry {
    nodes: Vec<NodeRegistration>,
}

impl StaticNodeRegistry {
    pub fn new(nodes: &[StaticNodeConfig]) -> Self {
        Self {
            nodes: nodes
                .iter()
                .map(|n| NodeRegistration {
                    key: n.name.clone(),
                    api_url: n.url.clone(),
                    arch: n.arch,
                })
                .collect(),
        }
    }
}

#[async_trait]
impl NodeRegistry for StaticNodeRegistry {
    async fn nodes_in_area(&self, _region: &str) -> Result<Vec<NodeRegistration>, GatewayError> {
        Ok(self.nodes.clone())
    }
}

/// Registry behind an HTTP discovery endpoint returning the area's node
/// list as JSON.
#[derive(Debug, Clone)]
pub struct HttpNodeRegistry {
    endpoint: String,
    timeout: Duration,
}

impl HttpNodeRegistry {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            timeout,
        }
    }
}

#[async_trait]
impl NodeRegistry for HttpNodeRegistry {
    async fn nodes_in_area(&self, region: &str) -> Result<Vec<NodeRegistration>, GatewayError> {
        let url = format!("{}?area={}", self.endpoint.trim_end_matches('/'), region);
        http_get_json(&url, self.timeout)
            .await
            .map_err(|e| GatewayError::Registry(e.to_string()))
    }
}

/// Probes `<node>/status` with a short timeout. Failures degrade to
/// `None`; the caller treats the node's metrics as uninitialised.
#[derive(Debug, Clone)]
pub struct HttpStatusProber {
    timeout: Duration,
}

impl HttpStatusProber {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl StatusProber for HttpStatusProber {
    async fn status(&self, target: &ProxyTarget) -> Option<NodeStatus> {
        let url = format!("{}/status", target.url);
        match http_get_json::<NodeStatus>(&url, self.timeout).await {
            Ok(status) => Some(status),
            Err(e) => {
                tracing::warn!(node = %target.name, error = %e, "status probe failed");
                None
            }
        }
    }
}

/// GETs a URL and decodes the JSON body. One connection per call; the
/// registry and probe endpoints are hit at most every few seconds.
pub(crate) async fn http_get_json<T: DeserializeOwned>(
    url: &str,
    timeout: Duration,
) -> Result<T, GatewayError> {
    let uri: hyper::Uri = url
        .parse()
        .map_err(|e| GatewayError::InvalidBackendUrl(format!("{url}: {e}")))?;
    let host = uri
        .host()
        .ok_or_else(|| GatewayError::InvalidBackendUrl(format!("{url}: missing host")))?
        .to_owned();
    let port = uri.port_u16().unwrap_or(80);
    let authority = format!("{host}:{port}");

    let stream = tokio::time::timeout(timeout, TcpStream::connect(&authority))
        .await
        .map_err(|_| GatewayError::Timeout)?
        .map_err(|e| GatewayError::ConnectionFailed(e.to_string()))?;

    let io = TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(|e| GatewayError::ConnectionFailed(e.to_string()))?;

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            tracing::warn!(error = %e, "HTTP connection error");
        }
    });

    let path_and_query = uri
        .path_and_query()
        .map_or("/", |pq| pq.as_str())
        .to_owned();
    let request = Request::builder()
        .method(Method::GET)
        .uri(path_and_query)
        .header(header::HOST, authority.as_str())
        .body(Full::new(Bytes::new()))
        .map_err(|e| GatewayError::RequestBuildFailed(e.to_string()))?;

    let response = tokio::time::timeout(timeout, sender.send_request(request))
        .await
        .map_err(|_| GatewayError::Timeout)?
        .map_err(|e| GatewayError::BackendError(e.to_string()))?;

    if !response.status().is_success() {
        return Err(GatewayError::BackendError(format!(
            "{url} returned {}",
            response.status()
        )));
    }

    let body = response
        .collect()
        .await
        .map_err(|e| GatewayError::BackendError(e.to_string()))?
        .to_bytes();

    serde_json::from_slice(&body)
        .map_err(|e| GatewayError::BackendError(format!("undecodable body from {url}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_decodes_registry_json() {
        let nodes: Vec<NodeRegistration> = serde_json::from_str(
            r#"[
                {"Key": "edge-arm-1", "APIUrl": "http://10.0.0.1:1323/", "Arch": "arm64"},
                {"Key": "edge-x86-1", "APIUrl": "http://10.0.0.2:1323", "Arch": "amd64"}
            ]"#,
        )
        .unwrap();

        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].arch, Architecture::Arm64);

        let target = nodes[0].to_target();
        assert_eq!(target.name, "edge-arm-1");
        // Trailing slashes would break path concatenation downstream.
        assert_eq!(target.url, "http://10.0.0.1:1323");
    }

    #[tokio::test]
    async fn static_registry_returns_configured_nodes() {
        let registry = StaticNodeRegistry::new(&[StaticNodeConfig {
            name: "arm1".into(),
            url: "http://10.0.0.1:1323".into(),
            arch: Architecture::Arm64,
        }]);

        let nodes = registry.nodes_in_area("default").await.unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].key, "arm1");
    }
}
