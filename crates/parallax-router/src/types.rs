//! Shared types of the dispatch pipeline.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Request header carrying the per-dispatch bandit request id, stamped
/// by the balancer and echoed back by the worker.
pub const HEADER_MAB_REQUEST_ID: &str = "Serverledge-MAB-Request-ID";
/// Response header naming the worker node that executed the function.
pub const HEADER_NODE_NAME: &str = "Serverledge-Node-Name";
/// Response header with the worker's CPU architecture.
pub const HEADER_NODE_ARCH: &str = "Serverledge-Node-Arch";
/// Response header with the worker's free memory in MB after execution.
pub const HEADER_FREE_MEM: &str = "Serverledge-Free-Mem";

/// CPU architecture of a worker node.
///
/// Wire names follow the container ecosystem: `amd64` and `arm64`.
/// The derived ordering (amd64 first) is the canonical tie-break order
/// wherever a deterministic choice between equal scores is needed.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum Architecture {
    #[serde(rename = "amd64")]
    Amd64,
    #[serde(rename = "arm64")]
    Arm64,
}

impl Architecture {
    /// Every architecture the platform schedules on.
    pub const ALL: [Self; 2] = [Self::Amd64, Self::Arm64];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Amd64 => "amd64",
            Self::Arm64 => "arm64",
        }
    }

    /// The other architecture of the pair.
    pub const fn other(self) -> Self {
        match self {
            Self::Amd64 => Self::Arm64,
            Self::Arm64 => Self::Amd64,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "amd64" => Some(Self::Amd64),
            "arm64" => Some(Self::Arm64),
            _ => None,
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One worker node as seen by the balancer. Immutable once created;
/// membership changes go through add/remove by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyTarget {
    /// Unique, stable node name (the registry key).
    pub name: String,
    /// Base URL of the node's API, without a trailing slash.
    pub url: String,
    pub arch: Architecture,
}

impl ProxyTarget {
    pub fn new(name: impl Into<String>, url: impl Into<String>, arch: Architecture) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            arch,
        }
    }
}

/// Function descriptor consumed at dispatch time. Owned by the function
/// store; the balancer only reads it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDescriptor {
    pub name: String,
    /// Memory demand of one invocation, in MB. Always positive.
    pub memory_mb: i64,
    pub supported_archs: Vec<Architecture>,
    pub runtime: String,
}

impl FunctionDescriptor {
    pub fn supports(&self, arch: Architecture) -> bool {
        self.supported_archs.contains(&arch)
    }
}

/// Snapshot returned by a worker's `/status` endpoint. Only the fields
/// the router consumes; workers report more.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    #[serde(rename = "TotalMemory")]
    pub total_memory: i64,
    #[serde(rename = "UsedMemory")]
    pub used_memory: i64,
    #[serde(rename = "LastUpdateTime")]
    pub last_update_time: i64,
}
