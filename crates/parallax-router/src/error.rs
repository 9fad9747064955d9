//! Dispatch errors.

use thiserror::Error;

/// Why the balancer dropped a request instead of returning a target.
///
/// Nothing in the dispatch path retries; the frontend maps these to
/// HTTP statuses and the client decides what to do next.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BalanceError {
    #[error("request path is not an invocation: {0}")]
    NotAnInvocation(String),

    #[error("unknown function: {0}")]
    UnknownFunction(String),

    #[error("no target available for function: {0}")]
    NoAvailableTarget(String),
}
