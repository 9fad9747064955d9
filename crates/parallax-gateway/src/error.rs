//! Gateway error types.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use parallax_router::BalanceError;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("function not found: {0}")]
    FunctionNotFound(String),

    #[error("not an invocation path: {0}")]
    NotAnInvocation(String),

    #[error("no target available for function: {0}")]
    NoAvailableTarget(String),

    #[error("invalid backend URL: {0}")]
    InvalidBackendUrl(String),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("request build failed: {0}")]
    RequestBuildFailed(String),

    #[error("backend error: {0}")]
    BackendError(String),

    #[error("registry error: {0}")]
    Registry(String),

    #[error("invalid execution report: {0}")]
    InvalidReport(String),

    #[error("request timeout")]
    Timeout,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::FunctionNotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::NotAnInvocation(_) => StatusCode::BAD_REQUEST,
            GatewayError::NoAvailableTarget(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::ConnectionFailed(_) | GatewayError::BackendError(_) => {
                StatusCode::BAD_GATEWAY
            }
            GatewayError::Config(_)
            | GatewayError::InvalidBackendUrl(_)
            | GatewayError::RequestBuildFailed(_)
            | GatewayError::Registry(_)
            | GatewayError::InvalidReport(_)
            | GatewayError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<BalanceError> for GatewayError {
    fn from(err: BalanceError) -> Self {
        match err {
            BalanceError::NotAnInvocation(path) => Self::NotAnInvocation(path),
            BalanceError::UnknownFunction(name) => Self::FunctionNotFound(name),
            BalanceError::NoAvailableTarget(name) => Self::NoAvailableTarget(name),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // Only balancer outcomes are safe to spell out for callers;
        // everything upstream-side stays generic.
        let message = match &self {
            GatewayError::FunctionNotFound(name) => format!("function not found: {name}"),
            GatewayError::NotAnInvocation(path) => format!("not an invocation path: {path}"),
            GatewayError::NoAvailableTarget(name) => {
                format!("no target available for function: {name}")
            }
            GatewayError::Timeout => "request timeout".to_owned(),
            GatewayError::ConnectionFailed(_) | GatewayError::BackendError(_) => {
                "bad gateway".to_owned()
            }
            GatewayError::Config(_)
            | GatewayError::InvalidBackendUrl(_)
            | GatewayError::RequestBuildFailed(_)
            | GatewayError::Registry(_)
            | GatewayError::InvalidReport(_)
            | GatewayError::Io(_) => "internal server error".to_owned(),
        };

        (status, message).into_response()
    }
}
