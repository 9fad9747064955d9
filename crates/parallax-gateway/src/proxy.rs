//! Reverse proxy: forwards invocations to the chosen worker and feeds
//! the outcome back into the pipeline.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use http::header;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;

use crate::error::GatewayError;
use crate::feedback::FeedbackEvent;
use crate::server::AppState;
use parallax_router::balancer::INVOKE_PREFIX;
use parallax_router::metrics::unix_now;
use parallax_router::types::{
    Architecture, HEADER_FREE_MEM, HEADER_MAB_REQUEST_ID, HEADER_NODE_ARCH, HEADER_NODE_NAME,
};

/// Buffered upstream response.
struct UpstreamResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

/// `POST /invoke/<function>`: pick a target, proxy the request, and run
/// the response-side bookkeeping.
pub async fn invoke(
    State(state): State<Arc<AppState>>,
    Path(function): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, GatewayError> {
    let path = format!("{INVOKE_PREFIX}{function}");

    let mut upstream_headers = headers;
    let target = state.balancer.next(&path, &mut upstream_headers).await?;
    tracing::debug!(function = %function, node = %target.name, arch = %target.arch, "dispatching");

    let request_id = upstream_headers
        .get(HEADER_MAB_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_owned();

    let upstream = forward(
        &target.url,
        &path,
        &upstream_headers,
        body,
        state.upstream_timeout,
    )
    .await?;

    Ok(finish_response(&state, upstream, &path, &request_id))
}

/// POSTs the invocation to the worker and buffers the whole response.
/// Buffering gives the feedback task and the client each their own view
/// of the body; streaming it through would let whichever side reads
/// first starve the other.
async fn forward(
    base_url: &str,
    path: &str,
    headers: &HeaderMap,
    body: Bytes,
    timeout: Duration,
) -> Result<UpstreamResponse, GatewayError> {
    let uri: hyper::Uri = base_url
        .parse()
        .map_err(|e| GatewayError::InvalidBackendUrl(format!("{base_url}: {e}")))?;
    let host = uri
        .host()
        .ok_or_else(|| GatewayError::InvalidBackendUrl(format!("{base_url}: missing host")))?
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

    let mut builder = Request::builder().method(Method::POST).uri(path);
    for (key, value) in headers {
        // The body is re-framed below, so upstream framing headers are
        // regenerated rather than copied.
        if key != header::HOST
            && key != header::CONTENT_LENGTH
            && key != header::TRANSFER_ENCODING
        {
            builder = builder.header(key, value);
        }
    }
    builder = builder.header(header::HOST, authority.as_str());

    let request = builder
        .body(Full::new(body))
        .map_err(|e| GatewayError::RequestBuildFailed(e.to_string()))?;

    let response = tokio::time::timeout(timeout, sender.send_request(request))
        .await
        .map_err(|_| GatewayError::Timeout)?
        .map_err(|e| GatewayError::BackendError(e.to_string()))?;

    let status = response.status();
    let headers = response.headers().clone();
    let body = response
        .collect()
        .await
        .map_err(|e| GatewayError::BackendError(e.to_string()))?
        .to_bytes();

    Ok(UpstreamResponse {
        status,
        headers,
        body,
    })
}

/// Response-side bookkeeping: hand the buffered body to the feedback
/// worker, absorb the node's reported free memory, and strip the
/// internal headers before replying. The client keeps
/// `Serverledge-Node-Arch` so callers can see where they ran.
fn finish_response(
    state: &AppState,
    upstream: UpstreamResponse,
    path: &str,
    request_id: &str,
) -> Response {
    let arch = upstream
        .headers
        .get(HEADER_NODE_ARCH)
        .and_then(|v| v.to_str().ok())
        .and_then(Architecture::parse);

    let event = FeedbackEvent {
        body: upstream.body.clone(),
        path: path.to_owned(),
        arch,
        request_id: request_id.to_owned(),
    };
    if let Err(e) = state.feedback_tx.try_send(event) {
        tracing::warn!(error = %e, "feedback queue full, dropping bandit update");
    }

    let node_name = upstream
        .headers
        .get(HEADER_NODE_NAME)
        .and_then(|v| v.to_str().ok());
    let free_mem = upstream
        .headers
        .get(HEADER_FREE_MEM)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<i64>().ok());
    if let (Some(node), Some(free)) = (node_name, free_mem) {
        tracing::debug!(%node, free_mem_mb = free, "node reported free memory");
        state.metrics.update(node, free, 0, unix_now());
    }

    let mut headers = upstream.headers;
    headers.remove(HEADER_NODE_NAME);
    headers.remove(HEADER_FREE_MEM);
    headers.remove(HEADER_MAB_REQUEST_ID);
    // The buffered body is re-framed.
    headers.remove(header::CONTENT_LENGTH);
    headers.remove(header::TRANSFER_ENCODING);

    let mut response = Response::new(Body::from(upstream.body));
    *response.status_mut() = upstream.status;
    *response.headers_mut() = headers;
    response
}
