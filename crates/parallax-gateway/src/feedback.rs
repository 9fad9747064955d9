//! Asynchronous bandit feedback, decoupled from the client response
//! path by a bounded channel so model updates never add latency to the
//! caller.

use std::sync::Arc;

use bytes::Bytes;
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::error::GatewayError;
use parallax_router::balancer::extract_function_name;
use parallax_router::mab::{BanditManager, ContextStorage};
use parallax_router::types::Architecture;

/// Outcome data the response path captures for one dispatch.
#[derive(Debug, Clone)]
pub struct FeedbackEvent {
    /// Buffered copy of the worker's response body.
    pub body: Bytes,
    /// Invocation path, `/invoke/<function>`.
    pub path: String,
    /// Architecture reported by the worker, if any.
    pub arch: Option<Architecture>,
    /// Request id stamped at dispatch; empty when the dispatch never
    /// went through a bandit.
    pub request_id: String,
}

/// Worker response body, reduced to the fields learning needs.
#[derive(Debug, Deserialize)]
struct InvocationReport {
    #[serde(rename = "ExecutionReport")]
    execution_report: ExecutionReport,
    #[serde(rename = "IsWarmStart", default)]
    is_warm_start: bool,
}

#[derive(Debug, Deserialize)]
struct ExecutionReport {
    /// Execution time in seconds.
    #[serde(rename = "Duration")]
    duration: f64,
}

/// Spawns the worker task draining feedback events into bandit state.
pub fn spawn_feedback_worker(
    bandits: Arc<BanditManager>,
    contexts: Arc<ContextStorage>,
    mut rx: mpsc::Receiver<FeedbackEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if let Err(e) = apply(&bandits, &contexts, event) {
                tracing::warn!(error = %e, "failed to update bandit");
            }
        }
        tracing::debug!("feedback worker stopped");
    })
}

/// Applies one completion report to the matching function's bandit.
pub fn apply(
    bandits: &BanditManager,
    contexts: &ContextStorage,
    event: FeedbackEvent,
) -> Result<(), GatewayError> {
    if event.request_id.is_empty() {
        // Single-architecture or round-robin dispatch: the bandit never
        // played, so there is nothing to learn and nothing to redact.
        return Ok(());
    }

    let arch = event.arch.ok_or_else(|| {
        GatewayError::InvalidReport("missing Serverledge-Node-Arch header".into())
    })?;
    let function = extract_function_name(&event.path).ok_or_else(|| {
        GatewayError::InvalidReport(format!("no function name in path {}", event.path))
    })?;
    let report: InvocationReport = serde_json::from_slice(&event.body)
        .map_err(|e| GatewayError::InvalidReport(format!("unparsable execution report: {e}")))?;

    if report.execution_report.duration <= 0.0 {
        return Err(GatewayError::InvalidReport(format!(
            "invalid execution duration: {}s",
            report.execution_report.duration
        )));
    }
    let duration_ms = report.execution_report.duration * 1000.0;

    let ctx = contexts.retrieve_and_delete(&event.request_id);
    let policy = bandits.get(function);
    policy.update_reward(arch, ctx.as_ref(), report.is_warm_start, duration_ms);

    tracing::debug!(
        %function,
        arch = %arch,
        warm = report.is_warm_start,
        duration_ms,
        "bandit updated"
    );
    Ok(())
}
