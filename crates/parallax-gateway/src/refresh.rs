//! Periodic reconciliation of the target set against the registry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::registry::{NodeRegistration, NodeRegistry};
use parallax_router::metrics::NodeMetricCache;
use parallax_router::{ArchAwareBalancer, StatusProber};

/// Wakes every `interval`, diffs the registry's node set against the
/// known one, applies adds and removals to the balancer, and re-probes
/// kept nodes so their memory metrics stay fresh between in-band
/// reports.
#[allow(clippy::too_many_arguments)]
pub async fn run_refresher(
    balancer: Arc<ArchAwareBalancer>,
    registry: Arc<dyn NodeRegistry>,
    prober: Arc<dyn StatusProber>,
    metrics: Arc<NodeMetricCache>,
    region: String,
    interval: Duration,
    initial: Vec<NodeRegistration>,
    cancel: CancellationToken,
) {
    let mut known: HashMap<String, NodeRegistration> = initial
        .into_iter()
        .map(|node| (node.key.clone(), node))
        .collect();

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(interval) => {}
        }
        tracing::debug!("periodic target refresh");

        let nodes = match registry.nodes_in_area(&region).await {
            Ok(nodes) => nodes,
            Err(e) => {
                // Keep the current target set; wiping it on a registry
                // hiccup would drop every node from the balancer.
                tracing::warn!(error = %e, "cannot refresh targets");
                continue;
            }
        };
        let fresh: HashMap<String, NodeRegistration> = nodes
            .into_iter()
            .map(|node| (node.key.clone(), node))
            .collect();

        for (name, node) in &fresh {
            if known.contains_key(name) {
                let target = node.to_target();
                if let Some(status) = prober.status(&target).await {
                    metrics.update(
                        name,
                        status.total_memory - status.used_memory,
                        status.total_memory,
                        status.last_update_time,
                    );
                }
            } else {
                tracing::info!(node = %name, "adding target");
                balancer.add_target(node.to_target()).await;
            }
        }

        for name in known.keys() {
            if !fresh.contains_key(name) {
                tracing::info!(node = %name, "removing target");
                balancer.remove_target(name);
            }
        }

        known = fresh;
    }

    tracing::debug!("refresher stopped");
}
