//! Transient storage of decision contexts keyed by request id.

use dashmap::DashMap;

use super::DecisionContext;

/// Holds each in-flight request's decision context until its completion
/// report arrives. A request that never completes leaves its entry
/// behind until process restart; at two floats per entry that is an
/// accepted cost.
#[derive(Debug, Default)]
pub struct ContextStorage {
    data: DashMap<String, DecisionContext>,
}

impl ContextStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, request_id: impl Into<String>, ctx: DecisionContext) {
        self.data.insert(request_id.into(), ctx);
    }

    /// Pops the context atomically; a second call for the same id gets
    /// nothing.
    pub fn retrieve_and_delete(&self, request_id: &str) -> Option<DecisionContext> {
        self.data.remove(request_id).map(|(_, ctx)| ctx)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Architecture;

    #[test]
    fn retrieve_consumes_the_entry() {
        let storage = ContextStorage::new();
        let mut ctx = DecisionContext::default();
        ctx.arch_mem_usage.insert(Architecture::Arm64, 0.4);

        storage.store("req-1", ctx.clone());
        assert_eq!(storage.len(), 1);

        assert_eq!(storage.retrieve_and_delete("req-1"), Some(ctx));
        assert!(storage.is_empty());
        assert_eq!(storage.retrieve_and_delete("req-1"), None);
    }

    #[test]
    fn unknown_id_returns_none() {
        let storage = ContextStorage::new();
        assert_eq!(storage.retrieve_and_delete("missing"), None);
    }
}
