//! Run context: a mutable mapping from dotted keys to JSON values.
//!
//! Owned by the driver. Fan-out branches traverse a snapshot; their
//! `ContextUpdates` are merged back only at the fan-in join, winner last so
//! collisions resolve toward the elected branch.

use std::collections::BTreeMap;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// Context key populated by fan-in joins with the winning branch ID.
pub const KEY_FAN_IN_BEST_ID: &str = "parallel.fan_in.best_id";

/// Process-local run context. Cheap to snapshot; the cancellation token is
/// shared across snapshots so a caller abort reaches every branch.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    values: BTreeMap<String, Value>,
    cancel: CancellationToken,
}

impl RunContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancel(cancel: CancellationToken) -> Self {
        RunContext {
            values: BTreeMap::new(),
            cancel,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// String rendering used by edge-condition comparison: JSON strings
    /// compare by their content, other values by their JSON text.
    pub fn get_string(&self, key: &str) -> Option<String> {
        self.values.get(key).map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    /// Merges a stage's `ContextUpdates` into the live context.
    pub fn merge(&mut self, updates: &BTreeMap<String, Value>) {
        for (key, value) in updates {
            self.values.insert(key.clone(), value.clone());
        }
    }

    /// Per-branch snapshot for fan-out: same cancellation token, copied values.
    pub fn snapshot(&self) -> RunContext {
        self.clone()
    }

    pub fn values(&self) -> &BTreeMap<String, Value> {
        &self.values
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// **Scenario**: Updates merge in and snapshots do not leak writes back to the parent.
    #[test]
    fn merge_and_snapshot_isolation() {
        let mut ctx = RunContext::new();
        ctx.set("phase", json!("build"));

        let mut branch = ctx.snapshot();
        branch.set("phase", json!("branch"));
        assert_eq!(ctx.get_string("phase").as_deref(), Some("build"));
        assert_eq!(branch.get_string("phase").as_deref(), Some("branch"));

        let mut updates = BTreeMap::new();
        updates.insert("failure_class".to_string(), json!("transient-infra"));
        ctx.merge(&updates);
        assert_eq!(ctx.get_string("failure_class").as_deref(), Some("transient-infra"));
    }

    /// **Scenario**: Cancellation propagates through snapshots via the shared token.
    #[test]
    fn cancellation_shared_across_snapshots() {
        let ctx = RunContext::new();
        let branch = ctx.snapshot();
        ctx.cancel_token().cancel();
        assert!(branch.is_cancelled());
    }
}
