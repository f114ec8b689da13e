//! Structured content database collaborator interface.
//!
//! The engine projects normalized tool-call turns into an external store with
//! at-least-once semantics. Append failures are warning-only: the run never
//! fails because the content database is down.

use async_trait::async_trait;
use serde_json::Value;

/// Record type written for tool-call start events.
pub const TYPE_TOOL_CALL: &str = "com.kilroy.attractor.ToolCall";
/// Record type written for tool-call end events.
pub const TYPE_TOOL_RESULT: &str = "com.kilroy.attractor.ToolResult";

/// Identifier and timestamp assigned by the store.
#[derive(Debug, Clone)]
pub struct AppendReceipt {
    pub id: String,
    pub ts: u64,
}

/// Narrow seam to the external content database.
#[async_trait]
pub trait ContentDb: Send + Sync {
    async fn append(
        &self,
        type_name: &str,
        schema_version: u32,
        payload: &Value,
    ) -> Result<AppendReceipt, String>;
}

/// Discards all records; used when no content database is configured.
#[derive(Debug, Default)]
pub struct NullContentDb;

#[async_trait]
impl ContentDb for NullContentDb {
    async fn append(
        &self,
        _type_name: &str,
        _schema_version: u32,
        _payload: &Value,
    ) -> Result<AppendReceipt, String> {
        Ok(AppendReceipt {
            id: "null".to_string(),
            ts: 0,
        })
    }
}

/// Collects records in memory; used by tests to assert projections.
#[derive(Debug, Default)]
pub struct MemoryContentDb {
    records: std::sync::Mutex<Vec<(String, u32, Value)>>,
}

impl MemoryContentDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<(String, u32, Value)> {
        self.records
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

#[async_trait]
impl ContentDb for MemoryContentDb {
    async fn append(
        &self,
        type_name: &str,
        schema_version: u32,
        payload: &Value,
    ) -> Result<AppendReceipt, String> {
        let mut records = self.records.lock().unwrap_or_else(|p| p.into_inner());
        records.push((type_name.to_string(), schema_version, payload.clone()));
        Ok(AppendReceipt {
            id: format!("mem-{}", records.len()),
            ts: records.len() as u64,
        })
    }
}
