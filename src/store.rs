//! Persistence seam.
//!
//! The durable store lives outside this crate; the runtime core only relies
//! on the transactional operations declared here. [`MemoryStore`] is the
//! in-process implementation used by the dev server and the test suites; it
//! serialises every mutation behind one mutex, which gives the same
//! atomicity the production store provides with conditional SQL updates.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,

    /// The target row disappeared between read and write
    #[error("row no longer exists")]
    Gone,

    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Write-ahead record of one workflow operation, used for audit/replay.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationRecord {
    pub operation: String,
    pub target: String,
    pub payload: Value,
    /// Client-stamped milliseconds
    pub timestamp: i64,
    pub user_id: String,
}

/// One `user_rate_limits` row.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitRecord {
    pub reference_id: String,
    pub sync_api_requests: u64,
    pub async_api_requests: u64,
    pub api_endpoint_requests: u64,
    pub window_start: DateTime<Utc>,
    pub last_request_at: DateTime<Utc>,
    pub is_rate_limited: bool,
    pub rate_limit_reset_at: Option<DateTime<Utc>>,
}

/// Which of the three counters a request consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterKind {
    Sync,
    Async,
    ApiEndpoint,
}

impl RateLimitRecord {
    fn fresh(key: &str, now: DateTime<Utc>) -> Self {
        Self {
            reference_id: key.to_string(),
            sync_api_requests: 0,
            async_api_requests: 0,
            api_endpoint_requests: 0,
            window_start: now,
            last_request_at: now,
            is_rate_limited: false,
            rate_limit_reset_at: None,
        }
    }

    pub fn counter(&self, kind: CounterKind) -> u64 {
        match kind {
            CounterKind::Sync => self.sync_api_requests,
            CounterKind::Async => self.async_api_requests,
            CounterKind::ApiEndpoint => self.api_endpoint_requests,
        }
    }

    fn counter_mut(&mut self, kind: CounterKind) -> &mut u64 {
        match kind {
            CounterKind::Sync => &mut self.sync_api_requests,
            CounterKind::Async => &mut self.async_api_requests,
            CounterKind::ApiEndpoint => &mut self.api_endpoint_requests,
        }
    }
}

/// Committed outcome of one atomic consume.
#[derive(Debug, Clone, Copy)]
pub struct ConsumedWindow {
    pub count: u64,
    pub window_start: DateTime<Utc>,
}

/// Transactional operations the runtime core invokes against the store.
#[async_trait::async_trait]
pub trait WorkflowStore: Send + Sync {
    async fn workflow_exists(&self, workflow_id: &str) -> Result<bool, StoreError>;

    /// Snapshot handed to clients on join/sync.
    async fn workflow_state(&self, workflow_id: &str) -> Result<Value, StoreError>;

    /// Persist one workflow operation (mutation plus audit row) atomically.
    async fn record_operation(
        &self,
        workflow_id: &str,
        record: &OperationRecord,
    ) -> Result<(), StoreError>;

    /// Merge one sub-block value into the block's `subBlocks` container,
    /// preserving sibling fields and creating the slot when missing.
    /// Fails with [`StoreError::Gone`] when the block vanished.
    async fn update_subblock(
        &self,
        workflow_id: &str,
        block_id: &str,
        subblock_id: &str,
        value: Value,
    ) -> Result<(), StoreError>;

    /// Merge one field into an existing variable, preserving sibling fields.
    /// Fails with [`StoreError::Gone`] when the variable vanished.
    async fn update_variable(
        &self,
        workflow_id: &str,
        variable_id: &str,
        field: &str,
        value: Value,
    ) -> Result<(), StoreError>;

    /// Conditional reset-or-increment of one counter, committed atomically:
    /// if the stored window has expired at commit time all three counters
    /// and `window_start` reset together, otherwise the selected counter is
    /// incremented. Returns the committed count and window.
    async fn rate_limit_consume(
        &self,
        key: &str,
        counter: CounterKind,
        now: DateTime<Utc>,
        window_ms: i64,
    ) -> Result<ConsumedWindow, StoreError>;

    async fn rate_limit_read(&self, key: &str) -> Result<Option<RateLimitRecord>, StoreError>;

    async fn rate_limit_mark_limited(
        &self,
        key: &str,
        reset_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn rate_limit_reset(&self, key: &str) -> Result<(), StoreError>;
}

// ============================================================================
// In-memory implementation
// ============================================================================

#[derive(Debug, Default, Clone)]
struct BlockRow {
    sub_blocks: serde_json::Map<String, Value>,
    updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Clone)]
struct WorkflowRow {
    variables: serde_json::Map<String, Value>,
    blocks: HashMap<String, BlockRow>,
    updated_at: Option<DateTime<Utc>>,
    operations: Vec<OperationRecord>,
}

/// Process-local store. The write counter makes "no storage write happened"
/// observable to tests.
#[derive(Default)]
pub struct MemoryStore {
    workflows: Mutex<HashMap<String, WorkflowRow>>,
    rate: Mutex<HashMap<String, RateLimitRecord>>,
    writes: AtomicUsize,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn workflow_rows(&self) -> std::sync::MutexGuard<'_, HashMap<String, WorkflowRow>> {
        self.workflows
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn rate_rows(&self) -> std::sync::MutexGuard<'_, HashMap<String, RateLimitRecord>> {
        self.rate
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn create_workflow(&self, workflow_id: &str) {
        self.workflow_rows()
            .entry(workflow_id.to_string())
            .or_default();
    }

    pub fn add_block(&self, workflow_id: &str, block_id: &str) {
        let mut workflows = self.workflow_rows();
        let row = workflows.entry(workflow_id.to_string()).or_default();
        row.blocks.entry(block_id.to_string()).or_default();
    }

    pub fn remove_block(&self, workflow_id: &str, block_id: &str) {
        if let Some(row) = self.workflow_rows().get_mut(workflow_id) {
            row.blocks.remove(block_id);
        }
    }

    pub fn add_variable(&self, workflow_id: &str, variable_id: &str, variable: Value) {
        let mut workflows = self.workflow_rows();
        let row = workflows.entry(workflow_id.to_string()).or_default();
        row.variables.insert(variable_id.to_string(), variable);
    }

    pub fn remove_workflow(&self, workflow_id: &str) {
        self.workflow_rows().remove(workflow_id);
    }

    pub fn subblock_value(&self, workflow_id: &str, block_id: &str, subblock_id: &str) -> Option<Value> {
        self.workflow_rows()
            .get(workflow_id)?
            .blocks
            .get(block_id)?
            .sub_blocks
            .get(subblock_id)
            .cloned()
    }

    pub fn variable(&self, workflow_id: &str, variable_id: &str) -> Option<Value> {
        self.workflow_rows()
            .get(workflow_id)?
            .variables
            .get(variable_id)
            .cloned()
    }

    pub fn operations(&self, workflow_id: &str) -> Vec<OperationRecord> {
        self.workflow_rows()
            .get(workflow_id)
            .map(|row| row.operations.clone())
            .unwrap_or_default()
    }

    /// Number of committed writes (operations, sub-block and variable
    /// merges). Reads never bump it.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Simulate a storage outage: every operation fails with
    /// [`StoreError::Unavailable`] until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("storage offline".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait::async_trait]
impl WorkflowStore for MemoryStore {
    async fn workflow_exists(&self, workflow_id: &str) -> Result<bool, StoreError> {
        self.check_available()?;
        Ok(self.workflow_rows().contains_key(workflow_id))
    }

    async fn workflow_state(&self, workflow_id: &str) -> Result<Value, StoreError> {
        self.check_available()?;
        let workflows = self.workflow_rows();
        let row = workflows.get(workflow_id).ok_or(StoreError::NotFound)?;

        let blocks: serde_json::Map<String, Value> = row
            .blocks
            .iter()
            .map(|(id, block)| {
                (
                    id.clone(),
                    json!({"id": id, "subBlocks": block.sub_blocks}),
                )
            })
            .collect();

        Ok(json!({
            "id": workflow_id,
            "variables": row.variables,
            "blocks": blocks,
        }))
    }

    async fn record_operation(
        &self,
        workflow_id: &str,
        record: &OperationRecord,
    ) -> Result<(), StoreError> {
        self.check_available()?;
        let mut workflows = self.workflow_rows();
        let row = workflows.get_mut(workflow_id).ok_or(StoreError::NotFound)?;
        row.operations.push(record.clone());
        row.updated_at = Some(Utc::now());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn update_subblock(
        &self,
        workflow_id: &str,
        block_id: &str,
        subblock_id: &str,
        value: Value,
    ) -> Result<(), StoreError> {
        self.check_available()?;
        let mut workflows = self.workflow_rows();
        let row = workflows.get_mut(workflow_id).ok_or(StoreError::NotFound)?;
        let block = row.blocks.get_mut(block_id).ok_or(StoreError::Gone)?;

        match block.sub_blocks.get_mut(subblock_id) {
            Some(Value::Object(existing)) => {
                existing.insert("value".to_string(), value);
            }
            _ => {
                block
                    .sub_blocks
                    .insert(subblock_id.to_string(), json!({"id": subblock_id, "value": value}));
            }
        }
        block.updated_at = Some(Utc::now());
        row.updated_at = block.updated_at;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn update_variable(
        &self,
        workflow_id: &str,
        variable_id: &str,
        field: &str,
        value: Value,
    ) -> Result<(), StoreError> {
        self.check_available()?;
        let mut workflows = self.workflow_rows();
        let row = workflows.get_mut(workflow_id).ok_or(StoreError::NotFound)?;
        let variable = row.variables.get_mut(variable_id).ok_or(StoreError::Gone)?;

        match variable {
            Value::Object(fields) => {
                fields.insert(field.to_string(), value);
            }
            _ => return Err(StoreError::Gone),
        }
        row.updated_at = Some(Utc::now());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rate_limit_consume(
        &self,
        key: &str,
        counter: CounterKind,
        now: DateTime<Utc>,
        window_ms: i64,
    ) -> Result<ConsumedWindow, StoreError> {
        self.check_available()?;
        let mut rate = self.rate_rows();

        let record = rate
            .entry(key.to_string())
            .or_insert_with(|| RateLimitRecord::fresh(key, now));

        if now - record.window_start >= Duration::milliseconds(window_ms) {
            // Expired at commit time: all three counters and the window
            // start advance together
            *record = RateLimitRecord::fresh(key, now);
        }

        *record.counter_mut(counter) += 1;
        record.last_request_at = now;

        Ok(ConsumedWindow {
            count: record.counter(counter),
            window_start: record.window_start,
        })
    }

    async fn rate_limit_read(&self, key: &str) -> Result<Option<RateLimitRecord>, StoreError> {
        self.check_available()?;
        Ok(self.rate_rows().get(key).cloned())
    }

    async fn rate_limit_mark_limited(
        &self,
        key: &str,
        reset_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.check_available()?;
        if let Some(record) = self.rate_rows().get_mut(key) {
            record.is_rate_limited = true;
            record.rate_limit_reset_at = Some(reset_at);
        }
        Ok(())
    }

    async fn rate_limit_reset(&self, key: &str) -> Result<(), StoreError> {
        self.check_available()?;
        self.rate_rows().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subblock_merge_preserves_siblings() {
        let store = MemoryStore::new();
        store.create_workflow("w1");
        store.add_block("w1", "b1");

        // Seed a sub-block that carries sibling fields next to `value`
        store
            .update_subblock("w1", "b1", "s1", json!("first"))
            .await
            .unwrap();
        {
            let mut workflows = store.workflows.lock().unwrap();
            let block = workflows.get_mut("w1").unwrap().blocks.get_mut("b1").unwrap();
            block.sub_blocks["s1"]["type"] = json!("short-input");
        }

        store
            .update_subblock("w1", "b1", "s1", json!("second"))
            .await
            .unwrap();

        let slot = store.subblock_value("w1", "b1", "s1").unwrap();
        assert_eq!(slot["value"], "second");
        assert_eq!(slot["type"], "short-input");
    }

    #[tokio::test]
    async fn test_subblock_slot_created_when_missing() {
        let store = MemoryStore::new();
        store.create_workflow("w1");
        store.add_block("w1", "b1");

        store
            .update_subblock("w1", "b1", "fresh", json!(42))
            .await
            .unwrap();
        let slot = store.subblock_value("w1", "b1", "fresh").unwrap();
        assert_eq!(slot["id"], "fresh");
        assert_eq!(slot["value"], 42);
    }

    #[tokio::test]
    async fn test_vanished_rows_reported_as_gone() {
        let store = MemoryStore::new();
        store.create_workflow("w1");

        assert!(matches!(
            store.update_subblock("w1", "missing", "s", json!(1)).await,
            Err(StoreError::Gone)
        ));
        assert!(matches!(
            store.update_variable("w1", "missing", "value", json!(1)).await,
            Err(StoreError::Gone)
        ));
        assert!(matches!(
            store.workflow_state("nope").await,
            Err(StoreError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_variable_field_merge() {
        let store = MemoryStore::new();
        store.create_workflow("w1");
        store.add_variable("w1", "v1", json!({"name": "count", "value": 0}));

        store
            .update_variable("w1", "v1", "value", json!(7))
            .await
            .unwrap();
        let variable = store.variable("w1", "v1").unwrap();
        assert_eq!(variable["value"], 7);
        assert_eq!(variable["name"], "count");
    }

    #[tokio::test]
    async fn test_reads_do_not_bump_write_count() {
        let store = MemoryStore::new();
        store.create_workflow("w1");
        store.add_block("w1", "b1");

        let _ = store.workflow_exists("w1").await.unwrap();
        let _ = store.workflow_state("w1").await.unwrap();
        assert_eq!(store.write_count(), 0);

        store
            .update_subblock("w1", "b1", "s1", json!(1))
            .await
            .unwrap();
        assert_eq!(store.write_count(), 1);
    }

    #[tokio::test]
    async fn test_rate_consume_increments_then_resets() {
        let store = MemoryStore::new();
        let window_ms = 60_000;
        let t0 = Utc::now();

        for expected in 1..=3u64 {
            let committed = store
                .rate_limit_consume("user-1", CounterKind::Sync, t0, window_ms)
                .await
                .unwrap();
            assert_eq!(committed.count, expected);
            assert_eq!(committed.window_start, t0);
        }
        store
            .rate_limit_consume("user-1", CounterKind::Async, t0, window_ms)
            .await
            .unwrap();

        // Window expiry resets every counter atomically
        let t1 = t0 + Duration::milliseconds(window_ms);
        let committed = store
            .rate_limit_consume("user-1", CounterKind::Sync, t1, window_ms)
            .await
            .unwrap();
        assert_eq!(committed.count, 1);
        assert_eq!(committed.window_start, t1);

        let record = store.rate_limit_read("user-1").await.unwrap().unwrap();
        assert_eq!(record.async_api_requests, 0);
        assert_eq!(record.sync_api_requests, 1);
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_everything() {
        let store = MemoryStore::new();
        store.create_workflow("w1");
        store.set_unavailable(true);

        assert!(matches!(
            store.workflow_exists("w1").await,
            Err(StoreError::Unavailable(_))
        ));
        assert!(matches!(
            store
                .rate_limit_consume("k", CounterKind::Sync, Utc::now(), 60_000)
                .await,
            Err(StoreError::Unavailable(_))
        ));
    }
}
