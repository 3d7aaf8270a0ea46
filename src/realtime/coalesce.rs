//! Coalescing field updater: high-frequency sub-block and variable edits
//! are debounced per field, written once with the latest value, and
//! acknowledged per contributing operation.
//!
//! Each pending key owns one cancellable timer; a newer arrival within the
//! debounce window aborts and replaces it, so the flush fires only after
//! the field has been quiet for the full interval.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

use super::protocol::{ServerEvent, SubblockUpdatePayload, VariableUpdatePayload};
use super::rooms::{RoomManager, SocketId};
use crate::store::{StoreError, WorkflowStore};

const DEBOUNCE: Duration = Duration::from_millis(25);

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
enum UpdateKey {
    Subblock {
        workflow_id: String,
        block_id: String,
        subblock_id: String,
    },
    Variable {
        workflow_id: String,
        variable_id: String,
        field: String,
    },
}

impl UpdateKey {
    fn workflow_id(&self) -> &str {
        match self {
            UpdateKey::Subblock { workflow_id, .. } => workflow_id,
            UpdateKey::Variable { workflow_id, .. } => workflow_id,
        }
    }
}

struct PendingFieldUpdate {
    /// Only the most recent accepted value survives coalescing
    value: Value,
    timestamp: i64,
    /// Every contributing (operation id, socket): sockets for sender
    /// exclusion, ids for per-operation acknowledgement
    ops: Vec<(Option<String>, SocketId)>,
    /// Bumped on every arrival; a timer only flushes the generation it was
    /// armed for, so a superseded timer can never steal the entry
    generation: u64,
    timer: JoinHandle<()>,
}

pub struct FieldUpdater {
    store: Arc<dyn WorkflowStore>,
    rooms: Arc<RoomManager>,
    pending: Mutex<HashMap<UpdateKey, PendingFieldUpdate>>,
    generations: std::sync::atomic::AtomicU64,
}

impl FieldUpdater {
    pub fn new(store: Arc<dyn WorkflowStore>, rooms: Arc<RoomManager>) -> Arc<Self> {
        Arc::new(Self {
            store,
            rooms,
            pending: Mutex::new(HashMap::new()),
            generations: std::sync::atomic::AtomicU64::new(0),
        })
    }

    pub fn queue_subblock(
        self: &Arc<Self>,
        socket_id: &str,
        workflow_id: &str,
        payload: SubblockUpdatePayload,
    ) {
        let key = UpdateKey::Subblock {
            workflow_id: workflow_id.to_string(),
            block_id: payload.block_id,
            subblock_id: payload.subblock_id,
        };
        self.queue(key, socket_id, payload.value, payload.timestamp, payload.operation_id);
    }

    pub fn queue_variable(
        self: &Arc<Self>,
        socket_id: &str,
        workflow_id: &str,
        payload: VariableUpdatePayload,
    ) {
        let key = UpdateKey::Variable {
            workflow_id: workflow_id.to_string(),
            variable_id: payload.variable_id,
            field: payload.field,
        };
        self.queue(key, socket_id, payload.value, payload.timestamp, payload.operation_id);
    }

    fn queue(
        self: &Arc<Self>,
        key: UpdateKey,
        socket_id: &str,
        value: Value,
        timestamp: i64,
        operation_id: Option<String>,
    ) {
        let mut pending = self
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let generation = self
            .generations
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let timer = {
            let updater = self.clone();
            let timer_key = key.clone();
            tokio::spawn(async move {
                tokio::time::sleep(DEBOUNCE).await;
                updater.flush(timer_key, generation).await;
            })
        };

        match pending.get_mut(&key) {
            Some(entry) => {
                entry.timer.abort();
                entry.value = value;
                entry.timestamp = timestamp;
                entry.ops.push((operation_id, socket_id.to_string()));
                entry.generation = generation;
                entry.timer = timer;
            }
            None => {
                pending.insert(
                    key,
                    PendingFieldUpdate {
                        value,
                        timestamp,
                        ops: vec![(operation_id, socket_id.to_string())],
                        generation,
                        timer,
                    },
                );
            }
        }
    }

    async fn flush(self: Arc<Self>, key: UpdateKey, generation: u64) {
        let entry = {
            let mut pending = self
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
            match pending.get(&key) {
                Some(entry) if entry.generation == generation => pending.remove(&key),
                // A newer arrival re-armed the timer; its flush owns the entry
                _ => None,
            }
        };
        let Some(entry) = entry else {
            return;
        };
        let workflow_id = key.workflow_id().to_string();

        match self.store.workflow_exists(&workflow_id).await {
            Ok(true) => {}
            Ok(false) => {
                self.fail_ops(&entry.ops, "Workflow not found", false).await;
                return;
            }
            Err(err) => {
                self.fail_ops(&entry.ops, &err.to_string(), true).await;
                return;
            }
        }

        let (result, broadcast) = match &key {
            UpdateKey::Subblock {
                workflow_id,
                block_id,
                subblock_id,
            } => (
                self.store
                    .update_subblock(workflow_id, block_id, subblock_id, entry.value.clone())
                    .await,
                ServerEvent::SubblockUpdate(json!({
                    "blockId": block_id,
                    "subblockId": subblock_id,
                    "value": entry.value,
                    "timestamp": entry.timestamp,
                })),
            ),
            UpdateKey::Variable {
                workflow_id,
                variable_id,
                field,
            } => (
                self.store
                    .update_variable(workflow_id, variable_id, field, entry.value.clone())
                    .await,
                ServerEvent::VariableUpdate(json!({
                    "variableId": variable_id,
                    "field": field,
                    "value": entry.value,
                    "timestamp": entry.timestamp,
                })),
            ),
        };

        match result {
            Ok(()) => {
                // Never echo the change back to a socket that contributed;
                // it would overwrite the sender's newer local state
                let contributors: Vec<&str> =
                    entry.ops.iter().map(|(_, socket)| socket.as_str()).collect();
                self.rooms
                    .broadcast(&workflow_id, &contributors, broadcast)
                    .await;

                let server_timestamp = chrono::Utc::now().timestamp_millis();
                for (operation_id, socket_id) in &entry.ops {
                    if let Some(operation_id) = operation_id {
                        self.rooms
                            .send_to(
                                socket_id,
                                ServerEvent::OperationConfirmed {
                                    operation_id: operation_id.clone(),
                                    server_timestamp,
                                },
                            )
                            .await;
                    }
                }
            }
            Err(StoreError::Gone) => {
                let message = match key {
                    UpdateKey::Subblock { .. } => "Block no longer exists",
                    UpdateKey::Variable { .. } => "Variable no longer exists",
                };
                self.fail_ops(&entry.ops, message, false).await;
            }
            Err(StoreError::NotFound) => {
                self.fail_ops(&entry.ops, "Workflow not found", false).await;
            }
            Err(err) => {
                log::warn!("coalesced flush failed on {}: {}", workflow_id, err);
                self.fail_ops(&entry.ops, &err.to_string(), true).await;
            }
        }
    }

    async fn fail_ops(&self, ops: &[(Option<String>, SocketId)], error: &str, retryable: bool) {
        for (operation_id, socket_id) in ops {
            if let Some(operation_id) = operation_id {
                self.rooms
                    .send_to(
                        socket_id,
                        ServerEvent::OperationFailed {
                            operation_id: Some(operation_id.clone()),
                            error: error.to_string(),
                            retryable,
                        },
                    )
                    .await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::protocol::{AuthenticatedUser, WorkflowRole};
    use crate::store::MemoryStore;
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Fixture {
        store: Arc<MemoryStore>,
        updater: Arc<FieldUpdater>,
    }

    async fn fixture(
        sockets: &[&str],
    ) -> (Fixture, Vec<UnboundedReceiver<ServerEvent>>) {
        let store = Arc::new(MemoryStore::new());
        store.create_workflow("w1");
        store.add_block("w1", "b1");
        store.add_variable("w1", "v1", json!({"name": "count", "value": 0}));

        let rooms = Arc::new(RoomManager::new());
        let mut receivers = Vec::new();
        for socket in sockets {
            let identity = AuthenticatedUser {
                user_id: format!("u-{}", socket),
                user_name: socket.to_string(),
            };
            receivers.push(rooms.register(socket, Some(identity.clone())).await);
            rooms.join(socket, "w1", &identity, WorkflowRole::Write).await;
        }

        let updater = FieldUpdater::new(store.clone(), rooms);
        (Fixture { store, updater }, receivers)
    }

    fn subblock(value: Value, timestamp: i64, op: &str) -> SubblockUpdatePayload {
        SubblockUpdatePayload {
            block_id: "b1".into(),
            subblock_id: "s1".into(),
            value,
            timestamp,
            operation_id: Some(op.into()),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_coalesces_to_last_value_with_all_acks() {
        let (fx, mut receivers) = fixture(&["a", "b"]).await;
        let mut rx_b = receivers.pop().unwrap();
        let mut rx_a = receivers.pop().unwrap();

        for (i, value) in ["a", "b", "c", "d", "e"].iter().enumerate() {
            fx.updater
                .queue_subblock("a", "w1", subblock(json!(value), i as i64, &format!("op-{}", i)));
        }

        // One write carrying the last-arrival value
        let first = rx_a.recv().await.unwrap();
        assert!(matches!(first, ServerEvent::OperationConfirmed { .. }));
        assert_eq!(fx.store.write_count(), 1);
        assert_eq!(
            fx.store.subblock_value("w1", "b1", "s1").unwrap()["value"],
            "e"
        );

        // One confirmation per coalesced operation, in submission order
        let mut confirmed = vec![match first {
            ServerEvent::OperationConfirmed { operation_id, .. } => operation_id,
            _ => unreachable!(),
        }];
        for _ in 0..4 {
            match rx_a.recv().await.unwrap() {
                ServerEvent::OperationConfirmed { operation_id, .. } => confirmed.push(operation_id),
                other => panic!("expected confirmation, got {:?}", other),
            }
        }
        assert_eq!(confirmed, vec!["op-0", "op-1", "op-2", "op-3", "op-4"]);

        // Exactly one broadcast to the non-contributing member
        let ServerEvent::SubblockUpdate(payload) = rx_b.recv().await.unwrap() else {
            panic!("expected subblock-update");
        };
        assert_eq!(payload["value"], "e");
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_contributing_sockets_never_receive_the_broadcast() {
        let (fx, mut receivers) = fixture(&["a", "b", "c"]).await;
        let mut rx_c = receivers.pop().unwrap();
        let mut rx_b = receivers.pop().unwrap();
        let mut rx_a = receivers.pop().unwrap();

        fx.updater
            .queue_subblock("a", "w1", subblock(json!("from-a"), 1, "op-a"));
        fx.updater
            .queue_subblock("b", "w1", subblock(json!("from-b"), 2, "op-b"));

        // Both contributors see only their confirmations
        assert!(matches!(
            rx_a.recv().await.unwrap(),
            ServerEvent::OperationConfirmed { .. }
        ));
        assert!(matches!(
            rx_b.recv().await.unwrap(),
            ServerEvent::OperationConfirmed { .. }
        ));
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_err());

        // The bystander gets the merged change once
        let ServerEvent::SubblockUpdate(payload) = rx_c.recv().await.unwrap() else {
            panic!("expected subblock-update");
        };
        assert_eq!(payload["value"], "from-b");
        assert_eq!(fx.store.write_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_distinct_keys_flush_independently() {
        let (fx, mut receivers) = fixture(&["a"]).await;
        let mut rx_a = receivers.pop().unwrap();

        fx.updater
            .queue_subblock("a", "w1", subblock(json!(1), 1, "op-s"));
        fx.updater.queue_variable(
            "a",
            "w1",
            VariableUpdatePayload {
                variable_id: "v1".into(),
                field: "value".into(),
                value: json!(9),
                timestamp: 2,
                operation_id: Some("op-v".into()),
            },
        );

        let mut confirmed = Vec::new();
        for _ in 0..2 {
            match rx_a.recv().await.unwrap() {
                ServerEvent::OperationConfirmed { operation_id, .. } => confirmed.push(operation_id),
                other => panic!("expected confirmation, got {:?}", other),
            }
        }
        confirmed.sort();
        assert_eq!(confirmed, vec!["op-s", "op-v"]);
        assert_eq!(fx.store.write_count(), 2);
        assert_eq!(fx.store.variable("w1", "v1").unwrap()["value"], 9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_workflow_fails_every_op_without_retry() {
        let (fx, mut receivers) = fixture(&["a"]).await;
        let mut rx_a = receivers.pop().unwrap();
        fx.store.remove_workflow("w1");

        fx.updater
            .queue_subblock("a", "w1", subblock(json!(1), 1, "op-1"));
        fx.updater
            .queue_subblock("a", "w1", subblock(json!(2), 2, "op-2"));

        for expected in ["op-1", "op-2"] {
            let ServerEvent::OperationFailed { operation_id, error, retryable } =
                rx_a.recv().await.unwrap()
            else {
                panic!("expected operation-failed");
            };
            assert_eq!(operation_id.as_deref(), Some(expected));
            assert_eq!(error, "Workflow not found");
            assert!(!retryable);
        }
        assert_eq!(fx.store.write_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_vanished_block_is_not_retryable() {
        let (fx, mut receivers) = fixture(&["a"]).await;
        let mut rx_a = receivers.pop().unwrap();
        fx.store.remove_block("w1", "b1");

        fx.updater
            .queue_subblock("a", "w1", subblock(json!(1), 1, "op-1"));

        let ServerEvent::OperationFailed { error, retryable, .. } = rx_a.recv().await.unwrap()
        else {
            panic!("expected operation-failed");
        };
        assert_eq!(error, "Block no longer exists");
        assert!(!retryable);
    }

    #[tokio::test(start_paused = true)]
    async fn test_storage_outage_is_retryable() {
        let (fx, mut receivers) = fixture(&["a"]).await;
        let mut rx_a = receivers.pop().unwrap();
        fx.store.set_unavailable(true);

        fx.updater
            .queue_subblock("a", "w1", subblock(json!(1), 1, "op-1"));

        let ServerEvent::OperationFailed { retryable, .. } = rx_a.recv().await.unwrap() else {
            panic!("expected operation-failed");
        };
        assert!(retryable);
    }
}
