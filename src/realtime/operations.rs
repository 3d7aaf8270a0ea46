//! Workflow operation handling: validate, authorise against the cached
//! role, persist, then broadcast. Position updates take a low-latency path
//! that broadcasts before (or entirely without) persistence.

use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

use super::protocol::{
    check_role_permission, validate_operation, ServerEvent, WorkflowOperationPayload,
};
use super::rooms::RoomManager;
use crate::store::{OperationRecord, StoreError, WorkflowStore};

pub struct OperationsHandler {
    store: Arc<dyn WorkflowStore>,
    rooms: Arc<RoomManager>,
}

impl OperationsHandler {
    pub fn new(store: Arc<dyn WorkflowStore>, rooms: Arc<RoomManager>) -> Self {
        Self { store, rooms }
    }

    pub async fn handle(&self, socket_id: &str, raw: Value) {
        let Some(user) = self.rooms.session(socket_id).await else {
            self.rooms
                .send_to(
                    socket_id,
                    ServerEvent::Error {
                        kind: "AUTHENTICATION_ERROR".into(),
                        message: "Authentication required".into(),
                    },
                )
                .await;
            return;
        };

        let Some(workflow_id) = self.rooms.room_of(socket_id).await else {
            self.rooms
                .send_to(
                    socket_id,
                    ServerEvent::Error {
                        kind: "NOT_IN_ROOM".into(),
                        message: "Join a workflow before sending operations".into(),
                    },
                )
                .await;
            return;
        };

        // Schema validation; the operation id is threaded into the failure
        // acknowledgement even when the rest of the payload is malformed
        let operation_id = raw
            .get("operationId")
            .and_then(|id| id.as_str())
            .map(String::from);
        let payload: WorkflowOperationPayload = match serde_json::from_value(raw) {
            Ok(payload) => payload,
            Err(err) => {
                self.reject_schema(socket_id, operation_id, None, None, err.to_string())
                    .await;
                return;
            }
        };

        if !validate_operation(&payload.target, &payload.operation) {
            self.reject_schema(
                socket_id,
                payload.operation_id.clone(),
                Some(payload.operation.clone()),
                Some(payload.target.clone()),
                format!(
                    "operation '{}' is not valid for target '{}'",
                    payload.operation, payload.target
                ),
            )
            .await;
            return;
        }

        self.rooms.touch_activity(socket_id).await;

        if payload.operation == "update-position" && payload.target == "block" {
            self.handle_position_update(socket_id, &workflow_id, &user.user_id, &user.user_name, payload)
                .await;
            return;
        }

        // Authorisation comes from the presence record written at join time;
        // no membership lookup happens per operation
        let Some(role) = self.rooms.cached_role(socket_id).await else {
            self.rooms
                .send_to(
                    socket_id,
                    ServerEvent::Error {
                        kind: "NOT_IN_ROOM".into(),
                        message: "No presence record for this socket".into(),
                    },
                )
                .await;
            return;
        };
        if let Err(reason) = check_role_permission(role, &payload.operation) {
            self.rooms
                .send_to(
                    socket_id,
                    ServerEvent::forbidden(reason, &payload.operation, &payload.target),
                )
                .await;
            return;
        }

        // Persist first so any client that re-fetches after the broadcast
        // sees the change already committed
        let record = OperationRecord {
            operation: payload.operation.clone(),
            target: payload.target.clone(),
            payload: payload.payload.clone(),
            timestamp: payload.timestamp,
            user_id: user.user_id.clone(),
        };
        if let Err(err) = self.store.record_operation(&workflow_id, &record).await {
            let (error, retryable) = persistence_failure(&err);
            log::warn!(
                "persist failed for {} on {}: {}",
                payload.operation,
                workflow_id,
                err
            );
            self.rooms
                .send_to(
                    socket_id,
                    ServerEvent::OperationFailed {
                        operation_id: payload.operation_id.clone(),
                        error,
                        retryable,
                    },
                )
                .await;
            return;
        }

        self.rooms.set_last_modified(&workflow_id).await;

        let envelope = self.envelope(socket_id, &workflow_id, &user.user_id, &user.user_name, &payload, false);
        self.rooms
            .broadcast(&workflow_id, &[socket_id], ServerEvent::WorkflowOperation(envelope))
            .await;

        if let Some(operation_id) = payload.operation_id {
            self.rooms
                .send_to(
                    socket_id,
                    ServerEvent::OperationConfirmed {
                        operation_id,
                        server_timestamp: chrono::Utc::now().timestamp_millis(),
                    },
                )
                .await;
        }
    }

    /// Low-latency path for block moves. The client timestamp is carried
    /// unchanged so consumers can re-order. Non-commit updates skip the
    /// permission check and never touch storage.
    async fn handle_position_update(
        &self,
        socket_id: &str,
        workflow_id: &str,
        user_id: &str,
        user_name: &str,
        payload: WorkflowOperationPayload,
    ) {
        let commit = payload.payload.get("commit").and_then(|c| c.as_bool()) == Some(true);

        let envelope = self.envelope(socket_id, workflow_id, user_id, user_name, &payload, true);
        self.rooms
            .broadcast(workflow_id, &[socket_id], ServerEvent::WorkflowOperation(envelope))
            .await;

        if !commit {
            return;
        }

        // Commit path: broadcast already happened, persistence catches up
        let store = self.store.clone();
        let rooms = self.rooms.clone();
        let workflow_id = workflow_id.to_string();
        let socket_id = socket_id.to_string();
        let record = OperationRecord {
            operation: payload.operation.clone(),
            target: payload.target.clone(),
            payload: payload.payload.clone(),
            timestamp: payload.timestamp,
            user_id: user_id.to_string(),
        };
        let operation_id = payload.operation_id.clone();
        tokio::spawn(async move {
            match store.record_operation(&workflow_id, &record).await {
                Ok(()) => {
                    rooms.set_last_modified(&workflow_id).await;
                    if let Some(operation_id) = operation_id {
                        rooms
                            .send_to(
                                &socket_id,
                                ServerEvent::OperationConfirmed {
                                    operation_id,
                                    server_timestamp: chrono::Utc::now().timestamp_millis(),
                                },
                            )
                            .await;
                    }
                }
                Err(err) => {
                    log::warn!("position persist failed on {}: {}", workflow_id, err);
                    rooms
                        .send_to(
                            &socket_id,
                            ServerEvent::OperationFailed {
                                operation_id,
                                error: err.to_string(),
                                retryable: true,
                            },
                        )
                        .await;
                }
            }
        });
    }

    fn envelope(
        &self,
        socket_id: &str,
        workflow_id: &str,
        user_id: &str,
        user_name: &str,
        payload: &WorkflowOperationPayload,
        is_position_update: bool,
    ) -> Value {
        let mut metadata = json!({
            "workflowId": workflow_id,
            "operationId": Uuid::new_v4().to_string(),
        });
        if is_position_update {
            metadata["isPositionUpdate"] = json!(true);
        }
        json!({
            "operation": payload.operation,
            "target": payload.target,
            "payload": payload.payload,
            "timestamp": payload.timestamp,
            "senderId": socket_id,
            "userId": user_id,
            "userName": user_name,
            "metadata": metadata,
        })
    }

    /// Schema failures are acknowledged on both the new and the legacy
    /// error channels.
    async fn reject_schema(
        &self,
        socket_id: &str,
        operation_id: Option<String>,
        operation: Option<String>,
        target: Option<String>,
        message: String,
    ) {
        self.rooms
            .send_to(
                socket_id,
                ServerEvent::OperationFailed {
                    operation_id,
                    error: message.clone(),
                    retryable: false,
                },
            )
            .await;
        self.rooms
            .send_to(
                socket_id,
                ServerEvent::validation_error(message.clone(), operation, target, Some(vec![message])),
            )
            .await;
    }
}

fn persistence_failure(err: &StoreError) -> (String, bool) {
    match err {
        StoreError::NotFound => ("Workflow not found".to_string(), false),
        StoreError::Gone => ("Target no longer exists".to_string(), false),
        StoreError::Unavailable(message) => (message.clone(), true),
    }
}
