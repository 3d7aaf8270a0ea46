// Realtime Collaboration Control Plane
// Rooms, presence, operation handling and coalesced field updates

pub mod coalesce;
pub mod operations;
pub mod protocol;
pub mod rooms;
pub mod server;

use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;

use coalesce::FieldUpdater;
use operations::OperationsHandler;
use protocol::{
    AccessControl, AuthenticatedUser, ClientFrame, JoinWorkflowPayload, ServerEvent,
    SubblockUpdatePayload, VariableUpdatePayload, WorkflowRole,
};
use rooms::RoomManager;

use crate::store::WorkflowStore;

/// The socket-facing façade: admits connections, dispatches frames to the
/// room manager, operations handler and field updater.
pub struct CollabServer {
    rooms: Arc<RoomManager>,
    store: Arc<dyn WorkflowStore>,
    access: Arc<dyn AccessControl>,
    operations: OperationsHandler,
    updater: Arc<FieldUpdater>,
}

impl CollabServer {
    pub fn new(store: Arc<dyn WorkflowStore>, access: Arc<dyn AccessControl>) -> Arc<Self> {
        let rooms = Arc::new(RoomManager::new());
        let operations = OperationsHandler::new(store.clone(), rooms.clone());
        let updater = FieldUpdater::new(store.clone(), rooms.clone());
        Arc::new(Self {
            rooms,
            store,
            access,
            operations,
            updater,
        })
    }

    pub fn rooms(&self) -> &Arc<RoomManager> {
        &self.rooms
    }

    /// Admit one socket. The identity comes from the authentication
    /// middleware; anonymous sockets may connect but cannot join rooms.
    pub async fn connect(
        &self,
        socket_id: &str,
        user: Option<AuthenticatedUser>,
    ) -> UnboundedReceiver<ServerEvent> {
        self.rooms.register(socket_id, user).await
    }

    pub async fn disconnect(&self, socket_id: &str) {
        if let Some(workflow_id) = self.rooms.leave(socket_id).await {
            self.rooms.broadcast_presence(&workflow_id, &[]).await;
        }
        self.rooms.unregister(socket_id).await;
    }

    pub async fn handle_frame(&self, socket_id: &str, frame: ClientFrame) {
        match frame.event.as_str() {
            "join-workflow" => self.join_workflow(socket_id, frame.payload).await,
            "leave-workflow" => self.leave_workflow(socket_id).await,
            "request-sync" => self.request_sync(socket_id, frame.payload).await,
            "workflow-operation" => self.operations.handle(socket_id, frame.payload).await,
            "subblock-update" => self.subblock_update(socket_id, frame.payload).await,
            "variable-update" => self.variable_update(socket_id, frame.payload).await,
            other => {
                log::debug!("unknown socket event '{}' from {}", other, socket_id);
                self.rooms
                    .send_to(
                        socket_id,
                        ServerEvent::Error {
                            kind: "UNKNOWN_EVENT".into(),
                            message: format!("unknown event '{}'", other),
                        },
                    )
                    .await;
            }
        }
    }

    async fn join_workflow(&self, socket_id: &str, payload: serde_json::Value) {
        let Some(user) = self.rooms.session(socket_id).await else {
            self.join_error(socket_id, "Authentication required").await;
            return;
        };

        let payload: JoinWorkflowPayload = match serde_json::from_value(payload) {
            Ok(payload) => payload,
            Err(err) => {
                self.join_error(socket_id, &format!("Invalid payload: {}", err))
                    .await;
                return;
            }
        };

        let access = match self
            .access
            .verify_workflow_access(&user.user_id, &payload.workflow_id)
            .await
        {
            Ok(access) => access,
            Err(err) => {
                log::warn!(
                    "access check failed for {} on {}: {}",
                    user.user_id,
                    payload.workflow_id,
                    err
                );
                self.join_error(socket_id, "Access check failed").await;
                return;
            }
        };
        if !access.has_access {
            self.join_error(socket_id, "Access denied").await;
            return;
        }
        let role = access.role.unwrap_or(WorkflowRole::Read);

        // A socket lives in at most one room; leaving the previous one
        // notifies its remaining members
        if let Some(previous) = self.rooms.leave(socket_id).await {
            self.rooms.broadcast_presence(&previous, &[]).await;
        }

        self.rooms
            .join(socket_id, &payload.workflow_id, &user, role)
            .await;

        match self.store.workflow_state(&payload.workflow_id).await {
            Ok(state) => {
                self.rooms
                    .send_to(socket_id, ServerEvent::WorkflowState(state))
                    .await;
            }
            Err(err) => {
                log::warn!("state fetch failed for {}: {}", payload.workflow_id, err);
                self.rooms.leave(socket_id).await;
                self.join_error(socket_id, "Workflow not found").await;
                return;
            }
        }

        self.rooms
            .broadcast_presence(&payload.workflow_id, &[socket_id])
            .await;

        log::info!(
            "{} joined workflow {} as {:?}",
            user.user_id,
            payload.workflow_id,
            role
        );
    }

    async fn leave_workflow(&self, socket_id: &str) {
        if let Some(workflow_id) = self.rooms.leave(socket_id).await {
            self.rooms.broadcast_presence(&workflow_id, &[]).await;
        }
    }

    /// Re-emit the current workflow state without touching membership.
    async fn request_sync(&self, socket_id: &str, payload: serde_json::Value) {
        let Some(user) = self.rooms.session(socket_id).await else {
            self.join_error(socket_id, "Authentication required").await;
            return;
        };
        let Ok(payload) = serde_json::from_value::<JoinWorkflowPayload>(payload) else {
            self.join_error(socket_id, "Invalid payload").await;
            return;
        };

        let authorized = self
            .access
            .verify_workflow_access(&user.user_id, &payload.workflow_id)
            .await
            .map(|access| access.has_access)
            .unwrap_or(false);
        if !authorized {
            self.join_error(socket_id, "Access denied").await;
            return;
        }

        match self.store.workflow_state(&payload.workflow_id).await {
            Ok(state) => {
                self.rooms
                    .send_to(socket_id, ServerEvent::WorkflowState(state))
                    .await;
            }
            Err(err) => {
                log::warn!("sync failed for {}: {}", payload.workflow_id, err);
                self.join_error(socket_id, "Workflow not found").await;
            }
        }
    }

    async fn subblock_update(&self, socket_id: &str, payload: serde_json::Value) {
        let Some(workflow_id) = self.guard_room(socket_id).await else {
            return;
        };
        let operation_id = extract_operation_id(&payload);
        match serde_json::from_value::<SubblockUpdatePayload>(payload) {
            Ok(payload) => {
                self.rooms.touch_activity(socket_id).await;
                self.updater.queue_subblock(socket_id, &workflow_id, payload);
            }
            Err(err) => self.schema_failure(socket_id, operation_id, err.to_string()).await,
        }
    }

    async fn variable_update(&self, socket_id: &str, payload: serde_json::Value) {
        let Some(workflow_id) = self.guard_room(socket_id).await else {
            return;
        };
        let operation_id = extract_operation_id(&payload);
        match serde_json::from_value::<VariableUpdatePayload>(payload) {
            Ok(payload) => {
                self.rooms.touch_activity(socket_id).await;
                self.updater.queue_variable(socket_id, &workflow_id, payload);
            }
            Err(err) => self.schema_failure(socket_id, operation_id, err.to_string()).await,
        }
    }

    /// Field updates require an authenticated socket inside a room.
    async fn guard_room(&self, socket_id: &str) -> Option<String> {
        if self.rooms.session(socket_id).await.is_none() {
            self.rooms
                .send_to(
                    socket_id,
                    ServerEvent::Error {
                        kind: "AUTHENTICATION_ERROR".into(),
                        message: "Authentication required".into(),
                    },
                )
                .await;
            return None;
        }
        let room = self.rooms.room_of(socket_id).await;
        if room.is_none() {
            self.rooms
                .send_to(
                    socket_id,
                    ServerEvent::Error {
                        kind: "NOT_IN_ROOM".into(),
                        message: "Join a workflow before sending updates".into(),
                    },
                )
                .await;
        }
        room
    }

    async fn schema_failure(&self, socket_id: &str, operation_id: Option<String>, message: String) {
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
                ServerEvent::validation_error(message.clone(), None, None, Some(vec![message])),
            )
            .await;
    }

    async fn join_error(&self, socket_id: &str, error: &str) {
        self.rooms
            .send_to(
                socket_id,
                ServerEvent::JoinWorkflowError {
                    error: error.to_string(),
                },
            )
            .await;
    }
}

fn extract_operation_id(payload: &serde_json::Value) -> Option<String> {
    payload
        .get("operationId")
        .and_then(|id| id.as_str())
        .map(String::from)
}
