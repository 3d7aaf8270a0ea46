//! Socket protocol: frame shapes, event payloads, roles and the permission
//! table. Frames travel as JSON `{ "event": <name>, "payload": <object> }`
//! in both directions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::store::StoreError;

/// Identity attached to a socket by the authentication middleware.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub user_id: String,
    pub user_name: String,
}

/// Incoming frame before payload-level validation.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientFrame {
    pub event: String,
    #[serde(default)]
    pub payload: Value,
}

// ============================================================================
// Client payloads
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinWorkflowPayload {
    pub workflow_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowOperationPayload {
    #[serde(default)]
    pub operation_id: Option<String>,
    pub operation: String,
    pub target: String,
    pub payload: Value,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubblockUpdatePayload {
    pub block_id: String,
    pub subblock_id: String,
    pub value: Value,
    pub timestamp: i64,
    #[serde(default)]
    pub operation_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableUpdatePayload {
    pub variable_id: String,
    pub field: String,
    pub value: Value,
    pub timestamp: i64,
    #[serde(default)]
    pub operation_id: Option<String>,
}

// ============================================================================
// Server events
// ============================================================================

/// Presence projection broadcast to room members.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceView {
    pub user_id: String,
    pub user_name: String,
    pub socket_id: String,
    pub role: WorkflowRole,
    pub joined_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(
    tag = "event",
    content = "payload",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    WorkflowState(Value),
    WorkflowOperation(Value),
    SubblockUpdate(Value),
    VariableUpdate(Value),
    PresenceUpdate {
        users: Vec<PresenceView>,
    },
    OperationConfirmed {
        operation_id: String,
        server_timestamp: i64,
    },
    OperationFailed {
        #[serde(skip_serializing_if = "Option::is_none")]
        operation_id: Option<String>,
        error: String,
        retryable: bool,
    },
    /// Legacy error envelope, emitted alongside `operation-failed` for
    /// schema failures until every client consumes the new form.
    OperationError {
        #[serde(rename = "type")]
        kind: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        operation: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        target: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        errors: Option<Vec<String>>,
    },
    OperationForbidden {
        #[serde(rename = "type")]
        kind: String,
        message: String,
        operation: String,
        target: String,
    },
    Error {
        #[serde(rename = "type")]
        kind: String,
        message: String,
    },
    JoinWorkflowError {
        error: String,
    },
}

impl ServerEvent {
    pub fn forbidden(message: impl Into<String>, operation: &str, target: &str) -> Self {
        ServerEvent::OperationForbidden {
            kind: "INSUFFICIENT_PERMISSIONS".to_string(),
            message: message.into(),
            operation: operation.to_string(),
            target: target.to_string(),
        }
    }

    pub fn validation_error(
        message: impl Into<String>,
        operation: Option<String>,
        target: Option<String>,
        errors: Option<Vec<String>>,
    ) -> Self {
        ServerEvent::OperationError {
            kind: "VALIDATION_ERROR".to_string(),
            message: message.into(),
            operation,
            target,
            errors,
        }
    }
}

// ============================================================================
// Roles and permissions
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowRole {
    Admin,
    Write,
    Read,
}

impl WorkflowRole {
    pub fn parse(name: &str) -> WorkflowRole {
        match name {
            "admin" => WorkflowRole::Admin,
            "write" => WorkflowRole::Write,
            _ => WorkflowRole::Read,
        }
    }
}

/// Permission check against the role cached at join time. Every catalogued
/// operation mutates the workflow, so read-only members are denied across
/// the board.
pub fn check_role_permission(role: WorkflowRole, operation: &str) -> Result<(), String> {
    match role {
        WorkflowRole::Admin | WorkflowRole::Write => Ok(()),
        WorkflowRole::Read => Err(format!(
            "read-only access does not permit '{}'",
            operation
        )),
    }
}

/// Allowed operations per target.
pub fn validate_operation(target: &str, operation: &str) -> bool {
    let allowed: &[&str] = match target {
        "block" => &[
            "add",
            "remove",
            "update-position",
            "update-name",
            "toggle-enabled",
            "update-parent",
            "update-wide",
            "update-advanced-mode",
            "duplicate",
        ],
        "edge" => &["add", "remove"],
        "subflow" => &["update"],
        "variable" => &["add", "edit", "remove", "duplicate"],
        _ => return false,
    };
    allowed.contains(&operation)
}

// ============================================================================
// Access control seam
// ============================================================================

#[derive(Debug, Clone)]
pub struct WorkflowAccess {
    pub has_access: bool,
    pub role: Option<WorkflowRole>,
}

/// Workflow membership lookup, implemented outside this crate.
#[async_trait::async_trait]
pub trait AccessControl: Send + Sync {
    async fn verify_workflow_access(
        &self,
        user_id: &str,
        workflow_id: &str,
    ) -> Result<WorkflowAccess, StoreError>;
}

/// In-memory grant table used by tests and seedable dev setups.
#[derive(Default)]
pub struct MemoryAccess {
    grants: Mutex<HashMap<(String, String), WorkflowRole>>,
}

impl MemoryAccess {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(&self, user_id: &str, workflow_id: &str, role: WorkflowRole) {
        self.grants
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert((user_id.to_string(), workflow_id.to_string()), role);
    }
}

#[async_trait::async_trait]
impl AccessControl for MemoryAccess {
    async fn verify_workflow_access(
        &self,
        user_id: &str,
        workflow_id: &str,
    ) -> Result<WorkflowAccess, StoreError> {
        let role = self
            .grants
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&(user_id.to_string(), workflow_id.to_string()))
            .copied();
        Ok(WorkflowAccess {
            has_access: role.is_some(),
            role,
        })
    }
}

/// Grants every authenticated user admin access. Development only.
pub struct OpenAccess;

#[async_trait::async_trait]
impl AccessControl for OpenAccess {
    async fn verify_workflow_access(
        &self,
        _user_id: &str,
        _workflow_id: &str,
    ) -> Result<WorkflowAccess, StoreError> {
        Ok(WorkflowAccess {
            has_access: true,
            role: Some(WorkflowRole::Admin),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_server_event_frame_shape() {
        let event = ServerEvent::OperationConfirmed {
            operation_id: "op-1".into(),
            server_timestamp: 1700000000000,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "operation-confirmed");
        assert_eq!(value["payload"]["operationId"], "op-1");
        assert_eq!(value["payload"]["serverTimestamp"], 1700000000000i64);

        let event = ServerEvent::JoinWorkflowError {
            error: "Authentication required".into(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "join-workflow-error");
        assert_eq!(value["payload"]["error"], "Authentication required");

        let event = ServerEvent::forbidden("denied", "add", "block");
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "operation-forbidden");
        assert_eq!(value["payload"]["type"], "INSUFFICIENT_PERMISSIONS");
    }

    #[test]
    fn test_client_frame_parses_payloads() {
        let frame: ClientFrame = serde_json::from_value(json!({
            "event": "subblock-update",
            "payload": {
                "blockId": "b1",
                "subblockId": "s1",
                "value": "x",
                "timestamp": 123,
                "operationId": "op-9"
            }
        }))
        .unwrap();
        assert_eq!(frame.event, "subblock-update");

        let payload: SubblockUpdatePayload = serde_json::from_value(frame.payload).unwrap();
        assert_eq!(payload.block_id, "b1");
        assert_eq!(payload.operation_id.as_deref(), Some("op-9"));

        // Missing required fields are schema errors
        let bad: Result<SubblockUpdatePayload, _> =
            serde_json::from_value(json!({"blockId": "b1"}));
        assert!(bad.is_err());
    }

    #[test]
    fn test_operation_catalogue() {
        assert!(validate_operation("block", "update-position"));
        assert!(validate_operation("variable", "duplicate"));
        assert!(validate_operation("edge", "remove"));
        assert!(validate_operation("subflow", "update"));
        assert!(!validate_operation("block", "explode"));
        assert!(!validate_operation("edge", "update"));
        assert!(!validate_operation("unknown", "add"));
    }

    #[test]
    fn test_role_permissions() {
        assert!(check_role_permission(WorkflowRole::Admin, "add").is_ok());
        assert!(check_role_permission(WorkflowRole::Write, "remove").is_ok());
        assert!(check_role_permission(WorkflowRole::Read, "add").is_err());
        assert_eq!(WorkflowRole::parse("write"), WorkflowRole::Write);
        assert_eq!(WorkflowRole::parse("garbage"), WorkflowRole::Read);
    }
}
