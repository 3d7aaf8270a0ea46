//! Room manager: which socket sits in which workflow room, per-user
//! presence, and fan-out to room members over per-socket channels.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio::sync::RwLock;

use super::protocol::{AuthenticatedUser, PresenceView, ServerEvent, WorkflowRole};

pub type SocketId = String;

/// Per-socket participation record. Lifetime is bounded by the socket
/// connection; removed on disconnect or explicit leave.
#[derive(Debug, Clone)]
pub struct UserPresence {
    pub user_id: String,
    pub user_name: String,
    pub socket_id: SocketId,
    pub role: WorkflowRole,
    pub joined_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl UserPresence {
    fn view(&self) -> PresenceView {
        PresenceView {
            user_id: self.user_id.clone(),
            user_name: self.user_name.clone(),
            socket_id: self.socket_id.clone(),
            role: self.role,
            joined_at: self.joined_at,
            last_activity: self.last_activity,
        }
    }
}

#[derive(Debug, Default)]
pub struct WorkflowRoom {
    pub users: HashMap<SocketId, UserPresence>,
    pub last_modified: Option<DateTime<Utc>>,
    pub active_connections: usize,
}

/// Process-local room state plus the outbound channel registry.
#[derive(Default)]
pub struct RoomManager {
    rooms: RwLock<HashMap<String, WorkflowRoom>>,
    socket_rooms: RwLock<HashMap<SocketId, String>>,
    sessions: RwLock<HashMap<SocketId, AuthenticatedUser>>,
    senders: RwLock<HashMap<SocketId, mpsc::UnboundedSender<ServerEvent>>>,
}

impl RoomManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection and its optional identity. The returned
    /// receiver is drained by the connection's write task.
    pub async fn register(
        &self,
        socket_id: &str,
        user: Option<AuthenticatedUser>,
    ) -> mpsc::UnboundedReceiver<ServerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.write().await.insert(socket_id.to_string(), tx);
        if let Some(user) = user {
            self.sessions
                .write()
                .await
                .insert(socket_id.to_string(), user);
        }
        rx
    }

    pub async fn session(&self, socket_id: &str) -> Option<AuthenticatedUser> {
        self.sessions.read().await.get(socket_id).cloned()
    }

    pub async fn room_of(&self, socket_id: &str) -> Option<String> {
        self.socket_rooms.read().await.get(socket_id).cloned()
    }

    /// Role captured at join time; operations authorise against this
    /// without another membership lookup.
    pub async fn cached_role(&self, socket_id: &str) -> Option<WorkflowRole> {
        let room_id = self.room_of(socket_id).await?;
        self.rooms
            .read()
            .await
            .get(&room_id)?
            .users
            .get(socket_id)
            .map(|presence| presence.role)
    }

    /// Insert the socket into a room, creating it when absent.
    pub async fn join(&self, socket_id: &str, workflow_id: &str, user: &AuthenticatedUser, role: WorkflowRole) {
        let now = Utc::now();
        let presence = UserPresence {
            user_id: user.user_id.clone(),
            user_name: user.user_name.clone(),
            socket_id: socket_id.to_string(),
            role,
            joined_at: now,
            last_activity: now,
        };

        let mut rooms = self.rooms.write().await;
        let room = rooms.entry(workflow_id.to_string()).or_default();
        room.active_connections += 1;
        room.users.insert(socket_id.to_string(), presence);
        drop(rooms);

        self.socket_rooms
            .write()
            .await
            .insert(socket_id.to_string(), workflow_id.to_string());
    }

    /// Remove the socket from its room. Returns the room it left, if any.
    /// Empty rooms are dropped.
    pub async fn leave(&self, socket_id: &str) -> Option<String> {
        let workflow_id = self.socket_rooms.write().await.remove(socket_id)?;

        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get_mut(&workflow_id) {
            room.users.remove(socket_id);
            room.active_connections = room.active_connections.saturating_sub(1);
            if room.users.is_empty() {
                rooms.remove(&workflow_id);
            }
        }
        Some(workflow_id)
    }

    /// Drop the connection channel and session on socket close.
    pub async fn unregister(&self, socket_id: &str) {
        self.senders.write().await.remove(socket_id);
        self.sessions.write().await.remove(socket_id);
    }

    pub async fn touch_activity(&self, socket_id: &str) {
        if let Some(workflow_id) = self.room_of(socket_id).await {
            let mut rooms = self.rooms.write().await;
            if let Some(presence) = rooms
                .get_mut(&workflow_id)
                .and_then(|room| room.users.get_mut(socket_id))
            {
                presence.last_activity = Utc::now();
            }
        }
    }

    pub async fn set_last_modified(&self, workflow_id: &str) {
        if let Some(room) = self.rooms.write().await.get_mut(workflow_id) {
            room.last_modified = Some(Utc::now());
        }
    }

    pub async fn presence_for(&self, workflow_id: &str) -> Vec<PresenceView> {
        self.rooms
            .read()
            .await
            .get(workflow_id)
            .map(|room| room.users.values().map(UserPresence::view).collect())
            .unwrap_or_default()
    }

    pub async fn room_sockets(&self, workflow_id: &str) -> Vec<SocketId> {
        self.rooms
            .read()
            .await
            .get(workflow_id)
            .map(|room| room.users.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Deliver one event to one socket. Dead channels are ignored; the
    /// disconnect path cleans them up.
    pub async fn send_to(&self, socket_id: &str, event: ServerEvent) {
        if let Some(sender) = self.senders.read().await.get(socket_id) {
            if sender.send(event).is_err() {
                log::debug!("dropping event for closed socket {}", socket_id);
            }
        }
    }

    /// Fan an event out to every room member except the listed sockets.
    pub async fn broadcast(&self, workflow_id: &str, exclude: &[&str], event: ServerEvent) {
        let targets = self.room_sockets(workflow_id).await;
        let senders = self.senders.read().await;
        for socket_id in targets {
            if exclude.contains(&socket_id.as_str()) {
                continue;
            }
            if let Some(sender) = senders.get(&socket_id) {
                let _ = sender.send(event.clone());
            }
        }
    }

    /// Presence delta for everyone else in the room.
    pub async fn broadcast_presence(&self, workflow_id: &str, exclude: &[&str]) {
        let users = self.presence_for(workflow_id).await;
        self.broadcast(workflow_id, exclude, ServerEvent::PresenceUpdate { users })
            .await;
    }
}
