//! HTTP/WebSocket transport for the collaboration plane.
//!
//! Endpoints:
//! - GET  /healthz                           liveness
//! - GET  /socket                            WebSocket upgrade into the rooms
//! - POST /api/workflows/:id/execute         rate-limited execution gate
//! - GET  /api/rate-limit/status             read-only limiter status
//!
//! The socket handshake carries `userId`/`userName` query parameters; in
//! production an authentication middleware sits in front and supplies them.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use uuid::Uuid;

use super::protocol::{AuthenticatedUser, ClientFrame, ServerEvent};
use super::CollabServer;
use crate::limits::{RateLimiter, SubscriptionLookup, TriggerType};

#[derive(Clone)]
pub struct AppState {
    pub collab: Arc<CollabServer>,
    pub limiter: Arc<RateLimiter>,
    pub subscriptions: Arc<dyn SubscriptionLookup>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/socket", get(socket_handler))
        .route("/api/workflows/:workflow_id/execute", post(execute_handler))
        .route("/api/rate-limit/status", get(status_handler))
        .with_state(state)
}

/// Bind and serve until the process is stopped.
pub async fn run(state: AppState, bind: &str) -> Result<(), Box<dyn std::error::Error>> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    log::info!("listening on {}", bind);
    axum::serve(listener, create_router(state)).await?;
    Ok(())
}

async fn healthz() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SocketQuery {
    user_id: Option<String>,
    user_name: Option<String>,
}

async fn socket_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<SocketQuery>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state.collab, query))
}

async fn handle_socket(socket: WebSocket, collab: Arc<CollabServer>, query: SocketQuery) {
    let socket_id = Uuid::new_v4().to_string();
    let user = query.user_id.map(|user_id| AuthenticatedUser {
        user_name: query.user_name.unwrap_or_else(|| user_id.clone()),
        user_id,
    });

    let events = collab.connect(&socket_id, user).await;
    let (mut sink, mut stream) = socket.split();

    // Outbound: drain the room channel into the websocket
    let writer = tokio::spawn(async move {
        let mut events = UnboundedReceiverStream::new(events);
        while let Some(event) = events.next().await {
            let Ok(text) = serde_json::to_string(&event) else {
                continue;
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    // Inbound: decode frames and dispatch
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientFrame>(&text) {
                Ok(frame) => collab.handle_frame(&socket_id, frame).await,
                Err(err) => {
                    collab
                        .rooms()
                        .send_to(
                            &socket_id,
                            ServerEvent::Error {
                                kind: "INVALID_FRAME".into(),
                                message: err.to_string(),
                            },
                        )
                        .await;
                }
            },
            Ok(Message::Close(_)) | Err(_) => break,
            _ => {}
        }
    }

    collab.disconnect(&socket_id).await;
    writer.abort();
    log::debug!("socket {} closed", socket_id);
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecuteBody {
    user_id: String,
    #[serde(default)]
    trigger_type: Option<String>,
    #[serde(default)]
    is_async: bool,
}

/// Workflow-execution ingress gate: key selection by subscription, then the
/// fixed-window check. Denials surface as HTTP 429.
async fn execute_handler(
    Path(workflow_id): Path<String>,
    State(state): State<AppState>,
    Json(body): Json<ExecuteBody>,
) -> impl IntoResponse {
    let subscription = match state
        .subscriptions
        .highest_priority_subscription(&body.user_id)
        .await
    {
        Ok(subscription) => subscription,
        Err(err) => {
            log::warn!("subscription lookup failed for {}: {}", body.user_id, err);
            None
        }
    };

    let trigger = TriggerType::parse(body.trigger_type.as_deref().unwrap_or("api"));
    let decision = state
        .limiter
        .check(&body.user_id, subscription.as_ref(), trigger, body.is_async)
        .await;

    if !decision.allowed {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({
                "allowed": false,
                "remaining": 0,
                "resetAt": decision.reset_at,
            })),
        )
            .into_response();
    }

    log::info!(
        "execution admitted: workflow={} user={} remaining={}",
        workflow_id,
        body.user_id,
        decision.remaining
    );
    (
        StatusCode::OK,
        Json(json!({
            "accepted": true,
            "workflowId": workflow_id,
            "remaining": decision.remaining,
            "resetAt": decision.reset_at,
        })),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusQuery {
    user_id: String,
    #[serde(default)]
    trigger_type: Option<String>,
    #[serde(default)]
    is_async: bool,
}

async fn status_handler(
    Query(query): Query<StatusQuery>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let subscription = state
        .subscriptions
        .highest_priority_subscription(&query.user_id)
        .await
        .unwrap_or(None);

    let trigger = TriggerType::parse(query.trigger_type.as_deref().unwrap_or("api"));
    let status = state
        .limiter
        .status(&query.user_id, subscription.as_ref(), trigger, query.is_async)
        .await;
    Json(status)
}
