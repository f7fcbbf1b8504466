//! WebSocket command surface
//!
//! Parses tagged client messages, enforces privilege before any handler runs,
//! and relays host changes back to the affected connection. The cloak core
//! itself never sees a privilege check.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    response::IntoResponse,
};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::cloak::service::MD_CLOAK;
use crate::error::{AppError, Result};
use crate::models::Role;
use crate::sessions::SessionEvent;
use crate::AppState;

/// WebSocket handler
pub async fn handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, addr))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, addr: SocketAddr) {
    let (mut sender, mut receiver) = socket.split();

    let session = state.sessions.register(addr.ip().to_string()).await;
    let session_id = session.id;
    let mut events = state.sessions.subscribe();

    loop {
        tokio::select! {
            msg = receiver.next() => {
                let msg = match msg {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        tracing::error!("WebSocket error: {}", e);
                        break;
                    }
                };

                let client_msg: ClientMessage = match serde_json::from_str(&msg) {
                    Ok(m) => m,
                    Err(e) => {
                        let error = ServerMessage::Error {
                            kind: "invalid_message".to_string(),
                            message: format!("Invalid message: {}", e),
                            detail: None,
                        };
                        send(&mut sender, &error).await;
                        continue;
                    }
                };

                if let Err(err) = dispatch(&mut sender, &state, session_id, client_msg).await {
                    send_error(&mut sender, &err).await;
                }
            }
            event = events.recv() => {
                match event {
                    Ok(SessionEvent::HostChanged { session_id: changed, host, .. })
                        if changed == session_id =>
                    {
                        send(&mut sender, &ServerMessage::HostChanged { host }).await;
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Session {} lagged {} events", session_id, skipped);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    state.sessions.remove(session_id).await;
}

async fn dispatch(
    sender: &mut SplitSink<WebSocket, Message>,
    state: &Arc<AppState>,
    session_id: Uuid,
    msg: ClientMessage,
) -> Result<()> {
    match msg {
        ClientMessage::Attach { account, role } => {
            let account = state
                .store
                .account_by_name(&account)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("{} is not registered", account)))?;

            let cloak = state.store.metadata_get(account.id, MD_CLOAK).await?;
            let session = state
                .sessions
                .attach(session_id, account.name.as_str(), role, cloak.as_deref())
                .await
                .ok_or_else(|| AppError::Internal("session is gone".to_string()))?;

            let reply = ServerMessage::Attached {
                session_id,
                account: account.name,
                visible_host: session.visible_host,
            };
            send(sender, &reply).await;
            Ok(())
        }
        ClientMessage::Request { account, cloak } => {
            let (_, requestor) = require_attached(state, session_id).await?;
            let request = state
                .cloaks
                .submit(account.as_deref(), cloak.as_deref(), &requestor)
                .await?;

            let reply = ServerMessage::RequestQueued {
                target: request.target,
                cloak: request.cloak,
                project: request.project,
            };
            send(sender, &reply).await;
            Ok(())
        }
        ClientMessage::Waiting => {
            require_admin(state, session_id).await?;
            let rows = state.cloaks.waiting().await;
            let count = rows.len();

            for (position, request) in rows {
                let row = ServerMessage::PendingRequest {
                    position,
                    target: request.target,
                    cloak: request.cloak,
                    project: request.project,
                    requestor: request.requestor,
                };
                send(sender, &row).await;
            }
            send(sender, &ServerMessage::EndOfList { count }).await;
            Ok(())
        }
        ClientMessage::Activate { target } => {
            let (_, admin) = require_admin(state, session_id).await?;
            let request = state.cloaks.activate(target.as_deref(), &admin).await?;

            let reply = ServerMessage::Activated {
                target: request.target,
                cloak: request.cloak,
            };
            send(sender, &reply).await;
            Ok(())
        }
        ClientMessage::Reject { target } => {
            let (_, admin) = require_admin(state, session_id).await?;
            let request = state.cloaks.reject(target.as_deref(), &admin).await?;

            let reply = ServerMessage::Rejected {
                target: request.target,
                cloak: request.cloak,
            };
            send(sender, &reply).await;
            Ok(())
        }
    }
}

/// The session must be attached to an account. Returns the session and its
/// canonical account name.
async fn require_attached(
    state: &Arc<AppState>,
    session_id: Uuid,
) -> Result<(crate::sessions::LiveSession, String)> {
    let session = state
        .sessions
        .get(session_id)
        .await
        .ok_or_else(|| AppError::Internal("session is gone".to_string()))?;

    match session.account.clone() {
        Some(account) => Ok((session, account)),
        None => Err(AppError::Forbidden("you are not logged in".to_string())),
    }
}

/// The session must be attached and hold the admin role.
async fn require_admin(
    state: &Arc<AppState>,
    session_id: Uuid,
) -> Result<(crate::sessions::LiveSession, String)> {
    let (session, account) = require_attached(state, session_id).await?;
    if !session.role.is_admin() {
        return Err(AppError::Forbidden(
            "you do not have the required privileges".to_string(),
        ));
    }
    Ok((session, account))
}

fn syntax_hint(operation: &str) -> Option<&'static str> {
    match operation {
        "request" => Some("Syntax: request <account> <cloak>"),
        "activate" => Some("Syntax: activate <account|position>"),
        "reject" => Some("Syntax: reject <account|position>"),
        _ => None,
    }
}

async fn send_error(sender: &mut SplitSink<WebSocket, Message>, err: &AppError) {
    let detail = err
        .operation()
        .and_then(syntax_hint)
        .map(|hint| hint.to_string());
    let error = ServerMessage::Error {
        kind: err.kind().to_string(),
        message: err.to_string(),
        detail,
    };
    send(sender, &error).await;
}

async fn send(sender: &mut SplitSink<WebSocket, Message>, msg: &ServerMessage) {
    if let Err(e) = sender
        .send(Message::Text(serde_json::to_string(msg).unwrap().into()))
        .await
    {
        tracing::error!("Failed to send message: {}", e);
    }
}

/// Messages from client to server
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Bind this connection to an account
    Attach {
        account: String,
        #[serde(default)]
        role: Role,
    },
    /// Submit a cloak request
    Request {
        account: Option<String>,
        cloak: Option<String>,
    },
    /// List pending cloak requests
    Waiting,
    /// Activate a pending cloak request
    Activate { target: Option<String> },
    /// Reject a pending cloak request
    Reject { target: Option<String> },
}

/// Messages from server to client
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Session is now bound to an account
    Attached {
        session_id: Uuid,
        account: String,
        visible_host: String,
    },
    /// A cloak request was queued
    RequestQueued {
        target: String,
        cloak: String,
        project: String,
    },
    /// One pending request (emitted per row of a listing)
    PendingRequest {
        position: usize,
        target: String,
        cloak: String,
        project: String,
        requestor: String,
    },
    /// Terminal marker of a listing
    EndOfList { count: usize },
    /// A request was activated
    Activated { target: String, cloak: String },
    /// A request was rejected
    Rejected { target: String, cloak: String },
    /// This session's displayed host changed
    HostChanged { host: String },
    /// Error occurred
    Error {
        kind: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
}
