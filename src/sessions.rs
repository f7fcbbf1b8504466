//! Live-session registry
//!
//! Tracks every connected session and the hostname it currently displays.
//! Cloak activation walks this registry to rewrite the visible host of all
//! sessions attached to the target account.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::models::Role;

/// A connected session, possibly attached to an account
#[derive(Debug, Clone, Serialize)]
pub struct LiveSession {
    pub id: Uuid,
    /// Canonical account name, set on attach
    pub account: Option<String>,
    pub role: Role,
    /// The host the session actually connected from
    pub real_host: String,
    /// The host currently displayed for this session
    pub visible_host: String,
    pub connected_at: DateTime<Utc>,
}

/// Events emitted by the session registry
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Connected {
        session_id: Uuid,
    },
    Attached {
        session_id: Uuid,
        account: String,
    },
    /// The displayed host of a session changed
    HostChanged {
        session_id: Uuid,
        account: String,
        host: String,
    },
    Disconnected {
        session_id: Uuid,
    },
}

/// Registry of live sessions
pub struct SessionRegistry {
    sessions: RwLock<HashMap<Uuid, LiveSession>>,
    event_tx: broadcast::Sender<SessionEvent>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            sessions: RwLock::new(HashMap::new()),
            event_tx,
        }
    }

    /// Subscribe to session events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    /// Register a newly connected session. The visible host starts out as the
    /// real host.
    pub async fn register(&self, real_host: impl Into<String>) -> LiveSession {
        let real_host = real_host.into();
        let session = LiveSession {
            id: Uuid::new_v4(),
            account: None,
            role: Role::User,
            visible_host: real_host.clone(),
            real_host,
            connected_at: Utc::now(),
        };

        {
            let mut sessions = self.sessions.write().await;
            sessions.insert(session.id, session.clone());
        }

        let _ = self.event_tx.send(SessionEvent::Connected {
            session_id: session.id,
        });

        session
    }

    /// Bind a session to an account. When the account already has a cloak
    /// assigned, the session displays it from this point on.
    pub async fn attach(
        &self,
        session_id: Uuid,
        account: impl Into<String>,
        role: Role,
        cloak: Option<&str>,
    ) -> Option<LiveSession> {
        let account = account.into();
        let updated = {
            let mut sessions = self.sessions.write().await;
            let session = sessions.get_mut(&session_id)?;
            session.account = Some(account.clone());
            session.role = role;
            if let Some(cloak) = cloak {
                session.visible_host = cloak.to_string();
            }
            session.clone()
        };

        let _ = self.event_tx.send(SessionEvent::Attached {
            session_id,
            account,
        });

        Some(updated)
    }

    /// Remove a session from the registry
    pub async fn remove(&self, session_id: Uuid) -> Option<LiveSession> {
        let removed = {
            let mut sessions = self.sessions.write().await;
            sessions.remove(&session_id)
        };

        if removed.is_some() {
            let _ = self.event_tx.send(SessionEvent::Disconnected { session_id });
        }

        removed
    }

    /// Get a session by ID
    pub async fn get(&self, session_id: Uuid) -> Option<LiveSession> {
        let sessions = self.sessions.read().await;
        sessions.get(&session_id).cloned()
    }

    /// All sessions currently attached to the given account
    pub async fn sessions_for_account(&self, account: &str) -> Vec<LiveSession> {
        let sessions = self.sessions.read().await;
        sessions
            .values()
            .filter(|s| s.account.as_deref() == Some(account))
            .cloned()
            .collect()
    }

    /// Set the displayed host of every session attached to `account`.
    ///
    /// `Some(host)` applies the given cloak; `None` resets each session to its
    /// own real host. Sessions already displaying the right host are left
    /// alone. Returns the ids of the sessions that actually changed.
    pub async fn set_account_host(&self, account: &str, host: Option<&str>) -> Vec<Uuid> {
        let mut changed = Vec::new();

        {
            let mut sessions = self.sessions.write().await;
            for session in sessions.values_mut() {
                if session.account.as_deref() != Some(account) {
                    continue;
                }
                let new_host = host.unwrap_or(&session.real_host).to_string();
                if session.visible_host == new_host {
                    continue;
                }
                session.visible_host = new_host.clone();
                changed.push((session.id, new_host));
            }
        }

        for (session_id, new_host) in &changed {
            let _ = self.event_tx.send(SessionEvent::HostChanged {
                session_id: *session_id,
                account: account.to_string(),
                host: new_host.clone(),
            });
        }

        changed.into_iter().map(|(id, _)| id).collect()
    }

    /// Number of connected sessions
    pub async fn len(&self) -> usize {
        let sessions = self.sessions.read().await;
        sessions.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
