//! Cloak workflow service: submission, listing, activation, rejection
//!
//! Owns the pending-request queue. All queue access goes through one `RwLock`
//! and every mutating handler holds the write guard across its whole
//! find-then-remove sequence, so at most one mutation is in flight at a time.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{broadcast, RwLock};

use super::request::{CloakRequest, PositionMatching, RequestQueue};
use super::validity;
use crate::error::{AppError, Result};
use crate::sessions::SessionRegistry;
use crate::store::Store;

/// Account metadata keys written on activation
pub const MD_CLOAK: &str = "cloak";
pub const MD_CLOAK_TIMESTAMP: &str = "cloak:timestamp";
pub const MD_CLOAK_ASSIGNER: &str = "cloak:assigner";

/// Events emitted by the cloak service
#[derive(Debug, Clone)]
pub enum CloakEvent {
    /// A request entered the queue
    Submitted {
        project: String,
        requestor: String,
        target: String,
        cloak: String,
    },
    /// A request was activated and committed to the account
    Activated {
        target: String,
        cloak: String,
        requestor: String,
        assigner: String,
    },
    /// A request was rejected and dropped
    Rejected {
        target: String,
        cloak: String,
        requestor: String,
        rejected_by: String,
    },
}

/// Service coordinating cloak requests and approvals
pub struct CloakService {
    store: Store,
    sessions: Arc<SessionRegistry>,
    queue: RwLock<RequestQueue>,
    matching: PositionMatching,
    event_tx: broadcast::Sender<CloakEvent>,
}

impl CloakService {
    pub fn new(store: Store, sessions: Arc<SessionRegistry>) -> Self {
        Self::with_matching(store, sessions, PositionMatching::default())
    }

    /// Create a service with an explicit positional-matching mode.
    pub fn with_matching(
        store: Store,
        sessions: Arc<SessionRegistry>,
        matching: PositionMatching,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            store,
            sessions,
            queue: RwLock::new(RequestQueue::new()),
            matching,
            event_tx,
        }
    }

    /// Subscribe to cloak events
    pub fn subscribe(&self) -> broadcast::Receiver<CloakEvent> {
        self.event_tx.subscribe()
    }

    /// Submit a cloak request on behalf of the project owning the cloak's
    /// namespace. Validation is fully ordered and side-effect-free until every
    /// check passes; the first failure wins.
    pub async fn submit(
        &self,
        target: Option<&str>,
        cloak: Option<&str>,
        requestor: &str,
    ) -> Result<CloakRequest> {
        let (target, cloak) = match (target, cloak) {
            (Some(target), Some(cloak)) if !target.is_empty() && !cloak.is_empty() => {
                (target, cloak)
            }
            _ => return Err(AppError::MissingParams("request")),
        };

        validity::check(cloak)?;

        let namespace = cloak.split('/').next().unwrap_or(cloak);
        let project = self
            .store
            .project_by_namespace(namespace)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!(
                    "the {} namespace is not registered to a project",
                    namespace
                ))
            })?;

        let account = self
            .store
            .account_by_name(target)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("{} is not registered", target)))?;

        if !self.store.is_contact(project.id, requestor).await? {
            return Err(AppError::Forbidden(format!(
                "{} is not an authorized contact for the {} namespace",
                requestor, namespace
            )));
        }

        if account.frozen {
            return Err(AppError::NoChange(format!(
                "{} is frozen and cannot be cloaked",
                account.name
            )));
        }

        if let Some(current) = self.store.metadata_get(account.id, MD_CLOAK).await? {
            if current == cloak {
                return Err(AppError::NoChange(format!(
                    "{} already has the given cloak set",
                    account.name
                )));
            }
        }

        let request =
            CloakRequest::new(project.name.as_str(), requestor, account.name.as_str(), cloak);

        {
            let mut queue = self.queue.write().await;
            queue.push(request.clone());
        }

        tracing::info!(
            target: "audit",
            cloak = %request.cloak,
            account = %request.target,
            project = %request.project,
            requestor = %request.requestor,
            "cloak requested"
        );

        let _ = self.event_tx.send(CloakEvent::Submitted {
            project: request.project.clone(),
            requestor: request.requestor.clone(),
            target: request.target.clone(),
            cloak: request.cloak.clone(),
        });

        Ok(request)
    }

    /// Snapshot of the queue for display: `(1-based position, request)` rows
    /// in insertion order. Pure read.
    pub async fn waiting(&self) -> Vec<(usize, CloakRequest)> {
        let queue = self.queue.read().await;
        queue
            .iter()
            .map(|(position, request)| (position, request.clone()))
            .collect()
    }

    pub async fn pending_count(&self) -> usize {
        let queue = self.queue.read().await;
        queue.len()
    }

    /// Activate the first request matching `token`: commit the cloak to the
    /// account's metadata, rewrite the host of all its live sessions, and
    /// drop the request from the queue.
    pub async fn activate(&self, token: Option<&str>, assigner: &str) -> Result<CloakRequest> {
        let token = token
            .filter(|t| !t.is_empty())
            .ok_or(AppError::MissingParams("activate"))?;

        let mut queue = self.queue.write().await;
        let index = queue.resolve(token, self.matching).ok_or_else(|| {
            AppError::NotFound(format!("{} not found in cloak request database", token))
        })?;
        let request = queue
            .get(index)
            .cloned()
            .ok_or_else(|| AppError::Internal("resolved index out of bounds".to_string()))?;

        let account = self
            .store
            .account_by_name(&request.target)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!("{} is not registered", request.target))
            })?;

        let now = Utc::now();
        self.store
            .metadata_set(account.id, MD_CLOAK, &request.cloak)
            .await?;
        self.store
            .metadata_set(account.id, MD_CLOAK_TIMESTAMP, &now.timestamp().to_string())
            .await?;
        self.store
            .metadata_set(account.id, MD_CLOAK_ASSIGNER, assigner)
            .await?;

        self.sessions
            .set_account_host(&account.name, Some(&request.cloak))
            .await;

        // Store and sessions are committed; only now does the request leave
        // the queue.
        queue.remove(index);
        drop(queue);

        tracing::info!(
            target: "audit",
            cloak = %request.cloak,
            account = %request.target,
            requestor = %request.requestor,
            assigner = %assigner,
            "cloak request activated"
        );

        let _ = self.event_tx.send(CloakEvent::Activated {
            target: request.target.clone(),
            cloak: request.cloak.clone(),
            requestor: request.requestor.clone(),
            assigner: assigner.to_string(),
        });

        Ok(request)
    }

    /// Reject the first request matching `token`: drop it from the queue
    /// without touching the account or its sessions.
    pub async fn reject(&self, token: Option<&str>, rejected_by: &str) -> Result<CloakRequest> {
        let token = token
            .filter(|t| !t.is_empty())
            .ok_or(AppError::MissingParams("reject"))?;

        let mut queue = self.queue.write().await;
        let index = queue.resolve(token, self.matching).ok_or_else(|| {
            AppError::NotFound(format!("{} not found in cloak request database", token))
        })?;
        let request = queue
            .remove(index)
            .ok_or_else(|| AppError::Internal("resolved index out of bounds".to_string()))?;
        drop(queue);

        tracing::info!(
            target: "audit",
            cloak = %request.cloak,
            account = %request.target,
            requestor = %request.requestor,
            rejected_by = %rejected_by,
            "cloak request rejected"
        );

        let _ = self.event_tx.send(CloakEvent::Rejected {
            target: request.target.clone(),
            cloak: request.cloak.clone(),
            requestor: request.requestor.clone(),
            rejected_by: rejected_by.to_string(),
        });

        Ok(request)
    }
}
