//! Cloakserv - project cloak request and approval service
//!
//! Project contacts request a masked hostname ("cloak") for an account on
//! behalf of their namespace; administrators activate or reject the pending
//! requests, and activation rewrites the displayed host of every live session
//! on the account.

pub mod cloak;
pub mod error;
pub mod models;
pub mod sessions;
pub mod store;
pub mod websocket;

use std::sync::Arc;

use sqlx::SqlitePool;

use cloak::CloakService;
use sessions::SessionRegistry;
use store::Store;

/// Application state shared across handlers
pub struct AppState {
    pub store: Store,
    pub sessions: Arc<SessionRegistry>,
    pub cloaks: CloakService,
}

impl AppState {
    pub fn new(pool: SqlitePool) -> Arc<Self> {
        let store = Store::new(pool);
        let sessions = Arc::new(SessionRegistry::new());
        let cloaks = CloakService::new(store.clone(), sessions.clone());
        Arc::new(Self {
            store,
            sessions,
            cloaks,
        })
    }
}
