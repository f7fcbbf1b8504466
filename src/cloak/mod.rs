//! Cloak request and approval workflow
//!
//! Project contacts request a masked hostname for an account; the request
//! waits in an in-memory queue until an administrator activates or rejects it.

pub mod request;
pub mod service;
pub mod validity;

pub use request::{CloakRequest, PositionMatching, RequestQueue};
pub use service::{CloakEvent, CloakService};
