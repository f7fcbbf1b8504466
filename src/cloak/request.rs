//! Pending cloak requests and the queue that owns them

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A pending request to assign `cloak` to `target`, submitted on behalf of
/// `project` by `requestor`. Immutable once queued.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloakRequest {
    /// Project on whose behalf the cloak was requested
    pub project: String,
    /// Contact who submitted the request
    pub requestor: String,
    /// Canonical account name the cloak will be applied to
    pub target: String,
    /// The requested hostname mask
    pub cloak: String,
    pub requested_at: DateTime<Utc>,
}

impl CloakRequest {
    pub fn new(
        project: impl Into<String>,
        requestor: impl Into<String>,
        target: impl Into<String>,
        cloak: impl Into<String>,
    ) -> Self {
        Self {
            project: project.into(),
            requestor: requestor.into(),
            target: target.into(),
            cloak: cloak.into(),
            requested_at: Utc::now(),
        }
    }
}

/// How a numeric token is matched against display positions during
/// resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PositionMatching {
    /// The position counter advances per scanned entry, so every listed
    /// position is selectable.
    #[default]
    Advancing,
    /// The counter never advances past 1, so a numeric token can only ever
    /// select the head of the queue. Kept for deployments that script against
    /// this behavior.
    LegacyFirstOnly,
}

/// Ordered queue of pending cloak requests, insertion order preserved.
///
/// Multiple pending requests for the same target are permitted. Positions are
/// display-only: they are recomputed on every enumeration and are not stable
/// across mutations.
#[derive(Debug, Default)]
pub struct RequestQueue {
    requests: Vec<CloakRequest>,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a request to the tail of the queue
    pub fn push(&mut self, request: CloakRequest) {
        self.requests.push(request);
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Enumerate `(position, request)` pairs in insertion order. Positions are
    /// 1-based and computed fresh on each call.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &CloakRequest)> {
        self.requests
            .iter()
            .enumerate()
            .map(|(index, request)| (index + 1, request))
    }

    pub fn get(&self, index: usize) -> Option<&CloakRequest> {
        self.requests.get(index)
    }

    /// Remove the request at `index`, captured from a completed scan. Never
    /// called while an enumeration is live.
    pub fn remove(&mut self, index: usize) -> Option<CloakRequest> {
        if index < self.requests.len() {
            Some(self.requests.remove(index))
        } else {
            None
        }
    }

    /// Scan the queue for a request matching `token`.
    ///
    /// A request matches if its target equals the token verbatim, or if the
    /// token parses as an integer equal to the request's current 1-based scan
    /// position under the given matching mode. Returns the index of the first
    /// match.
    pub fn resolve(&self, token: &str, matching: PositionMatching) -> Option<usize> {
        let numeric: Option<usize> = token.parse().ok();

        let mut position = 1;
        for (index, request) in self.requests.iter().enumerate() {
            if request.target == token || numeric == Some(position) {
                return Some(index);
            }
            if matching == PositionMatching::Advancing {
                position += 1;
            }
        }
        None
    }
}
