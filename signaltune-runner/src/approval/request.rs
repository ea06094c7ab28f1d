//! Pending approval requests and inbound callback data.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use signaltune_core::metrics::MetricsSnapshot;
use signaltune_core::store::Draft;

/// Callback data for the bulk action.
pub const APPROVE_ALL: &str = "approve_all";
const SEPARATOR: &str = "::";

/// Time-derived request identifier (`%Y%m%d%H%M%S`, `-n` on same-second
/// collisions).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hands out request ids. An id is never issued twice: allocations within
/// the same second, or after the wall clock stepped back, extend the last
/// base with a `-n` counter. The table still rejects an id it already holds.
#[derive(Debug, Default)]
pub struct IdAllocator {
    last_base: Option<String>,
    counter: u32,
}

impl IdAllocator {
    pub fn allocate(&mut self, now: DateTime<Utc>) -> RequestId {
        let base = now.format("%Y%m%d%H%M%S").to_string();
        // Fixed-width digits, so string order is time order.
        if let Some(last) = self.last_base.as_deref().filter(|last| base.as_str() <= *last) {
            self.counter += 1;
            RequestId(format!("{last}-{}", self.counter))
        } else {
            self.counter = 0;
            self.last_base = Some(base.clone());
            RequestId(base)
        }
    }
}

/// A draft waiting for a human decision.
///
/// Holds its own copy of the evaluated draft, so approving promotes exactly
/// the content that was measured even if the draft slot changed since.
#[derive(Debug, Clone)]
pub struct ApprovalRequest {
    pub id: RequestId,
    pub seq: u64,
    pub draft: Draft,
    pub baseline: f64,
    pub candidate: MetricsSnapshot,
    pub created_at: DateTime<Utc>,
}

impl ApprovalRequest {
    pub fn summary(&self) -> PendingSummary {
        PendingSummary {
            id: self.id.clone(),
            created_at: self.created_at,
            baseline: self.baseline,
            accuracy: self.candidate.accuracy,
            accuracy_gain: self.candidate.accuracy_gain,
            content_hash: self.draft.content_hash.clone(),
            provenance: self.draft.provenance.clone(),
        }
    }
}

/// Read-only view of a pending request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingSummary {
    pub id: RequestId,
    pub created_at: DateTime<Utc>,
    pub baseline: f64,
    pub accuracy: f64,
    pub accuracy_gain: f64,
    pub content_hash: String,
    pub provenance: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Approve,
    Reject,
    View,
}

impl Action {
    fn keyword(self) -> &'static str {
        match self {
            Action::Approve => "approve",
            Action::Reject => "reject",
            Action::View => "view",
        }
    }

    /// Callback data that triggers this action on `id`.
    pub fn callback_data(self, id: &RequestId) -> String {
        format!("{}{SEPARATOR}{id}", self.keyword())
    }
}

/// A parsed inbound callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackAction {
    Decide(RequestId, Action),
    ApproveAll,
}

impl CallbackAction {
    /// Parse `approve::<id>`, `reject::<id>`, `view::<id>` or `approve_all`.
    pub fn parse(data: &str) -> Option<Self> {
        let data = data.trim();
        if data == APPROVE_ALL {
            return Some(CallbackAction::ApproveAll);
        }
        let (verb, id) = data.split_once(SEPARATOR)?;
        let id = id.trim();
        if id.is_empty() {
            return None;
        }
        let action = match verb.trim() {
            "approve" => Action::Approve,
            "reject" => Action::Reject,
            "view" => Action::View,
            _ => return None,
        };
        Some(CallbackAction::Decide(RequestId::new(id), action))
    }
}
