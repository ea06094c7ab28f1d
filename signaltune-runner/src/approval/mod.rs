//! Approval workflow: the human gate for drafts below the auto-promotion bar.
//!
//! The pending table is the one piece of state shared between the loop
//! (which submits) and the callback path (which decides). It lives behind a
//! single mutex. Approve and approve-all keep that mutex held while they
//! promote, so a replayed decision always sees the resolved state and a
//! concurrent submit can never land in the middle of a batch.
//!
//! Lock order is always table, then the promotion gate.

pub mod outcome;
pub mod request;

pub use outcome::{auto_promoted_text, prompt_text, Outcome, PROMPT_SNIPPET_CHARS};
pub use request::{
    Action, ApprovalRequest, CallbackAction, IdAllocator, PendingSummary, RequestId, APPROVE_ALL,
};

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use signaltune_core::metrics::MetricsSnapshot;
use signaltune_core::store::{truncate_chars, Draft};
use thiserror::Error;
use tracing::{info, warn};

use crate::learning_log::LogEvent;
use crate::services::TunerServices;

/// Longest draft excerpt returned by a view.
pub const VIEW_LIMIT_CHARS: usize = 4000;

#[derive(Debug, Error, PartialEq)]
pub enum ApprovalError {
    #[error("request id {0} is already pending")]
    DuplicateId(RequestId),
}

#[derive(Debug, Default)]
struct PendingTable {
    entries: HashMap<RequestId, ApprovalRequest>,
    ids: IdAllocator,
    next_seq: u64,
}

pub struct ApprovalWorkflow {
    table: Mutex<PendingTable>,
    services: TunerServices,
}

impl ApprovalWorkflow {
    pub fn new(services: TunerServices) -> Self {
        Self {
            table: Mutex::new(PendingTable::default()),
            services,
        }
    }

    pub fn services(&self) -> &TunerServices {
        &self.services
    }

    fn lock(&self) -> MutexGuard<'_, PendingTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue `draft` for a decision and send the prompt.
    pub fn submit(
        &self,
        draft: Draft,
        baseline: f64,
        candidate: MetricsSnapshot,
    ) -> Result<RequestId, ApprovalError> {
        self.submit_at(draft, baseline, candidate, Utc::now())
    }

    pub fn submit_at(
        &self,
        draft: Draft,
        baseline: f64,
        candidate: MetricsSnapshot,
        now: DateTime<Utc>,
    ) -> Result<RequestId, ApprovalError> {
        let request = {
            let mut table = self.lock();
            let id = table.ids.allocate(now);
            if table.entries.contains_key(&id) {
                warn!(%id, "request id collision, refusing to overwrite");
                return Err(ApprovalError::DuplicateId(id));
            }
            let seq = table.next_seq;
            table.next_seq += 1;
            let request = ApprovalRequest {
                id: id.clone(),
                seq,
                draft,
                baseline,
                candidate,
                created_at: now,
            };
            table.entries.insert(id, request.clone());
            request
        };

        info!(
            id = %request.id,
            hash = request.draft.short_hash(),
            accuracy = request.candidate.accuracy,
            gain = request.candidate.accuracy_gain,
            "approval requested"
        );
        self.services.log.record(LogEvent::ApprovalRequested {
            request_id: request.id.to_string(),
            accuracy: request.candidate.accuracy,
        });
        self.services.notify(&prompt_text(&request));
        Ok(request.id)
    }

    /// Apply a decision and report it over the channel.
    pub fn decide(&self, id: &RequestId, action: Action) -> Outcome {
        let outcome = match action {
            Action::Approve => self.approve(id),
            Action::Reject => self.reject(id),
            Action::View => self.view(id),
        };
        self.services.notify(&outcome.message());
        outcome
    }

    /// Promote every pending request in creation order and empty the table.
    pub fn approve_all(&self) -> Outcome {
        let outcome = {
            let mut table = self.lock();
            let mut batch: Vec<ApprovalRequest> =
                table.entries.drain().map(|(_, request)| request).collect();
            batch.sort_by_key(|r| r.seq);

            let mut promoted = Vec::new();
            let mut failed = Vec::new();
            for request in batch {
                match self.promote_request(&request) {
                    Ok(version_id) => promoted.push((request.id, version_id)),
                    Err(reason) => {
                        warn!(id = %request.id, %reason, "approve-all: promotion failed, continuing");
                        failed.push((request.id, reason));
                    }
                }
            }
            Outcome::ApprovedAll { promoted, failed }
        };

        if let Outcome::ApprovedAll { promoted, failed } = &outcome {
            info!(promoted = promoted.len(), failed = failed.len(), "approve-all finished");
            self.services.log.record(LogEvent::ApproveAllFinished {
                promoted: promoted.len(),
                failed: failed.len(),
            });
        }
        self.services.notify(&outcome.message());
        outcome
    }

    /// Entry point for raw inbound callback data.
    pub fn handle_callback(&self, data: &str) -> Outcome {
        match CallbackAction::parse(data) {
            Some(CallbackAction::Decide(id, action)) => self.decide(&id, action),
            Some(CallbackAction::ApproveAll) => self.approve_all(),
            None => {
                warn!(data, "malformed callback data");
                Outcome::Malformed {
                    data: data.trim().to_string(),
                }
            }
        }
    }

    /// Resolve requests older than `ttl` to expired.
    pub fn expire_older_than(&self, ttl: chrono::Duration, now: DateTime<Utc>) -> Vec<RequestId> {
        let expired: Vec<ApprovalRequest> = {
            let mut table = self.lock();
            let stale: Vec<RequestId> = table
                .entries
                .values()
                .filter(|r| now - r.created_at >= ttl)
                .map(|r| r.id.clone())
                .collect();
            let mut expired: Vec<ApprovalRequest> = stale
                .iter()
                .filter_map(|id| table.entries.remove(id))
                .collect();
            expired.sort_by_key(|r| r.seq);
            expired
        };

        for request in &expired {
            info!(id = %request.id, "approval request expired");
            self.clear_draft(&request.draft);
            self.services.log.record(LogEvent::Expired {
                request_id: request.id.to_string(),
            });
            self.services
                .notify(&format!("Request {} expired without a decision.", request.id));
        }
        expired.into_iter().map(|r| r.id).collect()
    }

    /// Pending requests in creation order.
    pub fn pending(&self) -> Vec<PendingSummary> {
        let table = self.lock();
        let mut requests: Vec<&ApprovalRequest> = table.entries.values().collect();
        requests.sort_by_key(|r| r.seq);
        requests.into_iter().map(ApprovalRequest::summary).collect()
    }

    pub fn pending_count(&self) -> usize {
        self.lock().entries.len()
    }

    /// Id of the pending request holding the draft with `content_hash`.
    pub fn pending_for_draft(&self, content_hash: &str) -> Option<RequestId> {
        self.lock()
            .entries
            .values()
            .find(|r| r.draft.content_hash == content_hash)
            .map(|r| r.id.clone())
    }

    fn approve(&self, id: &RequestId) -> Outcome {
        let mut table = self.lock();
        let Some(request) = table.entries.get(id).cloned() else {
            info!(%id, "approve for unknown request");
            return Outcome::Unknown { id: id.clone() };
        };

        match self.promote_request(&request) {
            Ok(version_id) => {
                table.entries.remove(id);
                Outcome::Approved {
                    id: id.clone(),
                    version_id,
                    accuracy: request.candidate.accuracy,
                }
            }
            Err(reason) => Outcome::PromotionFailed {
                id: id.clone(),
                reason,
            },
        }
    }

    fn reject(&self, id: &RequestId) -> Outcome {
        let removed = self.lock().entries.remove(id);
        let Some(request) = removed else {
            info!(%id, "reject for unknown request");
            return Outcome::Unknown { id: id.clone() };
        };

        info!(%id, "request rejected");
        self.clear_draft(&request.draft);
        self.services.log.record(LogEvent::Rejected {
            request_id: id.to_string(),
        });
        Outcome::Rejected { id: id.clone() }
    }

    fn view(&self, id: &RequestId) -> Outcome {
        let table = self.lock();
        match table.entries.get(id) {
            Some(request) => {
                let content = truncate_chars(&request.draft.content, VIEW_LIMIT_CHARS);
                Outcome::View {
                    id: id.clone(),
                    truncated: content.len() < request.draft.content.len(),
                    content: content.to_string(),
                }
            }
            None => Outcome::Unknown { id: id.clone() },
        }
    }

    /// The one promotion path for approve and approve-all. Callers hold the
    /// table lock.
    fn promote_request(&self, request: &ApprovalRequest) -> Result<String, String> {
        match self
            .services
            .promoter
            .adopt(&request.draft, &request.candidate)
        {
            Ok(record) => {
                info!(id = %request.id, version = %record.version_id, "request approved");
                self.clear_draft(&request.draft);
                self.services.log.record(LogEvent::Approved {
                    request_id: request.id.to_string(),
                    version_id: record.version_id.clone(),
                });
                Ok(record.version_id)
            }
            Err(e) => {
                warn!(id = %request.id, error = %e, "promotion of approved request failed");
                Err(e.to_string())
            }
        }
    }

    fn clear_draft(&self, draft: &Draft) {
        match self.services.draft_slot.remove_if_matches(&draft.content_hash) {
            Ok(true) => info!(hash = draft.short_hash(), "consumed draft removed"),
            Ok(false) => {}
            Err(e) => warn!(error = %e, "cannot remove consumed draft"),
        }
    }
}
