//! Decision outcomes and the human-readable texts sent over the channel.

use signaltune_core::store::truncate_chars;

use super::request::{Action, ApprovalRequest, RequestId, APPROVE_ALL};

/// Snippet length in a decision prompt.
pub const PROMPT_SNIPPET_CHARS: usize = 800;

/// Result of an inbound decision. Soft failures are outcomes, not errors.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Approved {
        id: RequestId,
        version_id: String,
        accuracy: f64,
    },
    /// Promotion failed; the request is still pending.
    PromotionFailed { id: RequestId, reason: String },
    Rejected { id: RequestId },
    View {
        id: RequestId,
        content: String,
        truncated: bool,
    },
    ApprovedAll {
        promoted: Vec<(RequestId, String)>,
        failed: Vec<(RequestId, String)>,
    },
    /// The id was never issued or is already resolved.
    Unknown { id: RequestId },
    Malformed { data: String },
}

impl Outcome {
    /// True when this decision changed production.
    pub fn promoted_any(&self) -> bool {
        match self {
            Outcome::Approved { .. } => true,
            Outcome::ApprovedAll { promoted, .. } => !promoted.is_empty(),
            _ => false,
        }
    }

    pub fn message(&self) -> String {
        match self {
            Outcome::Approved {
                id,
                version_id,
                accuracy,
            } => format!(
                "Approved {id}: promoted as {version_id}, baseline now {}",
                percent(*accuracy)
            ),
            Outcome::PromotionFailed { id, reason } => {
                format!("Promotion of {id} failed, request kept pending: {reason}")
            }
            Outcome::Rejected { id } => format!("Rejected {id}. Production unchanged."),
            Outcome::View {
                id,
                content,
                truncated,
            } => {
                let more = if *truncated { "\n[truncated]" } else { "" };
                format!("Draft for {id}:\n{content}{more}")
            }
            Outcome::ApprovedAll { promoted, failed } => {
                if promoted.is_empty() && failed.is_empty() {
                    return "No pending requests.".to_string();
                }
                let mut text = format!("Approved {} pending request(s).", promoted.len());
                for (id, version) in promoted {
                    text.push_str(&format!("\n  {id} -> {version}"));
                }
                if !failed.is_empty() {
                    text.push_str(&format!("\n{} failed:", failed.len()));
                    for (id, reason) in failed {
                        text.push_str(&format!("\n  {id}: {reason}"));
                    }
                }
                text
            }
            Outcome::Unknown { id } => format!("Request {id} is unknown or already resolved."),
            Outcome::Malformed { data } => format!("Unrecognized command: {data:?}"),
        }
    }
}

/// Decision prompt for a new pending request.
pub fn prompt_text(request: &ApprovalRequest) -> String {
    let id = &request.id;
    let candidate = &request.candidate;
    let metrics = serde_json::to_string_pretty(candidate).unwrap_or_default();
    let origin = request
        .draft
        .provenance
        .as_deref()
        .unwrap_or("external draft");

    format!(
        "Strategy draft awaiting approval\n\
         Request: {id}\n\
         Draft: {hash} ({origin})\n\
         Accuracy: {baseline} -> {accuracy} ({gain:+.2} pts)\n\
         Metrics:\n{metrics}\n\
         Snippet:\n{snippet}\n\
         Reply: {approve} | {reject} | {view} | {APPROVE_ALL}",
        hash = request.draft.short_hash(),
        baseline = percent(request.baseline),
        accuracy = percent(candidate.accuracy),
        gain = candidate.accuracy_gain * 100.0,
        snippet = truncate_chars(&request.draft.content, PROMPT_SNIPPET_CHARS),
        approve = Action::Approve.callback_data(id),
        reject = Action::Reject.callback_data(id),
        view = Action::View.callback_data(id),
    )
}

/// Text for a draft promoted without human approval.
pub fn auto_promoted_text(version_id: &str, accuracy: f64, gain: f64) -> String {
    format!(
        "Auto-promoted {version_id}: accuracy {} ({:+.2} pts)",
        percent(accuracy),
        gain * 100.0
    )
}

fn percent(fraction: f64) -> String {
    format!("{:.2}%", fraction * 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use signaltune_core::metrics::{EvaluationReport, MetricsSnapshot};
    use signaltune_core::store::Draft;

    fn request(content: &str) -> ApprovalRequest {
        let report = EvaluationReport {
            accuracy_gain: 0.01,
            ..Default::default()
        };
        ApprovalRequest {
            id: RequestId::new("20240501093000"),
            seq: 0,
            draft: Draft::from_content(content.to_string()),
            baseline: 0.60,
            candidate: MetricsSnapshot::candidate(0.60, &report).unwrap(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn prompt_embeds_id_and_commands() {
        let text = prompt_text(&request("[params.buy_rsi]\nvalue = 71\n"));
        assert!(text.contains("Request: 20240501093000"));
        assert!(text.contains("approve::20240501093000"));
        assert!(text.contains("view::20240501093000"));
        assert!(text.contains("approve_all"));
        assert!(text.contains("60.00% -> 61.00%"));
        assert!(text.contains("\"accuracy\""));
    }

    #[test]
    fn prompt_snippet_is_bounded() {
        let body = "x".repeat(5_000);
        let text = prompt_text(&request(&body));
        assert!(text.len() < 2_000);
    }

    #[test]
    fn empty_approve_all_says_so() {
        let outcome = Outcome::ApprovedAll {
            promoted: Vec::new(),
            failed: Vec::new(),
        };
        assert_eq!(outcome.message(), "No pending requests.");
        assert!(!outcome.promoted_any());
    }

    #[test]
    fn unknown_message_names_id() {
        let outcome = Outcome::Unknown {
            id: RequestId::new("nonexistent-id"),
        };
        assert!(outcome.message().contains("nonexistent-id"));
    }
}
