//! Orchestrator loop: detect draft, evaluate, gate, promote or ask.
//!
//! One iteration at a time, strictly single-flight. The loop never exits on
//! its own: errors and panics inside an iteration are logged and followed
//! by a shorter recovery pause, and only the cancel flag stops it.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use signaltune_core::config::{MutationConfig, Thresholds, ThresholdsHandle};
use signaltune_core::metrics::{MetricsError, MetricsSnapshot};
use signaltune_core::mutator::{mutate, MutationPolicy};
use signaltune_core::rng::RngHierarchy;
use signaltune_core::store::{Draft, StoreError};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::approval::{auto_promoted_text, ApprovalError, ApprovalWorkflow, RequestId};
use crate::evaluator::SandboxEvaluator;
use crate::learning_log::LogEvent;
use crate::promotion::PromotionError;
use crate::schedule::MutationSchedule;
use crate::services::TunerServices;

/// Slack for float noise in the gain comparison.
const GAIN_EPSILON: f64 = 1e-9;
const CANCEL_CHECK_STEP: Duration = Duration::from_millis(100);

const STREAM_SCHEDULE: &str = "schedule";
const STREAM_MUTATION: &str = "mutation";

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Promotion(#[from] PromotionError),
    #[error(transparent)]
    Approval(#[from] ApprovalError),
    #[error(transparent)]
    Metrics(#[from] MetricsError),
}

/// What one iteration did.
#[derive(Debug, Clone, PartialEq)]
pub enum IterationOutcome {
    /// No draft present.
    Idle,
    /// The draft is already waiting for a human decision.
    AwaitingDecision { id: RequestId },
    /// The evaluator failed; nothing changed.
    EvaluationFailed { reason: String },
    AutoPromoted {
        version_id: String,
        candidate: MetricsSnapshot,
    },
    Submitted {
        request_id: RequestId,
        candidate: MetricsSnapshot,
    },
}

impl IterationOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            IterationOutcome::Idle => "idle",
            IterationOutcome::AwaitingDecision { .. } => "awaiting_decision",
            IterationOutcome::EvaluationFailed { .. } => "evaluation_failed",
            IterationOutcome::AutoPromoted { .. } => "auto_promoted",
            IterationOutcome::Submitted { .. } => "submitted",
        }
    }
}

/// Mutate current production and write the result to the draft slot.
///
/// Returns `None` when there is no usable production module or nothing to
/// mutate.
pub fn generate_draft<R: Rng>(
    services: &TunerServices,
    policy: &MutationPolicy,
    rng: &mut R,
    now: DateTime<Utc>,
) -> Result<Option<Draft>, StoreError> {
    let production = match services.promoter.production_module() {
        Ok(Some(module)) => module,
        Ok(None) => {
            debug!("no production module to mutate");
            return Ok(None);
        }
        Err(StoreError::Module(e)) => {
            warn!(error = %e, "production is not a parameter table, skipping mutation");
            return Ok(None);
        }
        Err(e) => return Err(e),
    };

    let report = mutate(&production, policy, rng, now);
    if report.is_noop() {
        return Ok(None);
    }

    let draft = services.draft_slot.write_module(&report.module)?;
    services.log.record(LogEvent::DraftGenerated {
        content_hash: draft.content_hash.clone(),
        description: report.description(),
    });
    Ok(Some(draft))
}

pub struct Orchestrator {
    approvals: Arc<ApprovalWorkflow>,
    evaluator: Box<dyn SandboxEvaluator>,
    thresholds: ThresholdsHandle,
    mutation: MutationConfig,
    schedule: MutationSchedule,
    rng: RngHierarchy,
    iteration: u64,
    last_mutation: Option<DateTime<Utc>>,
}

impl Orchestrator {
    pub fn new(
        approvals: Arc<ApprovalWorkflow>,
        evaluator: Box<dyn SandboxEvaluator>,
        thresholds: ThresholdsHandle,
        mutation: MutationConfig,
        seed: u64,
    ) -> Self {
        Self {
            approvals,
            evaluator,
            thresholds,
            schedule: MutationSchedule::from_config(&mutation),
            mutation,
            rng: RngHierarchy::new(seed),
            iteration: 0,
            last_mutation: None,
        }
    }

    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    /// Run one pass of the loop.
    pub fn run_iteration(&mut self) -> Result<IterationOutcome, OrchestratorError> {
        let approvals = Arc::clone(&self.approvals);
        let services = approvals.services();
        let thresholds = self.thresholds.snapshot();
        let now = Utc::now();
        let iteration = self.iteration;
        self.iteration += 1;

        if let Some(ttl) = thresholds.approval_ttl() {
            approvals.expire_older_than(ttl, now);
        }

        if self.mutation.enabled && !services.draft_slot.exists() {
            self.maybe_mutate(services, &thresholds, iteration, now)?;
        }

        let Some(draft) = services.draft_slot.load()? else {
            return Ok(IterationOutcome::Idle);
        };
        if let Some(id) = approvals.pending_for_draft(&draft.content_hash) {
            debug!(%id, hash = draft.short_hash(), "draft already awaiting a decision");
            return Ok(IterationOutcome::AwaitingDecision { id });
        }

        let report = match self.evaluator.evaluate(services.draft_slot.path()) {
            Ok(report) => report,
            Err(e) => return Ok(self.evaluation_failed(services, &draft, e.to_string())),
        };

        let baseline = services.promoter.metrics().baseline_accuracy();
        let candidate = match MetricsSnapshot::candidate(baseline, &report) {
            Ok(candidate) => candidate,
            Err(e) => return Ok(self.evaluation_failed(services, &draft, e.to_string())),
        };
        let gain = candidate.gain_over(baseline);
        info!(
            hash = draft.short_hash(),
            baseline,
            candidate = candidate.accuracy,
            gain,
            threshold = thresholds.auto_promote_min_gain,
            "draft evaluated"
        );
        services.log.record(LogEvent::Evaluated {
            content_hash: draft.content_hash.clone(),
            accuracy_gain: report.accuracy_gain,
            baseline,
            candidate: candidate.accuracy,
        });

        if gain + GAIN_EPSILON >= thresholds.auto_promote_min_gain {
            let record = services.promoter.adopt(&draft, &candidate)?;
            if let Err(e) = services.draft_slot.remove_if_matches(&draft.content_hash) {
                warn!(error = %e, "cannot remove promoted draft");
            }
            services.log.record(LogEvent::AutoPromoted {
                version_id: record.version_id.clone(),
                accuracy: candidate.accuracy,
            });
            services.notify(&auto_promoted_text(&record.version_id, candidate.accuracy, gain));
            Ok(IterationOutcome::AutoPromoted {
                version_id: record.version_id,
                candidate,
            })
        } else {
            let request_id = approvals.submit(draft, baseline, candidate.clone())?;
            Ok(IterationOutcome::Submitted {
                request_id,
                candidate,
            })
        }
    }

    /// Loop until `cancel` is set.
    pub fn run(&mut self, cancel: &AtomicBool) {
        let services = self.approvals.services().clone();
        services.log.record(LogEvent::LoopStarted {
            seed: self.rng.master_seed(),
        });
        info!(seed = self.rng.master_seed(), "orchestrator started");

        while !cancel.load(Ordering::Relaxed) {
            let result = panic::catch_unwind(AssertUnwindSafe(|| self.run_iteration()));
            let thresholds = self.thresholds.snapshot();
            let pause = match result {
                Ok(Ok(outcome)) => {
                    debug!(iteration = self.iteration, outcome = outcome.label(), "iteration done");
                    thresholds.poll_interval()
                }
                Ok(Err(e)) => {
                    error!(error = %e, "iteration failed");
                    services.log.record(LogEvent::LoopError {
                        message: e.to_string(),
                    });
                    thresholds.recovery_interval()
                }
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    error!(panic = %message, "iteration panicked");
                    services.log.record(LogEvent::LoopError { message });
                    thresholds.recovery_interval()
                }
            };
            sleep_unless_cancelled(pause, cancel);
        }
        info!(iterations = self.iteration, "orchestrator stopped");
    }

    /// Mutation bounds come from this iteration's thresholds snapshot, so a
    /// retrained policy takes effect on the next tick.
    fn maybe_mutate(
        &mut self,
        services: &TunerServices,
        thresholds: &Thresholds,
        iteration: u64,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut schedule_rng = self.rng.rng_for(STREAM_SCHEDULE, iteration);
        if !self
            .schedule
            .should_mutate(self.last_mutation, now, &mut schedule_rng)
        {
            return Ok(());
        }

        let bounds = &thresholds.mutation_bounds;
        if let Err(e) = bounds.validate() {
            warn!(error = %e, "mutation bounds are invalid, skipping mutation");
            return Ok(());
        }

        let mut rng = self.rng.rng_for(STREAM_MUTATION, iteration);
        self.last_mutation = Some(now);
        if let Some(draft) = generate_draft(services, bounds, &mut rng, now)? {
            info!(iteration, hash = draft.short_hash(), "mutated new draft");
        }
        Ok(())
    }

    fn evaluation_failed(
        &self,
        services: &TunerServices,
        draft: &Draft,
        reason: String,
    ) -> IterationOutcome {
        warn!(hash = draft.short_hash(), %reason, "evaluation failed, skipping cycle");
        services.log.record(LogEvent::EvaluationFailed {
            content_hash: draft.content_hash.clone(),
            reason: reason.clone(),
        });
        IterationOutcome::EvaluationFailed { reason }
    }
}

fn sleep_unless_cancelled(total: Duration, cancel: &AtomicBool) {
    let mut remaining = total;
    while !remaining.is_zero() && !cancel.load(Ordering::Relaxed) {
        let step = remaining.min(CANCEL_CHECK_STEP);
        thread::sleep(step);
        remaining = remaining.saturating_sub(step);
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_payloads_are_readable() {
        let payload = panic::catch_unwind(|| panic!("boom {}", 1)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "boom 1");

        let payload = panic::catch_unwind(|| panic!("static")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "static");
    }

    #[test]
    fn cancelled_sleep_returns_immediately() {
        let cancel = AtomicBool::new(true);
        let started = std::time::Instant::now();
        sleep_unless_cancelled(Duration::from_secs(30), &cancel);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn outcome_labels() {
        assert_eq!(IterationOutcome::Idle.label(), "idle");
        assert_eq!(
            IterationOutcome::EvaluationFailed {
                reason: "x".into()
            }
            .label(),
            "evaluation_failed"
        );
    }
}
