//! SignalTune Runner: orchestrator loop, approval workflow, promotion, adapters.
//!
//! This crate builds on `signaltune-core` to provide:
//! - Sandbox evaluator contract and a command-backed evaluator
//! - Outbound notifier adapters and inbound callback parsing
//! - Approval workflow with a mutex-guarded pending table
//! - Promotion manager (backup before overwrite, one promotion at a time)
//! - Orchestrator loop with mutation schedule and panic isolation
//! - JSONL learning log

pub mod approval;
pub mod evaluator;
pub mod learning_log;
pub mod notifier;
pub mod orchestrator;
pub mod promotion;
pub mod schedule;
pub mod services;

pub use approval::{Action, ApprovalError, ApprovalWorkflow, CallbackAction, Outcome, RequestId};
pub use evaluator::{CommandEvaluator, EvalError, SandboxEvaluator};
pub use learning_log::{LearningLog, LogEntry, LogEvent};
pub use notifier::{
    notifier_from_config, send_notification, HttpNotifier, LogNotifier, MemoryNotifier, Notifier,
    NotifyError,
};
pub use orchestrator::{generate_draft, IterationOutcome, Orchestrator, OrchestratorError};
pub use promotion::{PromotionError, PromotionManager};
pub use schedule::MutationSchedule;
pub use services::TunerServices;
