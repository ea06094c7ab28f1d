//! SignalTune Core: parameter table, mutator, metrics, durable stores, config.
//!
//! This crate holds everything the tuning loop needs that does not talk to
//! the outside world:
//! - Typed strategy parameter table rendered as TOML
//! - Draft mutator with per-class deltas and floors
//! - Deterministic RNG streams derived from one master seed
//! - Metrics snapshots and evaluation reports
//! - Draft slot, version store and baseline metrics store
//! - TOML configuration

pub mod config;
pub mod metrics;
pub mod mutator;
pub mod params;
pub mod rng;
pub mod store;

pub use config::{ConfigError, Thresholds, ThresholdsHandle, TunerConfig};
pub use metrics::{EvaluationReport, MetricsError, MetricsSnapshot};
pub use mutator::{mutate, MutationError, MutationPolicy, MutationReport};
pub use params::{ModuleError, Param, ParamClass, Provenance, StrategyModule};
pub use rng::RngHierarchy;
pub use store::{Draft, DraftSlot, MetricsStore, StoreError, VersionRecord, VersionStore};
