//! Mutation trigger policy.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use signaltune_core::config::MutationConfig;

/// Decides when the loop should generate a fresh draft.
///
/// Fires when nothing has been generated yet, when `min_interval` has
/// elapsed since the last draft, or with `explore_probability` on any tick.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationSchedule {
    pub min_interval: Duration,
    pub explore_probability: f64,
}

impl MutationSchedule {
    pub fn new(min_interval: Duration, explore_probability: f64) -> Self {
        Self {
            min_interval,
            explore_probability,
        }
    }

    pub fn from_config(config: &MutationConfig) -> Self {
        Self::new(
            Duration::from_secs(config.min_interval_secs),
            config.explore_probability,
        )
    }

    pub fn should_mutate<R: Rng>(
        &self,
        last: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        rng: &mut R,
    ) -> bool {
        let Some(last) = last else {
            return true;
        };
        let elapsed = (now - last).to_std().unwrap_or(Duration::ZERO);
        if elapsed > self.min_interval {
            return true;
        }
        let p = if self.explore_probability.is_finite() {
            self.explore_probability.clamp(0.0, 1.0)
        } else {
            0.0
        };
        rng.gen_bool(p)
    }
}
