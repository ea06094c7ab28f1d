//! Draft mutator: bounded random perturbation of the parameter table.
//!
//! Every parameter moves by one delta drawn from its class's discrete set,
//! then gets clamped into `[floor, ceiling]`. The effective floor is the
//! class floor tightened by the parameter's own `min`, so a mutated value
//! can never drop below either.

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::params::{Param, ParamClass, Provenance, StrategyModule};

/// Errors from an invalid mutation policy.
#[derive(Debug, Error, PartialEq)]
pub enum MutationError {
    #[error("{0} class has no mutation deltas")]
    EmptyDeltas(ParamClass),
    #[error("{0} class contains a zero delta")]
    ZeroDelta(ParamClass),
    #[error("{class} ceiling {ceiling} is below floor {floor}")]
    CeilingBelowFloor {
        class: ParamClass,
        floor: i64,
        ceiling: i64,
    },
}

/// Deltas and bounds for one parameter class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassPolicy {
    pub deltas: Vec<i64>,
    pub floor: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ceiling: Option<i64>,
}

impl ClassPolicy {
    pub fn threshold_default() -> Self {
        Self {
            deltas: vec![-3, -2, -1, 1, 2, 3],
            floor: 5,
            ceiling: Some(95),
        }
    }

    pub fn window_default() -> Self {
        Self {
            deltas: vec![-2, -1, 1, 2],
            floor: 2,
            ceiling: None,
        }
    }

    fn validate(&self, class: ParamClass) -> Result<(), MutationError> {
        if self.deltas.is_empty() {
            return Err(MutationError::EmptyDeltas(class));
        }
        if self.deltas.contains(&0) {
            return Err(MutationError::ZeroDelta(class));
        }
        if let Some(ceiling) = self.ceiling {
            if ceiling < self.floor {
                return Err(MutationError::CeilingBelowFloor {
                    class,
                    floor: self.floor,
                    ceiling,
                });
            }
        }
        Ok(())
    }
}

/// Per-class mutation policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MutationPolicy {
    pub threshold: ClassPolicy,
    pub window: ClassPolicy,
}

impl Default for MutationPolicy {
    fn default() -> Self {
        Self {
            threshold: ClassPolicy::threshold_default(),
            window: ClassPolicy::window_default(),
        }
    }
}

impl MutationPolicy {
    pub fn for_class(&self, class: ParamClass) -> &ClassPolicy {
        match class {
            ParamClass::Threshold => &self.threshold,
            ParamClass::Window => &self.window,
        }
    }

    pub fn validate(&self) -> Result<(), MutationError> {
        self.threshold.validate(ParamClass::Threshold)?;
        self.window.validate(ParamClass::Window)
    }

    /// Effective `(floor, ceiling)` for a parameter. The ceiling never sits
    /// below the floor.
    pub fn bounds_for(&self, param: &Param) -> (i64, Option<i64>) {
        let class = self.for_class(param.class);
        let floor = param.min.map_or(class.floor, |min| min.max(class.floor));
        let ceiling = match (class.ceiling, param.max) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        (floor, ceiling.map(|c| c.max(floor)))
    }
}

/// One applied perturbation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedMutation {
    pub name: String,
    pub class: ParamClass,
    pub old: i64,
    pub delta: i64,
    pub new: i64,
}

/// Mutated module plus what was applied to produce it.
#[derive(Debug, Clone)]
pub struct MutationReport {
    pub module: StrategyModule,
    pub applied: Vec<AppliedMutation>,
}

impl MutationReport {
    /// True when there was nothing to mutate.
    pub fn is_noop(&self) -> bool {
        self.applied.is_empty()
    }

    pub fn description(&self) -> String {
        describe(&self.applied)
    }
}

fn describe(applied: &[AppliedMutation]) -> String {
    let parts: Vec<String> = applied
        .iter()
        .map(|m| format!("{} {}->{} ({:+})", m.name, m.old, m.new, m.delta))
        .collect();
    format!("mutation: {}", parts.join(", "))
}

/// Produce a draft from `module` by perturbing every parameter.
///
/// An empty table is not an error: the module comes back unchanged and
/// without a new provenance header.
pub fn mutate<R: Rng>(
    module: &StrategyModule,
    policy: &MutationPolicy,
    rng: &mut R,
    now: DateTime<Utc>,
) -> MutationReport {
    if module.is_empty() {
        info!("no mutation targets in module, leaving it unchanged");
        return MutationReport {
            module: module.clone(),
            applied: Vec::new(),
        };
    }

    let mut next = module.clone();
    let mut applied = Vec::with_capacity(next.params.len());

    for (name, param) in next.params.iter_mut() {
        let delta = policy
            .for_class(param.class)
            .deltas
            .choose(rng)
            .copied()
            .unwrap_or(0);
        let (floor, ceiling) = policy.bounds_for(param);

        let mut value = param.value.saturating_add(delta).max(floor);
        if let Some(ceiling) = ceiling {
            value = value.min(ceiling);
        }

        debug!(
            param = %name,
            class = %param.class,
            old = param.value,
            delta,
            new = value,
            "mutated parameter"
        );
        applied.push(AppliedMutation {
            name: name.clone(),
            class: param.class,
            old: param.value,
            delta,
            new: value,
        });
        param.value = value;
    }

    next.provenance = Some(Provenance {
        generated_at: now,
        description: describe(&applied),
    });
    info!(mutations = applied.len(), "draft mutation complete");

    MutationReport {
        module: next,
        applied,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn default_policy_is_valid() {
        assert_eq!(MutationPolicy::default().validate(), Ok(()));
    }

    #[test]
    fn validate_rejects_bad_policies() {
        let mut policy = MutationPolicy::default();
        policy.window.deltas.clear();
        assert_eq!(
            policy.validate(),
            Err(MutationError::EmptyDeltas(ParamClass::Window))
        );

        let mut policy = MutationPolicy::default();
        policy.threshold.deltas.push(0);
        assert_eq!(
            policy.validate(),
            Err(MutationError::ZeroDelta(ParamClass::Threshold))
        );

        let mut policy = MutationPolicy::default();
        policy.threshold.ceiling = Some(1);
        assert!(matches!(
            policy.validate(),
            Err(MutationError::CeilingBelowFloor { .. })
        ));
    }

    #[test]
    fn every_param_moves_by_a_configured_delta() {
        let module = StrategyModule::default_signal_module();
        let policy = MutationPolicy::default();
        let mut rng = StdRng::seed_from_u64(7);

        let report = mutate(&module, &policy, &mut rng, now());
        assert_eq!(report.applied.len(), module.params.len());
        for m in &report.applied {
            assert!(policy.for_class(m.class).deltas.contains(&m.delta));
            assert_eq!(report.module.get(&m.name), Some(m.new));
        }
    }

    #[test]
    fn provenance_header_describes_mutations() {
        let module = StrategyModule::default_signal_module();
        let mut rng = StdRng::seed_from_u64(1);
        let stamp = now();

        let report = mutate(&module, &MutationPolicy::default(), &mut rng, stamp);
        let header = report.module.provenance.as_ref().unwrap();
        assert_eq!(header.generated_at, stamp);
        assert!(header.description.starts_with("mutation: "));
        assert!(header.description.contains("buy_rsi"));
    }

    #[test]
    fn empty_table_is_a_noop() {
        let module = StrategyModule::default();
        let mut rng = StdRng::seed_from_u64(1);

        let report = mutate(&module, &MutationPolicy::default(), &mut rng, now());
        assert!(report.is_noop());
        assert_eq!(report.module, module);
        assert!(report.module.provenance.is_none());
    }

    #[test]
    fn window_at_floor_never_goes_below() {
        let mut module = StrategyModule::default();
        module.params.insert("ma_fast".into(), Param::window(2));
        let policy = MutationPolicy::default();

        for seed in 0..200 {
            let mut rng = StdRng::seed_from_u64(seed);
            let report = mutate(&module, &policy, &mut rng, now());
            assert!(report.module.get("ma_fast").unwrap() >= 2);
        }
    }

    #[test]
    fn param_bounds_tighten_class_bounds() {
        let policy = MutationPolicy::default();
        let param = Param::threshold(70).with_bounds(Some(60), Some(72));
        assert_eq!(policy.bounds_for(&param), (60, Some(72)));

        let loose = Param::threshold(70).with_bounds(Some(1), None);
        assert_eq!(policy.bounds_for(&loose), (5, Some(95)));
    }

    #[test]
    fn value_below_floor_is_lifted() {
        let mut module = StrategyModule::default();
        module.params.insert("sell_rsi".into(), Param::threshold(-10));
        let mut rng = StdRng::seed_from_u64(3);

        let report = mutate(&module, &MutationPolicy::default(), &mut rng, now());
        assert_eq!(report.module.get("sell_rsi"), Some(5));
    }

    #[test]
    fn same_seed_same_draft() {
        let module = StrategyModule::default_signal_module();
        let policy = MutationPolicy::default();
        let stamp = now();

        let a = mutate(&module, &policy, &mut StdRng::seed_from_u64(42), stamp);
        let b = mutate(&module, &policy, &mut StdRng::seed_from_u64(42), stamp);
        assert_eq!(a.module, b.module);
    }
}
