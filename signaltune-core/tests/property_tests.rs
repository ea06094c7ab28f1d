//! Property tests for mutator and metrics invariants.
//!
//! Uses proptest to verify:
//! 1. Floor: no mutated value ever lands below its effective floor
//! 2. Ceiling: thresholds never exceed their ceiling
//! 3. Locality: a value already inside its bounds moves by at most one delta
//! 4. Candidate metrics: accuracy stays in [0, 1] and gain matches the delta

use chrono::Utc;
use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::SeedableRng;
use signaltune_core::metrics::{EvaluationReport, MetricsSnapshot};
use signaltune_core::mutator::{mutate, MutationPolicy};
use signaltune_core::params::{Param, ParamClass, StrategyModule};

// ── Strategies (proptest) ────────────────────────────────────────────

fn arb_class() -> impl Strategy<Value = ParamClass> {
    prop_oneof![Just(ParamClass::Threshold), Just(ParamClass::Window)]
}

fn arb_param() -> impl Strategy<Value = Param> {
    (
        -1_000i64..1_000,
        arb_class(),
        proptest::option::of(-50i64..50),
        proptest::option::of(0i64..200),
    )
        .prop_map(|(value, class, min, max)| Param {
            value,
            class,
            min,
            max,
        })
}

fn arb_module() -> impl Strategy<Value = StrategyModule> {
    proptest::collection::btree_map("[a-z_]{1,12}", arb_param(), 0..12).prop_map(|params| {
        StrategyModule {
            provenance: None,
            params,
        }
    })
}

// ── 1-3. Mutation bounds ─────────────────────────────────────────────

proptest! {
    #[test]
    fn mutated_values_respect_floor_and_ceiling(module in arb_module(), seed in any::<u64>()) {
        let policy = MutationPolicy::default();
        let mut rng = StdRng::seed_from_u64(seed);
        let report = mutate(&module, &policy, &mut rng, Utc::now());

        prop_assert_eq!(report.applied.len(), module.params.len());
        for (name, param) in &report.module.params {
            let (floor, ceiling) = policy.bounds_for(&module.params[name]);
            prop_assert!(param.value >= floor, "{} = {} below floor {}", name, param.value, floor);
            if let Some(ceiling) = ceiling {
                prop_assert!(param.value <= ceiling, "{} = {} above ceiling {}", name, param.value, ceiling);
            }
        }
    }

    #[test]
    fn in_bounds_values_move_by_one_delta(
        value in 20i64..80,
        class in arb_class(),
        seed in any::<u64>(),
    ) {
        let mut module = StrategyModule::default();
        module.params.insert("p".into(), Param { value, class, min: None, max: None });
        let policy = MutationPolicy::default();
        let mut rng = StdRng::seed_from_u64(seed);

        let report = mutate(&module, &policy, &mut rng, Utc::now());
        let applied = &report.applied[0];
        prop_assert!(policy.for_class(class).deltas.contains(&applied.delta));
        prop_assert_eq!(applied.new, value + applied.delta);
    }

    #[test]
    fn mutation_preserves_names_and_classes(module in arb_module(), seed in any::<u64>()) {
        let mut rng = StdRng::seed_from_u64(seed);
        let report = mutate(&module, &MutationPolicy::default(), &mut rng, Utc::now());

        let before: Vec<_> = module.params.iter().map(|(k, p)| (k.clone(), p.class)).collect();
        let after: Vec<_> = report.module.params.iter().map(|(k, p)| (k.clone(), p.class)).collect();
        prop_assert_eq!(before, after);
    }
}

// ── 4. Candidate metrics ─────────────────────────────────────────────

proptest! {
    #[test]
    fn candidate_accuracy_stays_in_unit_interval(
        baseline in 0.0..=1.0_f64,
        gain in -2.0..2.0_f64,
    ) {
        let report = EvaluationReport { accuracy_gain: gain, ..Default::default() };
        let candidate = MetricsSnapshot::candidate(baseline, &report).unwrap();

        prop_assert!((0.0..=1.0).contains(&candidate.accuracy));
        prop_assert!((candidate.gain_over(baseline) - candidate.accuracy_gain).abs() < 1e-12);
    }
}
