//! Proptest strategies for partition scoring inputs

use proptest::prelude::*;
use tasker_engine::config::ScoringWeights;
use tasker_engine::models::Priority;
use tasker_engine::partition::ScoreFactors;

pub fn factor_strategy() -> impl Strategy<Value = f64> {
    prop_oneof![
        8 => 0.0f64..=1.0,
        1 => Just(0.0),
        1 => Just(1.0),
    ]
}

pub fn score_factors_strategy() -> impl Strategy<Value = ScoreFactors> {
    (
        factor_strategy(),
        factor_strategy(),
        factor_strategy(),
        factor_strategy(),
        factor_strategy(),
    )
        .prop_map(|(load, performance, availability, resource, error)| ScoreFactors {
            load,
            performance,
            availability,
            resource,
            error,
        })
}

/// Arbitrary non-negative weights, not necessarily summing to one
pub fn weights_strategy() -> impl Strategy<Value = ScoringWeights> {
    (0.0f64..2.0, 0.0f64..2.0, 0.0f64..2.0, 0.0f64..2.0, 0.0f64..2.0).prop_map(
        |(load, performance, availability, resource, error)| ScoringWeights {
            load,
            performance,
            availability,
            resource,
            error,
        },
    )
}

pub fn priority_strategy() -> impl Strategy<Value = Priority> {
    prop::sample::select(Priority::ALL.to_vec())
}
