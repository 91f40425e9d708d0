//! Rule-driven feedback from index state to discovery actions.

mod engine;
mod rules;

pub use engine::{
    Disposition, PassReport, RuleOutcome, RulePhase, RuleStatus, TriggerCause, TriggerEngine,
    TriggerEvent,
};
pub use rules::{
    load_rules, rules_from_specs, CacheHitRateBelow, Evaluation, EvaluationContext,
    EvaluationMode, MinPrograms, PredicateSpec, RulePredicate, RuleSpec, StaleSegment,
    TriggerRule,
};
