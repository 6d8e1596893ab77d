//! Prerequisite checking: a pure function of the planner result and the
//! current context. A non-empty result means no stage agent may run.

use super::PlannerResult;
use crate::context::SharedContext;
use crate::models::Stage;

pub const DATASET_MISSING: &str = "dataset needs to be loaded";
pub const FORMULATION_MISSING: &str = "treatment and outcome must be defined";
pub const ADJUSTMENT_SET_MISSING: &str = "adjustment set must be identified";

/// Missing preconditions for `plan` given `context`, de-duplicated, in the
/// order they were found.
pub fn check(plan: &PlannerResult, context: &SharedContext) -> Vec<String> {
    let mut missing: Vec<String> = Vec::new();

    if plan.intent.requires_dataset && context.dataset.is_none() {
        push_unique(&mut missing, DATASET_MISSING);
    }

    for stage in &plan.intent.requires_prior_stages {
        if let Some(item) = unmet_stage(*stage, context) {
            push_unique(&mut missing, item);
        }
    }

    // Free-text prerequisites from the model only count when they map onto a
    // field we can verify; the mapped item then de-duplicates with the above.
    for declared in &plan.execution_plan.prerequisites {
        if let Some(item) = recognise(declared).and_then(|stage| unmet_stage(stage, context)) {
            push_unique(&mut missing, item);
        }
    }

    missing
}

/// The defining fields of a stage, as a missing-precondition string.
fn unmet_stage(stage: Stage, context: &SharedContext) -> Option<&'static str> {
    match stage {
        Stage::Formulation if !context.has_causal_question() => Some(FORMULATION_MISSING),
        Stage::Eda if context.dataset.is_none() => Some(DATASET_MISSING),
        Stage::Identification if !context.has_adjustment_set() => Some(ADJUSTMENT_SET_MISSING),
        _ => None,
    }
}

fn recognise(declared: &str) -> Option<Stage> {
    let lower = declared.to_lowercase();
    if lower.contains("dataset") || lower.contains("data loaded") {
        Some(Stage::Eda)
    } else if lower.contains("treatment") || lower.contains("outcome") || lower.contains("formulation") {
        Some(Stage::Formulation)
    } else if lower.contains("adjustment") {
        Some(Stage::Identification)
    } else {
        None
    }
}

fn push_unique(missing: &mut Vec<String>, item: &str) {
    if !missing.iter().any(|m| m == item) {
        missing.push(item.to_string());
    }
}
