//! Deterministic keyword classifier used when the completion service is
//! unavailable or its reply cannot be read.
//!
//! Rules are evaluated in the order of [`RULES`]; the first match wins.
//! Greeting, help and affirmative detection come before any stage keyword so
//! that a short acknowledgment is never routed into a stage re-execution.

use std::sync::LazyLock;

use regex::Regex;

use super::{CausalSpec, ExecutionPlan, Intent, IntentType, PlanSource, PlanStep, PlannerResult};
use crate::models::Stage;

pub struct FallbackRule {
    pub name: &'static str,
    pub confidence: f64,
    matches: fn(&str) -> bool,
    build: fn(&str) -> (Intent, CausalSpec),
}

impl FallbackRule {
    pub fn matches(&self, normalized: &str) -> bool {
        (self.matches)(normalized)
    }
}

macro_rules! pattern {
    ($name:ident, $re:expr) => {
        static $name: LazyLock<Regex> =
            LazyLock::new(|| Regex::new($re).expect(concat!("regex ", stringify!($name))));
    };
}

pattern!(GREETING, r"^(hi|hello|hey|howdy|greetings|hiya|good (morning|afternoon|evening))\b");
pattern!(
    HELP,
    r"^(help\b|\?+$|what can you do|what do you do|how does this work|how do i (use|start)|show (me )?(the )?commands)"
);
pattern!(
    AFFIRMATIVE,
    r"^(y|ya|yes|yeah|yep|yup|sure|ok|okay|k|go|go ahead|do it|please do|sounds good|lets go|let's go|alright|fine|correct|right)$"
);
pattern!(RESTART, r"^(restart|reset|start over|start again|begin again|new analysis)\b");
pattern!(CONTINUE, r"^(continue|next|next step|proceed|go on|move on|keep going)$");
pattern!(DATA_PATH, r"(?i)[\w~./\\-]+\.(csv|tsv)\b");
pattern!(DATA_VERB, r"\b(load|upload|import|open|read|use)\b.*\b(data|dataset|file|csv|spreadsheet)\b");
pattern!(
    DOES_X_AFFECT_Y,
    r"^(?:does|do|did|can|could|will|would|is|are)\s+(.+?)\s+(?:affect|affects|reduce|reduces|increase|increases|cause|causes|impact|impacts|influence|influences|improve|improves|lower|lowers|raise|raises|decrease|decreases|prevent|prevents|change|changes|lead to|leads to)\s+(.+?)[?.!\s]*$"
);
pattern!(
    EFFECT_OF_X_ON_Y,
    r"\b(?:effect|impact|influence)\s+of\s+(.+?)\s+on\s+(.+?)[?.!\s]*$"
);
pattern!(ESTIMATION_VERB, r"^(estimate|compute|calculate|quantify|measure)\b");
pattern!(
    EXPLORATION,
    r"\b(explore|exploration|exploratory|eda|distribution|distributions|summary statistics|describe the data|missing (data|values)|overlap|balance|positivity|check (the )?data|correlation|correlations)\b"
);
pattern!(DAG, r"\b(dag|causal graph|causal diagram|draw the graph)\b");
pattern!(
    IDENTIFICATION,
    r"\b(adjust for|adjustment set|identification|identify the effect|backdoor|back-door|front-door|instrument|what should i control for)\b"
);
pattern!(
    ESTIMATION,
    r"\b(estimate|estimation|ate|average treatment effect|run the (model|analysis|estimation)|regression|propensity|matching|ipw)\b"
);

pub static RULES: &[FallbackRule] = &[
    FallbackRule {
        name: "greeting",
        confidence: 0.9,
        matches: |m| word_count(m) <= 4 && GREETING.is_match(m),
        build: |m| control_like(IntentType::GeneralQuestion, "greeting", m),
    },
    FallbackRule {
        name: "help",
        confidence: 0.9,
        matches: |m| HELP.is_match(m),
        build: |m| control_like(IntentType::GeneralQuestion, "help", m),
    },
    FallbackRule {
        name: "affirmative",
        confidence: 0.85,
        matches: |m| AFFIRMATIVE.is_match(m),
        build: |m| control_like(IntentType::WorkflowControl, "affirmative", m),
    },
    FallbackRule {
        name: "restart",
        confidence: 0.8,
        matches: |m| word_count(m) <= 5 && RESTART.is_match(m),
        build: |m| control_like(IntentType::WorkflowControl, "restart", m),
    },
    FallbackRule {
        name: "continue",
        confidence: 0.8,
        matches: |m| CONTINUE.is_match(m),
        build: |m| control_like(IntentType::WorkflowControl, "continue", m),
    },
    FallbackRule {
        name: "dataset",
        confidence: 0.7,
        matches: |m| DATA_PATH.is_match(m) || DATA_VERB.is_match(m),
        build: |m| stage_like(IntentType::DatasetOperation, Some("load"), m, false, vec![]),
    },
    FallbackRule {
        name: "causal_question",
        confidence: 0.6,
        matches: |m| {
            DOES_X_AFFECT_Y.is_match(m) || (EFFECT_OF_X_ON_Y.is_match(m) && !ESTIMATION_VERB.is_match(m))
        },
        build: |m| {
            let (intent, _) = stage_like(IntentType::Formulation, None, m, false, vec![]);
            (intent, extract_causal_spec(m))
        },
    },
    FallbackRule {
        name: "exploration",
        confidence: 0.55,
        matches: |m| EXPLORATION.is_match(m),
        build: |m| stage_like(IntentType::Eda, None, m, true, vec![]),
    },
    FallbackRule {
        name: "dag",
        confidence: 0.55,
        matches: |m| DAG.is_match(m),
        build: |m| stage_like(IntentType::Dag, None, m, false, vec![Stage::Formulation]),
    },
    FallbackRule {
        name: "identification",
        confidence: 0.55,
        matches: |m| IDENTIFICATION.is_match(m),
        build: |m| stage_like(IntentType::Identification, None, m, false, vec![Stage::Formulation]),
    },
    FallbackRule {
        name: "estimation",
        confidence: 0.55,
        matches: |m| ESTIMATION.is_match(m),
        build: |m| stage_like(IntentType::Estimation, None, m, false, vec![Stage::Formulation]),
    },
    FallbackRule {
        name: "general",
        confidence: 0.3,
        matches: |_| true,
        build: |m| control_like(IntentType::GeneralQuestion, "question", m),
    },
];

/// Lowercase, collapse whitespace, strip trailing punctuation.
pub fn normalize(message: &str) -> String {
    message
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
        .trim_end_matches(['.', '!', ',', ';'])
        .trim()
        .to_string()
}

pub fn classify(message: &str) -> PlannerResult {
    let normalized = normalize(message);
    // The last rule always matches.
    let rule = RULES
        .iter()
        .find(|r| r.matches(&normalized))
        .unwrap_or(&RULES[RULES.len() - 1]);

    let (intent, causal_spec) = (rule.build)(&normalized);
    let execution_plan = plan_for(&intent, message);

    PlannerResult {
        intent,
        causal_spec,
        execution_plan,
        confidence: rule.confidence,
        reasoning: format!("Keyword fallback classification (rule: {})", rule.name),
        source: PlanSource::Fallback,
    }
}

/// Treatment and outcome from "does X affect Y" / "effect of X on Y".
pub fn extract_causal_spec(normalized: &str) -> CausalSpec {
    let captures = DOES_X_AFFECT_Y
        .captures(normalized)
        .or_else(|| EFFECT_OF_X_ON_Y.captures(normalized));

    let Some(captures) = captures else {
        return CausalSpec::default();
    };
    CausalSpec {
        treatment: captures.get(1).map(|m| clean_variable(m.as_str())),
        outcome: captures.get(2).map(|m| clean_variable(m.as_str())),
        ..Default::default()
    }
}

fn clean_variable(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches(['?', '.', '!']);
    trimmed
        .strip_prefix("the ")
        .or_else(|| trimmed.strip_prefix("a "))
        .or_else(|| trimmed.strip_prefix("an "))
        .unwrap_or(trimmed)
        .trim()
        .to_string()
}

fn word_count(message: &str) -> usize {
    message.split_whitespace().count()
}

fn control_like(kind: IntentType, subtype: &str, message: &str) -> (Intent, CausalSpec) {
    (
        Intent {
            kind,
            subtype: Some(subtype.to_string()),
            user_goal: message.to_string(),
            requires_dataset: false,
            requires_prior_stages: Vec::new(),
        },
        CausalSpec::default(),
    )
}

fn stage_like(
    kind: IntentType,
    subtype: Option<&str>,
    message: &str,
    requires_dataset: bool,
    requires_prior_stages: Vec<Stage>,
) -> (Intent, CausalSpec) {
    (
        Intent {
            kind,
            subtype: subtype.map(str::to_string),
            user_goal: message.to_string(),
            requires_dataset,
            requires_prior_stages,
        },
        CausalSpec::default(),
    )
}

fn plan_for(intent: &Intent, message: &str) -> ExecutionPlan {
    let step = match (intent.kind, intent.subtype.as_deref()) {
        (IntentType::WorkflowControl, _) => None,
        (IntentType::GeneralQuestion, Some("greeting" | "help")) => None,
        (kind, _) => Some(PlanStep {
            agent: kind.handler_name().to_string(),
            action: kind.default_action().to_string(),
            input: serde_json::json!({ "message": message }),
            expected_output: kind.expected_output().to_string(),
            depends_on: Vec::new(),
        }),
    };
    ExecutionPlan {
        steps: step.into_iter().collect(),
        prerequisites: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scenario_a_causal_question() {
        let result = classify("Does aspirin reduce heart attacks?");
        assert_eq!(result.intent.kind, IntentType::Formulation);
        assert_eq!(result.causal_spec.treatment.as_deref(), Some("aspirin"));
        assert_eq!(result.causal_spec.outcome.as_deref(), Some("heart attacks"));
        assert!(!result.intent.requires_dataset);
        assert!(result.confidence <= 0.6);
        assert!(result.reasoning.contains("fallback"));
    }

    #[test]
    fn test_scenario_c_single_letter_is_affirmative() {
        let result = classify("y");
        assert_eq!(result.intent.kind, IntentType::WorkflowControl);
        assert_eq!(result.intent.subtype.as_deref(), Some("affirmative"));
        assert_eq!(result.confidence, 0.85);
    }

    #[test]
    fn test_greeting_before_stage_keywords() {
        let result = classify("Hello, estimate please");
        assert_eq!(result.intent.kind, IntentType::GeneralQuestion);
        assert_eq!(result.intent.subtype.as_deref(), Some("greeting"));
    }

    #[test]
    fn test_estimation_request_without_question() {
        let result = classify("estimate the effect");
        assert_eq!(result.intent.kind, IntentType::Estimation);
        assert_eq!(result.intent.requires_prior_stages, vec![Stage::Formulation]);
        assert!(!result.intent.requires_dataset);
    }

    #[test]
    fn test_estimation_verb_wins_over_effect_of() {
        let result = classify("Estimate the effect of statins on MI");
        assert_eq!(result.intent.kind, IntentType::Estimation);
    }

    #[test]
    fn test_effect_of_pattern() {
        let spec = classify("What is the effect of smoking on lung cancer?").causal_spec;
        assert_eq!(spec.treatment.as_deref(), Some("smoking"));
        assert_eq!(spec.outcome.as_deref(), Some("lung cancer"));
    }

    #[test]
    fn test_exploration_requires_dataset() {
        let result = classify("check overlap between the groups");
        assert_eq!(result.intent.kind, IntentType::Eda);
        assert!(result.intent.requires_dataset);
    }

    #[test]
    fn test_dataset_and_control_rules() {
        assert_eq!(classify("load data/cohort.csv").intent.kind, IntentType::DatasetOperation);
        assert_eq!(classify("start over").intent.subtype.as_deref(), Some("restart"));
        assert_eq!(classify("next").intent.subtype.as_deref(), Some("continue"));
        assert_eq!(classify("help").intent.subtype.as_deref(), Some("help"));
    }

    #[test]
    fn test_unmatched_is_low_confidence_general_question() {
        let result = classify("why is the sky blue");
        assert_eq!(result.intent.kind, IntentType::GeneralQuestion);
        assert_eq!(result.confidence, 0.3);
        assert_eq!(result.execution_plan.steps.len(), 1);
    }

    #[test]
    fn test_high_confidence_results_are_deterministic() {
        for message in ["y", "hi", "help", "restart", "load trial.csv", "yes"] {
            let first = classify(message);
            assert!(first.confidence >= 0.7);
            for _ in 0..3 {
                assert_eq!(classify(message).intent.kind, first.intent.kind);
            }
        }
    }

    #[test]
    fn test_rule_order_is_explicit() {
        let names: Vec<&str> = RULES.iter().map(|r| r.name).collect();
        let pos = |n: &str| names.iter().position(|x| *x == n).unwrap();
        assert!(pos("greeting") < pos("causal_question"));
        assert!(pos("affirmative") < pos("general"));
        assert!(pos("causal_question") < pos("estimation"));
        assert_eq!(names.last(), Some(&"general"));
    }
}
