//! Shared Context Store
//!
//! The accumulated, cross-stage analysis state. Stage agents never mutate it
//! directly: they return a [`ContextPatch`] and the router merges it into a
//! fresh copy, restricted to the fields the agent declared it writes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::models::{AssumptionViolation, DatasetDescriptor, EffectEstimate};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SharedContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub treatment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
    /// Always present, possibly empty.
    #[serde(default)]
    pub confounders: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataset: Option<DatasetDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adjustment_set: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimate: Option<EffectEstimate>,
    #[serde(default)]
    pub violations: Vec<AssumptionViolation>,
    #[serde(default)]
    pub extensions: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextField {
    Treatment,
    Outcome,
    Confounders,
    Dataset,
    AdjustmentSet,
    Estimate,
    Violations,
    Extensions,
}

/// Writes proposed by one stage execution. Empty fields mean "no change".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub treatment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub confounders: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataset: Option<DatasetDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adjustment_set: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimate: Option<EffectEstimate>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub violations: Vec<AssumptionViolation>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extensions: BTreeMap<String, serde_json::Value>,
}

impl ContextPatch {
    pub fn touched_fields(&self) -> Vec<ContextField> {
        let mut fields = Vec::new();
        if self.treatment.is_some() {
            fields.push(ContextField::Treatment);
        }
        if self.outcome.is_some() {
            fields.push(ContextField::Outcome);
        }
        if !self.confounders.is_empty() {
            fields.push(ContextField::Confounders);
        }
        if self.dataset.is_some() {
            fields.push(ContextField::Dataset);
        }
        if self.adjustment_set.is_some() {
            fields.push(ContextField::AdjustmentSet);
        }
        if self.estimate.is_some() {
            fields.push(ContextField::Estimate);
        }
        if !self.violations.is_empty() {
            fields.push(ContextField::Violations);
        }
        if !self.extensions.is_empty() {
            fields.push(ContextField::Extensions);
        }
        fields
    }

    pub fn is_empty(&self) -> bool {
        self.touched_fields().is_empty()
    }
}

/// Outcome of a copy-on-write merge.
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub context: SharedContext,
    pub applied: Vec<ContextField>,
    /// Fields the patch touched that the writer had not declared.
    pub rejected: Vec<ContextField>,
}

impl SharedContext {
    pub fn has_causal_question(&self) -> bool {
        is_set(&self.treatment) && is_set(&self.outcome)
    }

    pub fn has_adjustment_set(&self) -> bool {
        self.adjustment_set.as_ref().is_some_and(|set| !set.is_empty())
    }

    /// A copy holding only `fields`; everything else is left at its default.
    pub fn view(&self, fields: &[ContextField]) -> SharedContext {
        let mut visible = SharedContext::default();
        for field in fields {
            match field {
                ContextField::Treatment => visible.treatment = self.treatment.clone(),
                ContextField::Outcome => visible.outcome = self.outcome.clone(),
                ContextField::Confounders => visible.confounders = self.confounders.clone(),
                ContextField::Dataset => visible.dataset = self.dataset.clone(),
                ContextField::AdjustmentSet => visible.adjustment_set = self.adjustment_set.clone(),
                ContextField::Estimate => visible.estimate = self.estimate.clone(),
                ContextField::Violations => visible.violations = self.violations.clone(),
                ContextField::Extensions => visible.extensions = self.extensions.clone(),
            }
        }
        visible
    }

    /// Merge `patch` into a copy of `self`, applying only the `allowed` fields.
    /// Scalars overwrite, confounders are union-extended, violations append.
    pub fn merge(&self, patch: &ContextPatch, allowed: &[ContextField]) -> MergeOutcome {
        let mut next = self.clone();
        let mut applied = Vec::new();
        let mut rejected = Vec::new();

        for field in patch.touched_fields() {
            if !allowed.contains(&field) {
                rejected.push(field);
                continue;
            }
            match field {
                ContextField::Treatment => next.treatment = patch.treatment.clone(),
                ContextField::Outcome => next.outcome = patch.outcome.clone(),
                ContextField::Confounders => extend_unique(&mut next.confounders, &patch.confounders),
                ContextField::Dataset => next.dataset = patch.dataset.clone(),
                ContextField::AdjustmentSet => next.adjustment_set = patch.adjustment_set.clone(),
                ContextField::Estimate => next.estimate = patch.estimate.clone(),
                ContextField::Violations => next.violations.extend(patch.violations.iter().cloned()),
                ContextField::Extensions => {
                    for (key, value) in &patch.extensions {
                        next.extensions.insert(key.clone(), value.clone());
                    }
                }
            }
            applied.push(field);
        }

        MergeOutcome {
            context: next,
            applied,
            rejected,
        }
    }

    /// Compact text rendering embedded in prompts.
    pub fn summary(&self) -> String {
        let mut lines = Vec::new();
        lines.push(format!("Treatment: {}", self.treatment.as_deref().unwrap_or("(not set)")));
        lines.push(format!("Outcome: {}", self.outcome.as_deref().unwrap_or("(not set)")));
        if self.confounders.is_empty() {
            lines.push("Confounders: (none identified)".to_string());
        } else {
            lines.push(format!("Confounders: {}", self.confounders.join(", ")));
        }
        match &self.dataset {
            Some(ds) => lines.push(format!(
                "Dataset: {} ({} rows; columns: {})",
                ds.name,
                ds.row_count,
                ds.columns.join(", ")
            )),
            None => lines.push("Dataset: (not loaded)".to_string()),
        }
        if let Some(set) = &self.adjustment_set {
            lines.push(format!("Adjustment set: {{{}}}", set.join(", ")));
        }
        if let Some(est) = &self.estimate {
            let ci = est
                .confidence_interval
                .map(|(lo, hi)| format!(", 95% CI [{:.3}, {:.3}]", lo, hi))
                .unwrap_or_default();
            lines.push(format!("Estimate: {:.4} via {}{}", est.effect, est.method, ci));
        }
        if !self.violations.is_empty() {
            let listed = self
                .violations
                .iter()
                .map(|v| format!("{} ({:?})", v.assumption, v.severity))
                .collect::<Vec<_>>()
                .join(", ");
            lines.push(format!("Assumption findings: {}", listed));
        }
        lines.join("\n")
    }
}

fn is_set(value: &Option<String>) -> bool {
    value.as_ref().is_some_and(|v| !v.trim().is_empty())
}

fn extend_unique(target: &mut Vec<String>, additions: &[String]) {
    for item in additions {
        let trimmed = item.trim();
        if trimmed.is_empty() {
            continue;
        }
        if !target.iter().any(|existing| existing.eq_ignore_ascii_case(trimmed)) {
            target.push(trimmed.to_string());
        }
    }
}
