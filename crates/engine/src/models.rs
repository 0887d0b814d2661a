//! Change-order model: per-resource change steps, their execution
//! order, and the request shape operations are driven by.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::graph;
use kusion_core::{Error, Intent, Resource, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionType {
    Undefined,
    UnChanged,
    Create,
    Update,
    Delete,
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ActionType::Undefined => "Undefined",
            ActionType::UnChanged => "UnChanged",
            ActionType::Create => "Create",
            ActionType::Update => "Update",
            ActionType::Delete => "Delete",
        };
        f.write_str(s)
    }
}

/// Planned transition for one resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeStep {
    pub id: String,
    pub action: ActionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<Resource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<Resource>,
}

impl ChangeStep {
    /// Top-level attribute sections (`metadata`, `spec`, `data`, ...)
    /// that differ between the prior and planned resource. Sorted, so
    /// rendered plans are deterministic.
    pub fn changed_sections(&self) -> Vec<String> {
        let (Some(from), Some(to)) = (&self.from, &self.to) else {
            return Vec::new();
        };
        let mut sections = BTreeSet::new();
        for (key, value) in &to.attributes {
            match from.attributes.get(key) {
                Some(prior) if prior == value => {}
                _ => {
                    sections.insert(key.clone());
                }
            }
        }
        for key in from.attributes.keys() {
            if !to.attributes.contains_key(key) {
                sections.insert(key.clone());
            }
        }
        sections.into_iter().collect()
    }
}

/// Computed plan for one preview/apply invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChangeOrder {
    /// Execution order: a topological sort of the union graph with
    /// lexicographic tie-break.
    #[serde(rename = "stepKeys")]
    pub step_keys: Vec<String>,
    #[serde(rename = "changeSteps")]
    pub change_steps: BTreeMap<String, ChangeStep>,
}

impl ChangeOrder {
    pub fn get(&self, id: &str) -> Option<&ChangeStep> {
        self.change_steps.get(id)
    }

    /// True when no step would touch a backing system.
    pub fn all_unchanged(&self) -> bool {
        self.change_steps
            .values()
            .all(|s| s.action == ActionType::UnChanged)
    }

    /// Render a human-readable summary of the plan, one line per step in
    /// execution order. Update lines name the attribute sections that
    /// changed.
    pub fn prompt_details(&self) -> String {
        let mut out = String::new();
        for id in &self.step_keys {
            let Some(step) = self.change_steps.get(id) else {
                continue;
            };
            let sections = match step.action {
                ActionType::Update => step.changed_sections(),
                _ => Vec::new(),
            };
            if sections.is_empty() {
                out.push_str(&format!("{:<9} {}\n", step.action.to_string(), id));
            } else {
                out.push_str(&format!(
                    "{:<9} {} [{}]\n",
                    step.action.to_string(),
                    id,
                    sections.join(", ")
                ));
            }
        }
        out
    }
}

/// One operation request. `intent` is required for preview and apply;
/// destroy is the only path that runs without one.
#[derive(Debug, Clone, Default)]
pub struct Request {
    pub tenant: String,
    pub project: String,
    pub stack: String,
    pub workspace: String,
    pub operator: String,
    pub intent: Option<Intent>,
}

/// Progress message published on the operator's bounded channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    pub resource_id: String,
    pub action: ActionType,
    pub status: MessageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MessageStatus {
    Start,
    Success,
    Skipped,
    Failed,
}

/// Compare prior state and desired intent, keyed by resource ID:
/// only-in-desired is Create, only-in-prior is Delete, both with equal
/// attributes is UnChanged, both with differing attributes is Update.
/// A desired resource with an unresolvable dependency becomes Undefined
/// and is surfaced as a diagnostic, never executed.
pub fn build_change_order(prior: &[Resource], desired: &[Resource]) -> Result<ChangeOrder> {
    let mut desired_index: BTreeMap<&str, &Resource> = BTreeMap::new();
    for r in desired {
        if desired_index.insert(r.id.as_str(), r).is_some() {
            return Err(Error::InvalidArgument(format!(
                "duplicate resource id {}",
                r.id
            )));
        }
    }
    let prior_index: BTreeMap<&str, &Resource> =
        prior.iter().map(|r| (r.id.as_str(), r)).collect();
    let in_union =
        |id: &str| desired_index.contains_key(id) || prior_index.contains_key(id);

    let mut change_steps = BTreeMap::new();
    let mut deps: BTreeMap<String, Vec<String>> = BTreeMap::new();

    for (id, r) in &desired_index {
        let unresolved = r.depends_on.iter().any(|d| !in_union(d));
        let action = if unresolved {
            ActionType::Undefined
        } else {
            match prior_index.get(id) {
                None => ActionType::Create,
                Some(p) if p.attributes == r.attributes => ActionType::UnChanged,
                Some(_) => ActionType::Update,
            }
        };
        change_steps.insert(
            id.to_string(),
            ChangeStep {
                id: id.to_string(),
                action,
                from: prior_index.get(id).map(|p| (*p).clone()),
                to: Some((*r).clone()),
            },
        );
        deps.insert(
            id.to_string(),
            r.depends_on.iter().filter(|d| in_union(d)).cloned().collect(),
        );
    }
    for (id, r) in &prior_index {
        if desired_index.contains_key(id) {
            continue;
        }
        change_steps.insert(
            id.to_string(),
            ChangeStep {
                id: id.to_string(),
                action: ActionType::Delete,
                from: Some((*r).clone()),
                to: None,
            },
        );
        deps.insert(
            id.to_string(),
            r.depends_on.iter().filter(|d| in_union(d)).cloned().collect(),
        );
    }

    let step_keys = graph::execution_order(&change_steps, &deps)?;
    Ok(ChangeOrder {
        step_keys,
        change_steps,
    })
}
