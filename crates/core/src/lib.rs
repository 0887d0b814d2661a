//! Kusion core types: resources, intents, states, and the error kinds
//! shared by every other crate.

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod container;
pub mod handler;
pub mod workload;

pub mod prelude {
    pub use super::{build_id, Attributes, Error, Intent, Resource, Result, RuntimeType, State};
}

/// Separator used when assembling canonical resource IDs.
pub const ID_SEPARATOR: &str = ":";

/// Error kinds surfaced by the engine. Not transport-specific.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("invalid handler type: {0}")]
    InvalidHandlerType(String),
    #[error("invalid handler url: {0}")]
    InvalidHandlerUrl(String),
    #[error("cyclic dependency: {0}")]
    CyclicDependency(String),
    #[error("unresolved dependency: {id} depends on {missing}")]
    UnresolvedDependency { id: String, missing: String },
    #[error("stale state: serial {got} does not follow prior serial (want {want})")]
    StaleState { got: u64, want: u64 },
    #[error("runtime failure ({id}): {message}")]
    RuntimeFailure { id: String, message: String },
    #[error("operation cancelled")]
    Cancelled,
    #[error("step timed out: {id}")]
    Timeout { id: String },
    #[error("not found: {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// The backing system a resource is reconciled through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RuntimeType {
    Kubernetes,
    Terraform,
}

impl std::fmt::Display for RuntimeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeType::Kubernetes => f.write_str("Kubernetes"),
            RuntimeType::Terraform => f.write_str("Terraform"),
        }
    }
}

/// Serialisable resource body handed to runtime drivers. Backed by a
/// BTree map, so key order is lexicographic and output is deterministic.
pub type Attributes = serde_json::Map<String, serde_json::Value>;

/// A single unit of desired state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    /// Canonical ID, unique within an intent. See [`build_id`].
    pub id: String,
    #[serde(rename = "type")]
    pub resource_type: RuntimeType,
    pub attributes: Attributes,
    /// Hard ordering edges, referencing other resource IDs.
    #[serde(rename = "dependsOn", default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    /// Driver-scoped hints (e.g. Terraform provider configuration).
    #[serde(default, skip_serializing_if = "Attributes::is_empty")]
    pub extensions: Attributes,
}

/// The desired-state resource list derived from the DSL.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    #[serde(default)]
    pub resources: Vec<Resource>,
}

/// A persisted snapshot of applied resources plus serial metadata.
///
/// Field order matters: the YAML wire form emits top-level keys in
/// declaration order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct State {
    #[serde(default)]
    pub id: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tenant: String,
    pub project: String,
    pub stack: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub workspace: String,
    #[serde(default)]
    pub version: u32,
    #[serde(rename = "kusionVersion", default)]
    pub kusion_version: String,
    /// Strictly increases on each apply; a fresh write carries
    /// `prior.serial + 1`.
    #[serde(default)]
    pub serial: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub operator: String,
    #[serde(rename = "createdAt", default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub resources: Vec<Resource>,
}

impl State {
    pub fn new(project: &str, stack: &str, workspace: &str, operator: &str) -> Self {
        State {
            project: project.to_string(),
            stack: stack.to_string(),
            workspace: workspace.to_string(),
            operator: operator.to_string(),
            version: 1,
            kusion_version: env!("CARGO_PKG_VERSION").to_string(),
            ..Default::default()
        }
    }
}

/// Build the canonical resource ID from its coordinates. The empty
/// namespace segment is omitted for cluster-scoped objects.
pub fn build_id(api_version: &str, kind: &str, namespace: &str, name: &str) -> String {
    let mut parts = vec![api_version, kind];
    if !namespace.is_empty() {
        parts.push(namespace);
    }
    parts.push(name);
    parts.join(ID_SEPARATOR)
}
