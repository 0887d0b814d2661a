//! Runtime abstraction: a uniform Import/Read/Apply/Delete/Watch
//! contract over the systems resources are reconciled through.

#![forbid(unsafe_code)]

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use kusion_core::{Error, Resource, Result, RuntimeType};

pub mod kubernetes;
pub mod terraform;

pub use kubernetes::KubernetesRuntime;
pub use terraform::TerraformRuntime;

/// Event emitted while watching a resource settle.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub id: String,
    pub payload: serde_json::Value,
}

pub type WatchStream = mpsc::Receiver<WatchEvent>;

/// Driver contract. Calls are cancelled by dropping the future; failures
/// come back as [`Error::RuntimeFailure`] carrying the resource ID, and
/// drivers never panic.
#[async_trait]
pub trait Runtime: Send + Sync {
    /// Populate the state shape from an externally-owned resource.
    async fn import(&self, resource: &Resource) -> Result<Resource>;

    /// Read the live resource; `None` when absent.
    async fn read(&self, resource: &Resource) -> Result<Option<Resource>>;

    /// Idempotent upsert of the planned resource.
    async fn apply(&self, prior: Option<&Resource>, plan: &Resource) -> Result<Resource>;

    /// Idempotent delete.
    async fn delete(&self, resource: &Resource) -> Result<()>;

    /// Optional readiness stream; drivers without one return `None`.
    async fn watch(&self, resource: &Resource) -> Result<Option<WatchStream>> {
        let _ = resource;
        Ok(None)
    }
}

/// One driver per referenced type, built once per operation.
pub type RuntimeMap = HashMap<RuntimeType, Arc<dyn Runtime>>;

/// Build the runtime map from the union of types referenced by an
/// operation's resources.
pub async fn runtimes<'a, I>(resources: I) -> Result<RuntimeMap>
where
    I: IntoIterator<Item = &'a Resource>,
{
    let types: BTreeSet<RuntimeType> = resources.into_iter().map(|r| r.resource_type).collect();
    let mut map = RuntimeMap::new();
    for t in types {
        let runtime: Arc<dyn Runtime> = match t {
            RuntimeType::Kubernetes => Arc::new(KubernetesRuntime::try_default().await?),
            RuntimeType::Terraform => Arc::new(TerraformRuntime::from_env()),
        };
        map.insert(t, runtime);
    }
    Ok(map)
}

/// Replace every referenced type with a no-op driver. Used by preview,
/// which runs the full pipeline without touching any backing system.
pub fn noop_runtimes<'a, I>(resources: I) -> RuntimeMap
where
    I: IntoIterator<Item = &'a Resource>,
{
    let types: BTreeSet<RuntimeType> = resources.into_iter().map(|r| r.resource_type).collect();
    types
        .into_iter()
        .map(|t| (t, Arc::new(NoopRuntime) as Arc<dyn Runtime>))
        .collect()
}

/// Driver that records nothing and reports every call as successful,
/// echoing the planned resource back.
pub struct NoopRuntime;

#[async_trait]
impl Runtime for NoopRuntime {
    async fn import(&self, resource: &Resource) -> Result<Resource> {
        Ok(resource.clone())
    }

    async fn read(&self, resource: &Resource) -> Result<Option<Resource>> {
        Ok(Some(resource.clone()))
    }

    async fn apply(&self, _prior: Option<&Resource>, plan: &Resource) -> Result<Resource> {
        Ok(plan.clone())
    }

    async fn delete(&self, _resource: &Resource) -> Result<()> {
        Ok(())
    }
}

pub(crate) fn runtime_error(id: &str, message: impl std::fmt::Display) -> Error {
    Error::RuntimeFailure {
        id: id.to_string(),
        message: message.to_string(),
    }
}
