//! Kubernetes driver: discovery-cached dynamic APIs and server-side
//! apply with `kusion` field ownership.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use futures::StreamExt;
use kube::{
    api::{Api, DeleteParams, Patch, PatchParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    runtime::watcher,
    Client,
};
use metrics::{counter, histogram};
use serde_json::Value as Json;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{runtime_error, Runtime, WatchEvent, WatchStream};
use kusion_core::{Attributes, Error, Resource, Result};

/// Field manager recorded by server-side apply.
const FIELD_MANAGER: &str = "kusion";

pub struct KubernetesRuntime {
    client: Client,
    // GVK key -> (ApiResource, namespaced). Populated lazily from
    // cluster discovery; scoped to this runtime instance.
    discovery: RwLock<HashMap<String, (ApiResource, bool)>>,
}

#[derive(Debug)]
struct Target {
    gvk: GroupVersionKind,
    name: String,
    namespace: Option<String>,
}

impl KubernetesRuntime {
    pub async fn try_default() -> Result<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| runtime_error("kubernetes", format!("initialising client: {e}")))?;
        Ok(Self::new(client))
    }

    pub fn new(client: Client) -> Self {
        KubernetesRuntime {
            client,
            discovery: RwLock::new(HashMap::new()),
        }
    }

    async fn api_for(&self, id: &str, target: &Target) -> Result<Api<DynamicObject>> {
        let (ar, namespaced) = self.find_api_resource(id, &target.gvk).await?;
        if namespaced {
            match target.namespace.as_deref() {
                Some(ns) => Ok(Api::namespaced_with(self.client.clone(), ns, &ar)),
                None => Err(runtime_error(id, "namespace required for namespaced kind")),
            }
        } else {
            Ok(Api::all_with(self.client.clone(), &ar))
        }
    }

    async fn find_api_resource(
        &self,
        id: &str,
        gvk: &GroupVersionKind,
    ) -> Result<(ApiResource, bool)> {
        let key = gvk_key(gvk);
        if let Some(hit) = self.discovery.read().ok().and_then(|c| c.get(&key).cloned()) {
            return Ok(hit);
        }
        let discovery = Discovery::new(self.client.clone())
            .run()
            .await
            .map_err(|e| runtime_error(id, format!("running discovery: {e}")))?;
        let mut found = None;
        if let Ok(mut cache) = self.discovery.write() {
            for group in discovery.groups() {
                for (ar, caps) in group.recommended_resources() {
                    let namespaced = matches!(caps.scope, Scope::Namespaced);
                    let entry_key = gvk_key(&GroupVersionKind {
                        group: ar.group.clone(),
                        version: ar.version.clone(),
                        kind: ar.kind.clone(),
                    });
                    if entry_key == key {
                        found = Some((ar.clone(), namespaced));
                    }
                    cache.insert(entry_key, (ar, namespaced));
                }
            }
        }
        found.ok_or_else(|| {
            runtime_error(
                id,
                format!("kind not served: {}/{}/{}", gvk.group, gvk.version, gvk.kind),
            )
        })
    }
}

#[async_trait]
impl Runtime for KubernetesRuntime {
    async fn import(&self, resource: &Resource) -> Result<Resource> {
        match self.read(resource).await? {
            Some(live) => Ok(live),
            None => Err(Error::NotFound(resource.id.clone())),
        }
    }

    async fn read(&self, resource: &Resource) -> Result<Option<Resource>> {
        let (_, target) = parse_target(resource)?;
        let api = self.api_for(&resource.id, &target).await?;
        let live = api
            .get_opt(&target.name)
            .await
            .map_err(|e| runtime_error(&resource.id, format!("reading object: {e}")))?;
        let Some(obj) = live else { return Ok(None) };
        let json = serde_json::to_value(&obj)
            .map_err(|e| runtime_error(&resource.id, format!("encoding live object: {e}")))?;
        Ok(Some(Resource {
            attributes: to_attributes(&resource.id, reduce_to_planned_shape(json))?,
            ..resource.clone()
        }))
    }

    async fn apply(&self, _prior: Option<&Resource>, plan: &Resource) -> Result<Resource> {
        let t0 = std::time::Instant::now();
        counter!("apply_attempts", 1u64);
        let (json, target) = parse_target(plan)?;
        let api = self.api_for(&plan.id, &target).await?;
        let pp = PatchParams::apply(FIELD_MANAGER).force();
        match api.patch(&target.name, &pp, &Patch::Apply(&json)).await {
            Ok(obj) => {
                histogram!("apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
                counter!("apply_ok", 1u64);
                debug!(id = %plan.id, rv = ?obj.metadata.resource_version, "applied");
                // Record the planned shape; server-populated fields stay
                // out of state so reruns diff clean.
                Ok(plan.clone())
            }
            Err(e) => {
                counter!("apply_err", 1u64);
                Err(runtime_error(&plan.id, format!("server-side apply failed: {e}")))
            }
        }
    }

    async fn delete(&self, resource: &Resource) -> Result<()> {
        let (_, target) = parse_target(resource)?;
        let api = self.api_for(&resource.id, &target).await?;
        match api.delete(&target.name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                debug!(id = %resource.id, "already deleted");
                Ok(())
            }
            Err(e) => Err(runtime_error(&resource.id, format!("deleting object: {e}"))),
        }
    }

    async fn watch(&self, resource: &Resource) -> Result<Option<WatchStream>> {
        let (_, target) = parse_target(resource)?;
        let api = self.api_for(&resource.id, &target).await?;
        let config = watcher::Config::default().fields(&format!("metadata.name={}", target.name));
        let (tx, rx) = mpsc::channel(16);
        let id = resource.id.clone();
        tokio::spawn(async move {
            let mut stream = Box::pin(watcher(api, config));
            while let Some(event) = stream.next().await {
                let payload = match event {
                    Ok(watcher::Event::Applied(obj)) => serde_json::to_value(&obj).ok(),
                    Ok(watcher::Event::Deleted(obj)) => serde_json::to_value(&obj).ok(),
                    Ok(watcher::Event::Restarted(_)) => None,
                    Err(e) => {
                        warn!(id = %id, error = %e, "watch stream error");
                        break;
                    }
                };
                if let Some(payload) = payload {
                    if tx
                        .send(WatchEvent {
                            id: id.clone(),
                            payload,
                        })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            }
        });
        Ok(Some(rx))
    }
}

fn gvk_key(gvk: &GroupVersionKind) -> String {
    if gvk.group.is_empty() {
        format!("{}/{}", gvk.version, gvk.kind)
    } else {
        format!("{}/{}/{}", gvk.group, gvk.version, gvk.kind)
    }
}

/// Pull the object body and addressing coordinates out of a resource.
fn parse_target(resource: &Resource) -> Result<(Json, Target)> {
    let json = Json::Object(resource.attributes.clone());
    let api_version = json
        .get("apiVersion")
        .and_then(|v| v.as_str())
        .ok_or_else(|| runtime_error(&resource.id, "attributes missing apiVersion"))?;
    let kind = json
        .get("kind")
        .and_then(|v| v.as_str())
        .ok_or_else(|| runtime_error(&resource.id, "attributes missing kind"))?;
    let (group, version) = match api_version.split_once('/') {
        Some((g, v)) => (g.to_string(), v.to_string()),
        None => (String::new(), api_version.to_string()),
    };
    let name = json
        .get("metadata")
        .and_then(|m| m.get("name"))
        .and_then(|v| v.as_str())
        .ok_or_else(|| runtime_error(&resource.id, "attributes missing metadata.name"))?
        .to_string();
    let namespace = json
        .get("metadata")
        .and_then(|m| m.get("namespace"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let kind = kind.to_string();
    Ok((
        json,
        Target {
            gvk: GroupVersionKind {
                group,
                version,
                kind,
            },
            name,
            namespace,
        },
    ))
}

/// Metadata keys a planned resource carries. The generator assembles
/// object metadata from exactly these; everything else on a live object
/// is the server's bookkeeping.
const PLANNED_METADATA_KEYS: [&str; 4] = ["name", "namespace", "labels", "annotations"];

/// Reduce a live object to the shape the planned attribute contract
/// covers, so reads and imports compare like with like against intent
/// resources: metadata keeps only the declared keys, and the
/// server-owned `status` subtree goes away entirely.
fn reduce_to_planned_shape(mut v: Json) -> Json {
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.retain(|key, _| PLANNED_METADATA_KEYS.contains(&key.as_str()));
    }
    if let Some(obj) = v.as_object_mut() {
        obj.remove("status");
    }
    v
}

fn to_attributes(id: &str, v: Json) -> Result<Attributes> {
    match v {
        Json::Object(m) => Ok(m),
        _ => Err(runtime_error(id, "live object is not a mapping")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kusion_core::{build_id, RuntimeType};

    fn resource(attrs: serde_json::Value) -> Resource {
        let attributes = match attrs {
            Json::Object(m) => m,
            _ => unreachable!(),
        };
        Resource {
            id: build_id("v1", "ConfigMap", "ns", "cm"),
            resource_type: RuntimeType::Kubernetes,
            attributes,
            depends_on: vec![],
            extensions: Attributes::new(),
        }
    }

    #[test]
    fn parse_target_extracts_coordinates() {
        let res = resource(serde_json::json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": { "name": "web", "namespace": "prod" },
        }));
        let (_, target) = parse_target(&res).unwrap();
        assert_eq!(target.gvk.group, "apps");
        assert_eq!(target.gvk.version, "v1");
        assert_eq!(target.gvk.kind, "Deployment");
        assert_eq!(target.name, "web");
        assert_eq!(target.namespace.as_deref(), Some("prod"));
    }

    #[test]
    fn parse_target_reports_missing_fields() {
        let res = resource(serde_json::json!({ "kind": "ConfigMap" }));
        let err = parse_target(&res).unwrap_err().to_string();
        assert!(err.contains("missing apiVersion"), "err={err}");

        let res = resource(serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {},
        }));
        let err = parse_target(&res).unwrap_err().to_string();
        assert!(err.contains("missing metadata.name"), "err={err}");
    }

    #[test]
    fn live_objects_reduce_to_the_planned_shape() {
        // A generator-planned ConfigMap carries name/namespace/labels
        // metadata and a data section; the live read comes back with
        // the server's bookkeeping attached.
        let live = serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": "proj-dev-app-nginx-0",
                "namespace": "proj",
                "labels": { "app.kubernetes.io/name": "app" },
                "uid": "f3f1f6f0-0000-0000-0000-000000000000",
                "resourceVersion": "123",
                "creationTimestamp": "2020-01-01T00:00:00Z",
                "managedFields": [{"manager": "kusion"}],
                "finalizers": ["kubernetes"],
                "ownerReferences": [{"kind": "Deployment"}],
            },
            "status": { "ready": true },
            "data": { "app.conf": "debug = false" },
        });
        let reduced = reduce_to_planned_shape(live);
        let meta = reduced.get("metadata").unwrap().as_object().unwrap();
        let keys: Vec<&str> = meta.keys().map(|k| k.as_str()).collect();
        assert_eq!(keys, vec!["labels", "name", "namespace"]);
        assert!(!reduced.as_object().unwrap().contains_key("status"));
        assert_eq!(reduced["data"]["app.conf"], "debug = false");
        assert_eq!(reduced["kind"], "ConfigMap");
    }
}
