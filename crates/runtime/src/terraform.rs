//! Terraform driver: provider-scoped CRUD through the terraform CLI,
//! one working directory per resource.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::{json, Value as Json};
use tokio::process::Command;
use tracing::debug;

use crate::{runtime_error, Runtime};
use kusion_core::{Attributes, Error, Resource, Result};

/// Extension key naming the terraform resource type, e.g. `local_file`.
pub const EXT_RESOURCE_TYPE: &str = "resourceType";
/// Extension key naming the provider source, e.g.
/// `registry.terraform.io/hashicorp/local/2.2.3`.
pub const EXT_PROVIDER: &str = "provider";
/// Extension key carrying the provider block configuration.
pub const EXT_PROVIDER_META: &str = "providerMeta";

pub struct TerraformRuntime {
    root: PathBuf,
}

impl TerraformRuntime {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        TerraformRuntime { root: root.into() }
    }

    pub fn from_env() -> Self {
        let root = std::env::var("KUSION_TF_DIR")
            .unwrap_or_else(|_| ".kusion/terraform".to_string());
        Self::new(root)
    }

    fn workspace_dir(&self, id: &str) -> PathBuf {
        self.root.join(sanitize_id(id))
    }

    async fn ensure_workspace(&self, resource: &Resource) -> Result<PathBuf> {
        let dir = self.workspace_dir(&resource.id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| runtime_error(&resource.id, format!("creating tf dir: {e}")))?;
        let main_tf = render_main_tf(resource)?;
        let body = serde_json::to_vec_pretty(&main_tf)
            .map_err(|e| runtime_error(&resource.id, format!("encoding main.tf.json: {e}")))?;
        tokio::fs::write(dir.join("main.tf.json"), body)
            .await
            .map_err(|e| runtime_error(&resource.id, format!("writing main.tf.json: {e}")))?;
        if !dir.join(".terraform").exists() {
            self.run(&resource.id, &dir, &["init", "-input=false"]).await?;
        }
        Ok(dir)
    }

    async fn run(&self, id: &str, dir: &Path, args: &[&str]) -> Result<Vec<u8>> {
        debug!(id = %id, ?args, "terraform");
        let output = Command::new("terraform")
            .args(args)
            .arg("-no-color")
            .current_dir(dir)
            .output()
            .await
            .map_err(|e| runtime_error(id, format!("spawning terraform: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(runtime_error(
                id,
                format!("terraform {} failed: {}", args.first().unwrap_or(&""), stderr.trim()),
            ));
        }
        Ok(output.stdout)
    }

    async fn show_values(&self, id: &str, dir: &Path) -> Result<Option<Attributes>> {
        let stdout = self.run(id, dir, &["show", "-json"]).await?;
        let parsed: Json = serde_json::from_slice(&stdout)
            .map_err(|e| runtime_error(id, format!("parsing terraform show output: {e}")))?;
        let values = parsed
            .get("values")
            .and_then(|v| v.get("root_module"))
            .and_then(|v| v.get("resources"))
            .and_then(|v| v.as_array())
            .and_then(|rs| rs.first())
            .and_then(|r| r.get("values"))
            .and_then(|v| v.as_object())
            .cloned();
        Ok(values)
    }
}

#[async_trait]
impl Runtime for TerraformRuntime {
    async fn import(&self, resource: &Resource) -> Result<Resource> {
        match self.read(resource).await? {
            Some(live) => Ok(live),
            None => Err(Error::NotFound(resource.id.clone())),
        }
    }

    async fn read(&self, resource: &Resource) -> Result<Option<Resource>> {
        let dir = self.workspace_dir(&resource.id);
        if !dir.join("terraform.tfstate").exists() {
            return Ok(None);
        }
        match self.show_values(&resource.id, &dir).await? {
            Some(values) => Ok(Some(Resource {
                attributes: values,
                ..resource.clone()
            })),
            None => Ok(None),
        }
    }

    async fn apply(&self, _prior: Option<&Resource>, plan: &Resource) -> Result<Resource> {
        let dir = self.ensure_workspace(plan).await?;
        self.run(&plan.id, &dir, &["apply", "-auto-approve", "-input=false"])
            .await?;
        let attributes = self
            .show_values(&plan.id, &dir)
            .await?
            .unwrap_or_else(|| plan.attributes.clone());
        Ok(Resource {
            attributes,
            ..plan.clone()
        })
    }

    async fn delete(&self, resource: &Resource) -> Result<()> {
        let dir = self.workspace_dir(&resource.id);
        if !dir.join("terraform.tfstate").exists() {
            return Ok(());
        }
        self.run(
            &resource.id,
            &dir,
            &["destroy", "-auto-approve", "-input=false"],
        )
        .await?;
        Ok(())
    }
}

fn sanitize_id(id: &str) -> String {
    id.chars()
        .map(|c| if c == ':' || c == '/' { '_' } else { c })
        .collect()
}

/// Synthesise the `main.tf.json` body for one resource from its
/// attributes and provider extensions.
pub fn render_main_tf(resource: &Resource) -> Result<Json> {
    let resource_type = resource
        .extensions
        .get(EXT_RESOURCE_TYPE)
        .and_then(|v| v.as_str())
        .ok_or_else(|| {
            Error::InvalidArgument(format!(
                "resource {} missing extension {EXT_RESOURCE_TYPE}",
                resource.id
            ))
        })?;
    let provider_name = resource_type.split('_').next().unwrap_or(resource_type);
    let resource_name = resource
        .id
        .rsplit(kusion_core::ID_SEPARATOR)
        .next()
        .unwrap_or(&resource.id);

    let mut root = serde_json::Map::new();
    if let Some(source) = resource.extensions.get(EXT_PROVIDER).and_then(|v| v.as_str()) {
        let (source, version) = parse_provider_source(source);
        let mut required = serde_json::Map::new();
        let mut entry = serde_json::Map::new();
        entry.insert("source".into(), Json::String(source));
        if let Some(version) = version {
            entry.insert("version".into(), Json::String(version));
        }
        required.insert(provider_name.to_string(), Json::Object(entry));
        root.insert(
            "terraform".into(),
            json!({ "required_providers": Json::Object(required) }),
        );
    }
    let provider_meta = resource
        .extensions
        .get(EXT_PROVIDER_META)
        .cloned()
        .unwrap_or_else(|| json!({}));
    let mut provider_block = serde_json::Map::new();
    provider_block.insert(provider_name.to_string(), provider_meta);
    root.insert("provider".into(), Json::Object(provider_block));

    let mut resource_entry = serde_json::Map::new();
    resource_entry.insert(
        resource_name.to_string(),
        Json::Object(resource.attributes.clone()),
    );
    let mut resource_block = serde_json::Map::new();
    resource_block.insert(resource_type.to_string(), Json::Object(resource_entry));
    root.insert("resource".into(), Json::Object(resource_block));
    Ok(Json::Object(root))
}

/// Split `registry.terraform.io/hashicorp/local/2.2.3` into a
/// `namespace/name` source and an optional version.
fn parse_provider_source(raw: &str) -> (String, Option<String>) {
    let parts: Vec<&str> = raw.split('/').collect();
    match parts.as_slice() {
        [_, namespace, name, version] => {
            (format!("{namespace}/{name}"), Some((*version).to_string()))
        }
        [namespace, name, version] => {
            (format!("{namespace}/{name}"), Some((*version).to_string()))
        }
        [namespace, name] => (format!("{namespace}/{name}"), None),
        _ => (raw.to_string(), None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kusion_core::RuntimeType;

    fn tf_resource() -> Resource {
        let attributes = match serde_json::json!({
            "content": "hello",
            "filename": "/tmp/hello.txt",
        }) {
            Json::Object(m) => m,
            _ => unreachable!(),
        };
        let extensions = match serde_json::json!({
            "resourceType": "local_file",
            "provider": "registry.terraform.io/hashicorp/local/2.2.3",
        }) {
            Json::Object(m) => m,
            _ => unreachable!(),
        };
        Resource {
            id: "hashicorp:local_file:hello".to_string(),
            resource_type: RuntimeType::Terraform,
            attributes,
            depends_on: vec![],
            extensions,
        }
    }

    #[test]
    fn render_main_tf_assembles_blocks() {
        let rendered = render_main_tf(&tf_resource()).unwrap();
        assert_eq!(
            rendered["terraform"]["required_providers"]["local"]["source"],
            "hashicorp/local"
        );
        assert_eq!(
            rendered["terraform"]["required_providers"]["local"]["version"],
            "2.2.3"
        );
        assert_eq!(
            rendered["resource"]["local_file"]["hello"]["content"],
            "hello"
        );
        assert!(rendered["provider"]["local"].is_object());
    }

    #[test]
    fn render_main_tf_requires_resource_type() {
        let mut res = tf_resource();
        res.extensions.remove(EXT_RESOURCE_TYPE);
        let err = render_main_tf(&res).unwrap_err().to_string();
        assert!(err.contains("resourceType"), "err={err}");
    }

    #[test]
    fn provider_source_parsing() {
        assert_eq!(
            parse_provider_source("registry.terraform.io/hashicorp/local/2.2.3"),
            ("hashicorp/local".to_string(), Some("2.2.3".to_string()))
        );
        assert_eq!(
            parse_provider_source("hashicorp/aws/5.0.1"),
            ("hashicorp/aws".to_string(), Some("5.0.1".to_string()))
        );
        assert_eq!(
            parse_provider_source("hashicorp/aws"),
            ("hashicorp/aws".to_string(), None)
        );
    }

    #[test]
    fn id_sanitisation_is_path_safe() {
        assert_eq!(
            sanitize_id("apps/v1:Deployment:ns:web"),
            "apps_v1_Deployment_ns_web"
        );
    }
}
