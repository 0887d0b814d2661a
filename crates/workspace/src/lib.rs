//! Workspace configuration: platform-level module defaults, per-project
//! patcher blocks, backend settings, and credential hydration.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use kusion_core::{Error, Result};

/// Untyped nested mapping used for platform and workspace overrides.
pub type GenericConfig = serde_json::Map<String, Value>;

/// Module configs keyed by module name.
pub type ModuleConfigs = BTreeMap<String, ModuleConfig>;

/// Synthetic key carrying the selector inside patcher blocks; stripped
/// from merged output.
pub const PROJECT_SELECTOR_FIELD: &str = "projectSelector";

pub const ERR_EMPTY_PROJECT_NAME: &str = "empty project name";

pub const DEFAULT_MYSQL_PORT: u32 = 3306;

pub const ENV_BACKEND_MYSQL_PASSWORD: &str = "KUSION_BACKEND_MYSQL_PASSWORD";
pub const ENV_OSS_ACCESS_KEY_ID: &str = "OSS_ACCESS_KEY_ID";
pub const ENV_OSS_ACCESS_KEY_SECRET: &str = "OSS_ACCESS_KEY_SECRET";
pub const ENV_AWS_ACCESS_KEY_ID: &str = "AWS_ACCESS_KEY_ID";
pub const ENV_AWS_SECRET_ACCESS_KEY: &str = "AWS_SECRET_ACCESS_KEY";
pub const ENV_AWS_REGION: &str = "AWS_REGION";
pub const ENV_AWS_DEFAULT_REGION: &str = "AWS_DEFAULT_REGION";

/// Per-module platform configuration: a `default` block plus named
/// patcher blocks that apply to selected projects only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModuleConfig {
    #[serde(default, skip_serializing_if = "GenericConfig::is_empty")]
    pub default: GenericConfig,
    #[serde(flatten)]
    pub patchers: BTreeMap<String, ModulePatcherConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModulePatcherConfig {
    #[serde(rename = "projectSelector", default)]
    pub project_selector: Vec<String>,
    #[serde(flatten)]
    pub config: GenericConfig,
}

/// Merge a module's default block with at most one matching patcher.
/// Patcher blocks are visited in lexicographic name order; the first one
/// selecting `project_name` wins and the rest are ignored. Patcher keys
/// overwrite defaults (shallow).
pub fn get_project_module_config(
    config: &ModuleConfig,
    project_name: &str,
) -> Result<GenericConfig> {
    if project_name.is_empty() {
        return Err(Error::InvalidArgument(ERR_EMPTY_PROJECT_NAME.to_string()));
    }
    let mut merged = config.default.clone();
    for (name, patcher) in &config.patchers {
        if !patcher.project_selector.iter().any(|p| p == project_name) {
            continue;
        }
        debug!(block = %name, project = %project_name, "applying module patcher");
        for (k, v) in &patcher.config {
            if k == PROJECT_SELECTOR_FIELD {
                continue;
            }
            merged.insert(k.clone(), v.clone());
        }
        break;
    }
    Ok(merged)
}

/// Resolve the module configs visible to one project. Modules whose
/// merged config ends up empty are omitted.
pub fn get_project_module_configs(
    configs: &ModuleConfigs,
    project_name: &str,
) -> Result<BTreeMap<String, GenericConfig>> {
    if configs.is_empty() {
        return Ok(BTreeMap::new());
    }
    if project_name.is_empty() {
        return Err(Error::InvalidArgument(ERR_EMPTY_PROJECT_NAME.to_string()));
    }
    let mut project_configs = BTreeMap::new();
    for (name, config) in configs {
        let merged = get_project_module_config(config, project_name)
            .map_err(|e| Error::InvalidArgument(format!("{e}, module name: {name}")))?;
        if !merged.is_empty() {
            project_configs.insert(name.clone(), merged);
        }
    }
    Ok(project_configs)
}

/// Typed getters over [`GenericConfig`]. Absent keys read as `None`;
/// present keys of the wrong type are an error, never a panic.
pub trait GenericConfigExt {
    fn get_int32_pointer(&self, key: &str) -> Result<Option<i32>>;
    fn get_string(&self, key: &str) -> Result<Option<String>>;
    fn get_map(&self, key: &str) -> Result<Option<GenericConfig>>;
    fn get_string_map(&self, key: &str) -> Result<Option<BTreeMap<String, String>>>;
}

impl GenericConfigExt for GenericConfig {
    fn get_int32_pointer(&self, key: &str) -> Result<Option<i32>> {
        match self.get(key) {
            None => Ok(None),
            Some(Value::Number(n)) => {
                let i = n
                    .as_i64()
                    .and_then(|i| i32::try_from(i).ok())
                    .ok_or_else(|| {
                        Error::InvalidArgument(format!("the value of {key} is not int"))
                    })?;
                Ok(Some(i))
            }
            Some(_) => Err(Error::InvalidArgument(format!(
                "the value of {key} is not int"
            ))),
        }
    }

    fn get_string(&self, key: &str) -> Result<Option<String>> {
        match self.get(key) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(_) => Err(Error::InvalidArgument(format!(
                "the value of {key} is not string"
            ))),
        }
    }

    fn get_map(&self, key: &str) -> Result<Option<GenericConfig>> {
        match self.get(key) {
            None => Ok(None),
            Some(Value::Object(m)) => Ok(Some(m.clone())),
            Some(_) => Err(Error::InvalidArgument(format!(
                "the value of {key} is not map"
            ))),
        }
    }

    fn get_string_map(&self, key: &str) -> Result<Option<BTreeMap<String, String>>> {
        let Some(map) = self.get_map(key)? else {
            return Ok(None);
        };
        let mut out = BTreeMap::new();
        for (k, v) in map {
            match v {
                Value::String(s) => {
                    out.insert(k, s);
                }
                _ => {
                    return Err(Error::InvalidArgument(format!(
                        "the value of {key}.{k} is not string"
                    )))
                }
            }
        }
        Ok(Some(out))
    }
}

/// Credentials sourced from the process environment. This is the single
/// place environment variables are read; completion functions take the
/// resolved set as an explicit input.
#[derive(Debug, Clone, Default)]
pub struct EnvCredentials {
    pub mysql_password: Option<String>,
    pub oss_access_key_id: Option<String>,
    pub oss_access_key_secret: Option<String>,
    pub aws_access_key_id: Option<String>,
    pub aws_secret_access_key: Option<String>,
    pub aws_region: Option<String>,
}

impl EnvCredentials {
    pub fn from_env() -> Self {
        fn read(name: &str) -> Option<String> {
            std::env::var(name).ok().filter(|v| !v.is_empty())
        }
        EnvCredentials {
            mysql_password: read(ENV_BACKEND_MYSQL_PASSWORD),
            oss_access_key_id: read(ENV_OSS_ACCESS_KEY_ID),
            oss_access_key_secret: read(ENV_OSS_ACCESS_KEY_SECRET),
            aws_access_key_id: read(ENV_AWS_ACCESS_KEY_ID),
            aws_secret_access_key: read(ENV_AWS_SECRET_ACCESS_KEY),
            aws_region: read(ENV_AWS_REGION).or_else(|| read(ENV_AWS_DEFAULT_REGION)),
        }
    }
}

/// Backend selection for state storage. At most one is set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendConfigs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local: Option<LocalConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mysql: Option<MysqlConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oss: Option<OssConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3: Option<S3Config>,
}

impl BackendConfigs {
    /// Name of the configured backend; local is the default.
    pub fn backend_name(&self) -> &'static str {
        if self.local.is_some() {
            "local"
        } else if self.mysql.is_some() {
            "mysql"
        } else if self.oss.is_some() {
            "oss"
        } else if self.s3.is_some() {
            "s3"
        } else {
            "local"
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LocalConfig {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dir: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MysqlConfig {
    pub db_name: String,
    pub user: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password: String,
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OssConfig {
    pub endpoint: String,
    pub bucket: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub prefix: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub access_key_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub access_key_secret: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct S3Config {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub region: String,
    pub bucket: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub prefix: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub access_key_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub access_key_secret: String,
}

/// Fill in the default port and the environment-sourced password.
pub fn complete_mysql_config(config: &mut MysqlConfig, creds: &EnvCredentials) {
    if config.port.is_none() {
        config.port = Some(DEFAULT_MYSQL_PORT);
    }
    if let Some(password) = &creds.mysql_password {
        config.password = password.clone();
    }
}

pub fn complete_oss_config(config: &mut OssConfig, creds: &EnvCredentials) {
    if let Some(id) = &creds.oss_access_key_id {
        config.access_key_id = id.clone();
    }
    if let Some(secret) = &creds.oss_access_key_secret {
        config.access_key_secret = secret.clone();
    }
}

pub fn complete_s3_config(config: &mut S3Config, creds: &EnvCredentials) {
    if let Some(id) = &creds.aws_access_key_id {
        config.access_key_id = id.clone();
    }
    if let Some(secret) = &creds.aws_secret_access_key {
        config.access_key_secret = secret.clone();
    }
    if let Some(region) = &creds.aws_region {
        config.region = region.clone();
    }
}
