//! High-level workload abstractions the generator lowers to Kubernetes
//! objects.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::container::Container;

pub const WORKLOAD_TYPE_SERVICE: &str = "Service";
pub const WORKLOAD_TYPE_JOB: &str = "Job";

pub const SERVICE_TYPE_DEPLOYMENT: &str = "Deployment";
pub const SERVICE_TYPE_STATEFULSET: &str = "StatefulSet";
pub const SERVICE_TYPE_COLLASET: &str = "Collaset";

/// Tagged workload union, discriminated by the `_type` header on the
/// wire. Variant fields are flattened next to the tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "_type")]
pub enum Workload {
    Service(Service),
    Job(Job),
}

impl Workload {
    pub fn type_name(&self) -> &'static str {
        match self {
            Workload::Service(_) => WORKLOAD_TYPE_SERVICE,
            Workload::Job(_) => WORKLOAD_TYPE_JOB,
        }
    }

    /// Key used to look up platform-level defaults for this workload.
    pub fn platform_config_key(&self) -> &'static str {
        match self {
            Workload::Service(_) => "service",
            Workload::Job(_) => "job",
        }
    }

    pub fn base(&self) -> &Base {
        match self {
            Workload::Service(s) => &s.base,
            Workload::Job(j) => &j.base,
        }
    }

    pub fn base_mut(&mut self) -> &mut Base {
        match self {
            Workload::Service(s) => &mut s.base,
            Workload::Job(j) => &mut j.base,
        }
    }
}

/// Fields common to every workload kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Base {
    /// Keyed by container name; emitted in lexicographic key order.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub containers: BTreeMap<String, Container>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

/// Long-running workload exposed through ports.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Service {
    #[serde(flatten)]
    pub base: Base,
    /// Kubernetes workload kind: Deployment, StatefulSet or Collaset.
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub service_type: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<Port>,
}

/// One-off or scheduled workload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Job {
    #[serde(flatten)]
    pub base: Base,
    /// Cron expression; empty means a one-shot Job.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub schedule: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Port {
    pub port: i32,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub target_port: i32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub protocol: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub public: bool,
}

fn is_zero(v: &i32) -> bool {
    *v == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workload_yaml_round_trip() {
        let mut containers = BTreeMap::new();
        containers.insert(
            "nginx".to_string(),
            Container {
                image: "nginx:v1".into(),
                ..Default::default()
            },
        );
        let workload = Workload::Service(Service {
            base: Base {
                containers,
                replicas: Some(2),
                ..Default::default()
            },
            service_type: SERVICE_TYPE_DEPLOYMENT.into(),
            ports: vec![Port {
                port: 80,
                protocol: "TCP".into(),
                ..Default::default()
            }],
        });
        let yaml = serde_yaml::to_string(&workload).unwrap();
        assert!(yaml.starts_with("_type: Service\n"), "yaml={yaml}");
        let back: Workload = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(workload, back);
    }

    #[test]
    fn job_json_carries_schedule() {
        let workload = Workload::Job(Job {
            base: Base::default(),
            schedule: "* * * * *".into(),
        });
        let json = serde_json::to_string(&workload).unwrap();
        assert_eq!(json, r#"{"_type":"Job","schedule":"* * * * *"}"#);
        let back: Workload = serde_json::from_str(&json).unwrap();
        assert_eq!(workload, back);
    }

    #[test]
    fn unknown_workload_type_rejected() {
        let err = serde_yaml::from_str::<Workload>("_type: Daemon\n")
            .unwrap_err()
            .to_string();
        assert!(err.contains("Daemon") || err.contains("unknown variant"), "err={err}");
    }
}
