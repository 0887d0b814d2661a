//! Application container spec as written in the DSL, before lowering to
//! Kubernetes shapes.

use std::collections::BTreeMap;

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::handler::{Lifecycle, Probe};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    pub image: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Ordered: entry order is observable in generated output.
    #[serde(default, skip_serializing_if = "EnvMap::is_empty")]
    pub env: EnvMap,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub working_dir: String,
    /// Quantity spec per resource name; `"2-4"` denotes a request-limit
    /// range, a single value means request = limit.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub resources: BTreeMap<String, String>,
    /// Files materialised into the container, keyed by absolute path.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub files: BTreeMap<String, FileSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readiness_probe: Option<Probe>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub liveness_probe: Option<Probe>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub startup_probe: Option<Probe>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lifecycle: Option<Lifecycle>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSpec {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub content: String,
    /// Octal permission string, e.g. `"0644"`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mode: String,
}

/// String map that keeps insertion order. Serialises as a plain mapping
/// in both YAML and JSON; decode preserves the order keys appear in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvMap(Vec<(String, String)>);

impl EnvMap {
    pub fn new() -> Self {
        EnvMap(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.push((key.into(), value.into()));
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, String)> {
        self.0.iter()
    }
}

impl From<Vec<(String, String)>> for EnvMap {
    fn from(entries: Vec<(String, String)>) -> Self {
        EnvMap(entries)
    }
}

impl Serialize for EnvMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (k, v) in &self.0 {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

struct EnvMapVisitor;

impl<'de> Visitor<'de> for EnvMapVisitor {
    type Value = EnvMap;

    fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("a mapping of environment variable names to values")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
        let mut entries = Vec::with_capacity(access.size_hint().unwrap_or(0));
        while let Some((k, v)) = access.next_entry::<String, String>()? {
            entries.push((k, v));
        }
        Ok(EnvMap(entries))
    }
}

impl<'de> Deserialize<'de> for EnvMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_map(EnvMapVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{ExecAction, Handler, HttpAction, TcpAction};

    fn base_container() -> Container {
        let mut env = EnvMap::new();
        env.push("env1", "VALUE");
        Container {
            image: "nginx:v1".into(),
            command: vec!["/bin/sh".into(), "-c".into(), "echo hi".into()],
            args: vec!["/bin/sh".into(), "-c".into(), "echo hi".into()],
            env,
            working_dir: "/tmp".into(),
            ..Default::default()
        }
    }

    #[test]
    fn container_json_golden() {
        let mut container = Container {
            image: "nginx:v1".into(),
            ..Default::default()
        };
        container.resources.insert("cpu".into(), "4".into());
        container.resources.insert("memory".into(), "8Gi".into());
        container.files.insert(
            "/tmp/test.txt".into(),
            FileSpec {
                content: "hello world".into(),
                mode: "0644".into(),
            },
        );
        let json = serde_json::to_string(&container).unwrap();
        assert_eq!(
            json,
            r#"{"image":"nginx:v1","resources":{"cpu":"4","memory":"8Gi"},"files":{"/tmp/test.txt":{"content":"hello world","mode":"0644"}}}"#
        );
        let back: Container = serde_json::from_str(&json).unwrap();
        assert_eq!(container, back);
    }

    #[test]
    fn container_with_http_probe_json_golden() {
        let container = Container {
            image: "nginx:v1".into(),
            readiness_probe: Some(Probe {
                probe_handler: Handler::Http(HttpAction {
                    url: "http://localhost:80".into(),
                    headers: Default::default(),
                }),
                initial_delay_seconds: 10,
            }),
            ..Default::default()
        };
        let json = serde_json::to_string(&container).unwrap();
        assert_eq!(
            json,
            r#"{"image":"nginx:v1","readinessProbe":{"probeHandler":{"_type":"Http","url":"http://localhost:80"},"initialDelaySeconds":10}}"#
        );
        let back: Container = serde_json::from_str(&json).unwrap();
        assert_eq!(container, back);
    }

    #[test]
    fn container_yaml_golden() {
        let container = base_container();
        let yaml = serde_yaml::to_string(&container).unwrap();
        assert_eq!(
            yaml,
            "image: nginx:v1\ncommand:\n- /bin/sh\n- -c\n- echo hi\nargs:\n- /bin/sh\n- -c\n- echo hi\nenv:\n  env1: VALUE\nworkingDir: /tmp\n"
        );
        let back: Container = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(container, back);
    }

    #[test]
    fn container_yaml_with_probes_round_trips() {
        let mut container = base_container();
        container.readiness_probe = Some(Probe {
            probe_handler: Handler::Tcp(TcpAction {
                url: "127.0.0.1:8080".into(),
            }),
            initial_delay_seconds: 10,
        });
        container.liveness_probe = Some(Probe {
            probe_handler: Handler::Exec(ExecAction {
                command: vec!["cat".into(), "/tmp/healthy".into()],
            }),
            initial_delay_seconds: 0,
        });
        let yaml = serde_yaml::to_string(&container).unwrap();
        assert!(yaml.contains("_type: Tcp"));
        assert!(yaml.contains("url: 127.0.0.1:8080"));
        let back: Container = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(container, back);
    }

    #[test]
    fn env_preserves_insertion_order() {
        let mut env = EnvMap::new();
        env.push("zz", "1");
        env.push("aa", "2");
        env.push("mm", "3");
        let yaml = serde_yaml::to_string(&env).unwrap();
        assert_eq!(yaml, "zz: '1'\naa: '2'\nmm: '3'\n");
        let back: EnvMap = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(env, back);

        let json = serde_json::to_string(&env).unwrap();
        assert_eq!(json, r#"{"zz":"1","aa":"2","mm":"3"}"#);
    }
}
