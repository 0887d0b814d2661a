//! Polymorphic probe and lifecycle actions.
//!
//! The wire form is a single flat object discriminated by a `_type` key,
//! which is always emitted first:
//!
//! ```text
//! {"_type":"Http","url":"http://...","headers":{...}}
//! {"_type":"Exec","command":[...]}
//! {"_type":"Tcp","url":"host:port"}
//! ```

use std::collections::BTreeMap;

use serde::de;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub const TYPE_EXEC: &str = "Exec";
pub const TYPE_HTTP: &str = "Http";
pub const TYPE_TCP: &str = "Tcp";

/// Run a command inside the container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecAction {
    pub command: Vec<String>,
}

/// Perform an HTTP GET against `url`. Host/port/scheme/path are derived
/// from the URL when the handler is lowered to a Kubernetes shape.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpAction {
    pub url: String,
    pub headers: BTreeMap<String, String>,
}

/// Open a TCP connection against a `host:port` endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TcpAction {
    pub url: String,
}

/// Shared action shape for probes and lifecycle hooks. Exactly one
/// variant's fields appear on the wire next to the `_type` tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handler {
    Exec(ExecAction),
    Http(HttpAction),
    Tcp(TcpAction),
}

pub type ProbeHandler = Handler;
pub type LifecycleHandler = Handler;

impl Handler {
    pub fn type_name(&self) -> &'static str {
        match self {
            Handler::Exec(_) => TYPE_EXEC,
            Handler::Http(_) => TYPE_HTTP,
            Handler::Tcp(_) => TYPE_TCP,
        }
    }
}

impl Serialize for Handler {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Handler::Exec(a) => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry("_type", TYPE_EXEC)?;
                map.serialize_entry("command", &a.command)?;
                map.end()
            }
            Handler::Http(a) => {
                let entries = if a.headers.is_empty() { 2 } else { 3 };
                let mut map = serializer.serialize_map(Some(entries))?;
                map.serialize_entry("_type", TYPE_HTTP)?;
                map.serialize_entry("url", &a.url)?;
                if !a.headers.is_empty() {
                    map.serialize_entry("headers", &a.headers)?;
                }
                map.end()
            }
            Handler::Tcp(a) => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry("_type", TYPE_TCP)?;
                map.serialize_entry("url", &a.url)?;
                map.end()
            }
        }
    }
}

/// Raw wire shape. Dispatch and cross-field validation happen after the
/// format-level decode, so the same checks apply to JSON and YAML.
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct HandlerRepr {
    #[serde(rename = "_type")]
    tag: Option<String>,
    command: Option<Vec<String>>,
    url: Option<String>,
    headers: Option<BTreeMap<String, String>>,
}

impl<'de> Deserialize<'de> for Handler {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let repr = HandlerRepr::deserialize(deserializer)?;
        let tag = repr
            .tag
            .ok_or_else(|| de::Error::custom("invalid handler type: missing _type"))?;
        match tag.as_str() {
            TYPE_EXEC => {
                if repr.url.is_some() || repr.headers.is_some() {
                    return Err(de::Error::custom(
                        "invalid handler type: Exec takes only command",
                    ));
                }
                let command = repr
                    .command
                    .ok_or_else(|| de::Error::custom("invalid handler type: Exec requires command"))?;
                Ok(Handler::Exec(ExecAction { command }))
            }
            TYPE_HTTP => {
                if repr.command.is_some() {
                    return Err(de::Error::custom(
                        "invalid handler type: Http takes only url and headers",
                    ));
                }
                let url = repr
                    .url
                    .ok_or_else(|| de::Error::custom("invalid handler type: Http requires url"))?;
                Ok(Handler::Http(HttpAction {
                    url,
                    headers: repr.headers.unwrap_or_default(),
                }))
            }
            TYPE_TCP => {
                if repr.command.is_some() || repr.headers.is_some() {
                    return Err(de::Error::custom(
                        "invalid handler type: Tcp takes only url",
                    ));
                }
                let url = repr
                    .url
                    .ok_or_else(|| de::Error::custom("invalid handler type: Tcp requires url"))?;
                Ok(Handler::Tcp(TcpAction { url }))
            }
            other => Err(de::Error::custom(format!("invalid handler type: {other}"))),
        }
    }
}

/// Health check run against a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Probe {
    #[serde(rename = "probeHandler")]
    pub probe_handler: ProbeHandler,
    #[serde(rename = "initialDelaySeconds", default, skip_serializing_if = "is_zero")]
    pub initial_delay_seconds: i32,
}

/// Container lifecycle hooks. `preStop` is declared first so YAML and
/// JSON output emit it before `postStart`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lifecycle {
    #[serde(rename = "preStop", default, skip_serializing_if = "Option::is_none")]
    pub pre_stop: Option<LifecycleHandler>,
    #[serde(rename = "postStart", default, skip_serializing_if = "Option::is_none")]
    pub post_start: Option<LifecycleHandler>,
}

fn is_zero(v: &i32) -> bool {
    *v == 0
}
