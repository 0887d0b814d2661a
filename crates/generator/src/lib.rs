//! Workload generator: lowers a high-level Service or Job plus its
//! containers into an ordered list of typed intent resources.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1 as appsv1;
use k8s_openapi::api::batch::v1 as batchv1;
use k8s_openapi::api::core::v1 as corev1;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::Resource as K8sResource;
use serde_json::Value as Json;
use tracing::debug;

use kusion_core::container::{Container, FileSpec};
use kusion_core::handler::{Handler, Lifecycle, Probe};
use kusion_core::workload::{
    Job, Service, Workload, SERVICE_TYPE_COLLASET, SERVICE_TYPE_DEPLOYMENT,
    SERVICE_TYPE_STATEFULSET,
};
use kusion_core::{build_id, Attributes, Error, Intent, Resource, Result, RuntimeType};
use kusion_workspace::{GenericConfig, GenericConfigExt};

const COLLASET_API_VERSION: &str = "apps.kusionstack.io/v1alpha1";
const COLLASET_KIND: &str = "CollaSet";

/// Lowers one workload into intent resources. Equal inputs produce
/// byte-equal output, including attribute key order.
pub struct Generator {
    pub project: String,
    pub stack: String,
    pub app: String,
    pub namespace: String,
    pub workload: Workload,
    /// Platform-level defaults keyed by workload kind ("service"/"job").
    pub platform_configs: BTreeMap<String, GenericConfig>,
}

impl Generator {
    pub fn generate(&self, intent: &mut Intent) -> Result<()> {
        let empty = GenericConfig::new();
        let config = self
            .platform_configs
            .get(self.workload.platform_config_key())
            .unwrap_or(&empty);
        let mut workload = self.workload.clone();
        complete_base_workload(workload.base_mut(), config)?;
        debug!(app = %self.app, kind = workload.type_name(), "generating workload");
        match &workload {
            Workload::Service(svc) => self.generate_service(svc, config, intent),
            Workload::Job(job) => self.generate_job(job, intent),
        }
    }

    fn generate_service(
        &self,
        svc: &Service,
        config: &GenericConfig,
        intent: &mut Intent,
    ) -> Result<()> {
        let name = unique_app_name(&self.project, &self.stack, &self.app);
        let (containers, volumes, config_maps) =
            to_ordered_containers(&svc.base.containers, &name)?;

        let labels = merge_string_maps(&[
            &unique_app_labels(&self.project, &self.app),
            &svc.base.labels,
        ]);
        let annotations = svc.base.annotations.clone();
        let selector = LabelSelector {
            match_labels: Some(unique_app_labels(&self.project, &self.app)),
            ..Default::default()
        };
        let metadata = ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(self.namespace.clone()),
            labels: some_if_not_empty(labels.clone()),
            annotations: some_if_not_empty(annotations.clone()),
            ..Default::default()
        };
        let template = corev1::PodTemplateSpec {
            metadata: Some(ObjectMeta {
                labels: some_if_not_empty(labels),
                annotations: some_if_not_empty(annotations),
                ..Default::default()
            }),
            spec: Some(corev1::PodSpec {
                containers,
                volumes: if volumes.is_empty() { None } else { Some(volumes) },
                ..Default::default()
            }),
        };

        let service_type = resolve_service_type(svc, config)?;
        let (api_version, kind, attributes) = match service_type.as_str() {
            SERVICE_TYPE_STATEFULSET => {
                let sts = appsv1::StatefulSet {
                    metadata,
                    spec: Some(appsv1::StatefulSetSpec {
                        replicas: svc.base.replicas,
                        selector,
                        service_name: name.clone(),
                        template,
                        ..Default::default()
                    }),
                    ..Default::default()
                };
                (
                    appsv1::StatefulSet::API_VERSION,
                    appsv1::StatefulSet::KIND,
                    to_attributes(&sts, appsv1::StatefulSet::API_VERSION, appsv1::StatefulSet::KIND)?,
                )
            }
            SERVICE_TYPE_COLLASET => {
                let mut spec = serde_json::Map::new();
                if let Some(replicas) = svc.base.replicas {
                    spec.insert("replicas".into(), replicas.into());
                }
                spec.insert("selector".into(), to_json(&selector)?);
                spec.insert("template".into(), to_json(&template)?);
                let mut attrs = Attributes::new();
                attrs.insert("apiVersion".into(), COLLASET_API_VERSION.into());
                attrs.insert("kind".into(), COLLASET_KIND.into());
                attrs.insert("metadata".into(), to_json(&metadata)?);
                attrs.insert("spec".into(), Json::Object(spec));
                (COLLASET_API_VERSION, COLLASET_KIND, attrs)
            }
            _ => {
                let deploy = appsv1::Deployment {
                    metadata,
                    spec: Some(appsv1::DeploymentSpec {
                        replicas: svc.base.replicas,
                        selector,
                        template,
                        ..Default::default()
                    }),
                    ..Default::default()
                };
                (
                    appsv1::Deployment::API_VERSION,
                    appsv1::Deployment::KIND,
                    to_attributes(&deploy, appsv1::Deployment::API_VERSION, appsv1::Deployment::KIND)?,
                )
            }
        };

        append_resource(
            intent,
            build_id(api_version, kind, &self.namespace, &name),
            attributes,
        )?;
        self.append_config_maps(intent, config_maps)
    }

    fn generate_job(&self, job: &Job, intent: &mut Intent) -> Result<()> {
        let name = unique_app_name(&self.project, &self.stack, &self.app);
        let (containers, volumes, config_maps) =
            to_ordered_containers(&job.base.containers, &name)?;

        let labels = merge_string_maps(&[
            &unique_app_labels(&self.project, &self.app),
            &job.base.labels,
        ]);
        let annotations = job.base.annotations.clone();
        let metadata = ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(self.namespace.clone()),
            labels: some_if_not_empty(labels.clone()),
            annotations: some_if_not_empty(annotations.clone()),
            ..Default::default()
        };
        let template = corev1::PodTemplateSpec {
            metadata: Some(ObjectMeta {
                labels: some_if_not_empty(labels),
                annotations: some_if_not_empty(annotations),
                ..Default::default()
            }),
            spec: Some(corev1::PodSpec {
                containers,
                volumes: if volumes.is_empty() { None } else { Some(volumes) },
                restart_policy: Some("Never".to_string()),
                ..Default::default()
            }),
        };
        let job_spec = batchv1::JobSpec {
            template,
            ..Default::default()
        };

        let (api_version, kind, attributes) = if job.schedule.is_empty() {
            let obj = batchv1::Job {
                metadata,
                spec: Some(job_spec),
                ..Default::default()
            };
            (
                batchv1::Job::API_VERSION,
                batchv1::Job::KIND,
                to_attributes(&obj, batchv1::Job::API_VERSION, batchv1::Job::KIND)?,
            )
        } else {
            let obj = batchv1::CronJob {
                metadata,
                spec: Some(batchv1::CronJobSpec {
                    schedule: job.schedule.clone(),
                    job_template: batchv1::JobTemplateSpec {
                        metadata: None,
                        spec: Some(job_spec),
                    },
                    ..Default::default()
                }),
                ..Default::default()
            };
            (
                batchv1::CronJob::API_VERSION,
                batchv1::CronJob::KIND,
                to_attributes(&obj, batchv1::CronJob::API_VERSION, batchv1::CronJob::KIND)?,
            )
        };

        append_resource(
            intent,
            build_id(api_version, kind, &self.namespace, &name),
            attributes,
        )?;
        self.append_config_maps(intent, config_maps)
    }

    fn append_config_maps(
        &self,
        intent: &mut Intent,
        config_maps: Vec<corev1::ConfigMap>,
    ) -> Result<()> {
        for mut cm in config_maps {
            cm.metadata.namespace = Some(self.namespace.clone());
            let name = cm.metadata.name.clone().unwrap_or_default();
            let attributes = to_attributes(&cm, corev1::ConfigMap::API_VERSION, corev1::ConfigMap::KIND)?;
            append_resource(
                intent,
                build_id(
                    corev1::ConfigMap::API_VERSION,
                    corev1::ConfigMap::KIND,
                    &self.namespace,
                    &name,
                ),
                attributes,
            )?;
        }
        Ok(())
    }
}

/// Canonical application name shared by the workload object and its
/// dependents.
pub fn unique_app_name(project: &str, stack: &str, app: &str) -> String {
    format!("{project}-{stack}-{app}")
}

/// Labels identifying one application within a project.
pub fn unique_app_labels(project: &str, app: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app.kubernetes.io/name".to_string(), app.to_string()),
        ("app.kubernetes.io/part-of".to_string(), project.to_string()),
    ])
}

/// Shallow merge; later maps win on conflicting keys.
pub fn merge_string_maps(maps: &[&BTreeMap<String, String>]) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for map in maps {
        for (k, v) in *map {
            out.insert(k.clone(), v.clone());
        }
    }
    out
}

/// Merge platform-level defaults into the workload base. The workload's
/// own replicas value wins; platform labels and annotations merge in
/// underneath the workload's.
pub fn complete_base_workload(base: &mut kusion_core::workload::Base, config: &GenericConfig) -> Result<()> {
    if base.replicas.is_none() {
        base.replicas = config.get_int32_pointer("replicas")?;
    }
    if let Some(labels) = config.get_string_map("labels")? {
        for (k, v) in labels {
            base.labels.entry(k).or_insert(v);
        }
    }
    if let Some(annotations) = config.get_string_map("annotations")? {
        for (k, v) in annotations {
            base.annotations.entry(k).or_insert(v);
        }
    }
    Ok(())
}

fn resolve_service_type(svc: &Service, config: &GenericConfig) -> Result<String> {
    let mut service_type = svc.service_type.clone();
    if service_type.is_empty() {
        service_type = config.get_string("type")?.unwrap_or_default();
    }
    if service_type.is_empty() {
        service_type = SERVICE_TYPE_DEPLOYMENT.to_string();
    }
    match service_type.as_str() {
        SERVICE_TYPE_DEPLOYMENT | SERVICE_TYPE_STATEFULSET | SERVICE_TYPE_COLLASET => {
            Ok(service_type)
        }
        other => Err(Error::InvalidArgument(format!(
            "unsupported service type {other}"
        ))),
    }
}

/// Lower the keyed container map into Kubernetes containers, emitted in
/// lexicographic key order, together with the volumes and config maps
/// materialised from container files.
pub fn to_ordered_containers(
    app_containers: &BTreeMap<String, Container>,
    unique_app_name: &str,
) -> Result<(
    Vec<corev1::Container>,
    Vec<corev1::Volume>,
    Vec<corev1::ConfigMap>,
)> {
    let mut containers = Vec::with_capacity(app_containers.len());
    let mut volumes = Vec::new();
    let mut config_maps = Vec::new();

    for (name, c) in app_containers {
        let mut container = corev1::Container {
            name: name.clone(),
            image: Some(c.image.clone()),
            ..Default::default()
        };
        if !c.command.is_empty() {
            container.command = Some(c.command.clone());
        }
        if !c.args.is_empty() {
            container.args = Some(c.args.clone());
        }
        if !c.env.is_empty() {
            container.env = Some(
                c.env
                    .iter()
                    .map(|(k, v)| corev1::EnvVar {
                        name: k.clone(),
                        value: Some(v.clone()),
                        value_from: None,
                    })
                    .collect(),
            );
        }
        if !c.working_dir.is_empty() {
            container.working_dir = Some(c.working_dir.clone());
        }
        if !c.resources.is_empty() {
            container.resources = Some(lower_resource_requirements(&c.resources)?);
        }
        if let Some(probe) = &c.readiness_probe {
            container.readiness_probe = Some(lower_probe(probe)?);
        }
        if let Some(probe) = &c.liveness_probe {
            container.liveness_probe = Some(lower_probe(probe)?);
        }
        if let Some(probe) = &c.startup_probe {
            container.startup_probe = Some(lower_probe(probe)?);
        }
        if let Some(lifecycle) = &c.lifecycle {
            container.lifecycle = Some(lower_lifecycle(lifecycle)?);
        }

        let (mounts, container_volumes, container_config_maps) =
            lower_files(&c.files, unique_app_name, name)?;
        if !mounts.is_empty() {
            container.volume_mounts = Some(mounts);
        }
        volumes.extend(container_volumes);
        config_maps.extend(container_config_maps);
        containers.push(container);
    }

    Ok((containers, volumes, config_maps))
}

/// Group container files by directory: each directory becomes one
/// ConfigMap, one Volume referencing it, and a VolumeMount named
/// `<app>-<container>-<ordinal>` mounted at the directory.
fn lower_files(
    files: &BTreeMap<String, FileSpec>,
    unique_app_name: &str,
    container_name: &str,
) -> Result<(
    Vec<corev1::VolumeMount>,
    Vec<corev1::Volume>,
    Vec<corev1::ConfigMap>,
)> {
    let mut dirs: BTreeMap<String, BTreeMap<String, &FileSpec>> = BTreeMap::new();
    for (path, spec) in files {
        let parsed = std::path::Path::new(path);
        let (dir, file_name) = match (parsed.parent(), parsed.file_name()) {
            (Some(dir), Some(file_name)) if !dir.as_os_str().is_empty() => (
                dir.to_string_lossy().to_string(),
                file_name.to_string_lossy().to_string(),
            ),
            _ => {
                return Err(Error::InvalidArgument(format!(
                    "invalid container file path: {path}"
                )))
            }
        };
        dirs.entry(dir).or_default().insert(file_name, spec);
    }

    let mut mounts = Vec::with_capacity(dirs.len());
    let mut volumes = Vec::with_capacity(dirs.len());
    let mut config_maps = Vec::with_capacity(dirs.len());
    for (ordinal, (dir, entries)) in dirs.into_iter().enumerate() {
        let volume_name = format!("{unique_app_name}-{container_name}-{ordinal}");
        let mut data = BTreeMap::new();
        let mut default_mode = None;
        for (file_name, spec) in entries {
            if default_mode.is_none() && !spec.mode.is_empty() {
                default_mode = Some(parse_file_mode(&spec.mode)?);
            }
            data.insert(file_name, spec.content.clone());
        }
        config_maps.push(corev1::ConfigMap {
            metadata: ObjectMeta {
                name: Some(volume_name.clone()),
                ..Default::default()
            },
            data: Some(data),
            ..Default::default()
        });
        volumes.push(corev1::Volume {
            name: volume_name.clone(),
            config_map: Some(corev1::ConfigMapVolumeSource {
                name: Some(volume_name.clone()),
                default_mode,
                ..Default::default()
            }),
            ..Default::default()
        });
        mounts.push(corev1::VolumeMount {
            name: volume_name,
            mount_path: dir,
            ..Default::default()
        });
    }
    Ok((mounts, volumes, config_maps))
}

/// Octal permission string to int32, e.g. `"0777"` -> 511.
fn parse_file_mode(mode: &str) -> Result<i32> {
    if mode.starts_with('-') {
        return Err(Error::InvalidArgument(format!("invalid file mode: {mode}")));
    }
    i32::from_str_radix(mode, 8)
        .map_err(|_| Error::InvalidArgument(format!("invalid file mode: {mode}")))
}

/// `"2-4"` means request 2 / limit 4; a single value means request =
/// limit.
fn lower_resource_requirements(
    resources: &BTreeMap<String, String>,
) -> Result<corev1::ResourceRequirements> {
    let mut requests = BTreeMap::new();
    let mut limits = BTreeMap::new();
    for (name, spec) in resources {
        let (request, limit) = match spec.split_once('-') {
            Some((request, limit)) => (request, limit),
            None => (spec.as_str(), spec.as_str()),
        };
        validate_quantity(name, request)?;
        validate_quantity(name, limit)?;
        requests.insert(name.clone(), Quantity(request.to_string()));
        limits.insert(name.clone(), Quantity(limit.to_string()));
    }
    Ok(corev1::ResourceRequirements {
        requests: Some(requests),
        limits: Some(limits),
        ..Default::default()
    })
}

fn validate_quantity(name: &str, raw: &str) -> Result<()> {
    const SUFFIXES: [&str; 13] = [
        "Ki", "Mi", "Gi", "Ti", "Pi", "Ei", "m", "k", "M", "G", "T", "P", "E",
    ];
    let digits = SUFFIXES
        .iter()
        .find_map(|s| raw.strip_suffix(s))
        .unwrap_or(raw);
    let value: f64 = digits.parse().map_err(|_| {
        Error::InvalidArgument(format!("invalid {name} quantity: {raw}"))
    })?;
    if !value.is_finite() || value < 0.0 {
        return Err(Error::InvalidArgument(format!(
            "invalid {name} quantity: {raw}"
        )));
    }
    Ok(())
}

fn lower_probe(probe: &Probe) -> Result<corev1::Probe> {
    let (exec, http_get, tcp_socket) = lower_handler(&probe.probe_handler)?;
    Ok(corev1::Probe {
        exec,
        http_get,
        tcp_socket,
        initial_delay_seconds: (probe.initial_delay_seconds != 0)
            .then_some(probe.initial_delay_seconds),
        ..Default::default()
    })
}

fn lower_lifecycle(lifecycle: &Lifecycle) -> Result<corev1::Lifecycle> {
    let mut out = corev1::Lifecycle::default();
    if let Some(handler) = &lifecycle.pre_stop {
        out.pre_stop = Some(lower_lifecycle_handler(handler)?);
    }
    if let Some(handler) = &lifecycle.post_start {
        out.post_start = Some(lower_lifecycle_handler(handler)?);
    }
    Ok(out)
}

fn lower_lifecycle_handler(handler: &Handler) -> Result<corev1::LifecycleHandler> {
    let (exec, http_get, tcp_socket) = lower_handler(handler)?;
    Ok(corev1::LifecycleHandler {
        exec,
        http_get,
        tcp_socket,
    })
}

fn lower_handler(
    handler: &Handler,
) -> Result<(
    Option<corev1::ExecAction>,
    Option<corev1::HTTPGetAction>,
    Option<corev1::TCPSocketAction>,
)> {
    match handler {
        Handler::Exec(a) => Ok((
            Some(corev1::ExecAction {
                command: Some(a.command.clone()),
            }),
            None,
            None,
        )),
        Handler::Http(a) => Ok((None, Some(lower_http_action(&a.url, &a.headers)?), None)),
        Handler::Tcp(a) => {
            let (host, port) = split_host_port(&a.url)?;
            Ok((
                None,
                None,
                Some(corev1::TCPSocketAction {
                    host: Some(host),
                    port: IntOrString::Int(port),
                }),
            ))
        }
    }
}

fn lower_http_action(
    raw: &str,
    headers: &BTreeMap<String, String>,
) -> Result<corev1::HTTPGetAction> {
    let url = url::Url::parse(raw).map_err(|e| Error::InvalidHandlerUrl(format!("{raw}: {e}")))?;
    let scheme = url.scheme().to_uppercase();
    if scheme != "HTTP" && scheme != "HTTPS" {
        return Err(Error::InvalidHandlerUrl(format!(
            "{raw}: unsupported scheme {scheme}"
        )));
    }
    // Pod-local probes leave the host empty so the kubelet targets the
    // pod IP.
    let host = match url.host_str() {
        None | Some("localhost") => None,
        Some(host) => Some(host.to_string()),
    };
    let port = url
        .port_or_known_default()
        .ok_or_else(|| Error::InvalidHandlerUrl(format!("{raw}: missing port")))?;
    let path = url.path();
    let path = if path == "/" && !raw.ends_with('/') {
        None
    } else {
        Some(path.to_string())
    };
    let http_headers = if headers.is_empty() {
        None
    } else {
        Some(
            headers
                .iter()
                .map(|(name, value)| corev1::HTTPHeader {
                    name: name.clone(),
                    value: value.clone(),
                })
                .collect(),
        )
    };
    Ok(corev1::HTTPGetAction {
        host,
        http_headers,
        path,
        port: IntOrString::Int(i32::from(port)),
        scheme: Some(scheme),
    })
}

fn split_host_port(raw: &str) -> Result<(String, i32)> {
    let (host, port) = raw
        .rsplit_once(':')
        .ok_or_else(|| Error::InvalidHandlerUrl(format!("{raw}: expected host:port")))?;
    if host.is_empty() {
        return Err(Error::InvalidHandlerUrl(format!("{raw}: missing host")));
    }
    let port: u16 = port
        .parse()
        .map_err(|_| Error::InvalidHandlerUrl(format!("{raw}: invalid port")))?;
    Ok((host.to_string(), i32::from(port)))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<Json> {
    serde_json::to_value(value)
        .map_err(|e| Error::InvalidArgument(format!("encoding object: {e}")))
}

fn to_attributes<T: serde::Serialize>(obj: &T, api_version: &str, kind: &str) -> Result<Attributes> {
    let mut map = match to_json(obj)? {
        Json::Object(map) => map,
        _ => {
            return Err(Error::InvalidArgument(
                "object did not encode to a mapping".to_string(),
            ))
        }
    };
    map.insert("apiVersion".into(), api_version.into());
    map.insert("kind".into(), kind.into());
    Ok(map)
}

fn append_resource(intent: &mut Intent, id: String, attributes: Attributes) -> Result<()> {
    if intent.resources.iter().any(|r| r.id == id) {
        return Err(Error::InvalidArgument(format!("duplicate resource id {id}")));
    }
    intent.resources.push(Resource {
        id,
        resource_type: RuntimeType::Kubernetes,
        attributes,
        depends_on: vec![],
        extensions: Attributes::new(),
    });
    Ok(())
}

fn some_if_not_empty(map: BTreeMap<String, String>) -> Option<BTreeMap<String, String>> {
    if map.is_empty() {
        None
    } else {
        Some(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kusion_core::container::EnvMap;
    use kusion_core::handler::{ExecAction, HttpAction, TcpAction};
    use kusion_core::workload::Base;

    fn generic(json: serde_json::Value) -> GenericConfig {
        match json {
            Json::Object(m) => m,
            _ => unreachable!(),
        }
    }

    fn nginx() -> Container {
        Container {
            image: "nginx:v1".into(),
            ..Default::default()
        }
    }

    fn service_generator(workload: Workload) -> Generator {
        Generator {
            project: "test".into(),
            stack: "test".into(),
            app: "test".into(),
            namespace: "test".into(),
            workload,
            platform_configs: BTreeMap::from([
                ("service".to_string(), generic(serde_json::json!({"type": "Deployment"}))),
                ("job".to_string(), generic(serde_json::json!({"replicas": 2}))),
            ]),
        }
    }

    #[test]
    fn ordered_containers_sort_by_name_and_keep_env_order() {
        let mut containers = BTreeMap::new();
        containers.insert("container1".to_string(), Container {
            image: "image1".into(),
            ..Default::default()
        });
        let mut env = EnvMap::new();
        env.push("key", "value");
        containers.insert("container2".to_string(), Container {
            image: "image2".into(),
            env,
            ..Default::default()
        });
        let mut files = BTreeMap::new();
        files.insert("/tmp/example1/file.txt".to_string(), FileSpec {
            content: "some file contents".into(),
            mode: "0777".into(),
        });
        files.insert("/tmp/example2/file.txt".to_string(), FileSpec {
            content: "some file contents".into(),
            mode: "0644".into(),
        });
        containers.insert("container3".to_string(), Container {
            image: "image3".into(),
            files,
            ..Default::default()
        });

        let (ordered, volumes, config_maps) =
            to_ordered_containers(&containers, "mock-app-name").unwrap();

        assert_eq!(ordered.len(), 3);
        assert_eq!(ordered[0].name, "container1");
        assert_eq!(ordered[0].image.as_deref(), Some("image1"));
        assert_eq!(ordered[1].name, "container2");
        let env = ordered[1].env.as_ref().unwrap();
        assert_eq!(env.len(), 1);
        assert_eq!(env[0].name, "key");
        assert_eq!(env[0].value.as_deref(), Some("value"));
        assert_eq!(ordered[2].name, "container3");

        let mounts = ordered[2].volume_mounts.as_ref().unwrap();
        assert_eq!(mounts[0].name, "mock-app-name-container3-0");
        assert_eq!(mounts[0].mount_path, "/tmp/example1");
        assert_eq!(mounts[1].name, "mock-app-name-container3-1");
        assert_eq!(mounts[1].mount_path, "/tmp/example2");

        assert_eq!(volumes.len(), 2);
        assert_eq!(
            volumes[0].config_map.as_ref().unwrap().default_mode,
            Some(511)
        );
        assert_eq!(
            volumes[1].config_map.as_ref().unwrap().default_mode,
            Some(420)
        );

        assert_eq!(config_maps.len(), 2);
        let wanted = BTreeMap::from([(
            "file.txt".to_string(),
            "some file contents".to_string(),
        )]);
        assert_eq!(config_maps[0].data.as_ref().unwrap(), &wanted);
        assert_eq!(config_maps[1].data.as_ref().unwrap(), &wanted);
    }

    #[test]
    fn probes_lower_to_kubernetes_shapes() {
        let mut containers = BTreeMap::new();
        containers.insert("nginx".to_string(), Container {
            image: "nginx:v1".into(),
            resources: BTreeMap::from([
                ("cpu".to_string(), "2-4".to_string()),
                ("memory".to_string(), "4Gi-8Gi".to_string()),
            ]),
            liveness_probe: Some(Probe {
                probe_handler: Handler::Exec(ExecAction {
                    command: vec!["/bin/sh".into(), "-c".into(), "echo live".into()],
                }),
                initial_delay_seconds: 0,
            }),
            readiness_probe: Some(Probe {
                probe_handler: Handler::Http(HttpAction {
                    url: "http://localhost:8080/readiness".into(),
                    headers: BTreeMap::from([("header".to_string(), "value".to_string())]),
                }),
                initial_delay_seconds: 10,
            }),
            startup_probe: Some(Probe {
                probe_handler: Handler::Tcp(TcpAction {
                    url: "10.0.0.1:8888".into(),
                }),
                initial_delay_seconds: 0,
            }),
            ..Default::default()
        });

        let (ordered, _, _) = to_ordered_containers(&containers, "mock-app-name").unwrap();
        assert_eq!(ordered.len(), 1);
        let c = &ordered[0];

        let resources = c.resources.as_ref().unwrap();
        let requests = resources.requests.as_ref().unwrap();
        let limits = resources.limits.as_ref().unwrap();
        assert_eq!(requests["cpu"].0, "2");
        assert_eq!(requests["memory"].0, "4Gi");
        assert_eq!(limits["cpu"].0, "4");
        assert_eq!(limits["memory"].0, "8Gi");

        let readiness = c.readiness_probe.as_ref().unwrap();
        let http_get = readiness.http_get.as_ref().unwrap();
        assert_eq!(http_get.scheme.as_deref(), Some("HTTP"));
        assert_eq!(http_get.path.as_deref(), Some("/readiness"));
        assert_eq!(http_get.port, IntOrString::Int(8080));
        assert_eq!(http_get.host, None);
        assert_eq!(http_get.http_headers.as_ref().unwrap().len(), 1);
        assert_eq!(readiness.initial_delay_seconds, Some(10));

        let liveness = c.liveness_probe.as_ref().unwrap();
        assert_eq!(
            liveness.exec.as_ref().unwrap().command.as_ref().unwrap(),
            &vec!["/bin/sh".to_string(), "-c".to_string(), "echo live".to_string()]
        );

        let startup = c.startup_probe.as_ref().unwrap();
        let tcp = startup.tcp_socket.as_ref().unwrap();
        assert_eq!(tcp.host.as_deref(), Some("10.0.0.1"));
        assert_eq!(tcp.port, IntOrString::Int(8888));
    }

    #[test]
    fn lifecycle_lowers_both_hooks() {
        let mut containers = BTreeMap::new();
        containers.insert("nginx".to_string(), Container {
            image: "nginx:v1".into(),
            lifecycle: Some(Lifecycle {
                pre_stop: Some(Handler::Exec(ExecAction {
                    command: vec!["/bin/sh".into(), "-c".into(), "echo bye".into()],
                })),
                post_start: Some(Handler::Http(HttpAction {
                    url: "http://localhost:8080/started".into(),
                    headers: BTreeMap::new(),
                })),
            }),
            ..Default::default()
        });
        let (ordered, _, _) = to_ordered_containers(&containers, "mock-app-name").unwrap();
        let lifecycle = ordered[0].lifecycle.as_ref().unwrap();
        assert!(lifecycle.pre_stop.as_ref().unwrap().exec.is_some());
        let post_start = lifecycle.post_start.as_ref().unwrap();
        let http_get = post_start.http_get.as_ref().unwrap();
        assert_eq!(http_get.path.as_deref(), Some("/started"));
        assert_eq!(http_get.port, IntOrString::Int(8080));
    }

    #[test]
    fn malformed_quantities_are_rejected() {
        for bad in ["-2", "2--4", "abc", ""] {
            let resources = BTreeMap::from([("cpu".to_string(), bad.to_string())]);
            assert!(
                lower_resource_requirements(&resources).is_err(),
                "quantity {bad:?} should fail"
            );
        }
    }

    #[test]
    fn malformed_http_url_is_rejected() {
        let err = lower_http_action("://nope", &BTreeMap::new()).unwrap_err();
        assert!(matches!(err, Error::InvalidHandlerUrl(_)));
        let err = split_host_port("no-port").unwrap_err();
        assert!(matches!(err, Error::InvalidHandlerUrl(_)));
    }

    #[test]
    fn complete_base_merges_platform_config() {
        let mut base = Base {
            containers: BTreeMap::from([("nginx".to_string(), nginx())]),
            labels: BTreeMap::from([
                ("k1".to_string(), "v1".to_string()),
                ("k2".to_string(), "v2".to_string()),
            ]),
            ..Default::default()
        };
        let config = generic(serde_json::json!({
            "labels": { "k1": "v1-ws", "k3": "v3-ws" },
            "annotations": { "k1": "v1-ws" },
            "replicas": 4,
        }));
        complete_base_workload(&mut base, &config).unwrap();
        assert_eq!(base.replicas, Some(4));
        assert_eq!(
            base.labels,
            BTreeMap::from([
                ("k1".to_string(), "v1".to_string()),
                ("k2".to_string(), "v2".to_string()),
                ("k3".to_string(), "v3-ws".to_string()),
            ])
        );
        assert_eq!(
            base.annotations,
            BTreeMap::from([("k1".to_string(), "v1-ws".to_string())])
        );
    }

    #[test]
    fn workload_replicas_win_over_platform() {
        let mut base = Base {
            replicas: Some(3),
            ..Default::default()
        };
        complete_base_workload(&mut base, &generic(serde_json::json!({"replicas": 4}))).unwrap();
        assert_eq!(base.replicas, Some(3));
    }

    #[test]
    fn invalid_platform_config_types_are_rejected() {
        let mut base = Base::default();
        assert!(
            complete_base_workload(&mut base, &generic(serde_json::json!({"replicas": "2"})))
                .is_err()
        );
        assert!(
            complete_base_workload(&mut base, &generic(serde_json::json!({"labels": "k1=v1"})))
                .is_err()
        );
        assert!(complete_base_workload(
            &mut base,
            &generic(serde_json::json!({"annotations": "k1=v1"}))
        )
        .is_err());
    }

    #[test]
    fn service_generates_deployment_with_unique_name() {
        let workload = Workload::Service(Service {
            base: Base {
                containers: BTreeMap::from([("nginx".to_string(), nginx())]),
                ..Default::default()
            },
            service_type: String::new(),
            ports: vec![],
        });
        let generator = service_generator(workload);
        let mut intent = Intent::default();
        generator.generate(&mut intent).unwrap();

        assert_eq!(intent.resources.len(), 1);
        let resource = &intent.resources[0];
        assert_eq!(resource.id, "apps/v1:Deployment:test:test-test-test");
        assert_eq!(resource.attributes["kind"], "Deployment");
        assert_eq!(resource.attributes["metadata"]["namespace"], "test");
        assert_eq!(resource.attributes["metadata"]["name"], "test-test-test");
        assert_eq!(
            resource.attributes["metadata"]["labels"]["app.kubernetes.io/name"],
            "test"
        );
    }

    #[test]
    fn job_generates_cron_job_with_schedule() {
        let workload = Workload::Job(Job {
            base: Base {
                containers: BTreeMap::from([("worker".to_string(), nginx())]),
                ..Default::default()
            },
            schedule: "* * * * *".into(),
        });
        let generator = service_generator(workload);
        let mut intent = Intent::default();
        generator.generate(&mut intent).unwrap();

        let resource = &intent.resources[0];
        assert_eq!(resource.id, "batch/v1:CronJob:test:test-test-test");
        assert_eq!(resource.attributes["spec"]["schedule"], "* * * * *");
        // Platform config for jobs provided replicas: 2 but jobs ignore it;
        // the pod template still restarts Never.
        assert_eq!(
            resource.attributes["spec"]["jobTemplate"]["spec"]["template"]["spec"]
                ["restartPolicy"],
            "Never"
        );
    }

    #[test]
    fn job_without_schedule_generates_plain_job() {
        let workload = Workload::Job(Job {
            base: Base {
                containers: BTreeMap::from([("worker".to_string(), nginx())]),
                ..Default::default()
            },
            schedule: String::new(),
        });
        let generator = service_generator(workload);
        let mut intent = Intent::default();
        generator.generate(&mut intent).unwrap();
        assert_eq!(intent.resources[0].id, "batch/v1:Job:test:test-test-test");
    }

    #[test]
    fn service_files_append_config_maps_after_workload() {
        let mut files = BTreeMap::new();
        files.insert("/etc/app/app.conf".to_string(), FileSpec {
            content: "debug = false".into(),
            mode: "0644".into(),
        });
        let workload = Workload::Service(Service {
            base: Base {
                containers: BTreeMap::from([(
                    "nginx".to_string(),
                    Container {
                        image: "nginx:v1".into(),
                        files,
                        ..Default::default()
                    },
                )]),
                ..Default::default()
            },
            ..Default::default()
        });
        let generator = service_generator(workload);
        let mut intent = Intent::default();
        generator.generate(&mut intent).unwrap();

        assert_eq!(intent.resources.len(), 2);
        assert!(intent.resources[0].id.starts_with("apps/v1:Deployment"));
        assert_eq!(
            intent.resources[1].id,
            "v1:ConfigMap:test:test-test-test-nginx-0"
        );
        assert_eq!(
            intent.resources[1].attributes["data"]["app.conf"],
            "debug = false"
        );
    }

    #[test]
    fn collaset_service_type_builds_custom_resource() {
        let workload = Workload::Service(Service {
            base: Base {
                containers: BTreeMap::from([("nginx".to_string(), nginx())]),
                replicas: Some(2),
                ..Default::default()
            },
            service_type: SERVICE_TYPE_COLLASET.into(),
            ports: vec![],
        });
        let generator = service_generator(workload);
        let mut intent = Intent::default();
        generator.generate(&mut intent).unwrap();
        let resource = &intent.resources[0];
        assert_eq!(resource.attributes["apiVersion"], COLLASET_API_VERSION);
        assert_eq!(resource.attributes["kind"], COLLASET_KIND);
        assert_eq!(resource.attributes["spec"]["replicas"], 2);
    }

    #[test]
    fn unknown_service_type_is_rejected() {
        let svc = Service {
            service_type: "DaemonSet".into(),
            ..Default::default()
        };
        assert!(resolve_service_type(&svc, &GenericConfig::new()).is_err());
    }

    #[test]
    fn platform_service_type_is_consulted() {
        let svc = Service::default();
        let config = generic(serde_json::json!({"type": "StatefulSet"}));
        assert_eq!(
            resolve_service_type(&svc, &config).unwrap(),
            SERVICE_TYPE_STATEFULSET
        );
        assert_eq!(
            resolve_service_type(&svc, &GenericConfig::new()).unwrap(),
            SERVICE_TYPE_DEPLOYMENT
        );
    }

    #[test]
    fn generation_is_deterministic() {
        let mut env = EnvMap::new();
        env.push("B_KEY", "b");
        env.push("A_KEY", "a");
        let mut files = BTreeMap::new();
        files.insert("/etc/app/app.conf".to_string(), FileSpec {
            content: "x".into(),
            mode: "0600".into(),
        });
        let workload = Workload::Service(Service {
            base: Base {
                containers: BTreeMap::from([
                    ("web".to_string(), Container {
                        image: "web:v2".into(),
                        env,
                        files,
                        ..Default::default()
                    }),
                    ("sidecar".to_string(), nginx()),
                ]),
                replicas: Some(3),
                labels: BTreeMap::from([("team".to_string(), "infra".to_string())]),
                ..Default::default()
            },
            ..Default::default()
        });
        let generator = service_generator(workload);

        let mut first = Intent::default();
        generator.generate(&mut first).unwrap();
        let mut second = Intent::default();
        generator.generate(&mut second).unwrap();

        let a = serde_json::to_string(&first).unwrap();
        let b = serde_json::to_string(&second).unwrap();
        assert_eq!(a, b);
        let y1 = serde_yaml::to_string(&first).unwrap();
        let y2 = serde_yaml::to_string(&second).unwrap();
        assert_eq!(y1, y2);
    }
}
