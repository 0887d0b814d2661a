//! Preview/apply option handling: workdir validation, intent loading,
//! and operation wiring.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::Args;
use colored::Colorize;
use serde::Deserialize;
use tracing::info;

use kusion_core::workload::Workload;
use kusion_core::{Error, Intent};
use kusion_engine::models::{ActionType, MessageStatus, Request};
use kusion_engine::operator::Operator;
use kusion_generator::Generator;
use kusion_state::{LocalStorage, StateStorage};
use kusion_workspace::{get_project_module_configs, BackendConfigs, ModuleConfigs};

use crate::project::{FileDetector, ProjectDetector};
use crate::runner::{CodeRunner, ExternalRunner};

const JSON_OUTPUT: &str = "json";

/// Flags shared by `preview` and `apply`.
#[derive(Args, Debug, Default, Clone)]
pub struct CommonOptions {
    /// Show per-resource attribute diffs
    #[arg(long = "detail")]
    pub detail: bool,

    /// Output format; "json" or empty for styled text
    #[arg(long = "output", default_value = "")]
    pub output: String,

    /// Disable styled output
    #[arg(long = "no-style")]
    pub no_style: bool,

    /// Load the intent from a YAML file instead of running the DSL
    /// compiler; must resolve inside the workdir tree
    #[arg(long = "intent-file")]
    pub intent_file: Option<PathBuf>,

    /// Project working directory
    #[arg(long = "workdir", default_value = ".")]
    pub workdir: PathBuf,
}

#[derive(Args, Debug, Default)]
pub struct PreviewOptions {
    #[command(flatten)]
    pub common: CommonOptions,
}

#[derive(Args, Debug, Default)]
pub struct ApplyOptions {
    #[command(flatten)]
    pub common: CommonOptions,

    /// Skip the confirmation prompt
    #[arg(long = "yes", short = 'y')]
    pub yes: bool,
}

/// Workspace configuration bundle loaded from `workspace.yaml`.
#[derive(Debug, Default, Deserialize)]
pub struct WorkspaceConfig {
    #[serde(default)]
    pub modules: ModuleConfigs,
    #[serde(default)]
    pub backends: BackendConfigs,
}

/// Application declarations as produced by the DSL compiler.
#[derive(Debug, Deserialize)]
struct AppConfiguration {
    workload: Workload,
}

type AppConfigurations = BTreeMap<String, AppConfiguration>;

impl CommonOptions {
    pub fn validate(&self) -> Result<()> {
        if !self.output.is_empty() && self.output != JSON_OUTPUT {
            bail!(Error::InvalidArgument(format!(
                "invalid output format {}; expected json or empty",
                self.output
            )));
        }
        self.validate_intent_file()
    }

    /// The intent file must be a file that resolves inside the workdir
    /// tree; parent-directory escapes are rejected.
    fn validate_intent_file(&self) -> Result<()> {
        let Some(intent_file) = &self.intent_file else {
            return Ok(());
        };
        let workdir = self
            .workdir
            .canonicalize()
            .with_context(|| format!("resolving workdir {}", self.workdir.display()))?;
        let resolved = if intent_file.is_absolute() {
            intent_file.clone()
        } else {
            workdir.join(intent_file)
        };
        let resolved = resolved
            .canonicalize()
            .map_err(|e| {
                anyhow!(Error::InvalidArgument(format!(
                    "intent file {}: {e}",
                    intent_file.display()
                )))
            })?;
        if !resolved.is_file() {
            bail!(Error::InvalidArgument(format!(
                "intent file {} is not a file",
                intent_file.display()
            )));
        }
        if !resolved.starts_with(&workdir) {
            bail!(Error::InvalidArgument(format!(
                "intent file {} must be inside the workdir tree",
                intent_file.display()
            )));
        }
        Ok(())
    }

    fn style(&self) {
        if self.no_style {
            colored::control::set_override(false);
        }
    }

    fn workspace_name(&self) -> String {
        std::env::var("KUSION_WORKSPACE").unwrap_or_else(|_| "default".to_string())
    }

    fn operator_name(&self) -> String {
        std::env::var("USER").unwrap_or_default()
    }

    fn load_workspace_config(&self) -> Result<WorkspaceConfig> {
        let path = self.workdir.join("workspace.yaml");
        if !path.is_file() {
            return Ok(WorkspaceConfig::default());
        }
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
    }

    fn state_storage(&self, config: &WorkspaceConfig) -> Result<Arc<dyn StateStorage>> {
        match config.backends.backend_name() {
            "local" => {
                let dir = config
                    .backends
                    .local
                    .as_ref()
                    .filter(|l| !l.dir.is_empty())
                    .map(|l| PathBuf::from(&l.dir))
                    .unwrap_or_else(|| self.workdir.join(".kusion").join("states"));
                Ok(Arc::new(LocalStorage::new(dir)))
            }
            other => bail!(Error::InvalidArgument(format!(
                "state backend {other} requires an external storage service"
            ))),
        }
    }

    /// Load the intent: either directly from `--intent-file`, or by
    /// running the DSL compiler and lowering the resulting application
    /// declarations through the workload generator.
    fn load_intent(&self, project: &str, stack: &str, config: &WorkspaceConfig) -> Result<Intent> {
        if let Some(intent_file) = &self.intent_file {
            let path = if intent_file.is_absolute() {
                intent_file.clone()
            } else {
                self.workdir.join(intent_file)
            };
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("reading intent file {}", path.display()))?;
            let intent = serde_yaml::from_str(&raw)
                .with_context(|| format!("parsing intent file {}", path.display()))?;
            return Ok(intent);
        }

        let runner = ExternalRunner::from_env();
        let raw = runner.run(&self.workdir, &BTreeMap::new())?;
        let apps: AppConfigurations =
            serde_yaml::from_slice(&raw).context("parsing DSL compiler output")?;
        build_intent(project, stack, apps, &config.modules)
    }

    fn request(&self, project: &str, stack: &str, intent: Intent) -> Request {
        Request {
            tenant: String::new(),
            project: project.to_string(),
            stack: stack.to_string(),
            workspace: self.workspace_name(),
            operator: self.operator_name(),
            intent: Some(intent),
        }
    }
}

/// Lower every application into intent resources, merging the
/// platform-level module configs for the owning project.
fn build_intent(
    project: &str,
    stack: &str,
    apps: AppConfigurations,
    modules: &ModuleConfigs,
) -> Result<Intent> {
    let platform_configs = get_project_module_configs(modules, project)?;
    let mut intent = Intent::default();
    for (app, config) in apps {
        let generator = Generator {
            project: project.to_string(),
            stack: stack.to_string(),
            app,
            namespace: project.to_string(),
            workload: config.workload,
            platform_configs: platform_configs.clone(),
        };
        generator.generate(&mut intent)?;
    }
    Ok(intent)
}

impl PreviewOptions {
    pub async fn run(&self) -> Result<()> {
        self.common.validate()?;
        self.common.style();
        let (project, stack) = FileDetector.detect(&self.common.workdir)?;
        let config = self.common.load_workspace_config()?;
        let storage = self.common.state_storage(&config)?;
        let intent = self
            .common
            .load_intent(&project.name, &stack.name, &config)?;
        info!(project = %project.name, stack = %stack.name, "previewing");

        let operator = Operator::new(storage, Default::default());
        let request = self.common.request(&project.name, &stack.name, intent);
        let response = operator.preview(&request).await?;

        if self.common.output == JSON_OUTPUT {
            println!("{}", serde_json::to_string_pretty(&response.order)?);
            return Ok(());
        }
        print_order(&response.order, self.common.detail);
        Ok(())
    }
}

impl ApplyOptions {
    pub async fn run(&self) -> Result<()> {
        self.common.validate()?;
        self.common.style();
        let (project, stack) = FileDetector.detect(&self.common.workdir)?;
        let config = self.common.load_workspace_config()?;
        let storage = self.common.state_storage(&config)?;
        let intent = self
            .common
            .load_intent(&project.name, &stack.name, &config)?;
        info!(project = %project.name, stack = %stack.name, "applying");

        let request = self.common.request(&project.name, &stack.name, intent.clone());

        // Preview first so the user confirms the actual change set.
        let preview = Operator::new(storage.clone(), Default::default());
        let order = preview.preview(&request).await?.order;
        print_order(&order, self.common.detail);
        if order.all_unchanged() {
            println!("no changes to apply");
            return Ok(());
        }
        if !self.yes && !confirm()? {
            println!("aborted");
            return Ok(());
        }

        let prior = storage
            .get(&request.project, &request.stack, &request.workspace)?
            .map(|s| s.resources)
            .unwrap_or_default();
        let runtimes =
            kusion_runtime::runtimes(intent.resources.iter().chain(prior.iter())).await?;
        let operator = Operator::new(storage, runtimes);
        let mut messages = operator.subscribe();
        let printer = tokio::spawn(async move {
            while let Some(message) = messages.recv().await {
                let status = match message.status {
                    MessageStatus::Start => "start".normal(),
                    MessageStatus::Success => "success".green(),
                    MessageStatus::Skipped => "skipped".yellow(),
                    MessageStatus::Failed => "failed".red(),
                };
                let detail = message
                    .detail
                    .map(|d| format!(" ({d})"))
                    .unwrap_or_default();
                println!("[{}] {} {}{}", message.action, message.resource_id, status, detail);
            }
        });

        let result = operator.apply(&request).await;
        let _ = printer.await;
        let response = result?;
        println!(
            "apply complete: serial {} with {} resources",
            response.state.serial,
            response.state.resources.len()
        );
        Ok(())
    }
}

fn print_order(order: &kusion_engine::models::ChangeOrder, detail: bool) {
    if order.step_keys.is_empty() {
        println!("no resources in intent");
        return;
    }
    for line in order.prompt_details().lines() {
        let styled = if line.starts_with("Create") {
            line.green()
        } else if line.starts_with("Delete") {
            line.red()
        } else if line.starts_with("Update") {
            line.yellow()
        } else if line.starts_with("Undefined") {
            line.magenta()
        } else {
            line.normal()
        };
        println!("{styled}");
    }
    if !detail {
        return;
    }
    for id in &order.step_keys {
        let Some(step) = order.change_steps.get(id) else {
            continue;
        };
        if step.action != ActionType::Update && step.action != ActionType::Create {
            continue;
        }
        if let Some(to) = &step.to {
            if let Ok(yaml) = serde_yaml::to_string(&to.attributes) {
                println!("--- {id}");
                print!("{yaml}");
            }
        }
    }
}

fn confirm() -> Result<bool> {
    use std::io::Write;
    print!("apply these changes? [y/N] ");
    std::io::stdout().flush().ok();
    let mut answer = String::new();
    std::io::stdin()
        .read_line(&mut answer)
        .context("reading confirmation")?;
    let answer = answer.trim().to_lowercase();
    Ok(answer == "y" || answer == "yes")
}

/// Exit codes: 1 for validation errors, 2 for runtime failures.
pub fn exit_code_for(e: &anyhow::Error) -> u8 {
    match e.downcast_ref::<Error>() {
        Some(
            Error::RuntimeFailure { .. }
            | Error::Timeout { .. }
            | Error::Cancelled
            | Error::StaleState { .. },
        ) => 2,
        Some(_) => 1,
        None => 1,
    }
}
