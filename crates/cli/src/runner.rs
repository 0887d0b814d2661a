//! DSL compiler seam: the engine consumes configuration as YAML bytes
//! produced by an external runner.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Command;

use anyhow::{bail, Context, Result};
use tracing::debug;

/// Compiles and runs the target DSL-based configuration code, returning
/// configuration data as YAML bytes.
pub trait CodeRunner {
    fn run(&self, workdir: &Path, arguments: &BTreeMap<String, String>) -> Result<Vec<u8>>;
}

/// Shells out to the configured DSL compiler (`KUSION_DSL_RUNNER`,
/// default `kcl`). Arguments are passed as `-D key=value`.
pub struct ExternalRunner {
    pub program: String,
}

impl ExternalRunner {
    pub fn from_env() -> Self {
        ExternalRunner {
            program: std::env::var("KUSION_DSL_RUNNER").unwrap_or_else(|_| "kcl".to_string()),
        }
    }
}

impl CodeRunner for ExternalRunner {
    fn run(&self, workdir: &Path, arguments: &BTreeMap<String, String>) -> Result<Vec<u8>> {
        let mut command = Command::new(&self.program);
        command.arg("run").current_dir(workdir);
        for (key, value) in arguments {
            command.arg("-D").arg(format!("{key}={value}"));
        }
        debug!(program = %self.program, workdir = %workdir.display(), "running DSL compiler");
        let output = command
            .output()
            .with_context(|| format!("spawning DSL compiler {}", self.program))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "DSL compiler {} failed: {}",
                self.program,
                stderr.trim()
            );
        }
        Ok(output.stdout)
    }
}
