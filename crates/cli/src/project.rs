//! Project and stack detection from the working directory.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Project {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stack {
    pub name: String,
}

/// Seam for tests and alternative layouts.
pub trait ProjectDetector {
    fn detect(&self, workdir: &Path) -> Result<(Project, Stack)>;
}

#[derive(Debug, Deserialize)]
struct NamedConfig {
    name: String,
}

/// Reads `project.yaml` and `stack.yaml` from the workdir; falls back
/// to the directory name for the project and `dev` for the stack.
pub struct FileDetector;

impl ProjectDetector for FileDetector {
    fn detect(&self, workdir: &Path) -> Result<(Project, Stack)> {
        let project = match read_name(&workdir.join("project.yaml"))? {
            Some(name) => name,
            None => workdir
                .canonicalize()
                .ok()
                .and_then(|p| p.file_name().map(|n| n.to_string_lossy().to_string()))
                .unwrap_or_else(|| "default".to_string()),
        };
        let stack = read_name(&workdir.join("stack.yaml"))?.unwrap_or_else(|| "dev".to_string());
        Ok((Project { name: project }, Stack { name: stack }))
    }
}

fn read_name(path: &Path) -> Result<Option<String>> {
    if !path.is_file() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let config: NamedConfig =
        serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
    Ok(Some(config.name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_files_win_over_directory_name() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("project.yaml"), "name: shop\n").unwrap();
        std::fs::write(dir.path().join("stack.yaml"), "name: prod\n").unwrap();
        let (project, stack) = FileDetector.detect(dir.path()).unwrap();
        assert_eq!(project.name, "shop");
        assert_eq!(stack.name, "prod");
    }

    #[test]
    fn directory_name_is_the_fallback() {
        let parent = tempfile::tempdir().unwrap();
        let workdir = parent.path().join("storefront");
        std::fs::create_dir_all(&workdir).unwrap();
        let (project, stack) = FileDetector.detect(&workdir).unwrap();
        assert_eq!(project.name, "storefront");
        assert_eq!(stack.name, "dev");
    }

    #[test]
    fn malformed_project_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("project.yaml"), "nope: []\n").unwrap();
        assert!(FileDetector.detect(dir.path()).is_err());
    }
}
