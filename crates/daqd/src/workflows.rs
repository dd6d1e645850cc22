//! TOML-file workflow and class catalogs.
//!
//! Stands in for the template repository the production deployment
//! provides: workflows and task classes are plain TOML files on disk.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use daq_core::TaskClass;
use daqgrid_env::{RepositoryError, Workflow, WorkflowSource};

/// Loads workflows from a directory of TOML files.
///
/// A workflow name resolves to `<dir>/<name>.toml`; names already
/// carrying a `.toml` extension are treated as paths.
pub struct TomlWorkflowSource {
    dir: PathBuf,
}

impl TomlWorkflowSource {
    pub fn new(dir: &Path) -> Self {
        Self { dir: dir.to_path_buf() }
    }

    fn resolve(&self, name: &str) -> PathBuf {
        if name.ends_with(".toml") {
            let path = PathBuf::from(name);
            if path.is_absolute() {
                return path;
            }
            return self.dir.join(path);
        }
        self.dir.join(format!("{name}.toml"))
    }
}

impl WorkflowSource for TomlWorkflowSource {
    fn load(&self, name: &str) -> Result<Workflow, RepositoryError> {
        let path = self.resolve(name);
        let content = std::fs::read_to_string(&path)
            .map_err(|e| RepositoryError(format!("cannot read {}: {e}", path.display())))?;
        toml::from_str(&content)
            .map_err(|e| RepositoryError(format!("cannot parse {}: {e}", path.display())))
    }
}

#[derive(Deserialize)]
struct ClassCatalog {
    #[serde(default)]
    classes: Vec<TaskClass>,
}

/// Load the task class catalog from one TOML file.
pub fn load_classes(path: &Path) -> anyhow::Result<Vec<TaskClass>> {
    let content = std::fs::read_to_string(path)?;
    let catalog: ClassCatalog = toml::from_str(&content)?;
    Ok(catalog.classes)
}
