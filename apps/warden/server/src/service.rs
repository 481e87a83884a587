use std::{
    io,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use warden_core::InstanceId;

use crate::{error::StartError, launcher::SOURCE_DIR};

pub const DEFAULT_ENTRY_FILE: &str = "service.ts";

/// A script service to run inside a sandboxed runtime instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    /// Source text of the entry program.
    pub program: String,
    #[serde(default = "default_entry_file")]
    pub entry_file: String,
    /// Keep the work directory across instances of this service.
    #[serde(default)]
    pub requires_persistent_workdir: bool,
    #[serde(default)]
    pub allow_network: bool,
}

fn default_entry_file() -> String {
    DEFAULT_ENTRY_FILE.to_owned()
}

impl ServiceConfig {
    pub fn new(name: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            entry_file: default_entry_file(),
            requires_persistent_workdir: false,
            allow_network: false,
        }
    }

    pub(crate) fn validate(&self) -> Result<(), StartError> {
        check_name(&self.name)?;
        check_name(&self.entry_file)
    }
}

// Names become single path components under the state directory.
fn check_name(name: &str) -> Result<(), StartError> {
    let valid = !name.is_empty()
        && name.len() <= 64
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(StartError::InvalidServiceName(name.to_owned()))
    }
}

/// On-disk sandbox of one instance.
#[derive(Debug, Clone)]
pub(crate) struct ServiceLayout {
    pub workdir: PathBuf,
    pub cache_dir: PathBuf,
    /// Relative to `workdir`.
    pub entry_program: PathBuf,
    /// Removed with the instance when the work directory is ephemeral.
    pub scratch_dir: Option<PathBuf>,
    /// Per-instance staging name, renamed over the entry program.
    staged_entry: PathBuf,
}

impl ServiceLayout {
    pub fn plan(state_dir: &Path, service: &ServiceConfig, instance: InstanceId) -> Self {
        let service_root = state_dir.join("services").join(&service.name);
        let (workdir, scratch_dir) = if service.requires_persistent_workdir {
            (service_root.join("work"), None)
        } else {
            let root = state_dir.join("instances").join(instance.to_string());
            (root.join("work"), Some(root))
        };
        let staged_entry = workdir
            .join(SOURCE_DIR)
            .join(format!(".{}.{instance}", service.entry_file));
        Self {
            workdir,
            cache_dir: service_root.join("cache"),
            entry_program: Path::new(SOURCE_DIR).join(&service.entry_file),
            scratch_dir,
            staged_entry,
        }
    }

    /// Creates the directories and writes the entry program. Instances sharing
    /// a persistent work directory each stage their own copy and rename it into
    /// place, so a runtime never reads a half-written entry.
    pub async fn prepare(&self, program: &str) -> io::Result<()> {
        tokio::fs::create_dir_all(self.workdir.join(SOURCE_DIR)).await?;
        tokio::fs::create_dir_all(&self.cache_dir).await?;
        tokio::fs::write(&self.staged_entry, program).await?;
        if let Err(err) =
            tokio::fs::rename(&self.staged_entry, self.workdir.join(&self.entry_program)).await
        {
            let _ = tokio::fs::remove_file(&self.staged_entry).await;
            return Err(err);
        }
        Ok(())
    }
}
