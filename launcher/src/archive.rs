use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::info;

use crate::backup::Archiver;
use crate::paths;

/// Archives a directory with the system `tar` into a bzip2 tarball placed
/// next to it.
#[derive(Debug, Clone)]
pub struct TarArchiver {
    program: String,
}

impl Default for TarArchiver {
    fn default() -> Self {
        Self {
            program: "tar".to_string(),
        }
    }
}

#[async_trait]
impl Archiver for TarArchiver {
    async fn archive(&self, dir: &Path) -> Result<PathBuf> {
        let target = paths::backup_archive_path(dir, &paths::local_timestamp())?;
        let parent = target
            .parent()
            .with_context(|| format!("Archive path has no parent: {}", target.display()))?;
        let abs = std::path::absolute(dir)
            .with_context(|| format!("Failed to resolve {}", dir.display()))?;
        let name = abs
            .file_name()
            .with_context(|| format!("Directory has no name: {}", abs.display()))?;

        info!(dir = %abs.display(), archive = %target.display(), "[archive] Creating");
        let output = Command::new(&self.program)
            .arg("-cjf")
            .arg(&target)
            .arg(name)
            .current_dir(parent)
            .output()
            .await
            .with_context(|| format!("Failed to run {}", self.program))?;

        if !output.status.success() {
            bail!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(target)
    }
}
