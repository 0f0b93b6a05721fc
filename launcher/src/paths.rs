/// Canonical file names inside and around the server working directory.
///
///   - `<work_dir>/paper.jar`      symlink to the active PaperMC build
///   - `<work_dir>/versions.json`  installed Paper/plugin versions
///   - `<work_dir>/plugins/`       plugin jars (`plugins/update/` for staged updates)
///   - `<parent>/<dir>-backup-<timestamp>.tar.bz2`  backup archives, next to the directory
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

pub const SERVER_JAR: &str = "paper.jar";
pub const VERSIONS_FILE: &str = "versions.json";
pub const PLUGINS_DIR: &str = "plugins";
pub const PLUGIN_UPDATE_DIR: &str = "update";
const BACKUP_SUFFIX: &str = "tar.bz2";

pub fn server_jar_path(work_dir: &Path) -> PathBuf {
    work_dir.join(SERVER_JAR)
}

pub fn versions_file_path(work_dir: &Path) -> PathBuf {
    work_dir.join(VERSIONS_FILE)
}

pub fn plugins_dir(work_dir: &Path) -> PathBuf {
    work_dir.join(PLUGINS_DIR)
}

/// Returns the current local time formatted as `YYYY-MM-DD_HH-MM-SS`.
pub fn local_timestamp() -> String {
    chrono::Local::now().format("%Y-%m-%d_%H-%M-%S").to_string()
}

/// Builds `<parent>/<dir-name>-backup-<timestamp>.tar.bz2` for `work_dir`.
///
/// Relative working directories are resolved against the current directory
/// first so that the archive still lands beside the directory.
pub fn backup_archive_path(work_dir: &Path, timestamp: &str) -> Result<PathBuf> {
    let abs = std::path::absolute(work_dir)
        .with_context(|| format!("Failed to resolve {}", work_dir.display()))?;
    let name = abs
        .file_name()
        .with_context(|| format!("Working directory has no name: {}", abs.display()))?
        .to_string_lossy()
        .into_owned();
    let parent = abs.parent().unwrap_or_else(|| Path::new("/"));
    Ok(parent.join(format!("{name}-backup-{timestamp}.{BACKUP_SUFFIX}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_jar_is_inside_work_dir() {
        let path = server_jar_path(Path::new("/srv/paper"));
        assert_eq!(path, PathBuf::from("/srv/paper/paper.jar"));
    }

    #[test]
    fn versions_file_is_inside_work_dir() {
        let path = versions_file_path(Path::new("/srv/paper"));
        assert_eq!(path.file_name().unwrap(), VERSIONS_FILE);
        assert_eq!(path.parent().unwrap(), Path::new("/srv/paper"));
    }

    #[test]
    fn backup_archive_lands_beside_work_dir() {
        let path = backup_archive_path(Path::new("/srv/paper"), "2024-01-01_01-00-00").unwrap();
        assert_eq!(
            path,
            PathBuf::from("/srv/paper-backup-2024-01-01_01-00-00.tar.bz2")
        );
    }

    #[test]
    fn backup_archive_resolves_relative_dir() {
        let path = backup_archive_path(Path::new("server"), "ts").unwrap();
        assert!(path.is_absolute());
        assert!(path.ends_with("server-backup-ts.tar.bz2"));
    }

    #[test]
    fn local_timestamp_has_correct_format() {
        let ts = local_timestamp();
        // Should match YYYY-MM-DD_HH-MM-SS (19 chars).
        assert_eq!(ts.len(), 19, "Unexpected timestamp length: {ts}");
        assert_eq!(&ts[4..5], "-");
        assert_eq!(&ts[7..8], "-");
        assert_eq!(&ts[10..11], "_");
        assert_eq!(&ts[13..14], "-");
        assert_eq!(&ts[16..17], "-");
    }
}
