use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::warn;

use crate::event::InnerCommand;
use crate::lifecycle::ProcessState;

/// Runtime status written by the launcher to `status_file` (TOML).
/// External tooling reads it to see what the supervisor is doing.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LauncherStatus {
    /// Launcher binary version (set from Cargo.toml at compile time).
    pub version: String,
    /// Lifecycle state of the server process.
    pub state: ProcessState,
    /// Next scheduled action, if any is planned.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_event: Option<String>,
    /// RFC 3339 time of the next scheduled action.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_event_at: Option<String>,
    /// Absolute path of the most recent successful backup archive.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_backup_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_backup_timestamp: Option<String>,
    /// Human-readable message of the most recent failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl LauncherStatus {
    pub fn new() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            state: ProcessState::Stopped,
            next_event: None,
            next_event_at: None,
            last_backup_path: None,
            last_backup_timestamp: None,
            error: None,
        }
    }

    pub fn set_next_event<Tz: chrono::TimeZone>(
        &mut self,
        next: Option<&(InnerCommand, chrono::DateTime<Tz>)>,
    ) where
        Tz::Offset: std::fmt::Display,
    {
        self.next_event = next.map(|(cmd, _)| cmd.to_string());
        self.next_event_at = next.map(|(_, at)| at.to_rfc3339());
    }
}

/// Serializes `status` to TOML and writes it to `path`.
/// Creates the parent directory if it does not exist.
/// Failures are logged and otherwise ignored.
pub fn write_status(path: &Path, status: &LauncherStatus) {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if let Err(e) = std::fs::create_dir_all(parent) {
            warn!("[status] Failed to create directory {}: {e}", parent.display());
            return;
        }
    }
    match toml::to_string_pretty(status) {
        Ok(content) => {
            if let Err(e) = std::fs::write(path, content) {
                warn!("[status] Failed to write status file: {e}");
            }
        }
        Err(e) => warn!("[status] Failed to serialize status: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn new_starts_stopped() {
        let s = LauncherStatus::new();
        assert_eq!(s.state, ProcessState::Stopped);
        assert_eq!(s.version, env!("CARGO_PKG_VERSION"));
        assert!(s.next_event.is_none());
        assert!(s.last_backup_path.is_none());
        assert!(s.error.is_none());
    }

    #[test]
    fn state_serializes_to_lowercase() {
        // TOML requires a root table, so verify the value via LauncherStatus.
        let mut s = LauncherStatus::new();
        assert!(toml::to_string_pretty(&s).unwrap().contains("state = \"stopped\""));
        s.state = ProcessState::Running;
        assert!(toml::to_string_pretty(&s).unwrap().contains("state = \"running\""));
        s.state = ProcessState::Crashed;
        assert!(toml::to_string_pretty(&s).unwrap().contains("state = \"crashed\""));
    }

    #[test]
    fn next_event_is_rendered_as_rfc3339() {
        let mut s = LauncherStatus::new();
        let at = chrono_tz::Europe::Berlin
            .with_ymd_and_hms(2024, 1, 1, 8, 0, 0)
            .unwrap();
        s.set_next_event(Some(&(InnerCommand::OpenAccess, at)));
        assert_eq!(s.next_event.as_deref(), Some("open-access"));
        assert_eq!(s.next_event_at.as_deref(), Some("2024-01-01T08:00:00+01:00"));

        s.set_next_event::<chrono::Utc>(None);
        assert!(s.next_event.is_none());
        assert!(s.next_event_at.is_none());
    }

    #[test]
    fn write_status_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("status.toml");
        write_status(&path, &LauncherStatus::new());
        assert!(path.exists());
    }

    #[test]
    fn write_status_content_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.toml");

        let mut original = LauncherStatus::new();
        original.state = ProcessState::Running;
        original.last_backup_path = Some("/srv/paper-backup-2024-01-01_01-00-00.tar.bz2".into());

        write_status(&path, &original);

        let content = std::fs::read_to_string(&path).unwrap();
        let parsed: LauncherStatus = toml::from_str(&content).unwrap();
        assert_eq!(parsed.state, ProcessState::Running);
        assert_eq!(parsed.last_backup_path, original.last_backup_path);
    }

    #[test]
    fn write_status_omits_none_optional_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.toml");
        write_status(&path, &LauncherStatus::new());

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(!content.contains("next_event"));
        assert!(!content.contains("last_backup_path"));
        assert!(!content.contains("error"));
    }
}
