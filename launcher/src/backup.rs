/// Backup saga: consistent on-disk snapshot while the server keeps running.
///
/// Steps, in order:
///   1. `save-off`, wait for "Automatic saving is now disabled"
///   2. `save-all`, wait for "Saved the game"
///   3. archive the working directory
///   4. settle pause
///   5. `save-on`, wait for "Automatic saving is now enabled"
///
/// Step 5 is attempted whenever step 1 was sent, so a returned error never
/// leaves autosave disabled on a server that can still hear us.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::correlation::ServerIo;

pub const SAVE_OFF: &str = "save-off";
pub const SAVE_OFF_ACK: &str = "Automatic saving is now disabled";
pub const SAVE_ALL: &str = "save-all";
pub const SAVE_ALL_ACK: &str = "Saved the game";
pub const SAVE_ON: &str = "save-on";
pub const SAVE_ON_ACK: &str = "Automatic saving is now enabled";

/// Produces a compressed snapshot of a directory.
#[async_trait]
pub trait Archiver: Send + Sync {
    /// Archives `dir` and returns the path of the created archive.
    async fn archive(&self, dir: &Path) -> anyhow::Result<PathBuf>;
}

/// Runs the saga against `io`. Returns the archive path on success, or the
/// first failure encountered.
pub async fn run(
    io: &ServerIo,
    archiver: &dyn Archiver,
    work_dir: &Path,
    settle: Duration,
) -> anyhow::Result<PathBuf> {
    info!("[backup] starting");
    let snapshot = snapshot(io, archiver, work_dir, settle).await;

    let resumed = io.request(SAVE_ON_ACK, SAVE_ON).await;
    if let Err(e) = &resumed {
        error!("[backup] failed to re-enable autosave: {e}");
    }

    match (snapshot, resumed) {
        (Ok(archive), Ok(_)) => {
            info!(archive = %archive.display(), "[backup] done");
            Ok(archive)
        }
        (Ok(_), Err(e)) => Err(e.into()),
        (Err(e), _) => {
            warn!("[backup] aborted: {e:#}");
            Err(e)
        }
    }
}

async fn snapshot(
    io: &ServerIo,
    archiver: &dyn Archiver,
    work_dir: &Path,
    settle: Duration,
) -> anyhow::Result<PathBuf> {
    io.request(SAVE_OFF_ACK, SAVE_OFF).await?;
    io.request(SAVE_ALL_ACK, SAVE_ALL).await?;
    let archive = archiver.archive(work_dir).await?;
    tokio::time::sleep(settle).await;
    Ok(archive)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{paper_reply, FakeServer};
    use anyhow::bail;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingArchiver {
        dirs: Mutex<Vec<PathBuf>>,
        fail: bool,
    }

    #[async_trait]
    impl Archiver for RecordingArchiver {
        async fn archive(&self, dir: &Path) -> anyhow::Result<PathBuf> {
            self.dirs.lock().unwrap().push(dir.to_path_buf());
            if self.fail {
                bail!("disk full");
            }
            Ok(dir.with_extension("tar.bz2"))
        }
    }

    const SETTLE: Duration = Duration::from_millis(200);

    #[tokio::test(start_paused = true)]
    async fn saga_runs_all_steps_in_order() {
        let server = FakeServer::paper(0);
        let archiver = RecordingArchiver::default();
        let archive = run(&server.io(), &archiver, Path::new("/srv/paper"), SETTLE)
            .await
            .unwrap();

        assert_eq!(archive, PathBuf::from("/srv/paper.tar.bz2"));
        assert_eq!(server.commands().await, vec![SAVE_OFF, SAVE_ALL, SAVE_ON]);
        assert_eq!(*archiver.dirs.lock().unwrap(), vec![PathBuf::from("/srv/paper")]);
    }

    #[tokio::test(start_paused = true)]
    async fn archive_failure_still_reenables_autosave() {
        let server = FakeServer::paper(0);
        let archiver = RecordingArchiver {
            fail: true,
            ..Default::default()
        };
        let err = run(&server.io(), &archiver, Path::new("/srv/paper"), SETTLE)
            .await
            .unwrap_err();

        assert!(err.to_string().contains("disk full"));
        assert_eq!(server.commands().await, vec![SAVE_OFF, SAVE_ALL, SAVE_ON]);
    }

    #[tokio::test(start_paused = true)]
    async fn settle_pause_separates_archive_and_save_on() {
        let server = FakeServer::paper(0);
        let archiver = RecordingArchiver::default();
        let started = tokio::time::Instant::now();
        run(&server.io(), &archiver, Path::new("/srv/paper"), SETTLE)
            .await
            .unwrap();
        assert!(started.elapsed() >= SETTLE);
    }

    #[tokio::test(start_paused = true)]
    async fn save_all_timeout_aborts_before_archiving() {
        // A server that never confirms the forced save.
        let server = FakeServer::new(|cmd| match cmd {
            SAVE_ALL => vec![],
            other => paper_reply(other, 0),
        });
        let io = server.io().with_ack_timeout(Some(Duration::from_secs(30)));
        let archiver = RecordingArchiver::default();
        let err = run(&io, &archiver, Path::new("/srv/paper"), SETTLE)
            .await
            .unwrap_err();

        assert!(err.to_string().contains(SAVE_ALL_ACK));
        assert!(archiver.dirs.lock().unwrap().is_empty());
        assert_eq!(server.commands().await, vec![SAVE_OFF, SAVE_ALL, SAVE_ON]);
    }

    #[tokio::test(start_paused = true)]
    async fn dead_server_fails_fast() {
        let server = FakeServer::paper(0);
        server.kill();
        let archiver = RecordingArchiver::default();
        let err = run(&server.io(), &archiver, Path::new("/srv/paper"), SETTLE)
            .await
            .unwrap_err();

        assert!(err.to_string().contains("no longer running"));
        assert!(archiver.dirs.lock().unwrap().is_empty());
    }
}
