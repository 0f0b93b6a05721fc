/// The single control loop that owns the server process.
///
/// Four producers feed one channel:
///   - console reader: operator lines from stdin
///   - schedule timer: due [`InnerCommand`]s
///   - exit watcher of the current [`ManagedProcess`]: unsolicited exits
///   - OS signal listener: SIGINT/SIGTERM
///
/// Every handler runs to completion before the next event is taken, so a
/// saga in progress is never interleaved with another action.

use std::path::Path;
use std::process::ExitStatus;
use std::sync::Arc;

use chrono::Utc;
use tokio::io::{AsyncRead, BufReader};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::access;
use crate::backup::{self, Archiver};
use crate::config::Config;
use crate::correlation::ServerIo;
use crate::error::{Result, SupervisorError};
use crate::event::{ConsoleCommand, InnerCommand, SupervisorEvent};
use crate::lifecycle::{Lifecycle, ProcessState};
use crate::pipes;
use crate::process::{LaunchSpec, ManagedProcess};
use crate::schedule::{self, ScheduleResolver};
use crate::status::{self, LauncherStatus};
use crate::updater::Updater;

const EVENT_QUEUE: usize = 64;

pub struct Supervisor {
    config: Arc<Config>,
    launch: LaunchSpec,
    archiver: Box<dyn Archiver>,
    updater: Box<dyn Updater>,
    resolver: ScheduleResolver,
    lifecycle: Lifecycle,
    /// Incremented on every launch; exit events from older launches are stale.
    generation: u64,
    process: Option<ManagedProcess>,
    events_tx: mpsc::Sender<SupervisorEvent>,
    events_rx: mpsc::Receiver<SupervisorEvent>,
    status: LauncherStatus,
}

enum Flow {
    Continue,
    Exit,
}

impl Supervisor {
    pub fn new(
        config: Arc<Config>,
        launch: LaunchSpec,
        archiver: Box<dyn Archiver>,
        updater: Box<dyn Updater>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
        Self {
            resolver: ScheduleResolver::from_config(&config),
            config,
            launch,
            archiver,
            updater,
            lifecycle: Lifecycle::new(),
            generation: 0,
            process: None,
            events_tx,
            events_rx,
            status: LauncherStatus::new(),
        }
    }

    /// Sender for the console reader and signal listener.
    pub fn events(&self) -> mpsc::Sender<SupervisorEvent> {
        self.events_tx.clone()
    }

    /// Starts the server and serves events until `stop`, a shutdown signal
    /// or a fatal error. The server is always stopped before this returns.
    pub async fn run(mut self) -> Result<()> {
        let (timer_stop_tx, timer_stop_rx) = watch::channel(false);
        let timer = tokio::spawn(schedule::run(
            self.resolver.clone(),
            self.events_tx.clone(),
            timer_stop_rx,
        ));

        self.refresh_next_event();
        let outcome = self.serve().await;

        let _ = timer_stop_tx.send(true);
        let _ = timer.await;

        if self.lifecycle.state() == ProcessState::Running {
            if let Err(e) = self.stop().await {
                error!("[supervisor] Final stop failed: {e}");
            }
        }

        match &outcome {
            Ok(()) => info!("[supervisor] Stopped"),
            Err(e) => {
                error!("[supervisor] Fatal: {e}");
                self.status.error = Some(e.to_string());
            }
        }
        self.status.set_next_event::<Utc>(None);
        self.write_status();
        outcome
    }

    async fn serve(&mut self) -> Result<()> {
        self.start()?;

        while let Some(evt) = self.events_rx.recv().await {
            let flow = match evt {
                SupervisorEvent::Console(line) => match ConsoleCommand::parse(&line) {
                    Some(cmd) => self.on_console(cmd).await?,
                    None => Flow::Continue,
                },
                SupervisorEvent::Scheduled(cmd) => {
                    self.on_scheduled(cmd).await;
                    Flow::Continue
                }
                SupervisorEvent::ProcessExited { generation, status } => {
                    self.on_exit(generation, status).await?;
                    Flow::Continue
                }
                SupervisorEvent::Shutdown => {
                    info!("[supervisor] Shutdown requested");
                    Flow::Exit
                }
            };
            if let Flow::Exit = flow {
                break;
            }
        }
        Ok(())
    }

    async fn on_console(&mut self, cmd: ConsoleCommand) -> Result<Flow> {
        debug!(?cmd, "[supervisor] Console command");
        match cmd {
            ConsoleCommand::Stop => return Ok(Flow::Exit),
            ConsoleCommand::Update => self.update().await?,
            ConsoleCommand::Backup => self.backup().await,
            ConsoleCommand::Reboot => {
                self.stop().await?;
                tokio::time::sleep(self.config.timings.reboot_pause.get()).await;
                self.start()?;
            }
            ConsoleCommand::Raw(line) => match self.io() {
                Some(io) => {
                    if let Err(e) = io.send(line).await {
                        warn!("[supervisor] Could not forward command: {e}");
                    }
                }
                None => warn!("[supervisor] Server is not running; dropped '{line}'"),
            },
        }
        Ok(Flow::Continue)
    }

    async fn on_scheduled(&mut self, cmd: InnerCommand) {
        info!(command = %cmd, "[supervisor] Scheduled event");
        match cmd {
            InnerCommand::Backup => self.backup().await,
            InnerCommand::OpenAccess | InnerCommand::CloseAccess | InnerCommand::Warn => {
                let Some(io) = self.io() else {
                    warn!(command = %cmd, "[supervisor] Server is not running; skipped");
                    return;
                };
                let config = &self.config;
                let result = match cmd {
                    InnerCommand::OpenAccess => {
                        access::open_access(&io, &config.players, &config.timings).await
                    }
                    InnerCommand::CloseAccess => {
                        access::close_access(&io, &config.players, &config.timings).await
                    }
                    _ => access::warn(&io).await.map(|_| ()),
                };
                match result {
                    Ok(()) => self.status.error = None,
                    Err(e) => {
                        warn!(command = %cmd, "[supervisor] Access action failed: {e}");
                        self.status.error = Some(format!("{cmd} failed: {e}"));
                    }
                }
            }
        }
        self.refresh_next_event();
    }

    /// Exits of the current process while it is meant to be running are fatal.
    async fn on_exit(&mut self, generation: u64, status: ExitStatus) -> Result<()> {
        let current = self.process.as_ref().map(ManagedProcess::generation);
        if current != Some(generation) || self.lifecycle.state() != ProcessState::Running {
            debug!(generation, "[supervisor] Ignoring stale exit event");
            return Ok(());
        }

        error!(generation, %status, "[supervisor] Server terminated unexpectedly");
        self.lifecycle.transition(ProcessState::Crashed)?;
        self.write_status();
        if let Some(process) = self.process.take() {
            if let Err(e) = process.reap().await {
                warn!("[supervisor] Failed to reap crashed server: {e}");
            }
        }
        self.lifecycle.transition(ProcessState::Stopped)?;
        Err(SupervisorError::Crashed(status))
    }

    fn start(&mut self) -> Result<()> {
        self.lifecycle.transition(ProcessState::Starting)?;
        self.write_status();

        self.generation += 1;
        let spawned = ManagedProcess::spawn(
            &self.launch,
            self.generation,
            self.config.ack_timeout(),
            self.events_tx.clone(),
        );
        match spawned {
            Ok(process) => {
                info!(generation = self.generation, pid = ?process.pid(), "[supervisor] Server launched");
                self.process = Some(process);
                self.lifecycle.transition(ProcessState::Running)?;
                self.write_status();
                Ok(())
            }
            Err(e) => {
                self.lifecycle.transition(ProcessState::Stopped)?;
                self.write_status();
                Err(e)
            }
        }
    }

    async fn stop(&mut self) -> Result<()> {
        self.lifecycle.transition(ProcessState::Stopping)?;
        self.write_status();
        if let Some(process) = self.process.take() {
            match process.stop().await {
                Ok(status) => info!(%status, "[supervisor] Server stopped"),
                Err(e) => warn!("[supervisor] Server stop was unclean: {e}"),
            }
        }
        self.lifecycle.transition(ProcessState::Stopped)?;
        self.write_status();
        Ok(())
    }

    /// stop, archive, refresh, start. A failed archive skips the refresh and
    /// restarts the old binary; a failed refresh is fatal.
    async fn update(&mut self) -> Result<()> {
        info!("[supervisor] Updating server");
        self.stop().await?;

        let work_dir = self.config.work_dir.clone();
        match self.archiver.archive(&work_dir).await {
            Ok(archive) => {
                self.record_backup(&archive);
                self.updater
                    .refresh(&work_dir)
                    .await
                    .map_err(SupervisorError::Refresh)?;
                self.status.error = None;
            }
            Err(e) => {
                error!("[supervisor] Pre-update backup failed, keeping current binary: {e:#}");
                self.status.error = Some(format!("Backup failed: {e:#}"));
            }
        }

        self.start()
    }

    async fn backup(&mut self) {
        let Some(io) = self.io() else {
            warn!("[supervisor] Server is not running; backup skipped");
            return;
        };
        let result = backup::run(
            &io,
            self.archiver.as_ref(),
            &self.config.work_dir,
            self.config.timings.save_settle.get(),
        )
        .await;
        match result {
            Ok(archive) => {
                self.record_backup(&archive);
                self.status.error = None;
                self.write_status();
            }
            Err(e) => {
                error!("[supervisor] Backup failed: {e:#}");
                self.status.error = Some(format!("Backup failed: {e:#}"));
                self.write_status();
            }
        }
    }

    fn io(&self) -> Option<ServerIo> {
        match self.lifecycle.state() {
            ProcessState::Running => self.process.as_ref().map(ManagedProcess::io),
            _ => None,
        }
    }

    fn record_backup(&mut self, archive: &Path) {
        self.status.last_backup_path = Some(archive.display().to_string());
        self.status.last_backup_timestamp = Some(chrono::Local::now().to_rfc3339());
    }

    fn refresh_next_event(&mut self) {
        let next = self.resolver.next_event(Utc::now());
        self.status.set_next_event(next.as_ref());
        self.write_status();
    }

    fn write_status(&mut self) {
        self.status.state = self.lifecycle.state();
        status::write_status(&self.config.status_file, &self.status);
    }
}

/// Forwards operator lines from stdin. Stdin EOF ends the reader only.
pub fn spawn_console_reader(tx: mpsc::Sender<SupervisorEvent>) -> JoinHandle<()> {
    tokio::spawn(forward_console(tokio::io::stdin(), tx))
}

async fn forward_console<R: AsyncRead + Unpin>(input: R, tx: mpsc::Sender<SupervisorEvent>) {
    let mut reader = BufReader::new(input);
    let mut buf = Vec::new();
    loop {
        match pipes::next_line(&mut reader, &mut buf).await {
            Ok(Some(line)) => {
                if tx.send(SupervisorEvent::Console(line)).await.is_err() {
                    break;
                }
            }
            Ok(None) => {
                debug!("[console] stdin closed");
                break;
            }
            Err(e) => {
                warn!("[console] Read failed: {e}");
                break;
            }
        }
    }
}

/// Turns SIGINT/SIGTERM (ctrl-c elsewhere) into [`SupervisorEvent::Shutdown`].
pub fn spawn_signal_listener(tx: mpsc::Sender<SupervisorEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        match wait_for_shutdown_signal().await {
            Ok(()) => {
                info!("[signal] Shutdown signal received");
                let _ = tx.send(SupervisorEvent::Shutdown).await;
            }
            Err(e) => warn!("[signal] Failed to install signal handlers: {e}"),
        }
    })
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::select! {
        _ = sigint.recv() => {},
        _ = sigterm.recv() => {},
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
