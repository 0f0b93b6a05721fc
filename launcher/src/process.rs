use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::correlation::{Correlator, ServerIo};
use crate::error::{Result, SupervisorError};
use crate::event::SupervisorEvent;
use crate::paths;
use crate::pipes;

/// Console command that makes the server save and exit.
pub const SHUTDOWN_COMMAND: &str = "stop";

/// How to launch the server binary.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub work_dir: PathBuf,
}

impl LaunchSpec {
    /// `java -Xms<mem> -Xmx<mem> <gc flags> <jvm_args> -jar paper.jar nogui`
    pub fn paper(config: &Config) -> Self {
        let mut args = vec![
            format!("-Xms{}", config.memory),
            format!("-Xmx{}", config.memory),
            "-XX:+UseG1GC".to_string(),
            "-XX:+ParallelRefProcEnabled".to_string(),
        ];
        args.extend(config.jvm_args.iter().cloned());
        args.extend([
            "-jar".to_string(),
            paths::SERVER_JAR.to_string(),
            "nogui".to_string(),
        ]);
        Self {
            program: config.java.clone(),
            args,
            work_dir: config.work_dir.clone(),
        }
    }
}

/// A launched server process and every worker bound to its lifetime.
///
/// Dropping a `ManagedProcess` without [`stop`](Self::stop) or
/// [`reap`](Self::reap) closes the kill channel, and the exit watcher kills
/// the child.
pub struct ManagedProcess {
    generation: u64,
    pid: Option<u32>,
    io: ServerIo,
    /// Setting this to `true` signals the stream workers and the correlator to stop.
    stop_tx: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
    kill_tx: Option<oneshot::Sender<()>>,
    exit_rx: oneshot::Receiver<std::io::Result<ExitStatus>>,
}

impl ManagedProcess {
    /// Launches the server and starts its stream workers, correlator and exit
    /// watcher. The exit watcher reports every exit to `events` tagged with
    /// `generation`.
    pub fn spawn(
        spec: &LaunchSpec,
        generation: u64,
        ack_timeout: Option<Duration>,
        events: mpsc::Sender<SupervisorEvent>,
    ) -> Result<Self> {
        let mut child = Command::new(&spec.program)
            .args(&spec.args)
            .current_dir(&spec.work_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SupervisorError::Launch {
                program: spec.program.clone(),
                source,
            })?;

        let stdin = child.stdin.take().ok_or(SupervisorError::StreamMissing("stdin"))?;
        let stdout = child.stdout.take().ok_or(SupervisorError::StreamMissing("stdout"))?;
        let stderr = child.stderr.take().ok_or(SupervisorError::StreamMissing("stderr"))?;
        let pid = child.id();

        let (stop_tx, stop_rx) = watch::channel(false);
        let pipes = pipes::start(stdin, stdout, stderr, &stop_rx);
        let (correlator, engine) = Correlator::spawn(pipes.lines, stop_rx);
        let mut workers = pipes.handles;
        workers.push(engine);

        let (kill_tx, kill_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = oneshot::channel();
        tokio::spawn(watch_exit(child, generation, kill_rx, exit_tx, events));

        info!(generation, pid = ?pid, program = %spec.program, "[process] started");

        Ok(Self {
            generation,
            pid,
            io: ServerIo::new(pipes.input, correlator).with_ack_timeout(ack_timeout),
            stop_tx,
            workers,
            kill_tx: Some(kill_tx),
            exit_rx,
        })
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// A handle for writing commands and awaiting acknowledgements.
    pub fn io(&self) -> ServerIo {
        self.io.clone()
    }

    /// Asks the server to shut down, waits for it to exit, then joins all
    /// workers. If the shutdown command cannot be delivered the child is killed.
    pub async fn stop(mut self) -> Result<ExitStatus> {
        info!(generation = self.generation, "[process] stopping");
        if let Err(e) = self.io.send(SHUTDOWN_COMMAND).await {
            warn!(generation = self.generation, "[process] could not send shutdown command ({e}); killing");
            if let Some(kill) = self.kill_tx.take() {
                let _ = kill.send(());
            }
        }
        self.reap().await
    }

    /// Waits for an already exiting process and joins all workers.
    pub async fn reap(self) -> Result<ExitStatus> {
        let status = match self.exit_rx.await {
            Ok(Ok(status)) => Ok(status),
            Ok(Err(e)) => Err(SupervisorError::Wait(e)),
            Err(_) => Err(SupervisorError::ProcessGone),
        };

        let _ = self.stop_tx.send(true);
        for worker in self.workers {
            let _ = worker.await;
        }
        info!(generation = self.generation, "[process] all workers joined");
        status
    }
}

async fn watch_exit(
    mut child: Child,
    generation: u64,
    mut kill_rx: oneshot::Receiver<()>,
    exit_tx: oneshot::Sender<std::io::Result<ExitStatus>>,
    events: mpsc::Sender<SupervisorEvent>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        // A send and a dropped sender both mean kill.
        _ = &mut kill_rx => {
            warn!(generation, "[process] killing server");
            if let Err(e) = child.start_kill() {
                error!(generation, "[process] kill failed: {e}");
            }
            child.wait().await
        }
    };

    match status {
        Ok(status) => {
            info!(generation, %status, "[process] exited");
            let _ = exit_tx.send(Ok(status));
            let _ = events
                .send(SupervisorEvent::ProcessExited { generation, status })
                .await;
        }
        Err(e) => {
            error!(generation, "[process] wait failed: {e}");
            let _ = exit_tx.send(Err(e));
        }
    }
    debug!(generation, "[process] exit watcher done");
}
