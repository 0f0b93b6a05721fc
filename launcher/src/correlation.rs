/// Correlates commands with the server's textual acknowledgements.
///
/// One engine task per process owns the stdout line stream and a single
/// in-flight slot. Callers submit a substring through [`Correlator::expect`];
/// the engine accepts it only when the slot is free, then tests every
/// following line for containment and hands the first match back. Lines are
/// always relayed to the log, matched or not.
///
/// The request channel holds one entry, so a second caller parks until the
/// first request resolves. That serialises all correlated exchanges without
/// any shared lock.
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::{Result, SupervisorError};
use crate::pipes::stopped;

struct PendingQuery {
    substring: String,
    accepted: oneshot::Sender<()>,
    found: oneshot::Sender<String>,
}

struct ActiveQuery {
    substring: String,
    found: oneshot::Sender<String>,
}

/// Cloneable handle for submitting requests to one process's engine.
#[derive(Clone)]
pub struct Correlator {
    requests: mpsc::Sender<PendingQuery>,
}

/// An accepted request. Dropping it abandons the request and frees the slot.
pub struct PendingMatch {
    substring: String,
    found: oneshot::Receiver<String>,
}

impl Correlator {
    /// Starts the engine over `lines`. The engine exits when `stop_rx` flips
    /// to `true` or `lines` closes; any request still active then fails with
    /// [`SupervisorError::ProcessGone`].
    pub fn spawn(
        lines: mpsc::Receiver<String>,
        stop_rx: watch::Receiver<bool>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(1);
        let handle = tokio::spawn(run_engine(lines, rx, stop_rx));
        (Self { requests: tx }, handle)
    }

    /// Registers interest in the next line containing `substring` and waits
    /// until the engine has accepted it. Only output produced after this
    /// returns is considered.
    pub async fn expect(&self, substring: impl Into<String>) -> Result<PendingMatch> {
        let substring = substring.into();
        let (accepted_tx, accepted_rx) = oneshot::channel();
        let (found_tx, found_rx) = oneshot::channel();
        self.requests
            .send(PendingQuery {
                substring: substring.clone(),
                accepted: accepted_tx,
                found: found_tx,
            })
            .await
            .map_err(|_| SupervisorError::ProcessGone)?;
        accepted_rx.await.map_err(|_| SupervisorError::ProcessGone)?;
        Ok(PendingMatch {
            substring,
            found: found_rx,
        })
    }
}

impl PendingMatch {
    /// Waits for the matching line. `None` waits indefinitely.
    pub async fn line(self, timeout: Option<Duration>) -> Result<String> {
        let PendingMatch { substring, found } = self;
        match timeout {
            None => found.await.map_err(|_| SupervisorError::ProcessGone),
            Some(limit) => match tokio::time::timeout(limit, found).await {
                Ok(line) => line.map_err(|_| SupervisorError::ProcessGone),
                Err(_) => Err(SupervisorError::AckTimeout {
                    substring,
                    timeout: limit,
                }),
            },
        }
    }
}

enum Step {
    Line(Option<String>),
    Request(Option<PendingQuery>),
    Abandoned,
    Stop,
}

async fn run_engine(
    mut lines: mpsc::Receiver<String>,
    mut requests: mpsc::Receiver<PendingQuery>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut active: Option<ActiveQuery> = None;
    let mut requests_open = true;

    loop {
        let step = match active.as_mut() {
            Some(query) => tokio::select! {
                line = lines.recv() => Step::Line(line),
                _ = query.found.closed() => Step::Abandoned,
                _ = stopped(&mut stop_rx) => Step::Stop,
            },
            None => tokio::select! {
                line = lines.recv() => Step::Line(line),
                req = requests.recv(), if requests_open => Step::Request(req),
                _ = stopped(&mut stop_rx) => Step::Stop,
            },
        };

        match step {
            Step::Line(Some(line)) => {
                info!(target: "server", "{line}");
                if active.as_ref().is_some_and(|q| line.contains(&q.substring)) {
                    if let Some(query) = active.take() {
                        debug!(substring = %query.substring, "[correlate] matched");
                        let _ = query.found.send(line);
                    }
                }
            }
            Step::Request(Some(req)) => {
                if req.accepted.send(()).is_ok() {
                    debug!(substring = %req.substring, "[correlate] accepted");
                    active = Some(ActiveQuery {
                        substring: req.substring,
                        found: req.found,
                    });
                }
            }
            Step::Request(None) => requests_open = false,
            Step::Abandoned => {
                if let Some(query) = active.take() {
                    debug!(substring = %query.substring, "[correlate] abandoned");
                }
            }
            Step::Line(None) | Step::Stop => break,
        }
    }

    debug!("[correlate] done");
}

/// Command channel to one running server: fire-and-forget writes plus
/// correlated request/acknowledgement exchanges.
#[derive(Clone)]
pub struct ServerIo {
    input: mpsc::Sender<String>,
    correlator: Correlator,
    ack_timeout: Option<Duration>,
}

impl ServerIo {
    pub fn new(input: mpsc::Sender<String>, correlator: Correlator) -> Self {
        Self {
            input,
            correlator,
            ack_timeout: None,
        }
    }

    /// Bounds every acknowledgement wait issued through this handle.
    pub fn with_ack_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.ack_timeout = timeout;
        self
    }

    pub async fn send(&self, line: impl Into<String>) -> Result<()> {
        self.input
            .send(line.into())
            .await
            .map_err(|_| SupervisorError::ProcessGone)
    }

    /// Sends `command` and returns the first subsequent output line that
    /// contains `ack`. The wait is registered before the command is written.
    pub async fn request(&self, ack: &str, command: &str) -> Result<String> {
        let pending = self.correlator.expect(ack).await?;
        self.send(command).await?;
        pending.line(self.ack_timeout).await
    }
}
