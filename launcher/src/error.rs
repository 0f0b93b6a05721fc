use std::process::ExitStatus;
use std::time::Duration;

use thiserror::Error;

use crate::lifecycle::ProcessState;

/// Failures of the supervisor core. Collaborators (archive, updater, config)
/// report through `anyhow` and are wrapped here only where the supervisor
/// must branch on them.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// A lifecycle transition was requested from the wrong state, e.g. starting
    /// an already started server.
    #[error("invalid process transition: {from} -> {to}")]
    InvalidTransition { from: ProcessState, to: ProcessState },

    #[error("failed to launch `{program}`: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("child {0} stream was not captured")]
    StreamMissing(&'static str),

    /// The input queue or correlation slot belonged to a process that is gone.
    #[error("server process is no longer running")]
    ProcessGone,

    #[error("no acknowledgement containing '{substring}' within {timeout:?}")]
    AckTimeout { substring: String, timeout: Duration },

    #[error("server process terminated unexpectedly ({0})")]
    Crashed(ExitStatus),

    #[error("failed to wait for the server process: {0}")]
    Wait(#[source] std::io::Error),

    #[error("binary refresh failed: {0:#}")]
    Refresh(#[source] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, SupervisorError>;
