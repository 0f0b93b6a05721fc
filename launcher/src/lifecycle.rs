use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SupervisorError};

/// Lifecycle of the managed server process.
///
/// ```text
/// Stopped -> Starting -> Running -> Stopping -> Stopped
///                |           \
///                v            -> Crashed -> Stopped
///             Stopped
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Crashed,
}

impl ProcessState {
    pub fn can_transition(self, to: ProcessState) -> bool {
        use ProcessState::*;
        matches!(
            (self, to),
            (Stopped, Starting)
                | (Starting, Running)
                | (Starting, Stopped)
                | (Running, Stopping)
                | (Running, Crashed)
                | (Stopping, Stopped)
                | (Crashed, Stopped)
        )
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProcessState::Stopped => "stopped",
            ProcessState::Starting => "starting",
            ProcessState::Running => "running",
            ProcessState::Stopping => "stopping",
            ProcessState::Crashed => "crashed",
        };
        f.write_str(s)
    }
}

/// Checked holder for the current [`ProcessState`].
#[derive(Debug)]
pub struct Lifecycle {
    state: ProcessState,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: ProcessState::Stopped,
        }
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn transition(&mut self, to: ProcessState) -> Result<()> {
        if !self.state.can_transition(to) {
            return Err(SupervisorError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        tracing::debug!(from = %self.state, to = %to, "process state");
        self.state = to;
        Ok(())
    }
}
