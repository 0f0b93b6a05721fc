use std::fmt;
use std::process::ExitStatus;

/// Everything the supervisor loop reacts to. All producers feed one channel.
#[derive(Debug)]
pub enum SupervisorEvent {
    /// A line typed on the operator console.
    Console(String),
    /// The schedule timer fired.
    Scheduled(InnerCommand),
    /// A server process exited. `generation` identifies which launch it was.
    ProcessExited { generation: u64, status: ExitStatus },
    /// SIGINT/SIGTERM received; behaves like the `stop` console command.
    Shutdown,
}

/// Scheduled actions, ordered by tie-break precedence (earlier wins).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum InnerCommand {
    Backup,
    OpenAccess,
    Warn,
    CloseAccess,
}

impl fmt::Display for InnerCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InnerCommand::Backup => "backup",
            InnerCommand::OpenAccess => "open-access",
            InnerCommand::Warn => "warn",
            InnerCommand::CloseAccess => "close-access",
        };
        f.write_str(s)
    }
}

/// Operator console commands. Anything unrecognised is forwarded verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Update,
    Backup,
    Reboot,
    Stop,
    Raw(String),
}

impl ConsoleCommand {
    /// Returns `None` for blank lines.
    pub fn parse(line: &str) -> Option<Self> {
        let trimmed = line.trim();
        let cmd = match trimmed {
            "" => return None,
            "update" => ConsoleCommand::Update,
            "backup" => ConsoleCommand::Backup,
            "reboot" => ConsoleCommand::Reboot,
            "stop" => ConsoleCommand::Stop,
            _ => ConsoleCommand::Raw(trimmed.to_string()),
        };
        Some(cmd)
    }
}
