use std::time::Duration;

use tracing::{debug, info};

use crate::config::{Player, PlayerKind, Timings};
use crate::correlation::ServerIo;
use crate::error::Result;

pub const LIST: &str = "list";
/// Present in every player-count line.
pub const LIST_ACK: &str = "of a max of";
/// Player-count line of an empty server.
pub const EMPTY_SERVER: &str = "There are 0 of a max of";
pub const CLOSE_BROADCAST: &str = "say Server is closing now!";
pub const WARN_BROADCAST: &str = "say Server will close soon";

impl Player {
    pub fn allow_command(&self) -> String {
        match self.kind {
            PlayerKind::Java => format!("whitelist add {}", self.nickname),
            PlayerKind::Bedrock => format!("fwhitelist add {}", self.nickname),
        }
    }

    pub fn remove_command(&self) -> String {
        match self.kind {
            PlayerKind::Java => format!("whitelist remove {}", self.nickname),
            PlayerKind::Bedrock => format!("fwhitelist remove {}", self.nickname),
        }
    }

    /// Bedrock players are known to the server under a `.`-prefixed name.
    pub fn kick_command(&self) -> String {
        match self.kind {
            PlayerKind::Java => format!("kick {}", self.nickname),
            PlayerKind::Bedrock => format!("kick .{}", self.nickname),
        }
    }
}

/// Announces the close, waits out the grace period, then removes and kicks
/// every player in configured order. Every player command is followed by
/// `player_delay`.
pub async fn close_access(io: &ServerIo, players: &[Player], timings: &Timings) -> Result<()> {
    info!(players = players.len(), "[access] closing");
    io.send(CLOSE_BROADCAST).await?;
    tokio::time::sleep(timings.close_grace.get()).await;
    let delay = timings.player_delay.get();
    for player in players {
        io.send(player.remove_command()).await?;
        tokio::time::sleep(delay).await;
        io.send(player.kick_command()).await?;
        pace(player, delay).await;
    }
    Ok(())
}

/// Puts every player back on the allow-list.
pub async fn open_access(io: &ServerIo, players: &[Player], timings: &Timings) -> Result<()> {
    info!(players = players.len(), "[access] opening");
    for player in players {
        io.send(player.allow_command()).await?;
        pace(player, timings.player_delay.get()).await;
    }
    Ok(())
}

/// Broadcasts the closing warning unless nobody is online. Returns whether
/// the warning was sent.
pub async fn warn(io: &ServerIo) -> Result<bool> {
    let count = io.request(LIST_ACK, LIST).await?;
    if count.contains(EMPTY_SERVER) {
        debug!("[access] nobody online, warning skipped");
        return Ok(false);
    }
    info!("[access] warning players");
    io.send(WARN_BROADCAST).await?;
    Ok(true)
}

async fn pace(player: &Player, delay: Duration) {
    debug!(nickname = %player.nickname, "[access] done");
    tokio::time::sleep(delay).await;
}
