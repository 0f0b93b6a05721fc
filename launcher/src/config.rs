use anyhow::{bail, Context, Result};
use chrono::Weekday;
use chrono_tz::Tz;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "config.toml";
pub const DEFAULT_JAVA: &str = "java";
pub const DEFAULT_STATUS_FILE: &str = "launcher-status.toml";
pub const DEFAULT_BACKUP_WEEKDAY: Weekday = Weekday::Mon;
pub const DEFAULT_BACKUP_HOUR: u32 = 1;
pub const DEFAULT_CLOSE_GRACE: Duration = Duration::from_secs(5);
pub const DEFAULT_PLAYER_DELAY: Duration = Duration::from_millis(200);
pub const DEFAULT_SAVE_SETTLE: Duration = Duration::from_millis(200);
pub const DEFAULT_REBOOT_PAUSE: Duration = Duration::from_secs(1);
/// Longest accepted `warn_before` lead.
pub const MAX_WARN_LEAD: Duration = Duration::from_secs(24 * 60 * 60);

/// Root configuration structure. Deserialized once from `config.toml` and
/// shared read-only for the rest of the run.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Server working directory. The JVM runs here and backups archive it.
    pub work_dir: PathBuf,
    /// Heap size passed to both `-Xms` and `-Xmx` (e.g. "4G").
    pub memory: String,
    /// JVM executable.
    #[serde(default = "default_java")]
    pub java: String,
    /// Extra JVM flags inserted before `-jar`.
    #[serde(default)]
    pub jvm_args: Vec<String>,
    /// Lead times before each close at which online players are warned.
    #[serde(default)]
    pub warn_before: Vec<Span>,
    pub schedule: Schedule,
    #[serde(default)]
    pub backup: BackupConfig,
    #[serde(default)]
    pub timings: Timings,
    /// Players whose allow-list entries follow the access schedule, in order.
    #[serde(default)]
    pub players: Vec<Player>,
    /// Also keep the Geyser plugin up to date on refresh.
    #[serde(default)]
    pub geyser: bool,
    /// Pins the PaperMC version. The latest published version is used when unset.
    #[serde(default)]
    pub paper_version: Option<String>,
    #[serde(default = "default_status_file")]
    pub status_file: PathBuf,
    /// Upper bound for acknowledgement waits. Unbounded when unset.
    #[serde(default)]
    pub ack_timeout: Option<Span>,
}

impl Config {
    pub fn warn_lead_times(&self) -> Vec<Duration> {
        self.warn_before.iter().map(|s| s.get()).collect()
    }

    pub fn ack_timeout(&self) -> Option<Duration> {
        self.ack_timeout.map(|s| s.get())
    }

    /// Checks the invariants serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.memory.trim().is_empty() {
            bail!("memory must not be empty");
        }
        if self.backup.hour > 23 {
            bail!("backup.hour must be in 0..=23, got {}", self.backup.hour);
        }
        if let Some(i) = self.players.iter().position(|p| p.nickname.trim().is_empty()) {
            bail!("players[{i}] has an empty nickname");
        }
        // A zero lead coincides with the close and would take its slot.
        for (i, lead) in self.warn_lead_times().iter().enumerate() {
            if lead.is_zero() || *lead > MAX_WARN_LEAD {
                bail!("warn_before[{i}] must be greater than zero and at most 24h, got {lead:?}");
            }
        }
        Ok(())
    }
}

/// Weekly access windows in a fixed timezone.
#[derive(Debug, Clone, Deserialize)]
pub struct Schedule {
    pub timezone: Tz,
    #[serde(default)]
    pub days: WeekDays,
}

/// One optional access window per weekday. Unknown day names are rejected.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WeekDays {
    pub monday: Option<DayWindow>,
    pub tuesday: Option<DayWindow>,
    pub wednesday: Option<DayWindow>,
    pub thursday: Option<DayWindow>,
    pub friday: Option<DayWindow>,
    pub saturday: Option<DayWindow>,
    pub sunday: Option<DayWindow>,
}

impl WeekDays {
    pub fn get(&self, day: Weekday) -> Option<&DayWindow> {
        match day {
            Weekday::Mon => self.monday.as_ref(),
            Weekday::Tue => self.tuesday.as_ref(),
            Weekday::Wed => self.wednesday.as_ref(),
            Weekday::Thu => self.thursday.as_ref(),
            Weekday::Fri => self.friday.as_ref(),
            Weekday::Sat => self.saturday.as_ref(),
            Weekday::Sun => self.sunday.as_ref(),
        }
    }

    #[cfg(test)]
    pub fn set(&mut self, day: Weekday, window: Option<DayWindow>) {
        let slot = match day {
            Weekday::Mon => &mut self.monday,
            Weekday::Tue => &mut self.tuesday,
            Weekday::Wed => &mut self.wednesday,
            Weekday::Thu => &mut self.thursday,
            Weekday::Fri => &mut self.friday,
            Weekday::Sat => &mut self.saturday,
            Weekday::Sun => &mut self.sunday,
        };
        *slot = window;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct DayWindow {
    pub open: DayTime,
    pub close: DayTime,
}

/// Time of day in `HH:MM` form, measured from local midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct DayTime {
    hours: u32,
    minutes: u32,
}

impl DayTime {
    pub fn new(hours: u32, minutes: u32) -> Option<Self> {
        (hours < 24 && minutes < 60).then_some(Self { hours, minutes })
    }

    /// Offset from local midnight.
    pub fn offset(&self) -> chrono::Duration {
        chrono::Duration::hours(i64::from(self.hours)) + chrono::Duration::minutes(i64::from(self.minutes))
    }
}

impl TryFrom<String> for DayTime {
    type Error = String;

    fn try_from(raw: String) -> std::result::Result<Self, Self::Error> {
        let (h, m) = raw
            .trim()
            .split_once(':')
            .ok_or_else(|| format!("time of day should be in HH:MM format, got '{raw}'"))?;
        let hours: u32 = h.parse().map_err(|_| format!("invalid hours in '{raw}'"))?;
        let minutes: u32 = m.parse().map_err(|_| format!("invalid minutes in '{raw}'"))?;
        DayTime::new(hours, minutes).ok_or_else(|| format!("time of day out of range: '{raw}'"))
    }
}

/// A duration written as `NNms`, `NNs`, `NNm` or `NNh`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct Span(Duration);

impl Span {
    pub fn get(&self) -> Duration {
        self.0
    }
}

impl TryFrom<String> for Span {
    type Error = String;

    fn try_from(raw: String) -> std::result::Result<Self, Self::Error> {
        parse_span(&raw).map(Span)
    }
}

fn parse_span(s: &str) -> std::result::Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration string".to_string());
    }
    if let Some(n) = s.strip_suffix("ms") {
        let val: u64 = n.trim().parse().map_err(|_| format!("invalid milliseconds: {n}"))?;
        return Ok(Duration::from_millis(val));
    }
    if let Some(n) = s.strip_suffix('s') {
        let val: u64 = n.trim().parse().map_err(|_| format!("invalid seconds: {n}"))?;
        return Ok(Duration::from_secs(val));
    }
    if let Some(n) = s.strip_suffix('m') {
        let val: u64 = n.trim().parse().map_err(|_| format!("invalid minutes: {n}"))?;
        let secs = val.checked_mul(60).ok_or_else(|| format!("minutes out of range: {n}"))?;
        return Ok(Duration::from_secs(secs));
    }
    if let Some(n) = s.strip_suffix('h') {
        let val: u64 = n.trim().parse().map_err(|_| format!("invalid hours: {n}"))?;
        let secs = val.checked_mul(3600).ok_or_else(|| format!("hours out of range: {n}"))?;
        return Ok(Duration::from_secs(secs));
    }
    Err(format!("unrecognized duration format: '{s}'. Expected NNms, NNs, NNm, or NNh."))
}

/// Weekly backup anchor: `weekday` at `hour`:00 in the schedule's timezone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct BackupConfig {
    #[serde(default = "default_backup_weekday")]
    pub weekday: Weekday,
    #[serde(default = "default_backup_hour")]
    pub hour: u32,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            weekday: DEFAULT_BACKUP_WEEKDAY,
            hour: DEFAULT_BACKUP_HOUR,
        }
    }
}

/// Fixed pauses used by the access actions and the backup saga.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Timings {
    /// Pause between the close broadcast and the first removal.
    #[serde(default = "default_close_grace")]
    pub close_grace: Span,
    /// Pause after each per-player command batch.
    #[serde(default = "default_player_delay")]
    pub player_delay: Span,
    /// Pause between archiving and re-enabling autosave.
    #[serde(default = "default_save_settle")]
    pub save_settle: Span,
    /// Pause between stop and start on `reboot`.
    #[serde(default = "default_reboot_pause")]
    pub reboot_pause: Span,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            close_grace: default_close_grace(),
            player_delay: default_player_delay(),
            save_settle: default_save_settle(),
            reboot_pause: default_reboot_pause(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlayerKind {
    Java,
    Bedrock,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Player {
    pub kind: PlayerKind,
    pub nickname: String,
}

/// Loads and validates the config file at `path`.
pub fn load(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("Invalid config file: {}", path.display()))?;
    Ok(config)
}

fn default_java() -> String {
    DEFAULT_JAVA.to_string()
}

fn default_status_file() -> PathBuf {
    PathBuf::from(DEFAULT_STATUS_FILE)
}

fn default_backup_weekday() -> Weekday {
    DEFAULT_BACKUP_WEEKDAY
}

fn default_backup_hour() -> u32 {
    DEFAULT_BACKUP_HOUR
}

fn default_close_grace() -> Span {
    Span(DEFAULT_CLOSE_GRACE)
}

fn default_player_delay() -> Span {
    Span(DEFAULT_PLAYER_DELAY)
}

fn default_save_settle() -> Span {
    Span(DEFAULT_SAVE_SETTLE)
}

fn default_reboot_pause() -> Span {
    Span(DEFAULT_REBOOT_PAUSE)
}
