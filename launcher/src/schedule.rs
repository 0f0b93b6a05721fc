/// Weekly schedule resolution: decides which [`InnerCommand`] is due next and
/// when, and runs the timer that hands due commands to the supervisor loop.
///
/// All arithmetic happens in the schedule's timezone. Each event sits at a
/// fixed offset from that day's local midnight, so a DST switch earlier in
/// the day shifts it by the switch amount.
use chrono::{DateTime, Datelike, Days, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use crate::config::{BackupConfig, Config, Schedule};
use crate::event::{InnerCommand, SupervisorEvent};
use crate::pipes::stopped;

/// Days scanned per resolution, today included.
pub const LOOKAHEAD_DAYS: u64 = 8;
/// Re-poll interval when nothing is scheduled inside the lookahead window.
pub const FALLBACK_POLL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone)]
pub struct ScheduleResolver {
    schedule: Schedule,
    warn_before: Vec<chrono::Duration>,
    backup: BackupConfig,
}

impl ScheduleResolver {
    pub fn new(schedule: Schedule, warn_before: &[Duration], backup: BackupConfig) -> Self {
        let warn_before = warn_before
            .iter()
            .filter_map(|d| chrono::Duration::from_std(*d).ok())
            .collect();
        Self {
            schedule,
            warn_before,
            backup,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.schedule.clone(),
            &config.warn_lead_times(),
            config.backup,
        )
    }

    pub fn timezone(&self) -> Tz {
        self.schedule.timezone
    }

    /// Returns the earliest event strictly after `now`, or `None` if the
    /// lookahead window holds nothing.
    ///
    /// Events at the same instant resolve by [`InnerCommand`] ordering:
    /// Backup, then OpenAccess, then Warn, then CloseAccess.
    pub fn next_event(&self, now: DateTime<Utc>) -> Option<(InnerCommand, DateTime<Tz>)> {
        let tz = self.schedule.timezone;
        let local_now = now.with_timezone(&tz);
        let today = local_now.date_naive();

        let mut candidates: Vec<(InnerCommand, DateTime<Tz>)> = Vec::new();
        for offset in 0..LOOKAHEAD_DAYS {
            let Some(date) = today.checked_add_days(Days::new(offset)) else {
                break;
            };
            let midnight = local_midnight(tz, date);
            let weekday = date.weekday();

            if let Some(window) = self.schedule.days.get(weekday) {
                candidates.push((InnerCommand::OpenAccess, midnight + window.open.offset()));
                let close = midnight + window.close.offset();
                for lead in &self.warn_before {
                    if let Some(at) = close.checked_sub_signed(*lead) {
                        candidates.push((InnerCommand::Warn, at));
                    }
                }
                candidates.push((InnerCommand::CloseAccess, close));
            }

            if weekday == self.backup.weekday {
                let at = midnight + chrono::Duration::hours(i64::from(self.backup.hour));
                candidates.push((InnerCommand::Backup, at));
            }
        }

        candidates
            .into_iter()
            .filter(|(_, at)| *at > local_now)
            .min_by(|a, b| a.1.cmp(&b.1).then(a.0.cmp(&b.0)))
    }
}

/// Local midnight of `date`. When midnight falls into a DST gap the first
/// valid instant after it is used.
fn local_midnight(tz: Tz, date: NaiveDate) -> DateTime<Tz> {
    let naive = date.and_time(NaiveTime::MIN);
    for minutes in 0..=180 {
        let candidate = naive + chrono::Duration::minutes(minutes);
        if let Some(dt) = tz.from_local_datetime(&candidate).earliest() {
            return dt;
        }
    }
    tz.from_utc_datetime(&naive)
}

/// Sleeps until each resolved event and sends it to the supervisor loop as
/// [`SupervisorEvent::Scheduled`]. Exits when `stop_rx` flips to `true` or
/// the loop's channel closes.
pub async fn run(
    resolver: ScheduleResolver,
    tx: mpsc::Sender<SupervisorEvent>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut last_fired: Option<DateTime<Utc>> = None;

    loop {
        let now = Utc::now();
        // Never resolve before an instant that already fired, even if the
        // wall clock lags the timer slightly.
        let from = last_fired.map_or(now, |t| t.max(now));

        let (wait, due) = match resolver.next_event(from) {
            Some((cmd, at)) => {
                let at = at.with_timezone(&Utc);
                info!(command = %cmd, at = %at.with_timezone(&resolver.timezone()), "[scheduler] next event");
                ((at - now).to_std().unwrap_or_default(), Some((cmd, at)))
            }
            None => {
                debug!("[scheduler] nothing within lookahead window; re-polling later");
                (FALLBACK_POLL, None)
            }
        };

        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = stopped(&mut stop_rx) => break,
        }

        if let Some((cmd, at)) = due {
            last_fired = Some(at);
            info!(command = %cmd, "[scheduler] firing");
            if tx.send(SupervisorEvent::Scheduled(cmd)).await.is_err() {
                break;
            }
        }
    }

    debug!("[scheduler] done");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DayTime, DayWindow, WeekDays};
    use chrono::Weekday;

    fn window(open: (u32, u32), close: (u32, u32)) -> DayWindow {
        DayWindow {
            open: DayTime::new(open.0, open.1).unwrap(),
            close: DayTime::new(close.0, close.1).unwrap(),
        }
    }

    fn resolver(tz: Tz, days: &[(Weekday, DayWindow)], warn_mins: &[u64]) -> ScheduleResolver {
        let mut week = WeekDays::default();
        for (day, w) in days {
            week.set(*day, Some(*w));
        }
        let warn: Vec<Duration> = warn_mins.iter().map(|m| Duration::from_secs(m * 60)).collect();
        ScheduleResolver::new(
            Schedule {
                timezone: tz,
                days: week,
            },
            &warn,
            BackupConfig::default(),
        )
    }

    fn monday_resolver() -> ScheduleResolver {
        resolver(Tz::UTC, &[(Weekday::Mon, window((8, 0), (22, 0)))], &[30])
    }

    /// 2024-01-01 is a Monday.
    fn utc(day: u32, h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, h, m, 0).unwrap()
    }

    // ── scenarios ─────────────────────────────────────────────────────────────

    #[test]
    fn monday_morning_opens_at_eight() {
        let (cmd, at) = monday_resolver().next_event(utc(1, 7, 0)).unwrap();
        assert_eq!(cmd, InnerCommand::OpenAccess);
        assert_eq!(at.with_timezone(&Utc), utc(1, 8, 0));
    }

    #[test]
    fn monday_evening_warns_before_close() {
        let (cmd, at) = monday_resolver().next_event(utc(1, 21, 29)).unwrap();
        assert_eq!(cmd, InnerCommand::Warn);
        assert_eq!(at.with_timezone(&Utc), utc(1, 21, 30));
    }

    #[test]
    fn event_at_now_is_not_eligible() {
        let (cmd, at) = monday_resolver().next_event(utc(1, 21, 30)).unwrap();
        assert_eq!(cmd, InnerCommand::CloseAccess);
        assert_eq!(at.with_timezone(&Utc), utc(1, 22, 0));
    }

    #[test]
    fn after_close_next_is_following_monday_backup() {
        let (cmd, at) = monday_resolver().next_event(utc(1, 22, 0)).unwrap();
        assert_eq!(cmd, InnerCommand::Backup);
        assert_eq!(at.with_timezone(&Utc), utc(8, 1, 0));
    }

    #[test]
    fn early_monday_backs_up_first() {
        let (cmd, at) = monday_resolver().next_event(utc(1, 0, 30)).unwrap();
        assert_eq!(cmd, InnerCommand::Backup);
        assert_eq!(at.with_timezone(&Utc), utc(1, 1, 0));
    }

    #[test]
    fn multiple_warn_lead_times_pick_earliest_pending() {
        let r = resolver(Tz::UTC, &[(Weekday::Tue, window((8, 0), (22, 0)))], &[30, 5]);
        let (cmd, at) = r.next_event(utc(2, 21, 0)).unwrap();
        assert_eq!((cmd, at.with_timezone(&Utc)), (InnerCommand::Warn, utc(2, 21, 30)));
        let (cmd, at) = r.next_event(utc(2, 21, 40)).unwrap();
        assert_eq!((cmd, at.with_timezone(&Utc)), (InnerCommand::Warn, utc(2, 21, 55)));
    }

    // ── tie-breaking ──────────────────────────────────────────────────────────

    #[test]
    fn backup_beats_open_at_same_instant() {
        let r = resolver(Tz::UTC, &[(Weekday::Mon, window((1, 0), (22, 0)))], &[]);
        let (cmd, _) = r.next_event(utc(1, 0, 0)).unwrap();
        assert_eq!(cmd, InnerCommand::Backup);
    }

    #[test]
    fn open_beats_warn_at_same_instant() {
        let r = resolver(Tz::UTC, &[(Weekday::Wed, window((8, 0), (8, 30)))], &[30]);
        let (cmd, at) = r.next_event(utc(3, 7, 0)).unwrap();
        assert_eq!(cmd, InnerCommand::OpenAccess);
        assert_eq!(at.with_timezone(&Utc), utc(3, 8, 0));
    }

    #[test]
    fn warn_beats_close_at_same_instant() {
        let r = resolver(Tz::UTC, &[(Weekday::Wed, window((8, 0), (22, 0)))], &[0]);
        let (cmd, _) = r.next_event(utc(3, 21, 0)).unwrap();
        assert_eq!(cmd, InnerCommand::Warn);
    }

    #[test]
    fn lead_beyond_calendar_range_is_skipped() {
        let mut days = WeekDays::default();
        days.set(Weekday::Wed, Some(window((8, 0), (22, 0))));
        let r = ScheduleResolver::new(
            Schedule {
                timezone: Tz::UTC,
                days,
            },
            &[Duration::from_secs(1 << 50)],
            BackupConfig::default(),
        );
        let (cmd, at) = r.next_event(utc(3, 21, 0)).unwrap();
        assert_eq!(cmd, InnerCommand::CloseAccess);
        assert_eq!(at.with_timezone(&Utc), utc(3, 22, 0));
    }

    // ── days without entries ──────────────────────────────────────────────────

    #[test]
    fn empty_schedule_still_backs_up_weekly() {
        let r = resolver(Tz::UTC, &[], &[30]);
        // Wednesday: the only candidate is next Monday's backup.
        let (cmd, at) = r.next_event(utc(3, 12, 0)).unwrap();
        assert_eq!(cmd, InnerCommand::Backup);
        assert_eq!(at.with_timezone(&Utc), utc(8, 1, 0));
    }

    #[test]
    fn unscheduled_days_produce_no_access_events() {
        let r = resolver(Tz::UTC, &[(Weekday::Fri, window((8, 0), (22, 0)))], &[30]);
        let mut now = utc(1, 0, 0);
        let end = utc(15, 0, 0);
        while now < end {
            let (cmd, at) = r.next_event(now).unwrap();
            if cmd != InnerCommand::Backup {
                assert_eq!(at.weekday(), Weekday::Fri, "{cmd} on {at}");
            } else {
                assert_eq!(at.weekday(), Weekday::Mon);
            }
            now = at.with_timezone(&Utc);
        }
    }

    // ── properties ────────────────────────────────────────────────────────────

    #[test]
    fn never_returns_instant_at_or_before_now() {
        let r = resolver(
            chrono_tz::Europe::Berlin,
            &[
                (Weekday::Mon, window((8, 0), (22, 0))),
                (Weekday::Sat, window((0, 0), (23, 59))),
                (Weekday::Sun, window((23, 0), (2, 0))),
            ],
            &[30, 5, 0],
        );
        // Covers the 2024-03-31 spring-forward switch in Berlin.
        let mut now = Utc.with_ymd_and_hms(2024, 3, 20, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 4, 10, 0, 0, 0).unwrap();
        while now < end {
            let (_, at) = r.next_event(now).expect("backup is always within lookahead");
            assert!(at.with_timezone(&Utc) > now, "{at} <= {now}");
            now += chrono::Duration::minutes(17);
        }
    }

    #[test]
    fn chained_resolution_visits_every_event_once() {
        let r = monday_resolver();
        let mut now = utc(1, 0, 0);
        let mut seen = Vec::new();
        for _ in 0..4 {
            let (cmd, at) = r.next_event(now).unwrap();
            seen.push(cmd);
            now = at.with_timezone(&Utc);
        }
        assert_eq!(
            seen,
            vec![
                InnerCommand::Backup,
                InnerCommand::OpenAccess,
                InnerCommand::Warn,
                InnerCommand::CloseAccess
            ]
        );
    }

    // ── timezone handling ─────────────────────────────────────────────────────

    #[test]
    fn uses_schedule_timezone() {
        let r = resolver(chrono_tz::Europe::Berlin, &[(Weekday::Mon, window((8, 0), (22, 0)))], &[]);
        // 06:00 UTC is 07:00 in Berlin (CET, UTC+1) in January.
        let (cmd, at) = r.next_event(utc(1, 6, 0)).unwrap();
        assert_eq!(cmd, InnerCommand::OpenAccess);
        assert_eq!(at.with_timezone(&Utc), utc(1, 7, 0));
    }

    #[test]
    fn local_day_differs_from_utc_day() {
        // 23:30 UTC Sunday is already Monday 08:30 in Tokyo.
        let r = resolver(chrono_tz::Asia::Tokyo, &[(Weekday::Mon, window((9, 0), (22, 0)))], &[]);
        let sunday_night = Utc.with_ymd_and_hms(2023, 12, 31, 23, 30, 0).unwrap();
        let (cmd, at) = r.next_event(sunday_night).unwrap();
        assert_eq!(cmd, InnerCommand::OpenAccess);
        assert_eq!(at.with_timezone(&Utc), utc(1, 0, 0));
    }

    // ── timer ─────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn timer_stops_on_signal() {
        let (tx, _rx) = mpsc::channel(4);
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(run(monday_resolver(), tx, stop_rx));
        stop_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("timer did not stop")
            .unwrap();
    }
}
