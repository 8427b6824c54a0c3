//! Time-of-day schedule resolution.
//!
//! A [Schedule] maps times of day to shows. It repeats every day, so the entry that is
//! active just after midnight is the last entry of the previous day.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Days, LocalResult, NaiveDateTime, NaiveTime, TimeDelta, TimeZone};
use chrono_tz::Tz;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::error::{Error, Result};

/// Identifier of a show, as written in the channel file.
pub type ShowId = String;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleEntry {
    pub start: NaiveTime,
    pub show: ShowId,
}

impl ScheduleEntry {
    /// Parse an entry from an `HH:MM` (or `HH:MM:SS`) time of day.
    pub fn parse(start: &str, show: impl Into<ShowId>) -> Result<Self> {
        let start = NaiveTime::parse_from_str(start, "%H:%M")
            .or_else(|_| NaiveTime::parse_from_str(start, "%H:%M:%S"))
            .map_err(|e| Error::Config(format!("bad schedule time {start:?}: {e}")))?;

        Ok(Self {
            start,
            show: show.into(),
        })
    }
}

/// The show scheduled for a contiguous window of wall-clock time.
#[derive(Debug, Clone, PartialEq)]
pub struct Slot {
    pub show: ShowId,
    pub start: DateTime<Tz>,
    pub end: DateTime<Tz>,
}

impl Slot {
    /// Time left in this slot at `now`, clamped to zero.
    pub fn remaining(&self, now: &DateTime<Tz>) -> Duration {
        (self.end - *now).to_std().unwrap_or(Duration::ZERO)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Schedule {
    /// Sorted by start, one entry per distinct start time.
    entries: Vec<ScheduleEntry>,
}

impl Schedule {
    /// Build a schedule from entries in declaration order.
    ///
    /// When several entries share a start time, the one declared last wins.
    pub fn from_entries(entries: impl IntoIterator<Item = ScheduleEntry>) -> Self {
        let mut sorted: Vec<ScheduleEntry> = entries.into_iter().collect();
        // stable: equal starts keep declaration order
        sorted.sort_by_key(|entry| entry.start);

        let mut deduped: Vec<ScheduleEntry> = Vec::with_capacity(sorted.len());
        for entry in sorted {
            match deduped.last_mut() {
                Some(last) if last.start == entry.start => *last = entry,
                _ => deduped.push(entry),
            }
        }

        Self { entries: deduped }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[ScheduleEntry] {
        &self.entries
    }

    /// Find the slot active at `now`, or `None` for an empty schedule.
    pub fn resolve(&self, now: &DateTime<Tz>) -> Option<Slot> {
        if self.entries.is_empty() {
            return None;
        }

        let tz = now.timezone();
        let local = now.naive_local();
        let today = local.date();
        let time_of_day = local.time();

        let started = self
            .entries
            .partition_point(|entry| entry.start <= time_of_day);
        let (current, start_date) = if started == 0 {
            // Before the first entry of the day: still in yesterday's last slot.
            (self.entries.len() - 1, today.checked_sub_days(Days::new(1))?)
        } else {
            (started - 1, today)
        };

        let next = (current + 1) % self.entries.len();
        let end_date = if next <= current {
            start_date.checked_add_days(Days::new(1))?
        } else {
            start_date
        };

        // In the repeated hour after a DST fall back both boundaries have two
        // candidates: the slot starts at the latest one not after `now` and ends at
        // the earliest one after it.
        let (early, late) = localize(&tz, start_date.and_time(self.entries[current].start));
        let start = if late <= *now { late } else { early };
        let (early, late) = localize(&tz, end_date.and_time(self.entries[next].start));
        let end = if early > *now { early } else { late };

        Some(Slot {
            show: self.entries[current].show.clone(),
            start,
            end,
        })
    }
}

/// Map a local wall-clock time onto the time zone as its earliest and latest
/// instants. They differ only for ambiguous times (DST fall back). Times inside a DST
/// gap move forward to the first valid minute after it.
fn localize(tz: &Tz, naive: NaiveDateTime) -> (DateTime<Tz>, DateTime<Tz>) {
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(time) => return (time, time),
        LocalResult::Ambiguous(early, late) => return (early, late),
        LocalResult::None => {}
    }

    let shifted = (1..=180)
        .find_map(|minutes| {
            tz.from_local_datetime(&(naive + TimeDelta::minutes(minutes)))
                .earliest()
        })
        .unwrap_or_else(|| tz.from_utc_datetime(&naive));
    (shifted, shifted)
}

/// Re-resolves the schedule on a fixed interval and publishes slot changes.
///
/// The scheduler subscribes to the published slot and interrupts a running transcode
/// as soon as it changes.
pub struct ScheduleWatcher {
    schedule: Arc<Schedule>,
    clock: Arc<dyn Clock>,
    poll_interval: Duration,
}

impl ScheduleWatcher {
    pub fn new(schedule: Arc<Schedule>, clock: Arc<dyn Clock>, poll_interval: Duration) -> Self {
        Self {
            schedule,
            clock,
            poll_interval,
        }
    }

    /// Create the slot channel, seeded with the slot active right now.
    pub fn channel(&self) -> (watch::Sender<Option<Slot>>, watch::Receiver<Option<Slot>>) {
        watch::channel(self.schedule.resolve(&self.clock.now()))
    }

    pub async fn run(self, slots: watch::Sender<Option<Slot>>, cancel: CancellationToken) {
        let mut ticks = tokio::time::interval(self.poll_interval);
        ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("schedule watcher stopping");
                    return;
                }
                _ = ticks.tick() => {}
            }

            let resolved = self.schedule.resolve(&self.clock.now());
            slots.send_if_modified(|current| {
                if *current == resolved {
                    return false;
                }

                info!(
                    show = resolved.as_ref().map(|slot| slot.show.as_str()),
                    "schedule slot changed"
                );
                *current = resolved.clone();
                true
            });
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use chrono::{DateTime, NaiveDate, TimeZone};
    use chrono_tz::Tz;
    use tokio_util::sync::CancellationToken;

    use crate::clock::Clock;
    use crate::schedule::{Schedule, ScheduleEntry, ScheduleWatcher};

    fn at(tz: Tz, day: u32, hour: u32, minute: u32) -> DateTime<Tz> {
        tz.from_local_datetime(
            &NaiveDate::from_ymd_opt(2024, 3, day)
                .unwrap()
                .and_hms_opt(hour, minute, 0)
                .unwrap(),
        )
        .unwrap()
    }

    fn schedule(entries: &[(&str, &str)]) -> Schedule {
        Schedule::from_entries(
            entries
                .iter()
                .map(|(start, show)| ScheduleEntry::parse(start, *show).unwrap()),
        )
    }

    #[test]
    pub fn test_empty_schedule() {
        let sched = schedule(&[]);
        assert!(sched.resolve(&at(chrono_tz::UTC, 4, 12, 0)).is_none());
    }

    #[test]
    pub fn test_overnight_wraparound() {
        let sched = schedule(&[("18:00", "evening"), ("07:00", "morning")]);
        let utc = chrono_tz::UTC;

        let late = sched.resolve(&at(utc, 4, 23, 30)).unwrap();
        assert_eq!(late.show, "evening");
        assert_eq!(late.start, at(utc, 4, 18, 0));
        assert_eq!(late.end, at(utc, 5, 7, 0));

        let early = sched.resolve(&at(utc, 5, 6, 0)).unwrap();
        assert_eq!(early.show, "evening");
        assert_eq!(early.start, at(utc, 4, 18, 0));
        assert_eq!(early.end, at(utc, 5, 7, 0));
        assert_eq!(early.remaining(&at(utc, 5, 6, 0)), Duration::from_secs(3600));

        let day = sched.resolve(&at(utc, 5, 7, 0)).unwrap();
        assert_eq!(day.show, "morning");
        assert_eq!(day.end, at(utc, 5, 18, 0));
    }

    #[test]
    pub fn test_slot_boundaries() {
        let sched = schedule(&[("09:00", "A"), ("12:00", "B")]);
        let utc = chrono_tz::UTC;

        let a = sched.resolve(&at(utc, 4, 9, 0)).unwrap();
        assert_eq!(a.show, "A");
        assert_eq!(a.remaining(&at(utc, 4, 9, 0)), Duration::from_secs(10800));

        let b = sched.resolve(&at(utc, 4, 12, 0)).unwrap();
        assert_eq!(b.show, "B");
        assert_eq!(b.end, at(utc, 5, 9, 0));
    }

    #[test]
    pub fn test_single_entry_covers_the_day() {
        let sched = schedule(&[("06:00", "only")]);
        let utc = chrono_tz::UTC;

        let slot = sched.resolve(&at(utc, 4, 3, 0)).unwrap();
        assert_eq!(slot.show, "only");
        assert_eq!(slot.start, at(utc, 3, 6, 0));
        assert_eq!(slot.end, at(utc, 4, 6, 0));
    }

    #[test]
    pub fn test_last_declared_wins_on_tie() {
        let sched = schedule(&[("10:00", "first"), ("20:00", "other"), ("10:00", "second")]);
        assert_eq!(sched.entries().len(), 2);

        let slot = sched.resolve(&at(chrono_tz::UTC, 4, 11, 0)).unwrap();
        assert_eq!(slot.show, "second");
        assert_eq!(slot.end, at(chrono_tz::UTC, 4, 20, 0));
    }

    #[test]
    pub fn test_resolve_is_idempotent() {
        let sched = schedule(&[("00:00", "a"), ("08:15", "b"), ("16:45", "c")]);
        let now = at(chrono_tz::UTC, 4, 16, 44);

        let first = sched.resolve(&now);
        for _ in 0..10 {
            assert_eq!(sched.resolve(&now), first);
        }
        assert_eq!(first.unwrap().show, "b");
    }

    #[test]
    pub fn test_every_minute_has_one_slot() {
        let sched = schedule(&[("23:30", "late"), ("05:00", "early"), ("13:20", "noon")]);
        let utc = chrono_tz::UTC;

        for minute in 0..(24 * 60) {
            let now = at(utc, 4, minute / 60, minute % 60);
            let slot = sched.resolve(&now).unwrap();
            assert!(slot.start <= now, "start after now at minute {minute}");
            assert!(slot.end > now, "end not after now at minute {minute}");
        }
    }

    #[test]
    pub fn test_dst_gap_remaining_is_positive() {
        // Europe/Berlin skips 02:00-03:00 on 2024-03-31.
        let berlin: Tz = "Europe/Berlin".parse().unwrap();
        let sched = schedule(&[("22:00", "night"), ("02:30", "gap")]);

        let now = at(berlin, 31, 1, 30);
        let slot = sched.resolve(&now).unwrap();
        assert_eq!(slot.show, "night");
        assert_eq!(slot.end, at(berlin, 31, 3, 0));
        assert!(slot.remaining(&now) > Duration::ZERO);
    }

    #[test]
    pub fn test_dst_fallback_slot_contains_now() {
        // Europe/Berlin repeats 02:00-03:00 on 2024-10-27.
        let berlin: Tz = "Europe/Berlin".parse().unwrap();
        let sched = schedule(&[("02:00", "x"), ("02:30", "y")]);
        let quarter_past = NaiveDate::from_ymd_opt(2024, 10, 27)
            .unwrap()
            .and_hms_opt(2, 15, 0)
            .unwrap();
        let half_past = quarter_past + chrono::TimeDelta::minutes(15);

        let first = berlin.from_local_datetime(&quarter_past).earliest().unwrap();
        let second = berlin.from_local_datetime(&quarter_past).latest().unwrap();
        assert!(first < second);

        let slot = sched.resolve(&first).unwrap();
        assert_eq!(slot.show, "x");
        assert!(slot.start <= first);
        assert_eq!(slot.end, berlin.from_local_datetime(&half_past).earliest().unwrap());
        assert_eq!(slot.remaining(&first), Duration::from_secs(15 * 60));

        let slot = sched.resolve(&second).unwrap();
        assert_eq!(slot.show, "x");
        assert!(slot.start <= second);
        assert_eq!(slot.end, berlin.from_local_datetime(&half_past).latest().unwrap());
        assert_eq!(slot.remaining(&second), Duration::from_secs(15 * 60));
    }

    #[test]
    pub fn test_parse_rejects_garbage() {
        assert!(ScheduleEntry::parse("25:00", "x").is_err());
        assert!(ScheduleEntry::parse("noon", "x").is_err());
        assert_eq!(
            ScheduleEntry::parse("07:05:30", "x").unwrap().start,
            chrono::NaiveTime::from_hms_opt(7, 5, 30).unwrap()
        );
    }

    struct ManualClock(Mutex<DateTime<Tz>>);

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Tz> {
            *self.0.lock().unwrap()
        }
    }

    #[tokio::test(start_paused = true)]
    pub async fn test_watcher_publishes_changes() {
        let utc = chrono_tz::UTC;
        let clock = Arc::new(ManualClock(Mutex::new(at(utc, 4, 11, 59))));
        let watcher = ScheduleWatcher::new(
            Arc::new(schedule(&[("09:00", "A"), ("12:00", "B")])),
            clock.clone(),
            Duration::from_secs(30),
        );

        let (tx, mut rx) = watcher.channel();
        assert_eq!(rx.borrow_and_update().as_ref().unwrap().show, "A");

        let cancel = CancellationToken::new();
        let task = tokio::spawn(watcher.run(tx, cancel.clone()));

        *clock.0.lock().unwrap() = at(utc, 4, 12, 0);
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().as_ref().unwrap().show, "B");

        cancel.cancel();
        task.await.unwrap();
    }
}
