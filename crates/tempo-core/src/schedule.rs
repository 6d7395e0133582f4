use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::timezone::local_to_utc;

/// Defines when and how often a recurring job should run.
///
/// `Daily` and `Weekly` are wall-clock times in the job's own timezone, so a
/// 09:00 job in `America/New_York` keeps firing at 09:00 local across DST.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Schedule {
    /// Run exactly once at the given UTC instant.
    Once { at: DateTime<Utc> },

    /// Run repeatedly with a fixed interval in seconds.
    Interval { every_secs: u64 },

    /// Run every day at HH:MM local time.
    Daily { hour: u8, minute: u8 },

    /// Run on a weekday (0 = Monday … 6 = Sunday) at HH:MM local time.
    Weekly { day: u8, hour: u8, minute: u8 },
}

impl Schedule {
    /// Range checks for the wall-clock fields.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Schedule::Once { .. } => Ok(()),
            Schedule::Interval { every_secs } if *every_secs == 0 => {
                Err("interval must be at least one second".to_string())
            }
            Schedule::Interval { every_secs } => interval(*every_secs)
                .map(|_| ())
                .ok_or_else(|| format!("interval of {every_secs}s is too large")),
            Schedule::Daily { hour, minute } => wall_clock(*hour, *minute).map(|_| ()),
            Schedule::Weekly { day, hour, minute } => {
                if *day > 6 {
                    return Err(format!("weekday {day} out of range 0..=6"));
                }
                wall_clock(*hour, *minute).map(|_| ())
            }
        }
    }
}

/// Compute the next UTC execution time for `schedule` in `tz`, strictly after `from`.
///
/// Returns `None` when the schedule is exhausted (a `Once` whose instant has
/// passed) or its fields are out of range.
pub fn compute_next_run(schedule: &Schedule, tz: Tz, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match schedule {
        Schedule::Once { at } => (*at > from).then_some(*at),

        Schedule::Interval { every_secs } => {
            if *every_secs == 0 {
                return None;
            }
            from.checked_add_signed(interval(*every_secs)?)
        }

        Schedule::Daily { hour, minute } => {
            let time = wall_clock(*hour, *minute).ok()?;
            let today = from.with_timezone(&tz).date_naive();
            // Two days covers every case: today's slot or tomorrow's.
            (0..=1)
                .map(|offset| at_local(tz, today + Duration::days(offset), time))
                .find(|candidate| *candidate > from)
        }

        Schedule::Weekly { day, hour, minute } => {
            if *day > 6 {
                return None;
            }
            let time = wall_clock(*hour, *minute).ok()?;
            let today = from.with_timezone(&tz).date_naive();
            (0..=7)
                .map(|offset| today + Duration::days(offset))
                .filter(|d| d.weekday().num_days_from_monday() == u32::from(*day))
                .map(|d| at_local(tz, d, time))
                .find(|candidate| *candidate > from)
        }
    }
}

// ---- private helpers ----

/// Longest interval a schedule may use (100 years).
const MAX_INTERVAL_SECS: u64 = 100 * 366 * 24 * 60 * 60;

fn interval(every_secs: u64) -> Option<Duration> {
    if every_secs > MAX_INTERVAL_SECS {
        return None;
    }
    Duration::try_seconds(i64::try_from(every_secs).ok()?)
}

fn wall_clock(hour: u8, minute: u8) -> Result<NaiveTime, String> {
    NaiveTime::from_hms_opt(u32::from(hour), u32::from(minute), 0)
        .ok_or_else(|| format!("invalid time {hour:02}:{minute:02}"))
}

fn at_local(tz: Tz, date: NaiveDate, time: NaiveTime) -> DateTime<Utc> {
    local_to_utc(tz, date.and_time(time))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[test]
    fn daily_follows_local_clock_across_spring_forward() {
        let ny: Tz = "America/New_York".parse().unwrap();
        let sched = Schedule::Daily { hour: 9, minute: 0 };

        // After Saturday's 09:00 EST run, the next one is Sunday 09:00 EDT.
        let next = compute_next_run(&sched, ny, utc("2024-03-09T14:00:00Z")).unwrap();
        assert_eq!(next, utc("2024-03-10T13:00:00Z"));
    }

    #[test]
    fn daily_same_day_when_slot_is_ahead() {
        let sched = Schedule::Daily { hour: 18, minute: 30 };
        let next = compute_next_run(&sched, Tz::UTC, utc("2024-05-01T10:00:00Z")).unwrap();
        assert_eq!(next, utc("2024-05-01T18:30:00Z"));
    }

    #[test]
    fn weekly_picks_the_next_matching_weekday() {
        // 2024-05-01 is a Wednesday; ask for Monday 08:00 in Berlin (CEST, UTC+2).
        let berlin: Tz = "Europe/Berlin".parse().unwrap();
        let sched = Schedule::Weekly { day: 0, hour: 8, minute: 0 };
        let next = compute_next_run(&sched, berlin, utc("2024-05-01T12:00:00Z")).unwrap();
        assert_eq!(next, utc("2024-05-06T06:00:00Z"));
    }

    #[test]
    fn weekly_same_weekday_after_slot_rolls_a_week() {
        let sched = Schedule::Weekly { day: 2, hour: 9, minute: 0 };
        let next = compute_next_run(&sched, Tz::UTC, utc("2024-05-01T12:00:00Z")).unwrap();
        assert_eq!(next, utc("2024-05-08T09:00:00Z"));
    }

    #[test]
    fn once_in_the_past_is_exhausted() {
        let sched = Schedule::Once {
            at: utc("2024-01-01T00:00:00Z"),
        };
        assert!(compute_next_run(&sched, Tz::UTC, utc("2024-02-01T00:00:00Z")).is_none());
    }

    #[test]
    fn huge_interval_is_invalid_and_never_fires() {
        let sched = Schedule::Interval {
            every_secs: 10_000_000_000_000_000,
        };
        assert!(sched.validate().is_err());
        assert!(compute_next_run(&sched, Tz::UTC, utc("2024-05-01T00:00:00Z")).is_none());

        let max = Schedule::Interval { every_secs: u64::MAX };
        assert!(max.validate().is_err());
        assert!(compute_next_run(&max, Tz::UTC, utc("2024-05-01T00:00:00Z")).is_none());
    }

    #[test]
    fn out_of_range_fields_are_rejected() {
        assert!(Schedule::Daily { hour: 24, minute: 0 }.validate().is_err());
        assert!(Schedule::Weekly { day: 7, hour: 1, minute: 0 }.validate().is_err());
        assert!(Schedule::Interval { every_secs: 0 }.validate().is_err());
        assert!(Schedule::Interval { every_secs: 60 }.validate().is_ok());
    }
}
