//! IANA timezone resolution.
//!
//! Wall-clock times are converted to UTC deadlines with two fixed rules for
//! daylight-saving edges:
//!
//! - a time that does not exist (spring-forward gap) is shifted forward by
//!   the length of the gap, so 02:30 on a New York spring-forward day runs
//!   at 03:30 EDT;
//! - a time that occurs twice (fall-back overlap) resolves to the earlier
//!   instant.

use chrono::{DateTime, Duration, LocalResult, NaiveDateTime, Offset, TimeZone, Utc};
use chrono_tz::Tz;

use crate::error::{Result, TempoError};

/// Parse an IANA identifier such as `"America/New_York"`.
pub fn parse_tz(name: &str) -> Result<Tz> {
    name.parse::<Tz>()
        .map_err(|_| TempoError::config(format!("unknown timezone '{name}'")))
}

/// Convert a wall-clock time in `tz` to the UTC instant it denotes.
pub fn local_to_utc(tz: Tz, local: NaiveDateTime) -> DateTime<Utc> {
    match tz.from_local_datetime(&local) {
        LocalResult::Single(dt) => dt.with_timezone(&Utc),
        LocalResult::Ambiguous(a, b) => a.min(b).with_timezone(&Utc),
        LocalResult::None => {
            // Apply the offset in force just before the gap.
            let before = tz
                .offset_from_utc_datetime(&(local - Duration::days(1)))
                .fix();
            let naive_utc = local - Duration::seconds(i64::from(before.local_minus_utc()));
            Utc.from_utc_datetime(&naive_utc)
        }
    }
}

/// Resolve `local` in the zone named `tz_name`.
pub fn resolve_local(tz_name: &str, local: NaiveDateTime) -> Result<DateTime<Utc>> {
    Ok(local_to_utc(parse_tz(tz_name)?, local))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn local(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, 0)
            .unwrap()
    }

    fn utc(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[test]
    fn nine_am_new_york_before_and_after_spring_forward() {
        let ny = parse_tz("America/New_York").unwrap();
        // Saturday: still EST (UTC-5).
        assert_eq!(
            local_to_utc(ny, local(2024, 3, 9, 9, 0)),
            utc("2024-03-09T14:00:00Z")
        );
        // Sunday: clocks jumped at 02:00, now EDT (UTC-4).
        assert_eq!(
            local_to_utc(ny, local(2024, 3, 10, 9, 0)),
            utc("2024-03-10T13:00:00Z")
        );
    }

    #[test]
    fn gap_time_is_shifted_forward_by_the_gap() {
        let ny = parse_tz("America/New_York").unwrap();
        // 02:30 does not exist on 2024-03-10; runs at 03:30 EDT.
        assert_eq!(
            local_to_utc(ny, local(2024, 3, 10, 2, 30)),
            utc("2024-03-10T07:30:00Z")
        );
    }

    #[test]
    fn ambiguous_time_takes_the_earlier_instant() {
        let ny = parse_tz("America/New_York").unwrap();
        // 01:30 happens twice on 2024-11-03; the first is EDT.
        assert_eq!(
            local_to_utc(ny, local(2024, 11, 3, 1, 30)),
            utc("2024-11-03T05:30:00Z")
        );
    }

    #[test]
    fn southern_hemisphere_and_fractional_offsets() {
        let sydney = parse_tz("Australia/Sydney").unwrap();
        // AEDT (UTC+11) in January.
        assert_eq!(
            local_to_utc(sydney, local(2024, 1, 15, 9, 0)),
            utc("2024-01-14T22:00:00Z")
        );
        let kolkata = parse_tz("Asia/Kolkata").unwrap();
        assert_eq!(
            local_to_utc(kolkata, local(2024, 6, 1, 9, 0)),
            utc("2024-06-01T03:30:00Z")
        );
    }

    #[test]
    fn unknown_zone_is_a_configuration_error() {
        let err = parse_tz("Mars/Olympus_Mons").unwrap_err();
        assert_eq!(err.code(), "CONFIGURATION_ERROR");
    }
}
