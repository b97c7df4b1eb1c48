//! Source-local wall clock → UTC using the upstream's named IANA zone.
//!
//! A fixed numeric offset is wrong for half the year, so the zone rules
//! (`chrono-tz`) decide the offset for each timestamp.

use chrono::{DateTime, LocalResult, NaiveDateTime, TimeDelta, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

use crate::error::{Error, Result};

/// Longest DST gap we are prepared to skip over, in minutes.
const MAX_GAP_MINUTES: u32 = 180;

pub fn parse_zone(name: &str) -> Result<Tz> {
    name.trim()
        .parse::<Tz>()
        .map_err(|e| Error::Timezone(format!("unknown timezone {:?}: {}", name, e)))
}

/// Convert a source-local timestamp to UTC.
///
/// - ambiguous (fall-back overlap): the earlier instant;
/// - nonexistent (spring-forward gap): the first valid local minute after
///   the gap, so converted events stay ordered relative to their neighbours.
pub fn source_local_to_utc(local: NaiveDateTime, zone: Tz) -> Result<DateTime<Utc>> {
    match zone.from_local_datetime(&local) {
        LocalResult::Single(dt) => Ok(dt.with_timezone(&Utc)),
        LocalResult::Ambiguous(earliest, _) => Ok(earliest.with_timezone(&Utc)),
        LocalResult::None => first_valid_after_gap(local, zone),
    }
}

fn first_valid_after_gap(local: NaiveDateTime, zone: Tz) -> Result<DateTime<Utc>> {
    let mut candidate = local
        .with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(local);
    for _ in 0..MAX_GAP_MINUTES {
        candidate += TimeDelta::minutes(1);
        if let Some(dt) = zone.from_local_datetime(&candidate).earliest() {
            return Ok(dt.with_timezone(&Utc));
        }
    }
    Err(Error::Timezone(format!(
        "{} does not exist in {} and no valid time follows within {} minutes",
        local, zone, MAX_GAP_MINUTES
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
    }

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_standard_time_offset() {
        let zone = parse_zone("America/Chicago").unwrap();
        let got = source_local_to_utc(local("2026-02-26 03:22:12"), zone).unwrap();
        assert_eq!(got, utc("2026-02-26T09:22:12Z"));
    }

    #[test]
    fn test_daylight_time_offset() {
        let zone = parse_zone("America/Chicago").unwrap();
        let got = source_local_to_utc(local("2026-07-04 12:00:00"), zone).unwrap();
        assert_eq!(got, utc("2026-07-04T17:00:00Z"));
    }

    #[test]
    fn test_spring_forward_gap_is_monotonic() {
        // 2026-03-08: Chicago skips 02:00-03:00 local.
        let zone = parse_zone("America/Chicago").unwrap();
        let before = source_local_to_utc(local("2026-03-08 01:59:30"), zone).unwrap();
        let inside = source_local_to_utc(local("2026-03-08 02:30:12"), zone).unwrap();
        let after = source_local_to_utc(local("2026-03-08 03:00:05"), zone).unwrap();

        assert_eq!(before, utc("2026-03-08T07:59:30Z"));
        assert_eq!(inside, utc("2026-03-08T08:00:00Z"));
        assert_eq!(after, utc("2026-03-08T08:00:05Z"));
        assert!(before < inside && inside < after);
    }

    #[test]
    fn test_fall_back_overlap_takes_earlier_instant() {
        // 2026-11-01: 01:00-02:00 local happens twice.
        let zone = parse_zone("America/Chicago").unwrap();
        let got = source_local_to_utc(local("2026-11-01 01:30:00"), zone).unwrap();
        assert_eq!(got, utc("2026-11-01T06:30:00Z"));
    }

    #[test]
    fn test_unknown_zone_is_rejected() {
        assert!(parse_zone("Mars/Olympus_Mons").is_err());
    }
}
