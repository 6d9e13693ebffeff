//! Monotonic-enough wall-clock helpers shared by the scheduler and the
//! retention planner. Everything here is a pure function of an explicit
//! instant so tests never depend on the process's timezone or the real
//! clock, following `zcrab::zfs::parse_datetime`'s use of `chrono` for this
//! purpose.

use chrono::{DateTime, Datelike, Duration, Local, TimeZone, Timelike, Utc};

/// The reference "now" used for a single scheduler tick, snapped to whole
/// minutes so a clock tie between snapshotting and aging is deterministic.
pub fn floor_to_minute(now: DateTime<Utc>) -> DateTime<Utc> {
    now - Duration::seconds(now.second() as i64) - Duration::nanoseconds(now.timestamp_subsec_nanos() as i64)
}

/// Midnight of the local calendar day containing `now`, expressed in UTC.
pub fn local_midnight(now: DateTime<Utc>) -> DateTime<Utc> {
    let local = now.with_timezone(&Local);
    let midnight_naive = local.date_naive().and_hms_opt(0, 0, 0).expect("valid midnight");
    Local
        .from_local_datetime(&midnight_naive)
        .single()
        .unwrap_or(local)
        .with_timezone(&Utc)
}

/// Format a newly taken snapshot's name: `YYYYMMDDHHMM`, local time.
pub fn format_snapshot_name(when: DateTime<Utc>) -> String {
    when.with_timezone(&Local).format("%Y%m%d%H%M").to_string()
}

/// The two naming conventions recognized as "managed".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameForm {
    /// `YYYYMMDDHHMM`, minute resolution.
    Long,
    /// `YYYYMMDD`, day resolution (legacy).
    Legacy,
}

/// Parse a snapshot's bare name (the part after `@`) against the two
/// managed conventions. Returns `None` for foreign names.
pub fn parse_snapshot_name(name: &str) -> Option<(DateTime<Utc>, NameForm)> {
    if name.len() == 12 && name.bytes().all(|b| b.is_ascii_digit()) {
        let naive = chrono::NaiveDateTime::parse_from_str(name, "%Y%m%d%H%M").ok()?;
        let dt = Local.from_local_datetime(&naive).single()?;
        return Some((dt.with_timezone(&Utc), NameForm::Long));
    }
    if name.len() == 8 && name.bytes().all(|b| b.is_ascii_digit()) {
        let naive = chrono::NaiveDate::parse_from_str(name, "%Y%m%d")
            .ok()?
            .and_hms_opt(0, 0, 0)?;
        let dt = Local.from_local_datetime(&naive).single()?;
        return Some((dt.with_timezone(&Utc), NameForm::Legacy));
    }
    None
}

/// True if `name` matches either managed convention.
pub fn is_managed_name(name: &str) -> bool {
    parse_snapshot_name(name).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn floor_drops_seconds_and_subseconds() {
        let t = Utc.with_ymd_and_hms(2024, 6, 15, 10, 30, 59).unwrap();
        let floored = floor_to_minute(t);
        assert_eq!(floored.second(), 0);
        assert_eq!(floored.minute(), 30);
    }

    #[test]
    fn round_trip_long_name() {
        let when = Local.with_ymd_and_hms(2024, 1, 2, 21, 0, 0).unwrap().with_timezone(&Utc);
        let name = format_snapshot_name(when);
        assert_eq!(name, "202401022100");
        let (parsed, form) = parse_snapshot_name(&name).unwrap();
        assert_eq!(form, NameForm::Long);
        assert_eq!(format_snapshot_name(parsed), name);
    }

    #[test]
    fn legacy_name_parses_at_day_resolution() {
        let (parsed, form) = parse_snapshot_name("20240615").unwrap();
        assert_eq!(form, NameForm::Legacy);
        assert_eq!(parsed.with_timezone(&Local).hour(), 0);
    }

    #[test]
    fn foreign_names_are_not_managed() {
        assert!(!is_managed_name("manual-before-migration"));
        assert!(!is_managed_name("2024-06-15"));
        assert!(!is_managed_name("2024061510300")); // 13 digits
    }
}
