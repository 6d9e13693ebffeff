//! The process-wide tick: a pure function from the previous and current
//! instants to the list of datasets due this tick, per the redesign note
//! that the main loop should be a tickable unit with the sleep pushed to
//! the outer shell. Generalizes `zcrab::main::daemon`'s
//! sleep-then-iterate-datasets loop shape into a function with no I/O of
//! its own, so time-based behavior is testable without a real clock.

use chrono::{DateTime, Local, TimeZone, Utc};

use crate::config::{DatasetConfig, TimeSpec};

/// Whether `dataset` is due, given the instant of the previous tick (`None`
/// on the very first tick, which never fires a clock-based dataset) and the
/// current tick's instant. Trigger datasets are always reported due here;
/// the engine's `.trigger` file check decides whether the tick is a no-op.
pub fn is_due(dataset: &DatasetConfig, previous: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    match &dataset.time {
        TimeSpec::Trigger => true,
        TimeSpec::Clock(times) => {
            let Some(previous) = previous else { return false };
            if previous >= now {
                return false;
            }
            crosses_any(times, previous, now)
        }
    }
}

/// True if wall-clock time crosses any of `times` somewhere in
/// `(previous, now]`. Checks every local calendar day spanned by the
/// interval so a daemon pause longer than a day still coalesces into a
/// single firing, not one per missed day.
fn crosses_any(times: &[chrono::NaiveTime], previous: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    let previous_local = previous.with_timezone(&Local);
    let now_local = now.with_timezone(&Local);

    let mut date = previous_local.date_naive();
    let last_date = now_local.date_naive();
    loop {
        for time in times {
            let naive = date.and_time(*time);
            if let Some(candidate) = Local.from_local_datetime(&naive).single() {
                let candidate = candidate.with_timezone(&Utc);
                if candidate > previous && candidate <= now {
                    return true;
                }
            }
        }
        if date >= last_date {
            break;
        }
        date = date.succ_opt().expect("calendar date has a successor");
    }
    false
}

/// Run one tick: evaluate every dataset's due predicate in configured
/// order and return the ones due, preserving that order. Datasets are
/// dispatched to the execution engine sequentially by the caller, never
/// concurrently, per the bounded-tool-concurrency design.
pub fn tick<'a>(
    datasets: &'a [DatasetConfig],
    previous: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Vec<&'a DatasetConfig> {
    datasets.iter().filter(|d| is_due(d, previous, now)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::Endpoint;
    use crate::schema::Schema;
    use chrono::NaiveTime;
    use std::str::FromStr;

    fn dataset(name: &str, time: TimeSpec) -> DatasetConfig {
        DatasetConfig {
            name: name.to_string(),
            mountpoint: None,
            time,
            snapshot: true,
            schema: Schema::from_str("1d").unwrap(),
            local_schema: None,
            replication: None,
            endpoint: Endpoint::local(),
            compression: None,
            preexec: None,
            postexec: None,
            replicate_postexec: None,
            clean_all: false,
            local_clean_all: false,
            all_snapshots: true,
            log_commands: false,
        }
    }

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn trigger_dataset_is_always_due() {
        let d = dataset("tank/data", TimeSpec::Trigger);
        assert!(is_due(&d, None, utc(2024, 6, 15, 10, 30)));
    }

    #[test]
    fn clock_dataset_never_fires_on_first_tick() {
        let times = vec![NaiveTime::from_hms_opt(21, 0, 0).unwrap()];
        let d = dataset("tank/data", TimeSpec::Clock(times));
        assert!(!is_due(&d, None, utc(2024, 6, 15, 21, 0)));
    }

    #[test]
    fn clock_dataset_fires_when_crossed_since_previous_tick() {
        let times = vec![NaiveTime::from_hms_opt(21, 0, 0).unwrap()];
        let d = dataset("tank/data", TimeSpec::Clock(times));
        let previous = utc(2024, 6, 15, 20, 59);
        let now = utc(2024, 6, 15, 21, 1);
        assert!(is_due(&d, Some(previous), now));
    }

    #[test]
    fn clock_dataset_does_not_fire_twice_for_one_crossing() {
        let times = vec![NaiveTime::from_hms_opt(21, 0, 0).unwrap()];
        let d = dataset("tank/data", TimeSpec::Clock(times));
        let first_previous = utc(2024, 6, 15, 20, 59);
        let first_now = utc(2024, 6, 15, 21, 1);
        assert!(is_due(&d, Some(first_previous), first_now));
        let second_now = utc(2024, 6, 15, 21, 2);
        assert!(!is_due(&d, Some(first_now), second_now));
    }

    #[test]
    fn missed_ticks_coalesce_into_one_firing() {
        let times = vec![NaiveTime::from_hms_opt(21, 0, 0).unwrap()];
        let d = dataset("tank/data", TimeSpec::Clock(times));
        // daemon paused for three days; only one firing is reported
        let previous = utc(2024, 6, 12, 10, 0);
        let now = utc(2024, 6, 15, 10, 0);
        assert!(is_due(&d, Some(previous), now));
    }

    #[test]
    fn tick_preserves_configuration_order() {
        let times = vec![NaiveTime::from_hms_opt(21, 0, 0).unwrap()];
        let a = dataset("a", TimeSpec::Clock(times.clone()));
        let b = dataset("b", TimeSpec::Trigger);
        let c = dataset("c", TimeSpec::Clock(times));
        let datasets = vec![a, b, c];
        let previous = utc(2024, 6, 15, 20, 59);
        let now = utc(2024, 6, 15, 21, 1);
        let due = tick(&datasets, Some(previous), now);
        let names: Vec<&str> = due.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn boundary_tick_fires_exactly_once() {
        let times = vec![NaiveTime::from_hms_opt(21, 0, 0).unwrap()];
        let d = dataset("tank/data", TimeSpec::Clock(times));
        let previous = utc(2024, 6, 15, 20, 59);
        let now = utc(2024, 6, 15, 21, 0);
        assert!(is_due(&d, Some(previous), now));
    }
}
