// Property-based tests for cron schedule evaluation

use chrono::{DateTime, Duration, TimeZone, Timelike, Utc};
use common::config::Settings;
use common::schedule::{normalize_cron_expression, parse_cron_expression, CronTrigger};
use proptest::prelude::*;

fn reference_time() -> impl Strategy<Value = DateTime<Utc>> {
    // 2020-01-01 .. 2030-01-01
    (1_577_836_800i64..1_893_456_000i64).prop_map(|secs| Utc.timestamp_opt(secs, 0).unwrap())
}

/// **Property: hourly schedules fire on the next hour boundary**
///
/// *For any* reference instant, `0 * * * *` fires at minute 0 strictly after it,
/// no more than one hour later.
#[test]
fn property_hourly_next_fire() {
    proptest!(|(reference in reference_time())| {
        let trigger = CronTrigger::with_timezone_name("0 * * * *", "UTC").unwrap();
        let next = trigger.next_after(reference).unwrap();

        prop_assert!(next > reference);
        prop_assert!(next - reference <= Duration::hours(1));
        prop_assert_eq!(next.minute(), 0);
        prop_assert_eq!(next.second(), 0);
    });
}

/// **Property: every-N-minutes schedules count missed intervals exactly**
///
/// *For any* step N dividing 60 and window of K*N minutes starting on a fire
/// time, exactly K fire times fall inside the window.
#[test]
fn property_missed_intervals_counted() {
    proptest!(|(
        step in prop::sample::select(vec![1u32, 5, 10, 15, 20, 30]),
        intervals in 0i64..48,
        hour in 0u32..24
    )| {
        let trigger = CronTrigger::with_timezone_name(&format!("*/{} * * * *", step), "UTC").unwrap();
        let start = Utc.with_ymd_and_hms(2024, 3, 1, hour, 0, 0).unwrap();
        let end = start + Duration::minutes(intervals * step as i64);

        prop_assert_eq!(trigger.fires_between(start, end), intervals as usize);
    });
}

/// **Property: five-field expressions gain a zero seconds field**
#[test]
fn property_five_field_normalization() {
    proptest!(|(
        minute in 0u32..60,
        hour in 0u32..24
    )| {
        let expression = format!("{} {} * * *", minute, hour);
        prop_assert_eq!(
            normalize_cron_expression(&expression),
            format!("0 {} {} * * *", minute, hour)
        );
        prop_assert!(parse_cron_expression(&expression).is_ok());
    });
}

/// **Property: malformed field counts are rejected**
#[test]
fn property_wrong_field_count_rejected() {
    proptest!(|(fields in prop::sample::select(vec![1usize, 2, 3, 4, 8, 9]))| {
        let expression = vec!["*"; fields].join(" ");
        prop_assert!(parse_cron_expression(&expression).is_err());
    });
}

#[test]
fn test_default_schedule_is_hourly() {
    let settings = Settings::default();
    let trigger =
        CronTrigger::with_timezone_name(&settings.schedule.cron, &settings.schedule.timezone)
            .unwrap();
    let reference = Utc.with_ymd_and_hms(2024, 3, 1, 10, 30, 0).unwrap();
    assert_eq!(
        trigger.next_after(reference),
        Some(Utc.with_ymd_and_hms(2024, 3, 1, 11, 0, 0).unwrap())
    );
}
