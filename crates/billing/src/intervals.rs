//! Billing / reset interval math
//!
//! Calendar arithmetic over epoch-millisecond timestamps, matching the
//! payment provider's anchor behaviour: adding months to a Jan 31 anchor
//! lands on Feb 28/29, then snaps back to the 31st in months that have one.

use autumn_shared::{BillingIntervalKind, IntervalConfig, IntervalOrOneOff, Price, ResetInterval};
use time::{Date, Duration, Month, OffsetDateTime};

/// Epoch ms to a UTC datetime; out-of-range values clamp to the epoch
pub fn ms_to_datetime(ms: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp_nanos(ms as i128 * 1_000_000)
        .unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

pub fn datetime_to_ms(dt: OffsetDateTime) -> i64 {
    (dt.unix_timestamp_nanos() / 1_000_000) as i64
}

/// Current wall-clock time in epoch ms
pub fn now_ms() -> i64 {
    datetime_to_ms(OffsetDateTime::now_utc())
}

fn months_for(interval: ResetInterval) -> Option<i32> {
    match interval {
        ResetInterval::Month => Some(1),
        ResetInterval::Quarter => Some(3),
        ResetInterval::SemiAnnual => Some(6),
        ResetInterval::Year => Some(12),
        ResetInterval::Day | ResetInterval::Week => None,
    }
}

/// Add whole months, snapping the day-of-month to `anchor_day` where the
/// target month is long enough, else to the month's last day
fn add_months(dt: OffsetDateTime, months: i32, anchor_day: u8) -> OffsetDateTime {
    let total = dt.year() * 12 + (u8::from(dt.month()) as i32 - 1) + months;
    let year = total.div_euclid(12);
    let month_index = total.rem_euclid(12) as u8 + 1;
    let month = Month::try_from(month_index).unwrap_or(Month::January);

    let last_day = month.length(year);
    let day = anchor_day.min(last_day);

    let date = Date::from_calendar_date(year, month, day).unwrap_or(dt.date());
    dt.replace_date(date)
}

/// Add `n x interval` to a timestamp. For month-based intervals the
/// day-of-month comes from `anchor_ms` when supplied (the provider's
/// billing-cycle anchor), else from the timestamp itself.
pub fn add_interval(ts_ms: i64, config: IntervalConfig, anchor_ms: Option<i64>) -> i64 {
    add_interval_signed(ts_ms, config, anchor_ms, 1)
}

/// Subtract `n x interval` from a timestamp, same anchor rules
pub fn subtract_interval(ts_ms: i64, config: IntervalConfig, anchor_ms: Option<i64>) -> i64 {
    add_interval_signed(ts_ms, config, anchor_ms, -1)
}

fn add_interval_signed(
    ts_ms: i64,
    config: IntervalConfig,
    anchor_ms: Option<i64>,
    sign: i32,
) -> i64 {
    let dt = ms_to_datetime(ts_ms);
    let count = config.count.max(1) as i64 * sign as i64;

    match config.interval {
        ResetInterval::Day => datetime_to_ms(dt + Duration::days(count)),
        ResetInterval::Week => datetime_to_ms(dt + Duration::weeks(count)),
        _ => {
            let months = months_for(config.interval).unwrap_or(1) as i64 * count;
            let anchor_day = anchor_ms.map(|a| ms_to_datetime(a).day()).unwrap_or(dt.day());
            datetime_to_ms(add_months(dt, months as i32, anchor_day))
        }
    }
}

/// Next reset boundary for an entitlement. Lifetime entitlements
/// (`interval = None`) never reset.
pub fn next_reset(
    current_reset_at: i64,
    interval: Option<IntervalConfig>,
    anchor_ms: Option<i64>,
) -> Option<i64> {
    interval.map(|config| add_interval(current_reset_at, config, anchor_ms))
}

/// The product's billing interval: the largest recurring interval among its
/// prices, or one-off when no price recurs
pub fn primary_billing_interval(prices: &[Price]) -> IntervalOrOneOff {
    prices
        .iter()
        .map(|p| p.config.interval())
        .max_by_key(|i| i.interval.approx_days() as u64 * i.count as u64)
        .unwrap_or(IntervalOrOneOff {
            interval: BillingIntervalKind::OneOff,
            count: 1,
        })
}
