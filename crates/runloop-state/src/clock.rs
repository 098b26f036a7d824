use chrono::{DateTime, SecondsFormat, Utc};
use std::sync::Mutex;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to. Tests and replays inject it so
/// executor output is reproducible.
#[derive(Debug)]
pub struct ManualClock {
    current: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            current: Mutex::new(start),
        }
    }

    pub fn from_millis(epoch_ms: i64) -> Self {
        Self::new(DateTime::from_timestamp_millis(epoch_ms).unwrap_or_default())
    }

    pub fn advance_ms(&self, ms: i64) {
        let mut guard = self.current.lock().expect("manual clock mutex poisoned");
        *guard += chrono::Duration::milliseconds(ms);
    }

    pub fn set(&self, value: DateTime<Utc>) {
        *self.current.lock().expect("manual clock mutex poisoned") = value;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.current.lock().expect("manual clock mutex poisoned")
    }
}

pub fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|parsed| parsed.with_timezone(&Utc))
}

/// Returns a timestamp strictly after `previous`. When the wall clock has not
/// advanced past `previous` (same millisecond, or skew), the result is
/// `previous + 1ms`.
pub fn next_timestamp(previous: &str, now: DateTime<Utc>) -> String {
    let now_ms = now.timestamp_millis();
    let next_ms = match parse_timestamp(previous) {
        Some(previous) => now_ms.max(previous.timestamp_millis() + 1),
        None => now_ms,
    };
    DateTime::from_timestamp_millis(next_ms)
        .map(format_timestamp)
        .unwrap_or_else(|| format_timestamp(now))
}

/// Whole milliseconds between two stamps, zero when either is unparsable or
/// `to` precedes `from`.
pub fn elapsed_ms(from: &str, to: DateTime<Utc>) -> u64 {
    parse_timestamp(from)
        .map(|from| (to - from).num_milliseconds().max(0) as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_timestamp_clock_ahead_expected_wall_clock_value() {
        let clock = ManualClock::from_millis(1_700_000_000_000);
        let previous = format_timestamp(clock.now());
        clock.advance_ms(250);

        let next = next_timestamp(&previous, clock.now());
        assert_eq!(next, format_timestamp(clock.now()));
    }

    #[test]
    fn next_timestamp_clock_stalled_expected_one_millisecond_bump() {
        let clock = ManualClock::from_millis(1_700_000_000_000);
        let previous = format_timestamp(clock.now());

        let next = next_timestamp(&previous, clock.now());
        let previous_ms = parse_timestamp(&previous).expect("parse").timestamp_millis();
        let next_ms = parse_timestamp(&next).expect("parse").timestamp_millis();
        assert_eq!(next_ms, previous_ms + 1);
    }

    #[test]
    fn next_timestamp_clock_behind_expected_still_increasing() {
        let clock = ManualClock::from_millis(1_700_000_000_000);
        let previous = "2030-01-01T00:00:00.000Z";

        let next = next_timestamp(previous, clock.now());
        assert_eq!(next, "2030-01-01T00:00:00.001Z");
    }

    #[test]
    fn next_timestamp_unparsable_previous_expected_now() {
        let clock = ManualClock::from_millis(0);
        assert_eq!(
            next_timestamp("not-a-date", clock.now()),
            "1970-01-01T00:00:00.000Z"
        );
    }

    #[test]
    fn elapsed_ms_expected_difference_or_zero() {
        let clock = ManualClock::from_millis(10_000);
        let start = format_timestamp(clock.now());
        clock.advance_ms(1_500);
        assert_eq!(elapsed_ms(&start, clock.now()), 1_500);
        assert_eq!(elapsed_ms("garbage", clock.now()), 0);
    }
}
