//! Protobuf ↔ domain conversions for scalar wire types
//!
//! Broker messages carry timestamps as `int64` milliseconds since the Unix
//! epoch and durations as `uint64` seconds.

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Convert a timestamp to protobuf epoch milliseconds
pub fn datetime_to_millis(dt: DateTime<Utc>) -> i64 {
  dt.timestamp_millis()
}

/// Convert protobuf epoch milliseconds to a timestamp
///
/// Zero means "unset" on the wire and maps to `None`, as do values outside
/// chrono's representable range.
pub fn millis_to_datetime(millis: i64) -> Option<DateTime<Utc>> {
  if millis == 0 {
    return None;
  }
  DateTime::from_timestamp_millis(millis)
}

/// Convert an optional timestamp to protobuf epoch milliseconds (0 when unset)
pub fn opt_datetime_to_millis(dt: Option<DateTime<Utc>>) -> i64 {
  dt.map(datetime_to_millis).unwrap_or_default()
}

/// Convert protobuf whole seconds to a duration, `None` when unset
pub fn secs_to_duration(secs: u64) -> Option<Duration> {
  (secs > 0).then(|| Duration::from_secs(secs))
}

/// Convert a duration to protobuf whole seconds, rounding sub-second
/// remainders up so a deadline is never shortened on the wire.
pub fn duration_to_secs(duration: Duration) -> u64 {
  let secs = duration.as_secs();
  if duration.subsec_nanos() > 0 { secs + 1 } else { secs }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::TimeZone;

  #[test]
  fn test_millis_roundtrip() {
    let dt = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap();
    let millis = datetime_to_millis(dt);
    assert_eq!(millis_to_datetime(millis), Some(dt));
  }

  #[test]
  fn test_zero_millis_is_unset() {
    assert_eq!(millis_to_datetime(0), None);
    assert_eq!(opt_datetime_to_millis(None), 0);
  }

  #[test]
  fn test_duration_conversions() {
    assert_eq!(secs_to_duration(0), None);
    assert_eq!(secs_to_duration(10), Some(Duration::from_secs(10)));
    assert_eq!(duration_to_secs(Duration::from_secs(10)), 10);
    assert_eq!(duration_to_secs(Duration::from_millis(1500)), 2);
  }
}
