//! Millisecond unix timestamps and the Bogota-local checkout stamp.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use chrono::{DateTime, FixedOffset, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize, de};

/// The number of milliseconds since the [`UNIX_EPOCH`].
///
/// Internally represented by a non-negative [`i64`] so it round-trips through
/// JSON meta columns and the platforms which lack unsigned ints.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize,
)]
pub struct TimestampMs(i64);

impl TimestampMs {
    /// Creates a new [`TimestampMs`] from the current [`SystemTime`].
    ///
    /// Panics if the current time is not within bounds.
    pub fn now() -> Self {
        Self::try_from(SystemTime::now()).unwrap()
    }

    /// Returns the contained [`i64`].
    #[inline]
    pub fn as_i64(self) -> i64 {
        self.0
    }

    pub fn from_i64(millis: i64) -> anyhow::Result<Self> {
        anyhow::ensure!(millis >= 0, "Unix timestamp must be non-negative");
        Ok(Self(millis))
    }

    /// Convert to a chrono UTC datetime, for `TIMESTAMPTZ` columns.
    pub fn to_utc(self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.0)
            .single()
            .expect("Non-negative invariant was violated")
    }

    pub fn from_utc(dt: DateTime<Utc>) -> Self {
        Self(dt.timestamp_millis().max(0))
    }

    pub fn saturating_sub(self, duration: Duration) -> Self {
        let millis = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX);
        Self(self.0.saturating_sub(millis).max(0))
    }
}

impl TryFrom<SystemTime> for TimestampMs {
    type Error = anyhow::Error;
    fn try_from(system_time: SystemTime) -> anyhow::Result<Self> {
        system_time
            .duration_since(UNIX_EPOCH)
            .map(|duration| duration.as_millis())
            .map(i64::try_from)
            .context("Current time is before January 1st, 1970")?
            .map(Self)
            .context("Current time is too far past epoch")
    }
}

/// Enforces that the inner [`i64`] is non-negative.
impl<'de> Deserialize<'de> for TimestampMs {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = i64::deserialize(deserializer)?;
        if value >= 0 {
            Ok(TimestampMs(value))
        } else {
            Err(de::Error::invalid_value(
                de::Unexpected::Signed(value),
                &"Unix timestamp must be non-negative",
            ))
        }
    }
}

/// Renders a timestamp as `YYYY-MM-DD-HHMM` in America/Bogota local time,
/// the format the standardized checkout external id embeds.
///
/// Colombia does not observe DST, so a fixed UTC-5 offset is exact.
pub fn bogota_checkout_stamp(ts: TimestampMs) -> String {
    let bogota = FixedOffset::west_opt(5 * 3600).expect("Valid offset");
    ts.to_utc()
        .with_timezone(&bogota)
        .format("%Y-%m-%d-%H%M")
        .to_string()
}

#[cfg(test)]
mod tests {
    use proptest::arbitrary::Arbitrary;
    use proptest::strategy::{BoxedStrategy, Strategy};
    use proptest::{prop_assert_eq, proptest};

    use super::*;

    impl Arbitrary for TimestampMs {
        type Parameters = ();
        type Strategy = BoxedStrategy<Self>;
        fn arbitrary_with(_args: Self::Parameters) -> Self::Strategy {
            // chrono cannot represent the far end of the i64 millis range;
            // 4102444800000 is 2100-01-01, plenty for roundtrip coverage.
            (0..4_102_444_800_000i64).prop_map(TimestampMs).boxed()
        }
    }

    #[test]
    fn utc_roundtrip() {
        proptest!(|(ts in proptest::arbitrary::any::<TimestampMs>())| {
            prop_assert_eq!(TimestampMs::from_utc(ts.to_utc()), ts);
        })
    }

    #[test]
    fn deserialize_enforces_nonnegative() {
        assert_eq!(serde_json::from_str::<TimestampMs>("42").unwrap().0, 42);
        assert!(serde_json::from_str::<TimestampMs>("-42").is_err());
    }

    #[test]
    fn bogota_stamp_is_utc_minus_5() {
        // 2024-03-07T03:30:00Z == 2024-03-06 22:30 in Bogota
        let ts = TimestampMs(1_709_782_200_000);
        assert_eq!(bogota_checkout_stamp(ts), "2024-03-06-2230");
    }
}
