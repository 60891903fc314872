//! Exponential backoff iterator.

use std::cmp::min;
use std::time::Duration;

const INITIAL_WAIT_MS: u64 = 500;
const MAXIMUM_WAIT_MS: u64 = 60_000;

/// An infinite iterator of [`Duration`]s doubling from 500 ms up to a cap of
/// 60 s, for retry loops against flaky external services.
pub fn iter() -> impl Iterator<Item = Duration> {
    (0u32..).map(|attempt| {
        let factor = 2u64.saturating_pow(attempt);
        let wait_ms = INITIAL_WAIT_MS.saturating_mul(factor);
        Duration::from_millis(min(wait_ms, MAXIMUM_WAIT_MS))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caps_and_never_overflows() {
        let mut backoff = iter();
        assert_eq!(backoff.next().unwrap(), Duration::from_millis(500));
        assert_eq!(backoff.next().unwrap(), Duration::from_millis(1000));
        let far = iter().nth(200).unwrap();
        assert_eq!(far, Duration::from_millis(MAXIMUM_WAIT_MS));
    }
}
