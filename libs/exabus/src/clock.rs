//! Monotonic nanosecond clock used for latency stamps.
//!
//! Values are nanoseconds since the first call in this process and are
//! always positive, so zero remains free to mean "no timestamp".

use once_cell::sync::Lazy;
use std::time::Instant;

static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Current monotonic time in nanoseconds, never zero or negative.
#[inline]
pub fn now_nanos() -> i64 {
    let elapsed = EPOCH.elapsed().as_nanos();
    i64::try_from(elapsed).unwrap_or(i64::MAX).saturating_add(1)
}

/// Nanoseconds elapsed since `since`, clamped at zero.
#[inline]
pub fn elapsed_since(since: i64) -> u64 {
    now_nanos().saturating_sub(since).max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_and_positive() {
        let a = now_nanos();
        let b = now_nanos();
        assert!(a > 0);
        assert!(b >= a);
        assert!(elapsed_since(b + 1_000_000) == 0);
    }
}
