//! Wall-clock time, used for token lifetimes. Everything latency-related in the engine runs on
//! `std::time::Instant` instead; only tokens that survive across processes need an absolute
//! clock.

use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds since the unix epoch. A clock set before 1970 reads as zero, which merely makes
/// every outstanding token look expired.
#[inline]
pub fn unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unix_secs_is_current_era() {
        let now = unix_secs();
        assert!(now > 1_500_000_000);
        assert!(unix_secs() >= now);
    }
}
