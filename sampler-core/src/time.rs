//! Time newtypes shared across the sampler core.
//!
//! Two distinct clocks exist on the instrument: the battery-backed RTC that
//! task schedules are expressed against (wall-clock epoch seconds), and the
//! monotonic uptime counter that drives the action scheduler. Keeping them as
//! separate newtypes prevents mixing the two domains by accident.

use core::fmt;
use core::ops::{Add, AddAssign, Sub};
use core::time::Duration;

/// Wall-clock instant in whole seconds since the Unix epoch, as read from the
/// RTC. Signed so that schedule arithmetic can go negative without wrapping.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Timestamp(i64);

impl Timestamp {
    pub const EPOCH: Timestamp = Timestamp(0);

    #[must_use]
    pub const fn from_secs(secs: i64) -> Self {
        Self(secs)
    }

    #[must_use]
    pub const fn as_secs(self) -> i64 {
        self.0
    }

    /// Seconds from `self` until `later`; negative when `later` is in the past.
    #[must_use]
    pub const fn seconds_until(self, later: Timestamp) -> i64 {
        later.0 - self.0
    }
}

impl Add<i64> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: i64) -> Timestamp {
        Timestamp(self.0 + rhs)
    }
}

impl Sub<i64> for Timestamp {
    type Output = Timestamp;

    fn sub(self, rhs: i64) -> Timestamp {
        Timestamp(self.0 - rhs)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}s", self.0)
    }
}

/// Monotonic uptime in milliseconds. Never moves backwards.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Millis(u64);

impl Millis {
    pub const ZERO: Millis = Millis(0);

    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    #[must_use]
    pub const fn as_millis(self) -> u64 {
        self.0
    }

    /// Returns the saturating duration from `earlier` to `self`.
    #[must_use]
    pub fn saturating_duration_since(self, earlier: Millis) -> Duration {
        Duration::from_millis(self.0.saturating_sub(earlier.0))
    }
}

impl Add<Duration> for Millis {
    type Output = Millis;

    fn add(self, rhs: Duration) -> Millis {
        let millis = u64::try_from(rhs.as_millis()).unwrap_or(u64::MAX);
        Millis(self.0.saturating_add(millis))
    }
}

impl AddAssign<Duration> for Millis {
    fn add_assign(&mut self, rhs: Duration) {
        *self = *self + rhs;
    }
}

impl fmt::Display for Millis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// Converts a whole-second gap into a [`Duration`], clamping negatives to zero.
#[must_use]
pub fn secs_to_duration(secs: i64) -> Duration {
    Duration::from_secs(u64::try_from(secs).unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_gap_is_signed() {
        let earlier = Timestamp::from_secs(100);
        let later = Timestamp::from_secs(160);
        assert_eq!(earlier.seconds_until(later), 60);
        assert_eq!(later.seconds_until(earlier), -60);
    }

    #[test]
    fn millis_addition_saturates() {
        let near_max = Millis::from_millis(u64::MAX - 5);
        assert_eq!(near_max + Duration::from_millis(100), Millis::from_millis(u64::MAX));
    }

    #[test]
    fn duration_since_never_negative() {
        let earlier = Millis::from_millis(500);
        let later = Millis::from_millis(1_700);
        assert_eq!(later.saturating_duration_since(earlier), Duration::from_millis(1_200));
        assert_eq!(earlier.saturating_duration_since(later), Duration::ZERO);
    }

    #[test]
    fn negative_gaps_clamp_to_zero() {
        assert_eq!(secs_to_duration(-3), Duration::ZERO);
        assert_eq!(secs_to_duration(8), Duration::from_secs(8));
    }
}
