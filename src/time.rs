/*! Time structures.

The `time` module contains structures used to represent both
absolute and relative time.

 - [Instant] is used to represent absolute time.
 - [Duration] is used to represent relative time.

Time is counted in coarse ticks of [TCP_TICK_MILLIS] milliseconds, which is
the resolution of every TCP timer and of round-trip measurement. The tick
counter wraps; differences are taken modulo 2<sup>32</sup>.

[Instant]: struct.Instant.html
[Duration]: struct.Duration.html
[TCP_TICK_MILLIS]: ../config/constant.TCP_TICK_MILLIS.html
*/

use core::{fmt, ops};

use crate::config::TCP_TICK_MILLIS;

/// A representation of an absolute time value.
///
/// The `Instant` type is a wrapper around a `u32` tick count. The absolute
/// value is meaningless by itself; only differences between instants are.
#[derive(Debug, Default, PartialEq, Eq, Hash, Clone, Copy)]
pub struct Instant {
    ticks: u32,
}

impl Instant {
    pub const ZERO: Instant = Instant::from_ticks(0);

    /// Create a new `Instant` from a tick count.
    pub const fn from_ticks(ticks: u32) -> Instant {
        Instant { ticks }
    }

    /// Create a new `Instant` from a number of milliseconds, rounding down
    /// to a whole tick.
    pub const fn from_millis(millis: u64) -> Instant {
        Instant::from_ticks((millis / TCP_TICK_MILLIS as u64) as u32)
    }

    /// The tick count of this instant.
    pub const fn ticks(&self) -> u32 {
        self.ticks
    }

    /// The total number of milliseconds represented by this instant.
    pub const fn total_millis(&self) -> u64 {
        self.ticks as u64 * TCP_TICK_MILLIS as u64
    }
}

impl PartialOrd for Instant {
    fn partial_cmp(&self, other: &Instant) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Instant {
    // Wrapping comparison: an instant is later if it is less than half the
    // tick space ahead.
    fn cmp(&self, other: &Instant) -> core::cmp::Ordering {
        (self.ticks.wrapping_sub(other.ticks) as i32).cmp(&0)
    }
}

impl fmt::Display for Instant {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}t", self.ticks)
    }
}

impl ops::Add<Duration> for Instant {
    type Output = Instant;

    fn add(self, rhs: Duration) -> Instant {
        Instant::from_ticks(self.ticks.wrapping_add(rhs.ticks))
    }
}

impl ops::AddAssign<Duration> for Instant {
    fn add_assign(&mut self, rhs: Duration) {
        self.ticks = self.ticks.wrapping_add(rhs.ticks);
    }
}

impl ops::Sub<Instant> for Instant {
    type Output = Duration;

    fn sub(self, rhs: Instant) -> Duration {
        Duration::from_ticks(self.ticks.wrapping_sub(rhs.ticks))
    }
}

/// A relative amount of time.
#[derive(Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy)]
pub struct Duration {
    ticks: u32,
}

impl Duration {
    pub const ZERO: Duration = Duration::from_ticks(0);

    /// Create a new `Duration` from a number of ticks.
    pub const fn from_ticks(ticks: u32) -> Duration {
        Duration { ticks }
    }

    /// Create a new `Duration` from a number of milliseconds, rounding up to
    /// a whole tick.
    pub const fn from_millis(millis: u64) -> Duration {
        Duration::from_ticks(millis.div_ceil(TCP_TICK_MILLIS as u64) as u32)
    }

    /// The number of ticks in this duration.
    pub const fn ticks(&self) -> u32 {
        self.ticks
    }

    /// The total number of milliseconds in this duration.
    pub const fn total_millis(&self) -> u64 {
        self.ticks as u64 * TCP_TICK_MILLIS as u64
    }
}

impl fmt::Display for Duration {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}ms", self.total_millis())
    }
}

impl ops::Add<Duration> for Duration {
    type Output = Duration;

    fn add(self, rhs: Duration) -> Duration {
        Duration::from_ticks(self.ticks.saturating_add(rhs.ticks))
    }
}

impl ops::Shl<u32> for Duration {
    type Output = Duration;

    fn shl(self, rhs: u32) -> Duration {
        Duration::from_ticks(self.ticks.checked_shl(rhs).unwrap_or(u32::MAX))
    }
}
