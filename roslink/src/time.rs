use std::{
    fmt,
    ops::{Add, Sub},
    time::{SystemTime, UNIX_EPOCH},
};

const NANOS_PER_SEC: i64 = 1_000_000_000;

/// An instant on the ROS wall clock, stored as two unsigned 32-bit fields.
///
/// This is the wire representation used by every `time` message field, so
/// arithmetic saturates rather than wrapping past the representable range.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Time {
    pub sec: u32,
    pub nsec: u32,
}

impl Time {
    pub fn new(sec: u32, nsec: u32) -> Self {
        Time { sec, nsec }
    }

    /// The current wall-clock time.
    pub fn now() -> Self {
        let elapsed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();

        Time {
            sec: elapsed.as_secs() as u32,
            nsec: elapsed.subsec_nanos(),
        }
    }

    pub fn is_zero(&self) -> bool {
        self.sec == 0 && self.nsec == 0
    }

    fn as_nanos(&self) -> i64 {
        self.sec as i64 * NANOS_PER_SEC + self.nsec as i64
    }

    fn from_nanos(nanos: i64) -> Self {
        let nanos = nanos.max(0);
        Time {
            sec: (nanos / NANOS_PER_SEC) as u32,
            nsec: (nanos % NANOS_PER_SEC) as u32,
        }
    }
}

impl Add<Duration> for Time {
    type Output = Time;

    fn add(self, rhs: Duration) -> Time {
        Time::from_nanos(self.as_nanos() + rhs.as_nanos())
    }
}

impl Sub for Time {
    type Output = Duration;

    fn sub(self, rhs: Time) -> Duration {
        Duration::from_nanos(self.as_nanos() - rhs.as_nanos())
    }
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.sec, self.nsec)
    }
}

/// A span of ROS time.
///
/// Signed in practice, but carried on the wire as two u32 fields for
/// compatibility with `Time`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Duration {
    pub sec: u32,
    pub nsec: u32,
}

impl Duration {
    pub fn new(sec: u32, nsec: u32) -> Self {
        Duration { sec, nsec }
    }

    pub fn from_seconds(sec: u32) -> Self {
        Duration { sec, nsec: 0 }
    }

    pub fn from_millis(millis: u64) -> Self {
        Duration {
            sec: (millis / 1_000) as u32,
            nsec: ((millis % 1_000) * 1_000_000) as u32,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.sec == 0 && self.nsec == 0
    }

    fn as_nanos(&self) -> i64 {
        self.sec as i64 * NANOS_PER_SEC + self.nsec as i64
    }

    fn from_nanos(nanos: i64) -> Self {
        let nanos = nanos.max(0);
        Duration {
            sec: (nanos / NANOS_PER_SEC) as u32,
            nsec: (nanos % NANOS_PER_SEC) as u32,
        }
    }
}

impl From<Duration> for std::time::Duration {
    fn from(value: Duration) -> Self {
        std::time::Duration::new(value.sec as u64, value.nsec)
    }
}

impl fmt::Display for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.sec, self.nsec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_ordering_follows_fields() {
        assert!(Time::new(1, 0) < Time::new(1, 1));
        assert!(Time::new(1, 999_999_999) < Time::new(2, 0));
    }

    #[test]
    fn add_duration_carries_nanoseconds() {
        let later = Time::new(1, 900_000_000) + Duration::new(0, 200_000_000);
        assert_eq!(later, Time::new(2, 100_000_000));
    }

    #[test]
    fn subtraction_saturates_at_zero() {
        let diff = Time::new(1, 0) - Time::new(5, 0);
        assert!(diff.is_zero());
    }
}
