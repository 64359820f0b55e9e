//! Timestamps carried in handshake messages.

use core::time::Duration;

/// Non-leap seconds since the Unix epoch.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, minicbor::Encode, minicbor::Decode,
)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cbor(transparent)]
pub struct TimestampSeconds(#[n(0)] u64);

impl TimestampSeconds {
    /// Wrap a count of seconds since the Unix epoch.
    #[must_use]
    pub const fn new(secs: u64) -> Self {
        Self(secs)
    }

    /// The current wall-clock time.
    ///
    /// A clock set before the Unix epoch reads as zero.
    #[must_use]
    pub fn now() -> Self {
        let secs = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_or(0, |d| d.as_secs());
        Self(secs)
    }

    /// Seconds since the Unix epoch.
    #[must_use]
    pub const fn as_secs(&self) -> u64 {
        self.0
    }

    /// Absolute distance to `other`.
    #[must_use]
    pub const fn abs_diff(&self, other: Self) -> Duration {
        Duration::from_secs(self.0.abs_diff(other.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abs_diff_is_symmetric() {
        let a = TimestampSeconds::new(1000);
        let b = TimestampSeconds::new(1600);
        assert_eq!(a.abs_diff(b), Duration::from_secs(600));
        assert_eq!(b.abs_diff(a), Duration::from_secs(600));
    }

    #[test]
    fn now_is_after_2020() {
        assert!(TimestampSeconds::now().as_secs() > 1_577_836_800);
    }
}
