//! Random nonce for challenge uniqueness.

/// A random nonce carried in every handshake challenge.
///
/// Together with the challenge timestamp it makes each signed challenge
/// unique, so a listener can detect replays with a
/// [`NonceCache`](crate::nonce_cache::NonceCache).
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, minicbor::Encode, minicbor::Decode,
)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cbor(transparent)]
pub struct Nonce(
    #[n(0)]
    #[cbor(with = "minicbor::bytes")]
    [u8; 16],
);

impl Nonce {
    /// Build a nonce from a fixed value, little-endian.
    #[must_use]
    pub const fn new(value: u128) -> Self {
        Self(value.to_le_bytes())
    }

    /// The nonce as an integer.
    #[must_use]
    pub const fn as_u128(&self) -> u128 {
        u128::from_le_bytes(self.0)
    }

    /// The 16 nonce bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Draw a fresh nonce from the operating system.
    ///
    /// # Panics
    ///
    /// Panics if the system random number generator fails.
    #[allow(clippy::expect_used)]
    #[must_use]
    pub fn random() -> Self {
        let mut bytes = [0u8; 16];
        getrandom::fill(&mut bytes).expect("getrandom failed");
        Self(bytes)
    }
}
