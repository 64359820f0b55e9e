//! Signing trait for key management abstraction.
//!
//! The handshake only ever needs "sign these bytes" and "who am I", so key
//! storage stays pluggable: in-memory keys via [`LocalSigner`], or an HSM or
//! remote signer behind the same trait.

use ed25519_dalek::{Signature, SigningKey, VerifyingKey};
use futures::{future::BoxFuture, FutureExt};

use crate::peer::id::PeerId;

/// A trait for signing data with an ed25519 key.
pub trait Signer: Send + Sync {
    /// Sign the given message bytes.
    fn sign<'a>(&'a self, message: &'a [u8]) -> BoxFuture<'a, Signature>;

    /// Get the verifying (public) key corresponding to this signer.
    fn verifying_key(&self) -> VerifyingKey;

    /// Get the peer ID derived from the verifying key.
    fn peer_id(&self) -> PeerId {
        PeerId::from(self.verifying_key())
    }
}

/// A signer that holds an ed25519 signing key in memory.
#[derive(Clone)]
pub struct LocalSigner {
    signing_key: SigningKey,
}

impl LocalSigner {
    /// Create a new local signer from a signing key.
    #[must_use]
    pub const fn new(signing_key: SigningKey) -> Self {
        Self { signing_key }
    }

    /// Create a new local signer with a randomly generated key.
    ///
    /// # Panics
    ///
    /// Panics if the system random number generator fails.
    #[allow(clippy::expect_used)]
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        getrandom::fill(&mut bytes).expect("getrandom failed");
        Self::from_bytes(&bytes)
    }

    /// Create a local signer from raw key bytes.
    #[must_use]
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Self::new(SigningKey::from_bytes(bytes))
    }

    /// Get the peer ID derived from the verifying key.
    #[must_use]
    pub fn peer_id(&self) -> PeerId {
        PeerId::from(self.signing_key.verifying_key())
    }
}

impl Signer for LocalSigner {
    fn sign<'a>(&'a self, message: &'a [u8]) -> BoxFuture<'a, Signature> {
        use ed25519_dalek::Signer as _;
        let signature = self.signing_key.sign(message);
        async move { signature }.boxed()
    }

    fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }
}

impl core::fmt::Debug for LocalSigner {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LocalSigner")
            .field("peer_id", &self.peer_id())
            .finish_non_exhaustive()
    }
}
