//! Signed payloads.
//!
//! ```text
//! Local:    T  ──seal──►  Signed<T>  ──wire──►  Signed<T>  ──try_verify──►  Verified<T>
//! ```
//!
//! The payload is CBOR-encoded once at seal time and the signature covers
//! [`SIGNING_CONTEXT`] followed by those exact bytes, so verification never
//! depends on re-encoding.

use core::marker::PhantomData;

use ed25519_dalek::{Signature, VerifyingKey};
use thiserror::Error;

use super::signer::Signer;
use crate::peer::id::PeerId;

/// Domain separation prefix for every handshake signature.
pub const SIGNING_CONTEXT: &[u8] = b"webtransport-p2p/signed/v1";

/// A signed payload with its issuer and signature.
///
/// The payload stays opaque until [`try_verify`](Self::try_verify) succeeds.
pub struct Signed<T> {
    issuer: VerifyingKey,
    signature: Signature,
    payload: Vec<u8>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Signed<T> {
    /// Get the issuer's verifying key.
    #[must_use]
    pub const fn issuer(&self) -> VerifyingKey {
        self.issuer
    }

    /// The encoded payload bytes that were signed.
    #[must_use]
    pub fn payload_bytes(&self) -> &[u8] {
        &self.payload
    }

    fn signed_message(payload: &[u8]) -> Vec<u8> {
        let mut msg = Vec::with_capacity(SIGNING_CONTEXT.len() + payload.len());
        msg.extend_from_slice(SIGNING_CONTEXT);
        msg.extend_from_slice(payload);
        msg
    }
}

impl<T: for<'a> minicbor::Decode<'a, ()>> Signed<T> {
    /// Verify the signature and decode the payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the signature is invalid or the payload cannot be decoded.
    pub fn try_verify(&self) -> Result<Verified<T>, VerificationError> {
        self.issuer
            .verify_strict(&Self::signed_message(&self.payload), &self.signature)?;
        let payload = minicbor::decode::<T>(&self.payload)?;
        Ok(Verified {
            issuer: self.issuer,
            payload,
        })
    }
}

impl<T: minicbor::Encode<()>> Signed<T> {
    /// Seal a payload with the given signer's signature.
    ///
    /// # Panics
    ///
    /// Panics if CBOR encoding into a `Vec` fails, which it cannot for
    /// well-formed types.
    #[allow(clippy::expect_used)]
    pub async fn seal<S: Signer + ?Sized>(signer: &S, payload: &T) -> Self {
        let encoded = minicbor::to_vec(payload).expect("encoding into a Vec should not fail");
        let message = Self::signed_message(&encoded);
        let signature = signer.sign(&message).await;

        Self {
            issuer: signer.verifying_key(),
            signature,
            payload: encoded,
            _marker: PhantomData,
        }
    }
}

impl<T> Clone for Signed<T> {
    fn clone(&self) -> Self {
        Self {
            issuer: self.issuer,
            signature: self.signature,
            payload: self.payload.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> core::fmt::Debug for Signed<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Signed")
            .field("issuer", &PeerId::from(self.issuer))
            .field("payload_len", &self.payload.len())
            .finish_non_exhaustive()
    }
}

impl<T> PartialEq for Signed<T> {
    fn eq(&self, other: &Self) -> bool {
        self.issuer.as_bytes() == other.issuer.as_bytes()
            && self.signature.to_bytes() == other.signature.to_bytes()
            && self.payload == other.payload
    }
}

impl<T> Eq for Signed<T> {}

impl<C, T> minicbor::Encode<C> for Signed<T> {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _ctx: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        e.array(3)?
            .bytes(self.issuer.as_bytes())?
            .bytes(&self.signature.to_bytes())?
            .bytes(&self.payload)?;
        Ok(())
    }
}

impl<'b, C, T> minicbor::Decode<'b, C> for Signed<T> {
    fn decode(d: &mut minicbor::Decoder<'b>, _ctx: &mut C) -> Result<Self, minicbor::decode::Error> {
        if d.array()? != Some(3) {
            return Err(minicbor::decode::Error::message(
                "signed payload must be a 3-element array",
            ));
        }

        let issuer: [u8; 32] = d
            .bytes()?
            .try_into()
            .map_err(|_| minicbor::decode::Error::message("issuer must be exactly 32 bytes"))?;
        let issuer = VerifyingKey::from_bytes(&issuer)
            .map_err(|_| minicbor::decode::Error::message("invalid issuer key"))?;

        let signature: [u8; 64] = d
            .bytes()?
            .try_into()
            .map_err(|_| minicbor::decode::Error::message("signature must be exactly 64 bytes"))?;

        let payload = d.bytes()?.to_vec();

        Ok(Self {
            issuer,
            signature: Signature::from_bytes(&signature),
            payload,
            _marker: PhantomData,
        })
    }
}

/// A payload whose signature has been checked.
///
/// Only [`Signed::try_verify`] constructs this, so holding one is proof that
/// `issuer` signed `payload`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verified<T> {
    issuer: VerifyingKey,
    payload: T,
}

impl<T> Verified<T> {
    /// The issuer's identity.
    #[must_use]
    pub fn issuer(&self) -> PeerId {
        PeerId::from(self.issuer)
    }

    /// A reference to the verified payload.
    #[must_use]
    pub const fn payload(&self) -> &T {
        &self.payload
    }

    /// Consume and return the payload.
    #[must_use]
    pub fn into_payload(self) -> T {
        self.payload
    }
}

/// Errors that can occur during signature verification.
#[derive(Debug, Error)]
pub enum VerificationError {
    /// The signature does not match the issuer and payload.
    #[error("invalid signature")]
    InvalidSignature,

    /// The payload is not valid CBOR for the expected type.
    #[error("CBOR decode error: {0}")]
    Decode(#[from] minicbor::decode::Error),
}

impl From<ed25519_dalek::SignatureError> for VerificationError {
    fn from(_: ed25519_dalek::SignatureError) -> Self {
        Self::InvalidSignature
    }
}
