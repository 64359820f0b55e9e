//! Certificate fingerprints.
//!
//! A fingerprint identifies one TLS certificate a listener serves sessions
//! with. On the wire and in addresses it is a [multihash]: an algorithm code,
//! a digest length, then the digest. The textual form is multibase
//! base64url (`u` prefix, no padding), as used in `/certhash/` address
//! components.
//!
//! [multihash]: https://github.com/multiformats/multihash

use core::{fmt, str::FromStr};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use sha2::{Digest as _, Sha256};
use thiserror::Error;

/// Multibase prefix for base64url without padding.
const MULTIBASE_BASE64URL: char = 'u';

/// Hash algorithms a fingerprint may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum HashAlgorithm {
    /// SHA-256 (multihash code `0x12`).
    Sha256,
}

impl HashAlgorithm {
    /// The multihash code for this algorithm.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Sha256 => 0x12,
        }
    }

    /// The digest length in bytes.
    #[must_use]
    pub const fn digest_len(self) -> usize {
        match self {
            Self::Sha256 => 32,
        }
    }

    const fn from_code(code: u8) -> Option<Self> {
        match code {
            0x12 => Some(Self::Sha256),
            _ => None,
        }
    }
}

/// An immutable certificate digest, compared by byte equality.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct CertificateFingerprint {
    multihash: Vec<u8>,
}

impl CertificateFingerprint {
    /// Fingerprint a DER-encoded certificate with SHA-256.
    #[must_use]
    pub fn sha256(certificate_der: &[u8]) -> Self {
        let digest = Sha256::digest(certificate_der);
        Self::from_digest(HashAlgorithm::Sha256, &digest)
    }

    /// Wrap an already-computed digest.
    ///
    /// The caller is responsible for `digest` having been produced by `algorithm`;
    /// use [`from_multihash`](Self::from_multihash) for untrusted input.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // digests are all shorter than 128 bytes
    pub fn from_digest(algorithm: HashAlgorithm, digest: &[u8]) -> Self {
        let mut multihash = Vec::with_capacity(2 + digest.len());
        multihash.push(algorithm.code());
        multihash.push(digest.len() as u8);
        multihash.extend_from_slice(digest);
        Self { multihash }
    }

    /// Parse a binary multihash.
    ///
    /// # Errors
    ///
    /// Returns an error if the algorithm is unsupported or the length prefix
    /// does not match the digest.
    pub fn from_multihash(bytes: &[u8]) -> Result<Self, FingerprintError> {
        let [code, len, digest @ ..] = bytes else {
            return Err(FingerprintError::Truncated);
        };
        let algorithm =
            HashAlgorithm::from_code(*code).ok_or(FingerprintError::UnsupportedAlgorithm(*code))?;

        if usize::from(*len) != digest.len() || digest.len() != algorithm.digest_len() {
            return Err(FingerprintError::LengthMismatch {
                declared: usize::from(*len),
                actual: digest.len(),
            });
        }

        Ok(Self {
            multihash: bytes.to_vec(),
        })
    }

    /// The hash algorithm.
    #[must_use]
    pub fn algorithm(&self) -> HashAlgorithm {
        self.multihash
            .first()
            .copied()
            .and_then(HashAlgorithm::from_code)
            .unwrap_or(HashAlgorithm::Sha256)
    }

    /// The raw digest bytes (without the multihash header).
    #[must_use]
    pub fn digest(&self) -> &[u8] {
        self.multihash.get(2..).unwrap_or_default()
    }

    /// The full binary multihash.
    #[must_use]
    pub fn as_multihash(&self) -> &[u8] {
        &self.multihash
    }
}

impl AsRef<[u8]> for CertificateFingerprint {
    fn as_ref(&self) -> &[u8] {
        &self.multihash
    }
}

impl fmt::Display for CertificateFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{MULTIBASE_BASE64URL}{}",
            URL_SAFE_NO_PAD.encode(&self.multihash)
        )
    }
}

impl fmt::Debug for CertificateFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CertificateFingerprint({self})")
    }
}

impl FromStr for CertificateFingerprint {
    type Err = FingerprintError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let encoded = s
            .strip_prefix(MULTIBASE_BASE64URL)
            .ok_or(FingerprintError::UnsupportedMultibase)?;
        let bytes = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|_| FingerprintError::InvalidBase64)?;
        Self::from_multihash(&bytes)
    }
}

impl<C> minicbor::Encode<C> for CertificateFingerprint {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _ctx: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        e.bytes(&self.multihash)?;
        Ok(())
    }
}

impl<'b, C> minicbor::Decode<'b, C> for CertificateFingerprint {
    fn decode(d: &mut minicbor::Decoder<'b>, _ctx: &mut C) -> Result<Self, minicbor::decode::Error> {
        Self::from_multihash(d.bytes()?)
            .map_err(|_| minicbor::decode::Error::message("invalid certificate multihash"))
    }
}

/// Problems decoding a [`CertificateFingerprint`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FingerprintError {
    /// Fewer than two header bytes.
    #[error("multihash is truncated")]
    Truncated,

    /// Algorithm code is not supported.
    #[error("unsupported multihash code {0:#04x}")]
    UnsupportedAlgorithm(u8),

    /// Declared digest length disagrees with the digest.
    #[error("multihash declares {declared} digest bytes but carries {actual}")]
    LengthMismatch {
        /// Length in the multihash header.
        declared: usize,

        /// Bytes actually present.
        actual: usize,
    },

    /// Text form is not base64url multibase.
    #[error("expected base64url multibase ('u' prefix)")]
    UnsupportedMultibase,

    /// Text form is not valid base64url.
    #[error("invalid base64url")]
    InvalidBase64,
}

/// Whether every element of `subset` occurs in `superset`, by exact byte
/// equality and ignoring order.
///
/// The empty set is a subset of every set; a non-empty set is never a subset
/// of the empty set.
///
/// ```
/// use webtransport_p2p::fingerprint::is_subset;
///
/// assert!(is_subset(&[[1u8, 2, 3], [4, 5, 6]], &[[1u8, 2, 3]]));
/// assert!(!is_subset::<[u8; 3], [u8; 3]>(&[], &[[1, 2, 3]]));
/// assert!(!is_subset(&[vec![1u8, 2, 3]], &[vec![1u8, 2]]));
/// ```
pub fn is_subset<A: AsRef<[u8]>, B: AsRef<[u8]>>(superset: &[A], subset: &[B]) -> bool {
    subset
        .iter()
        .all(|b| superset.iter().any(|a| a.as_ref() == b.as_ref()))
}
