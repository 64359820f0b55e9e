//! Signing primitives used by the session handshake.

pub mod nonce;
pub mod signed;
pub mod signer;
