//! Peer identity.

pub mod id;
