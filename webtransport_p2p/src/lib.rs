//! # WebTransport P2P
//!
//! Presents a natively multiplexed WebTransport session as an authenticated,
//! stream-multiplexed peer connection.
//!
//! The QUIC/HTTP3 machinery is owned by a native runtime (see [`native`]).
//! This crate layers two things on top of it:
//!
//! 1. A **session authenticator** ([`handshake`]) that runs once per session on
//!    the first bidirectional stream. Both peers prove their ed25519 identity and
//!    exchange the certificate fingerprints they vouch for. The dialer checks
//!    that the fingerprints it trusted when dialing are a subset of what the
//!    listener reports.
//! 2. A **stream multiplexer emulator** ([`muxer`]) that wraps every later native
//!    bidirectional stream as a [`MuxedStream`](stream::MuxedStream) with
//!    independent half-close tracking and an inbound admission ceiling.
//!
//! # Architecture
//!
//! ```text
//!   dial ──► NativeRuntime::connect ─┐
//!                                    ├─► handshake (stream 0) ─► Upgrader ─► WebTransportConnection
//!   listen ─► NativeServer::accept ──┘                              │
//!                                                                   └─► WebTransportMuxer
//!                                                                         ├─ new_stream()
//!                                                                         └─ inbound admission loop
//! ```
//!
//! # Example
//!
//! ```ignore
//! use webtransport_p2p::{
//!     config::TransportConfig, crypto::signer::LocalSigner, transport::WebTransport,
//! };
//!
//! let transport = WebTransport::new(runtime, LocalSigner::generate(), TransportConfig::default());
//! let conn = transport.dial(&"/ip4/127.0.0.1/udp/4433/quic-v1/webtransport/certhash/uEi...".parse()?).await?;
//! let stream = conn.new_stream().await?;
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod address;
pub mod config;
pub mod connection;
pub mod crypto;
pub mod error;
pub mod fingerprint;
pub mod handshake;
pub mod interfaces;
pub mod listener;
pub mod muxer;
pub mod native;
pub mod nonce_cache;
pub mod peer;
pub mod stream;
pub mod timeout;
pub mod timestamp;
pub mod transport;
pub mod upgrader;

#[cfg(any(test, feature = "test_utils"))]
#[cfg_attr(docsrs, doc(cfg(feature = "test_utils")))]
pub mod memory;

/// Protocol identifier used for discovery-mode handshakes.
///
/// A dialer that does not know the listener's [`PeerId`](peer::id::PeerId)
/// addresses its challenge to `blake3(PROTOCOL_ID)`.
pub const PROTOCOL_ID: &[u8] = b"/webtransport-p2p/1";

/// Session close code: authentication failed.
pub const AUTHENTICATION_FAILED_CODE: u32 = 1;

/// Session close code: authentication succeeded but the upgrade step failed.
pub const UPGRADE_FAILED_CODE: u32 = 2;

/// Session close code: the session never became ready in time.
pub const SESSION_TIMEOUT_CODE: u32 = 3;

/// Session close code: muxer construction was aborted.
pub const MUXER_ABORTED_CODE: u32 = 4;

/// Stream reset/stop code used when an inbound stream exceeds the admission ceiling.
pub const ADMISSION_REJECTED_CODE: u32 = 5;

/// Stream reset code for [`MuxedStream::abort`](stream::MuxedStream::abort).
pub const STREAM_ABORTED_CODE: u32 = 6;
