//! Error types.
//!
//! Errors that belong to a single building block live next to it and are
//! re-exported here; errors of the connection-level operations (dial, accept,
//! listen, stream and muxer use) are defined here.

use thiserror::Error;

use crate::timeout::TimedOut;

pub use crate::{
    address::AddrParseError,
    fingerprint::FingerprintError,
    handshake::{AuthenticateError, FramingError},
    native::NativeError,
};

/// Problem using a [`MuxedStream`](crate::stream::MuxedStream).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    /// `sink` was called a second time on the same stream.
    #[error("stream sink may only be used once")]
    SinkAlreadyUsed,

    /// The write side has already been closed or aborted.
    #[error("write side is closed")]
    WriteClosed,

    /// The byte producer handed to `sink` failed.
    #[error("sink producer failed: {0}")]
    Producer(String),

    /// The native stream failed.
    #[error(transparent)]
    Native(#[from] NativeError),
}

/// Problem creating or using a [`WebTransportMuxer`](crate::muxer::WebTransportMuxer).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MuxerError {
    /// The abort signal fired before the muxer was built.
    #[error("muxer creation aborted")]
    Aborted,

    /// The muxer (and its session) has been closed.
    #[error("muxer is closed")]
    Closed,

    /// The native session failed.
    #[error(transparent)]
    Native(#[from] NativeError),
}

/// The upgrade step failed after authentication succeeded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UpgradeError {
    /// The muxer could not be built.
    #[error("muxer error: {0}")]
    Muxer(#[from] MuxerError),

    /// A custom upgrader refused the connection.
    #[error("upgrade refused: {0}")]
    Refused(String),
}

/// Problem dialing a peer.
#[derive(Debug, Error)]
pub enum DialError {
    /// The target address cannot be dialed.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// The native runtime could not start a session.
    #[error("connect error: {0}")]
    Connect(NativeError),

    /// The session closed before becoming ready.
    #[error("session never became ready: {0}")]
    SessionNotReady(NativeError),

    /// The authentication stream could not be opened.
    #[error("failed to open authentication stream: {0}")]
    OpenAuthStream(NativeError),

    /// The handshake failed.
    #[error("authentication failed: {0}")]
    Authentication(#[from] Box<AuthenticateError<FramingError>>),

    /// The handshake did not finish within the configured bound.
    #[error("handshake timed out")]
    HandshakeTimeout(TimedOut),

    /// The upgrade step failed.
    #[error("upgrade failed: {0}")]
    Upgrade(#[from] UpgradeError),
}

/// Why an inbound session was dropped.
///
/// These never reach the caller as listener events; they are logged.
#[derive(Debug, Error)]
pub enum AcceptError {
    /// The session did not become ready within the session-ready timeout.
    #[error("session ready timeout")]
    SessionTimeout(TimedOut),

    /// The session closed before becoming ready.
    #[error("session never became ready: {0}")]
    SessionNotReady(NativeError),

    /// No authentication stream arrived.
    #[error("failed to accept authentication stream: {0}")]
    AcceptAuthStream(NativeError),

    /// The handshake failed.
    #[error("authentication failed: {0}")]
    Authentication(#[from] Box<AuthenticateError<FramingError>>),

    /// The handshake did not finish within the configured bound.
    #[error("handshake timed out")]
    HandshakeTimeout(TimedOut),

    /// The upgrade step failed.
    #[error("upgrade failed: {0}")]
    Upgrade(#[from] UpgradeError),
}

/// Problem starting a listener.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ListenError {
    /// The native runtime could not bind.
    #[error("bind failed: {0}")]
    Bind(#[from] NativeError),

    /// `listen` was called on a listener that is not in the `NotStarted` state.
    #[error("listener already started")]
    AlreadyStarted,

    /// The native server stopped accepting sessions without being closed.
    #[error("native server stopped")]
    Stopped,
}
