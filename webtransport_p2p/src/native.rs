//! The boundary with the native WebTransport runtime.
//!
//! Everything below this module (QUIC, HTTP/3, TLS, certificate handling) is
//! owned by an external implementation. These traits describe the small
//! surface this crate needs from it: sessions with a ready/closed lifecycle,
//! bidirectional streams with independent halves, and a listening server.
//!
//! The in-process [`memory`](crate::memory) runtime implements them for tests.

use core::fmt;
use std::net::SocketAddr;

use bytes::Bytes;
use futures::future::BoxFuture;
use thiserror::Error;

use crate::fingerprint::CertificateFingerprint;

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CloseInfo {
    /// Application close code.
    pub code: u32,

    /// Human-readable reason (may be empty).
    pub reason: String,
}

impl CloseInfo {
    /// Build a close record.
    #[must_use]
    pub fn new(code: u32, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for CloseInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reason.is_empty() {
            write!(f, "code {}", self.code)
        } else {
            write!(f, "code {}: {}", self.code, self.reason)
        }
    }
}

/// Errors surfaced by a native runtime.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NativeError {
    /// The session is closed.
    #[error("session closed ({0})")]
    SessionClosed(CloseInfo),

    /// The peer reset its send side of the stream.
    #[error("stream reset by peer with code {0}")]
    Reset(u32),

    /// The peer stopped reading from the stream.
    #[error("stream stopped by peer with code {0}")]
    Stopped(u32),

    /// The local address is already bound.
    #[error("address in use")]
    AddrInUse,

    /// Nothing is listening at the remote address.
    #[error("remote unreachable")]
    Unreachable,

    /// Anything else the runtime reports.
    #[error("{0}")]
    Other(String),
}

/// The writable half of a native bidirectional stream.
pub trait SendHalf: Send + 'static {
    /// Write one chunk.
    fn write(&mut self, chunk: Bytes) -> BoxFuture<'_, Result<(), NativeError>>;

    /// Gracefully finish the stream (FIN).
    fn finish(&mut self) -> BoxFuture<'_, Result<(), NativeError>>;

    /// Abruptly abandon the stream with an error code.
    fn reset(&mut self, code: u32);
}

/// The readable half of a native bidirectional stream.
pub trait RecvHalf: Send + 'static {
    /// Read the next chunk. `Ok(None)` is end of stream.
    fn read(&mut self) -> BoxFuture<'_, Result<Option<Bytes>, NativeError>>;

    /// Tell the peer to stop sending.
    fn stop(&mut self, code: u32);
}

/// A handle to one native WebTransport session.
///
/// Handles are cheap to clone and all refer to the same session.
pub trait NativeSession: Clone + Send + Sync + 'static {
    /// Writable stream half.
    type Send: SendHalf;

    /// Readable stream half.
    type Recv: RecvHalf;

    /// Resolves once the session can carry streams.
    fn ready(&self) -> BoxFuture<'static, Result<(), NativeError>>;

    /// Resolves once the session has closed, locally or remotely.
    fn closed(&self) -> BoxFuture<'static, CloseInfo>;

    /// Open a new bidirectional stream.
    fn open_bi(&self) -> BoxFuture<'_, Result<(Self::Send, Self::Recv), NativeError>>;

    /// Wait for the next peer-initiated bidirectional stream.
    fn accept_bi(&self) -> BoxFuture<'_, Result<(Self::Send, Self::Recv), NativeError>>;

    /// Close the session with a code and reason. Idempotent.
    fn close(&self, code: u32, reason: &str);
}

/// A bound WebTransport server.
pub trait NativeServer: Send + Sync + 'static {
    /// Sessions this server accepts.
    type Session: NativeSession;

    /// The bound socket address.
    fn local_addr(&self) -> SocketAddr;

    /// Fingerprints of the certificates this server serves with.
    fn certificate_fingerprints(&self) -> Vec<CertificateFingerprint>;

    /// Wait for the next incoming session. `None` once the server is closed.
    fn accept(&self) -> BoxFuture<'_, Option<Self::Session>>;

    /// Stop listening.
    fn close(&self);
}

/// Factory for servers and client sessions.
pub trait NativeRuntime: Clone + Send + Sync + 'static {
    /// Session type shared by both roles.
    type Session: NativeSession;

    /// Listening server type.
    type Server: NativeServer<Session = Self::Session>;

    /// Bind a server.
    fn bind(&self, addr: SocketAddr) -> BoxFuture<'_, Result<Self::Server, NativeError>>;

    /// Start a client session, pinning the server certificate to one of
    /// `fingerprints`.
    fn connect<'a>(
        &'a self,
        addr: SocketAddr,
        fingerprints: &'a [CertificateFingerprint],
    ) -> BoxFuture<'a, Result<Self::Session, NativeError>>;
}
