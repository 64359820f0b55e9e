//! Authenticated, multiplexed connections.
//!
//! A [`WebTransportConnection`] is not a byte pipe. All data flows over
//! streams obtained from [`new_stream`](WebTransportConnection::new_stream)
//! and [`accept_stream`](WebTransportConnection::accept_stream).

use core::fmt;
use std::{net::SocketAddr, sync::Arc, time::Instant};

use async_lock::Mutex;
use futures::{future::BoxFuture, FutureExt};
use tokio_util::sync::CancellationToken;

use crate::{
    error::MuxerError,
    fingerprint::CertificateFingerprint,
    muxer::WebTransportMuxer,
    native::NativeSession,
    peer::id::PeerId,
    stream::{Direction, MuxedStream, Timeline},
    STREAM_ABORTED_CODE,
};

/// Session close code for an orderly local close.
pub const NORMAL_CLOSE_CODE: u32 = 0;

/// The minimal contract a caller needs from an upgraded connection.
pub trait Connection: Send + Sync {
    /// The remote's authenticated identity.
    fn peer_id(&self) -> PeerId;

    /// Whether the connection has closed, locally or remotely.
    fn is_closed(&self) -> bool;

    /// Close the connection. Idempotent.
    fn close(&self) -> BoxFuture<'_, ()>;
}

/// An authenticated connection over one WebTransport session.
pub struct WebTransportConnection<S: NativeSession> {
    inner: Arc<Inner<S>>,
}

struct Inner<S: NativeSession> {
    muxer: WebTransportMuxer<S>,
    remote_peer_id: PeerId,
    remote_fingerprints: Vec<CertificateFingerprint>,
    remote_addr: Option<SocketAddr>,
    opened_at: Instant,
    closed_at: Mutex<Option<Instant>>,
    closed: CancellationToken,
}

impl<S: NativeSession> Clone for WebTransportConnection<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: NativeSession> fmt::Debug for WebTransportConnection<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebTransportConnection")
            .field("remote_peer_id", &self.inner.remote_peer_id)
            .field("remote_addr", &self.inner.remote_addr)
            .field("direction", &self.inner.muxer.direction())
            .finish_non_exhaustive()
    }
}

impl<S: NativeSession> WebTransportConnection<S> {
    /// Wrap an authenticated session's muxer.
    ///
    /// Spawns a watcher that records when the session closes, so this must
    /// be called from within a tokio runtime. Dropping the last handle closes
    /// the session.
    #[must_use]
    pub fn new(
        muxer: WebTransportMuxer<S>,
        remote_peer_id: PeerId,
        remote_fingerprints: Vec<CertificateFingerprint>,
        remote_addr: Option<SocketAddr>,
    ) -> Self {
        let session_closed = muxer.session().closed();
        let conn = Self {
            inner: Arc::new(Inner {
                muxer,
                remote_peer_id,
                remote_fingerprints,
                remote_addr,
                opened_at: Instant::now(),
                closed_at: Mutex::new(None),
                closed: CancellationToken::new(),
            }),
        };

        let watched = Arc::downgrade(&conn.inner);
        let closed = conn.inner.closed.clone();
        tokio::spawn(async move {
            tokio::select! {
                info = session_closed => {
                    tracing::debug!(peer_id = %remote_peer_id, "session closed: {info}");
                }
                () = closed.cancelled() => {}
            }
            if let Some(inner) = watched.upgrade() {
                inner.mark_closed().await;
            }
        });

        conn
    }

    /// Open an outbound stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is closed or the session refuses.
    pub async fn new_stream(&self) -> Result<MuxedStream<S>, MuxerError> {
        self.inner.muxer.new_stream().await
    }

    /// Wait for the next inbound stream the peer opened.
    ///
    /// # Errors
    ///
    /// Returns [`MuxerError::Closed`] once the connection is closed.
    pub async fn accept_stream(&self) -> Result<MuxedStream<S>, MuxerError> {
        self.inner.muxer.accept_stream().await
    }

    /// Streams that are open (not yet finalized).
    pub async fn streams(&self) -> Vec<MuxedStream<S>> {
        self.inner.muxer.streams().await
    }

    /// The remote's transport address.
    ///
    /// Always `None` for inbound connections: the native session does not
    /// expose the peer's address.
    #[must_use]
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.remote_addr
    }

    /// Fingerprints the remote reported during the handshake.
    #[must_use]
    pub fn remote_fingerprints(&self) -> &[CertificateFingerprint] {
        &self.inner.remote_fingerprints
    }

    /// Whether we dialed or accepted this connection.
    #[must_use]
    pub fn direction(&self) -> Direction {
        self.inner.muxer.direction()
    }

    /// Open and close instants.
    pub async fn timeline(&self) -> Timeline {
        Timeline {
            open: self.inner.opened_at,
            close: *self.inner.closed_at.lock().await,
        }
    }

    /// Resolves once the connection has closed, locally or remotely.
    pub fn closed(&self) -> impl core::future::Future<Output = ()> + Send + 'static {
        // The close time is stamped before the token fires.
        let closed = self.inner.closed.clone();
        async move { closed.cancelled().await }
    }

    /// Abort every open stream, then close the session.
    pub async fn abort(&self, reason: &str) {
        for stream in self.inner.muxer.streams().await {
            stream.abort(reason).await;
        }
        self.inner.muxer.close(STREAM_ABORTED_CODE, reason);
        self.inner.mark_closed().await;
    }
}

impl<S: NativeSession> Inner<S> {
    async fn mark_closed(&self) {
        let mut closed_at = self.closed_at.lock().await;
        if closed_at.is_none() {
            *closed_at = Some(Instant::now());
        }
        self.closed.cancel();
    }
}

impl<S: NativeSession> Drop for Inner<S> {
    fn drop(&mut self) {
        if !self.closed.is_cancelled() {
            tracing::debug!(peer_id = %self.remote_peer_id, "connection dropped without close");
            self.muxer.close(NORMAL_CLOSE_CODE, "connection dropped");
            self.closed.cancel();
        }
    }
}

impl<S: NativeSession> Connection for WebTransportConnection<S> {
    fn peer_id(&self) -> PeerId {
        self.inner.remote_peer_id
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        async move {
            if self.is_closed() {
                return;
            }
            tracing::debug!(peer_id = %self.inner.remote_peer_id, "closing connection");
            self.inner.muxer.close(NORMAL_CLOSE_CODE, "connection closed");
            self.inner.mark_closed().await;
        }
        .boxed()
    }
}
