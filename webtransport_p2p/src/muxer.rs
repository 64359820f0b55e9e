//! Stream multiplexer emulation over a natively multiplexed session.
//!
//! The session already multiplexes streams, so the "muxer" only adds
//! bookkeeping: sequential stream ids, the active set, and an admission
//! ceiling for peer-opened streams.
//!
//! Inbound streams are drained by a background task, one at a time. There is
//! no backpressure beyond the admission ceiling: admitted streams queue on an
//! unbounded channel until the caller accepts them.

use core::fmt;
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use async_lock::Mutex;
use tokio_util::sync::CancellationToken;

use crate::{
    error::MuxerError,
    native::{NativeSession, RecvHalf, SendHalf},
    stream::{ActiveStreams, Direction, MuxedStream, StreamId},
    ADMISSION_REJECTED_CODE, MUXER_ABORTED_CODE,
};

/// Default ceiling on concurrently open streams before inbound ones are refused.
pub const DEFAULT_MAX_INBOUND_STREAMS: usize = 1000;

/// Builds a [`WebTransportMuxer`] for an authenticated session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MuxerFactory {
    max_inbound_streams: usize,
}

impl Default for MuxerFactory {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_INBOUND_STREAMS)
    }
}

/// Per-muxer construction parameters.
#[derive(Debug, Clone)]
pub struct MuxerInit {
    /// Aborts construction if already cancelled.
    pub abort: Option<CancellationToken>,

    /// Which side of the session this muxer runs on.
    pub direction: Direction,
}

impl MuxerFactory {
    /// A factory that admits at most `max_inbound_streams` open streams.
    #[must_use]
    pub const fn new(max_inbound_streams: usize) -> Self {
        Self {
            max_inbound_streams,
        }
    }

    /// The admission ceiling.
    #[must_use]
    pub const fn max_inbound_streams(&self) -> usize {
        self.max_inbound_streams
    }

    /// Build a muxer and start its inbound admission loop.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`MuxerError::Aborted`] (after closing the session) if the
    /// abort signal has already fired.
    pub fn create_stream_muxer<S: NativeSession>(
        &self,
        session: S,
        init: MuxerInit,
    ) -> Result<WebTransportMuxer<S>, MuxerError> {
        if init.abort.as_ref().is_some_and(CancellationToken::is_cancelled) {
            session.close(MUXER_ABORTED_CODE, "muxer creation aborted");
            return Err(MuxerError::Aborted);
        }

        let active: ActiveStreams<S> = Arc::new(Mutex::new(BTreeMap::new()));
        let next_id = Arc::new(AtomicU64::new(0));
        let shutdown = CancellationToken::new();
        let (inbound_tx, inbound_rx) = async_channel::unbounded();

        tokio::spawn(admission_loop(AdmissionLoop {
            session: session.clone(),
            active: active.clone(),
            next_id: next_id.clone(),
            max_inbound_streams: self.max_inbound_streams,
            shutdown: shutdown.clone(),
            inbound: inbound_tx,
        }));

        Ok(WebTransportMuxer {
            session,
            active,
            next_id,
            shutdown,
            inbound: inbound_rx,
            direction: init.direction,
        })
    }
}

/// Presents a session's native streams as managed streams.
pub struct WebTransportMuxer<S: NativeSession> {
    session: S,
    active: ActiveStreams<S>,
    next_id: Arc<AtomicU64>,
    shutdown: CancellationToken,
    inbound: async_channel::Receiver<MuxedStream<S>>,
    direction: Direction,
}

impl<S: NativeSession> fmt::Debug for WebTransportMuxer<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebTransportMuxer")
            .field("direction", &self.direction)
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .field("closed", &self.shutdown.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl<S: NativeSession> WebTransportMuxer<S> {
    /// Open an outbound stream.
    ///
    /// # Errors
    ///
    /// Returns [`MuxerError::Closed`] after [`close`](Self::close), or the
    /// native error if the session cannot open a stream.
    pub async fn new_stream(&self) -> Result<MuxedStream<S>, MuxerError> {
        if self.shutdown.is_cancelled() {
            return Err(MuxerError::Closed);
        }

        let (send, recv) = self.session.open_bi().await?;
        let id = StreamId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let stream = MuxedStream::new(id, Direction::Outbound, send, recv, &self.active);
        self.active.lock().await.insert(id, stream.clone());

        tracing::debug!(stream_id = %id, "opened outbound stream");
        Ok(stream)
    }

    /// Wait for the next admitted inbound stream.
    ///
    /// # Errors
    ///
    /// Returns [`MuxerError::Closed`] once the muxer or session has closed
    /// and every admitted stream has been handed out.
    pub async fn accept_stream(&self) -> Result<MuxedStream<S>, MuxerError> {
        self.inbound.recv().await.map_err(|_| MuxerError::Closed)
    }

    /// Snapshot of streams that are not yet finalized.
    pub async fn streams(&self) -> Vec<MuxedStream<S>> {
        self.active.lock().await.values().cloned().collect()
    }

    /// The session this muxer runs over.
    #[must_use]
    pub const fn session(&self) -> &S {
        &self.session
    }

    /// Which side of the session this muxer runs on.
    #[must_use]
    pub const fn direction(&self) -> Direction {
        self.direction
    }

    /// Whether [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Stop the admission loop and close the session.
    ///
    /// Open streams are not closed one by one; the session close ends them.
    pub fn close(&self, code: u32, reason: &str) {
        self.shutdown.cancel();
        self.inbound.close();
        self.session.close(code, reason);
    }
}

struct AdmissionLoop<S: NativeSession> {
    session: S,
    active: ActiveStreams<S>,
    next_id: Arc<AtomicU64>,
    max_inbound_streams: usize,
    shutdown: CancellationToken,
    inbound: async_channel::Sender<MuxedStream<S>>,
}

async fn admission_loop<S: NativeSession>(ctx: AdmissionLoop<S>) {
    let mut closed = ctx.session.closed();

    loop {
        let accepted = tokio::select! {
            biased;
            () = ctx.shutdown.cancelled() => break,
            info = &mut closed => {
                tracing::debug!("session closed ({info}), stopping inbound stream loop");
                break;
            }
            accepted = ctx.session.accept_bi() => accepted,
        };

        let (mut send, mut recv) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                tracing::debug!("inbound stream loop ending: {e}");
                break;
            }
        };

        let mut active = ctx.active.lock().await;
        if active.len() >= ctx.max_inbound_streams {
            drop(active);
            tracing::warn!(
                limit = ctx.max_inbound_streams,
                "refusing inbound stream: too many open streams"
            );
            send.reset(ADMISSION_REJECTED_CODE);
            recv.stop(ADMISSION_REJECTED_CODE);
            continue;
        }

        let id = StreamId::new(ctx.next_id.fetch_add(1, Ordering::Relaxed));
        let stream = MuxedStream::new(id, Direction::Inbound, send, recv, &ctx.active);
        active.insert(id, stream.clone());
        drop(active);

        tracing::debug!(stream_id = %id, "admitted inbound stream");
        if ctx.inbound.send(stream.clone()).await.is_err() {
            stream.abort("muxer closed").await;
            break;
        }
    }

    ctx.inbound.close();
}
