//! Managed streams.
//!
//! A [`MuxedStream`] wraps one native bidirectional stream and tracks its two
//! halves independently:
//!
//! ```text
//!              close_read / EOF                 close_write / sink done
//!   ┌────────┐ ───────────────► ┌───────────┐
//!   │  open  │                  │ read done │ ──┐
//!   └────────┘ ───────────────► ┌───────────┐   ├──► finalized
//!                               │write done │ ──┘    (removed from the active set,
//!                               └───────────┘         close time stamped)
//! ```
//!
//! Finalization happens exactly once, when both halves are closed, whatever
//! order they close in. [`close`](MuxedStream::close) and
//! [`abort`](MuxedStream::abort) finalize unconditionally.

use core::{fmt, future::Future};
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    time::Instant,
};

use async_lock::Mutex;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::{
    error::StreamError,
    native::{NativeError, NativeSession, RecvHalf, SendHalf},
    STREAM_ABORTED_CODE,
};

/// Sequential identifier of a stream within one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StreamId(u64);

impl StreamId {
    /// Wrap a raw sequence number.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// The raw sequence number.
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which side opened a stream or connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Direction {
    /// Opened by the remote peer.
    Inbound,

    /// Opened locally.
    Outbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inbound => f.write_str("inbound"),
            Self::Outbound => f.write_str("outbound"),
        }
    }
}

/// Open and close instants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeline {
    /// When the stream (or connection) was created.
    pub open: Instant,

    /// When it was finalized, if it has been.
    pub close: Option<Instant>,
}

/// Streams of one session that are not yet finalized, keyed by id.
pub(crate) type ActiveStreams<S> = Arc<Mutex<BTreeMap<StreamId, MuxedStream<S>>>>;

/// A managed bidirectional stream.
///
/// Handles are cheap to clone; all clones refer to the same stream.
pub struct MuxedStream<S: NativeSession> {
    inner: Arc<Inner<S>>,
}

struct Inner<S: NativeSession> {
    id: StreamId,
    direction: Direction,
    send: Mutex<Option<S::Send>>,
    recv: Mutex<Option<S::Recv>>,
    state: Mutex<HalfState>,
    read_cancel: CancellationToken,
    write_cancel: CancellationToken,
    finalized: CancellationToken,
    sink_used: AtomicBool,
    metadata: Mutex<BTreeMap<String, String>>,
    active: Weak<Mutex<BTreeMap<StreamId, MuxedStream<S>>>>,
}

#[derive(Debug)]
struct HalfState {
    read_closed: bool,
    write_closed: bool,
    finalized: bool,
    opened_at: Instant,
    closed_at: Option<Instant>,
}

impl<S: NativeSession> Clone for MuxedStream<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: NativeSession> fmt::Debug for MuxedStream<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MuxedStream")
            .field("id", &self.inner.id)
            .field("direction", &self.inner.direction)
            .field("finalized", &self.inner.finalized.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl<S: NativeSession> MuxedStream<S> {
    /// Wrap native halves. The caller is responsible for inserting the
    /// stream into `active`.
    pub(crate) fn new(
        id: StreamId,
        direction: Direction,
        send: S::Send,
        recv: S::Recv,
        active: &ActiveStreams<S>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                id,
                direction,
                send: Mutex::new(Some(send)),
                recv: Mutex::new(Some(recv)),
                state: Mutex::new(HalfState {
                    read_closed: false,
                    write_closed: false,
                    finalized: false,
                    opened_at: Instant::now(),
                    closed_at: None,
                }),
                read_cancel: CancellationToken::new(),
                write_cancel: CancellationToken::new(),
                finalized: CancellationToken::new(),
                sink_used: AtomicBool::new(false),
                metadata: Mutex::new(BTreeMap::new()),
                active: Arc::downgrade(active),
            }),
        }
    }

    /// The stream's sequence number within its session.
    #[must_use]
    pub fn id(&self) -> StreamId {
        self.inner.id
    }

    /// Who opened the stream.
    #[must_use]
    pub fn direction(&self) -> Direction {
        self.inner.direction
    }

    /// Open and close instants.
    pub async fn timeline(&self) -> Timeline {
        let state = self.inner.state.lock().await;
        Timeline {
            open: state.opened_at,
            close: state.closed_at,
        }
    }

    /// Whether the read side is closed.
    pub async fn is_read_closed(&self) -> bool {
        self.inner.state.lock().await.read_closed
    }

    /// Whether the write side is closed.
    pub async fn is_write_closed(&self) -> bool {
        self.inner.state.lock().await.write_closed
    }

    /// Whether the stream has been finalized.
    #[must_use]
    pub fn is_finalized(&self) -> bool {
        self.inner.finalized.is_cancelled()
    }

    /// Resolves once the stream is finalized.
    pub fn closed(&self) -> impl Future<Output = ()> + Send + 'static {
        let token = self.inner.finalized.clone();
        async move { token.cancelled().await }
    }

    /// Look up a metadata entry.
    pub async fn metadata(&self, key: &str) -> Option<String> {
        self.inner.metadata.lock().await.get(key).cloned()
    }

    /// Set a metadata entry, returning the previous value.
    pub async fn set_metadata(&self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.inner
            .metadata
            .lock()
            .await
            .insert(key.into(), value.into())
    }

    /// The stream's incoming bytes.
    ///
    /// Yields chunks until the peer finishes its side, then ends and marks
    /// the read side closed. A native read error is yielded once and also
    /// ends the sequence. Calling this again returns a sequence that resumes
    /// from wherever the previous one stopped.
    pub fn source(&self) -> impl Stream<Item = Result<Bytes, StreamError>> + Send + 'static {
        futures::stream::unfold(Some(self.clone()), |stream| async move {
            let stream = stream?;
            match stream.read_chunk().await {
                Ok(Some(chunk)) => Some((Ok(chunk), Some(stream))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
    }

    async fn read_chunk(&self) -> Result<Option<Bytes>, StreamError> {
        let result = {
            let mut guard = self.inner.recv.lock().await;
            match guard.as_mut() {
                None => Ok(None),
                Some(recv) => {
                    tokio::select! {
                        biased;
                        () = self.inner.read_cancel.cancelled() => Ok(None),
                        read = recv.read() => read.map_err(StreamError::from),
                    }
                }
            }
        };

        if !matches!(result, Ok(Some(_))) {
            self.mark_read_closed().await;
        }
        result
    }

    /// Feed `producer` into the write side, then close the write side.
    ///
    /// Chunks are written in the order the producer yields them. The write
    /// side is closed when the producer ends, fails, or a write fails.
    ///
    /// # Errors
    ///
    /// - [`StreamError::SinkAlreadyUsed`] on a second call, without touching
    ///   the stream.
    /// - [`StreamError::Producer`] if the producer yields an error.
    /// - [`StreamError::WriteClosed`] or [`StreamError::Native`] if writing fails.
    pub async fn sink<P, E>(&self, producer: P) -> Result<(), StreamError>
    where
        P: Stream<Item = Result<Bytes, E>> + Send,
        E: fmt::Display,
    {
        if self.inner.sink_used.swap(true, Ordering::AcqRel) {
            return Err(StreamError::SinkAlreadyUsed);
        }

        let result = self.pump(producer).await;
        self.close_write().await;
        result
    }

    async fn pump<P, E>(&self, producer: P) -> Result<(), StreamError>
    where
        P: Stream<Item = Result<Bytes, E>> + Send,
        E: fmt::Display,
    {
        futures::pin_mut!(producer);
        while let Some(item) = producer.next().await {
            let chunk = item.map_err(|e| StreamError::Producer(e.to_string()))?;
            self.write_chunk(chunk).await?;
        }
        Ok(())
    }

    async fn write_chunk(&self, chunk: Bytes) -> Result<(), StreamError> {
        let mut guard = self.inner.send.lock().await;
        let send = guard.as_mut().ok_or(StreamError::WriteClosed)?;
        tokio::select! {
            biased;
            () = self.inner.write_cancel.cancelled() => Err(StreamError::WriteClosed),
            written = send.write(chunk) => written.map_err(StreamError::from),
        }
    }

    /// Stop reading. Idempotent.
    pub async fn close_read(&self) {
        self.inner.read_cancel.cancel();
        if let Some(mut recv) = self.inner.recv.lock().await.take() {
            recv.stop(0);
        }
        self.mark_read_closed().await;
    }

    /// Gracefully finish the write side. Idempotent.
    ///
    /// A peer that already stopped reading or reset the stream counts as
    /// having closed both directions; that is not reported as an error, and
    /// the read side is closed along with the write side.
    pub async fn close_write(&self) {
        let send = self.inner.send.lock().await.take();
        let mut peer_gone = false;
        if let Some(mut send) = send {
            match send.finish().await {
                Ok(()) | Err(NativeError::SessionClosed(_)) => {}
                Err(NativeError::Stopped(code) | NativeError::Reset(code)) => {
                    tracing::debug!(stream_id = %self.inner.id, code, "peer reset while finishing");
                    peer_gone = true;
                }
                Err(e) => {
                    tracing::debug!(stream_id = %self.inner.id, "error finishing write side: {e}");
                }
            }
        }
        self.mark_write_closed().await;
        if peer_gone {
            self.inner.read_cancel.cancel();
            if let Some(mut recv) = self.inner.recv.lock().await.take() {
                recv.stop(0);
            }
            self.mark_read_closed().await;
        }
    }

    /// Close both halves and finalize.
    pub async fn close(&self) {
        self.close_read().await;
        self.close_write().await;
        self.finalize().await;
    }

    /// Alias for [`close`](Self::close); no distinct hard reset is available.
    pub async fn reset(&self) {
        self.close().await;
    }

    /// Forcefully tear the stream down: reset the write side, stop the read
    /// side, finalize.
    pub async fn abort(&self, reason: &str) {
        tracing::debug!(stream_id = %self.inner.id, reason, "aborting stream");
        self.inner.write_cancel.cancel();
        self.inner.read_cancel.cancel();

        if let Some(mut send) = self.inner.send.lock().await.take() {
            send.reset(STREAM_ABORTED_CODE);
        }
        if let Some(mut recv) = self.inner.recv.lock().await.take() {
            recv.stop(STREAM_ABORTED_CODE);
        }

        {
            let mut state = self.inner.state.lock().await;
            state.read_closed = true;
            state.write_closed = true;
        }
        self.finalize().await;
    }

    async fn mark_read_closed(&self) {
        let both = {
            let mut state = self.inner.state.lock().await;
            if state.read_closed {
                return;
            }
            state.read_closed = true;
            state.write_closed
        };
        tracing::trace!(stream_id = %self.inner.id, "read side closed");
        if both {
            self.finalize().await;
        }
    }

    async fn mark_write_closed(&self) {
        let both = {
            let mut state = self.inner.state.lock().await;
            if state.write_closed {
                return;
            }
            state.write_closed = true;
            state.read_closed
        };
        tracing::trace!(stream_id = %self.inner.id, "write side closed");
        if both {
            self.finalize().await;
        }
    }

    async fn finalize(&self) {
        {
            let mut state = self.inner.state.lock().await;
            if state.finalized {
                return;
            }
            state.finalized = true;
            state.closed_at = Some(Instant::now());
        }

        if let Some(active) = self.inner.active.upgrade() {
            active.lock().await.remove(&self.inner.id);
        }
        self.inner.finalized.cancel();
        tracing::debug!(
            stream_id = %self.inner.id,
            direction = %self.inner.direction,
            "stream finalized"
        );
    }
}
