//! An in-process implementation of the [`native`](crate::native) traits.
//!
//! Every [`MemoryRuntime`] created from the same [`MemoryNetwork`] can reach
//! the others' servers by socket address. Sessions and streams behave like
//! their QUIC counterparts for the purposes of this crate:
//!
//! - closing a session (from either end) fails every pending and future
//!   stream operation with [`NativeError::SessionClosed`];
//! - `stop` on a receive half makes the peer's writes fail with
//!   [`NativeError::Stopped`];
//! - `reset` on a send half makes the peer's reads fail with
//!   [`NativeError::Reset`].
//!
//! There is no TLS, so certificate pinning is not enforced at connect time.

use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::{
        atomic::{AtomicU16, Ordering},
        Arc, OnceLock,
    },
};

use async_lock::Mutex;
use bytes::Bytes;
use futures::{future::BoxFuture, FutureExt};
use tokio_util::sync::CancellationToken;

use crate::{
    fingerprint::CertificateFingerprint,
    native::{
        CloseInfo, NativeError, NativeRuntime, NativeServer, NativeSession, RecvHalf, SendHalf,
    },
};

const FIRST_EPHEMERAL_PORT: u16 = 40_000;

type StreamPair = (MemorySendHalf, MemoryRecvHalf);

/// A shared in-process "network".
#[derive(Debug, Clone)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

#[derive(Debug)]
struct NetworkInner {
    servers: Mutex<HashMap<SocketAddr, async_channel::Sender<MemorySession>>>,
    next_port: AtomicU16,
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNetwork {
    /// Create an empty network.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(NetworkInner {
                servers: Mutex::new(HashMap::new()),
                next_port: AtomicU16::new(FIRST_EPHEMERAL_PORT),
            }),
        }
    }

    /// A runtime whose servers present `certificates`.
    #[must_use]
    pub fn runtime(&self, certificates: Vec<CertificateFingerprint>) -> MemoryRuntime {
        MemoryRuntime {
            network: self.clone(),
            certificates: Arc::new(certificates),
            stall_ready: false,
            sessions: Arc::new(Mutex::new(Vec::new())),
        }
    }

    async fn lookup(&self, addr: SocketAddr) -> Option<async_channel::Sender<MemorySession>> {
        let servers = self.inner.servers.lock().await;
        if let Some(tx) = servers.get(&addr) {
            return Some(tx.clone());
        }
        let wildcard = match addr.ip() {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        servers.get(&SocketAddr::new(wildcard, addr.port())).cloned()
    }
}

/// One peer's view of a [`MemoryNetwork`].
#[derive(Debug, Clone)]
pub struct MemoryRuntime {
    network: MemoryNetwork,
    certificates: Arc<Vec<CertificateFingerprint>>,
    stall_ready: bool,
    sessions: Arc<Mutex<Vec<MemorySession>>>,
}

impl MemoryRuntime {
    /// Client sessions from this runtime never become ready.
    #[must_use]
    pub fn with_stalled_ready(mut self) -> Self {
        self.stall_ready = true;
        self
    }

    /// Client-side handles of every session this runtime has connected.
    pub async fn connected_sessions(&self) -> Vec<MemorySession> {
        self.sessions.lock().await.clone()
    }
}

impl NativeRuntime for MemoryRuntime {
    type Session = MemorySession;
    type Server = MemoryServer;

    fn bind(&self, addr: SocketAddr) -> BoxFuture<'_, Result<MemoryServer, NativeError>> {
        async move {
            let addr = if addr.port() == 0 {
                let port = self.network.inner.next_port.fetch_add(1, Ordering::Relaxed);
                SocketAddr::new(addr.ip(), port)
            } else {
                addr
            };

            let mut servers = self.network.inner.servers.lock().await;
            if servers.contains_key(&addr) {
                return Err(NativeError::AddrInUse);
            }
            let (tx, rx) = async_channel::unbounded();
            servers.insert(addr, tx);

            Ok(MemoryServer {
                addr,
                certificates: self.certificates.to_vec(),
                incoming: rx,
                network: self.network.clone(),
            })
        }
        .boxed()
    }

    fn connect<'a>(
        &'a self,
        addr: SocketAddr,
        _fingerprints: &'a [CertificateFingerprint],
    ) -> BoxFuture<'a, Result<MemorySession, NativeError>> {
        async move {
            let server = self
                .network
                .lookup(addr)
                .await
                .ok_or(NativeError::Unreachable)?;

            let (client, remote) = MemorySession::pair();
            if !self.stall_ready {
                client.shared.ready.cancel();
            }
            server
                .send(remote)
                .await
                .map_err(|_| NativeError::Unreachable)?;

            self.sessions.lock().await.push(client.clone());
            Ok(client)
        }
        .boxed()
    }
}

/// A bound in-memory server.
#[derive(Debug)]
pub struct MemoryServer {
    addr: SocketAddr,
    certificates: Vec<CertificateFingerprint>,
    incoming: async_channel::Receiver<MemorySession>,
    network: MemoryNetwork,
}

impl NativeServer for MemoryServer {
    type Session = MemorySession;

    fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    fn certificate_fingerprints(&self) -> Vec<CertificateFingerprint> {
        self.certificates.clone()
    }

    fn accept(&self) -> BoxFuture<'_, Option<MemorySession>> {
        async move { self.incoming.recv().await.ok() }.boxed()
    }

    fn close(&self) {
        self.incoming.close();
        while let Ok(pending) = self.incoming.try_recv() {
            pending.close(0, "server closed");
        }
        if let Some(mut servers) = self.network.inner.servers.try_lock() {
            servers.remove(&self.addr);
        } else {
            let network = self.network.clone();
            let addr = self.addr;
            tokio::spawn(async move {
                network.inner.servers.lock().await.remove(&addr);
            });
        }
    }
}

#[derive(Debug)]
struct SessionShared {
    ready: CancellationToken,
    closed: CancellationToken,
    close_info: OnceLock<CloseInfo>,
}

impl SessionShared {
    fn close_info(&self) -> CloseInfo {
        self.close_info
            .get()
            .cloned()
            .unwrap_or_else(|| CloseInfo::new(0, ""))
    }
}

/// One end of an in-memory session.
#[derive(Debug, Clone)]
pub struct MemorySession {
    shared: Arc<SessionShared>,
    to_peer: async_channel::Sender<StreamPair>,
    from_peer: async_channel::Receiver<StreamPair>,
}

impl MemorySession {
    fn pair() -> (Self, Self) {
        let shared = Arc::new(SessionShared {
            ready: CancellationToken::new(),
            closed: CancellationToken::new(),
            close_info: OnceLock::new(),
        });
        let (a_tx, a_rx) = async_channel::unbounded();
        let (b_tx, b_rx) = async_channel::unbounded();
        (
            Self {
                shared: shared.clone(),
                to_peer: a_tx,
                from_peer: b_rx,
            },
            Self {
                shared,
                to_peer: b_tx,
                from_peer: a_rx,
            },
        )
    }

    /// How the session was closed, if it has been.
    #[must_use]
    pub fn close_info(&self) -> Option<CloseInfo> {
        self.shared
            .closed
            .is_cancelled()
            .then(|| self.shared.close_info())
    }

    async fn wait_ready(&self) -> Result<(), NativeError> {
        tokio::select! {
            biased;
            () = self.shared.closed.cancelled() => Err(NativeError::SessionClosed(self.shared.close_info())),
            () = self.shared.ready.cancelled() => Ok(()),
        }
    }
}

fn pipe(session: &Arc<SessionShared>) -> (MemorySendHalf, MemoryRecvHalf) {
    let (tx, rx) = async_channel::unbounded();
    let stopped = Arc::new(OnceLock::new());
    (
        MemorySendHalf {
            tx,
            stopped: stopped.clone(),
            session: session.clone(),
            finished: false,
        },
        MemoryRecvHalf {
            rx,
            stopped,
            session: session.clone(),
            ended: false,
        },
    )
}

impl NativeSession for MemorySession {
    type Send = MemorySendHalf;
    type Recv = MemoryRecvHalf;

    fn ready(&self) -> BoxFuture<'static, Result<(), NativeError>> {
        let this = self.clone();
        async move { this.wait_ready().await }.boxed()
    }

    fn closed(&self) -> BoxFuture<'static, CloseInfo> {
        let shared = self.shared.clone();
        async move {
            shared.closed.cancelled().await;
            shared.close_info()
        }
        .boxed()
    }

    fn open_bi(&self) -> BoxFuture<'_, Result<StreamPair, NativeError>> {
        async move {
            self.wait_ready().await?;
            let (local_send, remote_recv) = pipe(&self.shared);
            let (remote_send, local_recv) = pipe(&self.shared);
            self.to_peer
                .send((remote_send, remote_recv))
                .await
                .map_err(|_| NativeError::SessionClosed(self.shared.close_info()))?;
            Ok((local_send, local_recv))
        }
        .boxed()
    }

    fn accept_bi(&self) -> BoxFuture<'_, Result<StreamPair, NativeError>> {
        async move {
            tokio::select! {
                biased;
                () = self.shared.closed.cancelled() => Err(NativeError::SessionClosed(self.shared.close_info())),
                pair = self.from_peer.recv() => {
                    pair.map_err(|_| NativeError::SessionClosed(self.shared.close_info()))
                }
            }
        }
        .boxed()
    }

    fn close(&self, code: u32, reason: &str) {
        let _ = self.shared.close_info.set(CloseInfo::new(code, reason));
        self.shared.closed.cancel();
        self.to_peer.close();
    }
}

#[derive(Debug)]
enum Frame {
    Data(Bytes),
    Fin,
    Reset(u32),
}

/// Writable half of an in-memory stream.
#[derive(Debug)]
pub struct MemorySendHalf {
    tx: async_channel::Sender<Frame>,
    stopped: Arc<OnceLock<u32>>,
    session: Arc<SessionShared>,
    finished: bool,
}

impl MemorySendHalf {
    fn check_open(&self) -> Result<(), NativeError> {
        if self.session.closed.is_cancelled() {
            return Err(NativeError::SessionClosed(self.session.close_info()));
        }
        if let Some(code) = self.stopped.get() {
            return Err(NativeError::Stopped(*code));
        }
        Ok(())
    }

    fn push(&self, frame: Frame) -> Result<(), NativeError> {
        self.tx
            .try_send(frame)
            .map_err(|_| NativeError::Stopped(self.stopped.get().copied().unwrap_or(0)))
    }
}

impl SendHalf for MemorySendHalf {
    fn write(&mut self, chunk: Bytes) -> BoxFuture<'_, Result<(), NativeError>> {
        async move {
            self.check_open()?;
            if self.finished {
                return Err(NativeError::Other("write after finish".into()));
            }
            self.push(Frame::Data(chunk))
        }
        .boxed()
    }

    fn finish(&mut self) -> BoxFuture<'_, Result<(), NativeError>> {
        async move {
            if self.finished {
                return Ok(());
            }
            self.check_open()?;
            self.finished = true;
            self.push(Frame::Fin)
        }
        .boxed()
    }

    fn reset(&mut self, code: u32) {
        if !self.finished {
            self.finished = true;
            let _ = self.push(Frame::Reset(code));
        }
    }
}

/// Readable half of an in-memory stream.
#[derive(Debug)]
pub struct MemoryRecvHalf {
    rx: async_channel::Receiver<Frame>,
    stopped: Arc<OnceLock<u32>>,
    session: Arc<SessionShared>,
    ended: bool,
}

impl RecvHalf for MemoryRecvHalf {
    fn read(&mut self) -> BoxFuture<'_, Result<Option<Bytes>, NativeError>> {
        async move {
            if self.ended {
                return Ok(None);
            }
            let frame = tokio::select! {
                biased;
                () = self.session.closed.cancelled() => {
                    return Err(NativeError::SessionClosed(self.session.close_info()));
                }
                frame = self.rx.recv() => frame,
            };
            match frame {
                Ok(Frame::Data(chunk)) => Ok(Some(chunk)),
                Ok(Frame::Fin) => {
                    self.ended = true;
                    Ok(None)
                }
                Ok(Frame::Reset(code)) => {
                    self.ended = true;
                    Err(NativeError::Reset(code))
                }
                Err(_) => {
                    self.ended = true;
                    Err(NativeError::Reset(0))
                }
            }
        }
        .boxed()
    }

    fn stop(&mut self, code: u32) {
        let _ = self.stopped.set(code);
        self.rx.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn localhost() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 0))
    }

    async fn connected() -> (MemorySession, MemorySession) {
        let network = MemoryNetwork::new();
        let runtime = network.runtime(Vec::new());
        let server = runtime
            .bind(localhost())
            .await
            .unwrap_or_else(|e| unreachable!("{e}"));
        let client = runtime
            .connect(server.local_addr(), &[])
            .await
            .unwrap_or_else(|e| unreachable!("{e}"));
        let accepted = server
            .accept()
            .await
            .unwrap_or_else(|| unreachable!("server closed"));
        (client, accepted)
    }

    #[tokio::test]
    async fn bytes_flow_then_fin() {
        let (client, server) = connected().await;
        let (mut tx, _rx) = client.open_bi().await.unwrap_or_else(|e| unreachable!("{e}"));
        let (_tx, mut rx) = server.accept_bi().await.unwrap_or_else(|e| unreachable!("{e}"));

        tx.write(Bytes::from_static(b"abc"))
            .await
            .unwrap_or_else(|e| unreachable!("{e}"));
        tx.finish().await.unwrap_or_else(|e| unreachable!("{e}"));

        assert_eq!(rx.read().await, Ok(Some(Bytes::from_static(b"abc"))));
        assert_eq!(rx.read().await, Ok(None));
        assert_eq!(rx.read().await, Ok(None));
    }

    #[tokio::test]
    async fn stop_fails_peer_writes() {
        let (client, server) = connected().await;
        let (mut tx, _rx) = client.open_bi().await.unwrap_or_else(|e| unreachable!("{e}"));
        let (_tx, mut rx) = server.accept_bi().await.unwrap_or_else(|e| unreachable!("{e}"));

        rx.stop(9);
        assert_eq!(
            tx.write(Bytes::from_static(b"x")).await,
            Err(NativeError::Stopped(9))
        );
    }

    #[tokio::test]
    async fn reset_fails_peer_reads() {
        let (client, server) = connected().await;
        let (mut tx, _rx) = client.open_bi().await.unwrap_or_else(|e| unreachable!("{e}"));
        let (_tx, mut rx) = server.accept_bi().await.unwrap_or_else(|e| unreachable!("{e}"));

        tx.reset(4);
        assert_eq!(rx.read().await, Err(NativeError::Reset(4)));
    }

    #[tokio::test]
    async fn close_is_seen_by_both_ends() {
        let (client, server) = connected().await;
        server.close(7, "bye");

        assert_eq!(client.closed().await, CloseInfo::new(7, "bye"));
        assert!(matches!(
            client.open_bi().await,
            Err(NativeError::SessionClosed(_))
        ));
        assert_eq!(client.close_info(), Some(CloseInfo::new(7, "bye")));
    }

    #[tokio::test]
    async fn first_close_wins() {
        let (client, server) = connected().await;
        client.close(1, "first");
        server.close(2, "second");
        assert_eq!(server.closed().await, CloseInfo::new(1, "first"));
    }

    #[tokio::test]
    async fn unknown_address_is_unreachable() {
        let runtime = MemoryNetwork::new().runtime(Vec::new());
        assert!(matches!(
            runtime.connect(SocketAddr::from(([127, 0, 0, 1], 1)), &[]).await,
            Err(NativeError::Unreachable)
        ));
    }

    #[tokio::test]
    async fn rebinding_is_refused() {
        let runtime = MemoryNetwork::new().runtime(Vec::new());
        let addr = SocketAddr::from(([127, 0, 0, 1], 5000));
        let _server = runtime.bind(addr).await.unwrap_or_else(|e| unreachable!("{e}"));
        assert!(matches!(runtime.bind(addr).await, Err(NativeError::AddrInUse)));
    }

    #[tokio::test]
    async fn wildcard_bind_is_reachable_on_loopback() {
        let runtime = MemoryNetwork::new().runtime(Vec::new());
        let server = runtime
            .bind(SocketAddr::from(([0, 0, 0, 0], 0)))
            .await
            .unwrap_or_else(|e| unreachable!("{e}"));
        let target = SocketAddr::from(([127, 0, 0, 1], server.local_addr().port()));
        assert!(runtime.connect(target, &[]).await.is_ok());
    }

    #[tokio::test]
    async fn stalled_session_fails_ready_on_close() {
        let network = MemoryNetwork::new();
        let runtime = network.runtime(Vec::new()).with_stalled_ready();
        let server = runtime
            .bind(localhost())
            .await
            .unwrap_or_else(|e| unreachable!("{e}"));
        let client = runtime
            .connect(server.local_addr(), &[])
            .await
            .unwrap_or_else(|e| unreachable!("{e}"));

        let ready = client.ready();
        client.close(3, "timeout");
        assert!(matches!(ready.await, Err(NativeError::SessionClosed(_))));
    }
}
