//! Listening for inbound sessions.
//!
//! A [`WebTransportListener`] owns a native server. Every accepted session
//! runs the same pipeline in its own task: wait for readiness, authenticate on
//! the first bidirectional stream, then upgrade. Failures are contained to the
//! session that caused them and are only visible in logs.
//!
//! ```text
//!   NotStarted ──listen──► Starting ──bound──► Listening ──close──► Closed
//!                             │                    │
//!                             └──────► Error ◄─────┘
//! ```

use std::{sync::Arc, time::Duration};

use async_lock::Mutex;
use futures::{future::join_all, FutureExt};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::{
    address::WebTransportAddr,
    config::TransportConfig,
    connection::{Connection, NORMAL_CLOSE_CODE},
    crypto::signer::Signer,
    error::{AcceptError, ListenError},
    fingerprint::CertificateFingerprint,
    handshake::{respond, Responder, StreamHandshake},
    interfaces::{expand_bound_addr, NetworkInterfaces},
    muxer::MuxerFactory,
    native::{NativeRuntime, NativeServer, NativeSession},
    nonce_cache::NonceCache,
    timeout::Timeout,
    timestamp::TimestampSeconds,
    upgrader::{RawConnection, UpgradeOptions, Upgrader},
    AUTHENTICATION_FAILED_CODE, SESSION_TIMEOUT_CODE, UPGRADE_FAILED_CODE,
};

/// How long a refused dialer gets to read the rejection and hang up before
/// the session is closed from our side.
const REJECTION_GRACE: Duration = Duration::from_millis(500);

/// Where a listener is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListenerState {
    /// Created, `listen` not yet called.
    NotStarted,

    /// Binding the native server.
    Starting,

    /// Accepting sessions.
    Listening,

    /// Closed by the caller.
    Closed,

    /// Binding failed or the native server stopped on its own.
    Error,
}

/// Notifications from a listener. Each occurrence is delivered once.
#[derive(Debug, Clone)]
pub enum ListenerEvent<C> {
    /// The listener is bound and reachable at these addresses.
    Listening(Vec<WebTransportAddr>),

    /// An inbound session was authenticated and upgraded.
    Connection(C),

    /// The listener failed.
    Error(ListenError),

    /// The listener closed.
    Closed,
}

/// Everything an accepted session's task needs.
struct AcceptContext<S, U, C, O> {
    signer: Arc<S>,
    upgrader: Arc<U>,
    timeout: O,
    config: TransportConfig,
    nonce_cache: NonceCache,
    fingerprints: Vec<CertificateFingerprint>,
    connections: Arc<Mutex<Vec<C>>>,
    events: async_channel::Sender<ListenerEvent<C>>,
    cancel: CancellationToken,
}

/// Accepts WebTransport sessions and turns them into connections.
pub struct WebTransportListener<R, S, U, O>
where
    R: NativeRuntime,
    U: Upgrader<R::Session>,
{
    runtime: R,
    signer: Arc<S>,
    upgrader: Arc<U>,
    timeout: O,
    interfaces: Arc<dyn NetworkInterfaces>,
    config: TransportConfig,
    state: Arc<Mutex<ListenerState>>,
    server: Mutex<Option<Arc<R::Server>>>,
    addrs: Mutex<Vec<WebTransportAddr>>,
    connections: Arc<Mutex<Vec<U::Connection>>>,
    events: async_channel::Sender<ListenerEvent<U::Connection>>,
    cancel: CancellationToken,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl<R, S, U, O> core::fmt::Debug for WebTransportListener<R, S, U, O>
where
    R: NativeRuntime,
    U: Upgrader<R::Session>,
{
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WebTransportListener")
            .field("config", &self.config)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl<R, S, U, O> WebTransportListener<R, S, U, O>
where
    R: NativeRuntime,
    S: Signer + 'static,
    U: Upgrader<R::Session>,
    O: Timeout,
{
    /// Create a listener in the [`NotStarted`](ListenerState::NotStarted) state.
    ///
    /// Usually obtained through
    /// [`WebTransport::create_listener`](crate::transport::WebTransport::create_listener).
    #[must_use]
    pub fn new(
        runtime: R,
        signer: Arc<S>,
        upgrader: Arc<U>,
        timeout: O,
        interfaces: Arc<dyn NetworkInterfaces>,
        config: TransportConfig,
    ) -> (Self, async_channel::Receiver<ListenerEvent<U::Connection>>) {
        let (events, events_rx) = async_channel::unbounded();
        let listener = Self {
            runtime,
            signer,
            upgrader,
            timeout,
            interfaces,
            config,
            state: Arc::new(Mutex::new(ListenerState::NotStarted)),
            server: Mutex::new(None),
            addrs: Mutex::new(Vec::new()),
            connections: Arc::new(Mutex::new(Vec::new())),
            events,
            cancel: CancellationToken::new(),
            accept_task: Mutex::new(None),
        };
        (listener, events_rx)
    }

    /// The current lifecycle state.
    pub async fn state(&self) -> ListenerState {
        *self.state.lock().await
    }

    /// The advertised addresses. Empty until listening.
    pub async fn addrs(&self) -> Vec<WebTransportAddr> {
        self.addrs.lock().await.clone()
    }

    /// Connections accepted so far that are still open.
    pub async fn connections(&self) -> Vec<U::Connection> {
        let mut connections = self.connections.lock().await;
        connections.retain(|conn| !conn.is_closed());
        connections.clone()
    }

    /// Bind and start accepting sessions.
    ///
    /// A wildcard bind advertises one address per local interface of the same
    /// family. Every address carries the server's certificate fingerprints and
    /// our peer id.
    ///
    /// # Errors
    ///
    /// Returns [`ListenError::AlreadyStarted`] unless the listener is
    /// [`NotStarted`](ListenerState::NotStarted), or [`ListenError::Bind`] if
    /// the native server cannot bind. A bind failure is also delivered as a
    /// [`ListenerEvent::Error`].
    pub async fn listen(
        &self,
        addr: std::net::SocketAddr,
    ) -> Result<Vec<WebTransportAddr>, ListenError> {
        {
            let mut state = self.state.lock().await;
            if *state != ListenerState::NotStarted {
                return Err(ListenError::AlreadyStarted);
            }
            *state = ListenerState::Starting;
        }

        let server = match self.runtime.bind(addr).await {
            Ok(server) => Arc::new(server),
            Err(e) => {
                tracing::error!(%addr, "failed to bind listener: {e}");
                *self.state.lock().await = ListenerState::Error;
                let err = ListenError::Bind(e);
                self.emit(ListenerEvent::Error(err.clone())).await;
                return Err(err);
            }
        };

        let bound = server.local_addr();
        let fingerprints = server.certificate_fingerprints();
        let local_peer_id = self.signer.peer_id();
        let addrs: Vec<WebTransportAddr> = expand_bound_addr(bound, &*self.interfaces)
            .into_iter()
            .map(|socket_addr| {
                WebTransportAddr::new(socket_addr, fingerprints.clone(), Some(local_peer_id))
            })
            .collect();

        let ctx = Arc::new(AcceptContext {
            signer: self.signer.clone(),
            upgrader: self.upgrader.clone(),
            timeout: self.timeout.clone(),
            config: self.config,
            nonce_cache: NonceCache::default(),
            fingerprints,
            connections: self.connections.clone(),
            events: self.events.clone(),
            cancel: self.cancel.child_token(),
        });

        *self.server.lock().await = Some(server.clone());
        *self.addrs.lock().await = addrs.clone();
        *self.state.lock().await = ListenerState::Listening;

        tracing::info!(%bound, peer_id = %local_peer_id, "listening");
        self.emit(ListenerEvent::Listening(addrs.clone())).await;

        let task = tokio::spawn(accept_loop::<R, S, U, O>(ctx, server, self.state.clone()));
        *self.accept_task.lock().await = Some(task);

        Ok(addrs)
    }

    /// Stop accepting, close every tracked connection, then stop the server.
    ///
    /// Sessions still in the accept pipeline are closed. Individual close
    /// failures are logged. Calling `close` again is a no-op.
    pub async fn close(&self) {
        {
            let mut state = self.state.lock().await;
            if *state == ListenerState::Closed {
                return;
            }
            *state = ListenerState::Closed;
        }

        self.cancel.cancel();
        if let Some(task) = self.accept_task.lock().await.take() {
            if let Err(e) = task.await {
                tracing::warn!("accept loop ended abnormally: {e}");
            }
        }

        let connections = core::mem::take(&mut *self.connections.lock().await);
        let count = connections.len();
        join_all(connections.iter().map(|conn| conn.close())).await;
        tracing::debug!(count, "closed tracked connections");

        if let Some(server) = self.server.lock().await.take() {
            server.close();
        }
        self.addrs.lock().await.clear();

        tracing::info!("listener closed");
        self.emit(ListenerEvent::Closed).await;
    }

    async fn emit(&self, event: ListenerEvent<U::Connection>) {
        if self.events.send(event).await.is_err() {
            tracing::debug!("listener event receiver dropped");
        }
    }
}

async fn accept_loop<R, S, U, O>(
    ctx: Arc<AcceptContext<S, U, U::Connection, O>>,
    server: Arc<R::Server>,
    state: Arc<Mutex<ListenerState>>,
) where
    R: NativeRuntime,
    S: Signer + 'static,
    U: Upgrader<R::Session>,
    O: Timeout,
{
    let mut sessions = JoinSet::new();
    loop {
        tokio::select! {
            () = ctx.cancel.cancelled() => {
                tracing::debug!("accept loop canceled");
                break;
            }
            Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
            accepted = server.accept() => {
                let Some(session) = accepted else {
                    stopped_unexpectedly(&ctx, &state).await;
                    break;
                };
                tracing::debug!("accepted native session");
                sessions.spawn(handle_session::<R, S, U, O>(ctx.clone(), session));
            }
        }
    }

    while sessions.join_next().await.is_some() {}
}

async fn stopped_unexpectedly<S, U, C, O>(
    ctx: &AcceptContext<S, U, C, O>,
    state: &Mutex<ListenerState>,
) {
    {
        let mut state = state.lock().await;
        if *state != ListenerState::Listening {
            return;
        }
        *state = ListenerState::Error;
    }
    tracing::error!("native server stopped accepting sessions");
    if ctx
        .events
        .send(ListenerEvent::Error(ListenError::Stopped))
        .await
        .is_err()
    {
        tracing::debug!("listener event receiver dropped");
    }
}

async fn handle_session<R, S, U, O>(
    ctx: Arc<AcceptContext<S, U, U::Connection, O>>,
    session: R::Session,
) where
    R: NativeRuntime,
    S: Signer + 'static,
    U: Upgrader<R::Session>,
    O: Timeout,
{
    let result = tokio::select! {
        () = ctx.cancel.cancelled() => {
            session.close(NORMAL_CLOSE_CODE, "listener closed");
            return;
        }
        result = accept_session::<R, S, U, O>(&ctx, session.clone()) => result,
    };

    let conn = match result {
        Ok(conn) => conn,
        Err(e) => {
            tracing::warn!("dropping inbound session: {e}");
            return;
        }
    };

    let peer_id = conn.peer_id();
    {
        let mut connections = ctx.connections.lock().await;
        connections.retain(|tracked| !tracked.is_closed());
        connections.push(conn.clone());
    }
    tracing::info!(%peer_id, "accepted inbound connection");

    if ctx.events.send(ListenerEvent::Connection(conn)).await.is_err() {
        tracing::error!(%peer_id, "listener event receiver dropped, connection will only be closed with the listener");
    }
}

/// Ready, authenticate, upgrade. Closes the session on every failure.
async fn accept_session<R, S, U, O>(
    ctx: &AcceptContext<S, U, U::Connection, O>,
    session: R::Session,
) -> Result<U::Connection, AcceptError>
where
    R: NativeRuntime,
    S: Signer + 'static,
    U: Upgrader<R::Session>,
    O: Timeout,
{
    match ctx
        .timeout
        .timeout(ctx.config.session_ready_timeout, session.ready())
        .await
    {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return Err(AcceptError::SessionNotReady(e)),
        Err(timed_out) => {
            session.close(SESSION_TIMEOUT_CODE, "session ready timeout");
            return Err(AcceptError::SessionTimeout(timed_out));
        }
    }

    let (send, recv) = match session.accept_bi().await {
        Ok(pair) => pair,
        Err(e) => {
            session.close(AUTHENTICATION_FAILED_CODE, "no authentication stream");
            return Err(AcceptError::AcceptAuthStream(e));
        }
    };

    let mut handshake = StreamHandshake::<R::Session>::new(send, recv);
    let responder = Responder {
        signer: &*ctx.signer,
        nonce_cache: &ctx.nonce_cache,
        fingerprints: &ctx.fingerprints,
        max_drift: ctx.config.handshake_max_drift,
    };
    let exchange = respond(&mut handshake, responder, TimestampSeconds::now()).boxed();
    let outcome = match ctx.config.handshake_timeout {
        Some(limit) => ctx.timeout.timeout(limit, exchange).await,
        None => Ok(exchange.await),
    };
    let outcome = match outcome {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(e)) => {
            // The dialer reads the rejection, if any, before the session closes.
            handshake.finish().await;
            let hung_up = ctx
                .timeout
                .timeout(REJECTION_GRACE, session.closed())
                .await
                .is_ok();
            if !hung_up {
                session.close(AUTHENTICATION_FAILED_CODE, "authentication failed");
            }
            return Err(AcceptError::Authentication(Box::new(e)));
        }
        Err(timed_out) => {
            session.close(AUTHENTICATION_FAILED_CODE, "handshake timed out");
            return Err(AcceptError::HandshakeTimeout(timed_out));
        }
    };
    handshake.finish().await;
    tracing::debug!(peer_id = %outcome.remote_peer_id, "inbound session authenticated");

    let raw = RawConnection {
        session: session.clone(),
        remote_peer_id: outcome.remote_peer_id,
        remote_fingerprints: outcome.remote_fingerprints,
        remote_addr: None,
    };
    let options = UpgradeOptions::new(MuxerFactory::new(ctx.config.max_inbound_streams))
        .with_abort(Some(ctx.cancel.clone()));
    ctx.upgrader
        .upgrade_inbound(raw, options)
        .await
        .map_err(|e| {
            session.close(UPGRADE_FAILED_CODE, &e.to_string());
            AcceptError::Upgrade(e)
        })
}
