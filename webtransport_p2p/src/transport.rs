//! The caller-facing transport: dial, listen, filter.

use std::sync::Arc;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use crate::{
    address::WebTransportAddr,
    config::{ListenerOptions, TransportConfig},
    connection::Connection,
    crypto::{nonce::Nonce, signer::Signer},
    error::DialError,
    handshake::{initiate, Audience, StreamHandshake},
    interfaces::{NetworkInterfaces, SystemInterfaces},
    listener::{ListenerEvent, WebTransportListener},
    muxer::MuxerFactory,
    native::{NativeRuntime, NativeSession},
    timeout::{FuturesTimerTimeout, Timeout},
    timestamp::TimestampSeconds,
    upgrader::{MuxUpgrader, RawConnection, UpgradeOptions, Upgrader},
    AUTHENTICATION_FAILED_CODE, UPGRADE_FAILED_CODE,
};

/// Dials and listens for authenticated WebTransport connections.
pub struct WebTransport<R, S, U = MuxUpgrader, O = FuturesTimerTimeout> {
    runtime: R,
    signer: Arc<S>,
    upgrader: Arc<U>,
    timeout: O,
    interfaces: Arc<dyn NetworkInterfaces>,
    config: TransportConfig,
}

impl<R: core::fmt::Debug, S, U, O> core::fmt::Debug for WebTransport<R, S, U, O> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WebTransport")
            .field("runtime", &self.runtime)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<R: NativeRuntime, S: Signer + 'static> WebTransport<R, S> {
    /// A transport using the stock upgrader and timer.
    #[must_use]
    pub fn new(runtime: R, signer: S, config: TransportConfig) -> Self {
        Self {
            runtime,
            signer: Arc::new(signer),
            upgrader: Arc::new(MuxUpgrader),
            timeout: FuturesTimerTimeout,
            interfaces: Arc::new(SystemInterfaces),
            config,
        }
    }
}

impl<R, S, U, O> WebTransport<R, S, U, O>
where
    R: NativeRuntime,
    S: Signer + 'static,
    U: Upgrader<R::Session>,
    O: Timeout,
{
    /// Replace the upgrader.
    #[must_use]
    pub fn with_upgrader<V: Upgrader<R::Session>>(self, upgrader: V) -> WebTransport<R, S, V, O> {
        WebTransport {
            runtime: self.runtime,
            signer: self.signer,
            upgrader: Arc::new(upgrader),
            timeout: self.timeout,
            interfaces: self.interfaces,
            config: self.config,
        }
    }

    /// Replace the timeout strategy.
    #[must_use]
    pub fn with_timeout<P: Timeout>(self, timeout: P) -> WebTransport<R, S, U, P> {
        WebTransport {
            runtime: self.runtime,
            signer: self.signer,
            upgrader: self.upgrader,
            timeout,
            interfaces: self.interfaces,
            config: self.config,
        }
    }

    /// Replace interface enumeration used for wildcard listeners.
    #[must_use]
    pub fn with_interfaces(mut self, interfaces: impl NetworkInterfaces) -> Self {
        self.interfaces = Arc::new(interfaces);
        self
    }

    /// The transport settings.
    #[must_use]
    pub const fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Dial a peer and return an authenticated connection.
    ///
    /// # Errors
    ///
    /// See [`dial_with_signal`](Self::dial_with_signal).
    pub async fn dial(&self, addr: &WebTransportAddr) -> Result<U::Connection, DialError> {
        self.dial_with_signal(addr, None).await
    }

    /// Dial a peer, aborting the upgrade if `abort` has fired by then.
    ///
    /// The session is pinned to the address's certificate fingerprints. After
    /// the handshake, those fingerprints must be a subset of what the listener
    /// reports. If the address carries a peer id, the listener must prove it
    /// holds that key. Any failure closes the session before returning.
    ///
    /// # Errors
    ///
    /// Returns [`DialError::InvalidAddress`] if the address has no
    /// certificate hash, or the error of whichever step failed.
    pub async fn dial_with_signal(
        &self,
        addr: &WebTransportAddr,
        abort: Option<CancellationToken>,
    ) -> Result<U::Connection, DialError> {
        if addr.fingerprints().is_empty() {
            return Err(DialError::InvalidAddress(format!(
                "{addr} has no certificate hash"
            )));
        }

        let socket_addr = addr.socket_addr();
        tracing::debug!(%socket_addr, "dialing");

        let session = self
            .runtime
            .connect(socket_addr, addr.fingerprints())
            .await
            .map_err(DialError::Connect)?;

        if let Err(e) = session.ready().await {
            session.close(AUTHENTICATION_FAILED_CODE, "session never became ready");
            return Err(DialError::SessionNotReady(e));
        }

        let (send, recv) = match session.open_bi().await {
            Ok(pair) => pair,
            Err(e) => {
                session.close(AUTHENTICATION_FAILED_CODE, "failed to open authentication stream");
                return Err(DialError::OpenAuthStream(e));
            }
        };

        let audience = addr.peer_id().map_or_else(Audience::discover, Audience::known);
        let mut handshake = StreamHandshake::<R::Session>::new(send, recv);
        let exchange = initiate(
            &mut handshake,
            &*self.signer,
            audience,
            addr.fingerprints(),
            TimestampSeconds::now(),
            Nonce::random(),
        )
        .boxed();
        let outcome = match self.config.handshake_timeout {
            Some(limit) => self.timeout.timeout(limit, exchange).await,
            None => Ok(exchange.await),
        };
        let outcome = match outcome {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                tracing::warn!(%socket_addr, "outbound authentication failed: {e}");
                session.close(AUTHENTICATION_FAILED_CODE, "authentication failed");
                return Err(DialError::Authentication(Box::new(e)));
            }
            Err(timed_out) => {
                session.close(AUTHENTICATION_FAILED_CODE, "handshake timed out");
                return Err(DialError::HandshakeTimeout(timed_out));
            }
        };
        handshake.finish().await;

        let raw = RawConnection {
            session: session.clone(),
            remote_peer_id: outcome.remote_peer_id,
            remote_fingerprints: outcome.remote_fingerprints,
            remote_addr: Some(socket_addr),
        };
        let options = UpgradeOptions::new(MuxerFactory::new(self.config.max_inbound_streams))
            .with_abort(abort);
        let conn = self
            .upgrader
            .upgrade_outbound(raw, options)
            .await
            .map_err(|e| {
                session.close(UPGRADE_FAILED_CODE, &e.to_string());
                DialError::Upgrade(e)
            })?;

        tracing::info!(peer_id = %conn.peer_id(), %socket_addr, "outbound connection established");
        Ok(conn)
    }

    /// Create a listener. It does nothing until
    /// [`listen`](WebTransportListener::listen) is called.
    #[must_use]
    pub fn create_listener(
        &self,
        options: ListenerOptions,
    ) -> (
        WebTransportListener<R, S, U, O>,
        async_channel::Receiver<ListenerEvent<U::Connection>>,
    ) {
        WebTransportListener::new(
            self.runtime.clone(),
            self.signer.clone(),
            self.upgrader.clone(),
            self.timeout.clone(),
            self.interfaces.clone(),
            options.resolve(&self.config),
        )
    }

    /// Keep the addresses this transport can dial.
    ///
    /// An address qualifies if it parses as a WebTransport address and carries
    /// at least one certificate hash.
    #[must_use]
    pub fn filter(&self, addrs: &[&str]) -> Vec<WebTransportAddr> {
        addrs
            .iter()
            .filter_map(|text| match text.parse::<WebTransportAddr>() {
                Ok(addr) if !addr.fingerprints().is_empty() => Some(addr),
                Ok(_) => {
                    tracing::trace!(addr = %text, "skipping address without certificate hash");
                    None
                }
                Err(e) => {
                    tracing::trace!(addr = %text, "skipping address: {e}");
                    None
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use super::*;
    use crate::{
        crypto::signer::LocalSigner, fingerprint::CertificateFingerprint, memory::MemoryNetwork,
    };

    fn transport() -> WebTransport<crate::memory::MemoryRuntime, LocalSigner> {
        WebTransport::new(
            MemoryNetwork::new().runtime(Vec::new()),
            LocalSigner::from_bytes(&[1; 32]),
            TransportConfig::default(),
        )
    }

    #[test]
    fn filter_keeps_addresses_with_certhash() {
        let fp = CertificateFingerprint::sha256(b"cert");
        let good = format!("/ip4/127.0.0.1/udp/4433/quic-v1/webtransport/certhash/{fp}");
        let inputs = [
            good.as_str(),
            "/ip4/127.0.0.1/udp/4433/quic-v1/webtransport",
            "/ip4/127.0.0.1/tcp/4433",
            "not an address",
        ];

        let kept = transport().filter(&inputs);

        assert_eq!(kept.len(), 1);
        assert_eq!(kept.first().map(|a| a.to_string()), Some(good));
    }

    #[tokio::test]
    async fn dialing_without_certhash_is_invalid() {
        let addr = WebTransportAddr::new(SocketAddr::from(([127, 0, 0, 1], 4433)), Vec::new(), None);
        let result = transport().dial(&addr).await;
        assert!(matches!(result, Err(DialError::InvalidAddress(_))));
    }

    #[tokio::test]
    async fn dialing_nobody_is_a_connect_error() {
        let addr = WebTransportAddr::new(
            SocketAddr::from(([127, 0, 0, 1], 9)),
            vec![CertificateFingerprint::sha256(b"cert")],
            None,
        );
        let result = transport().dial(&addr).await;
        assert!(matches!(result, Err(DialError::Connect(_))));
    }
}
