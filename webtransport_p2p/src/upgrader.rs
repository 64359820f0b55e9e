//! The upgrade step that turns an authenticated session into a connection.
//!
//! QUIC's TLS layer already encrypts the session and the session multiplexes
//! streams natively, so the stock [`MuxUpgrader`] skips encryption and
//! protection negotiation and only installs the muxer emulator.

use std::net::SocketAddr;

use futures::{future::BoxFuture, FutureExt};
use tokio_util::sync::CancellationToken;

use crate::{
    connection::{Connection, WebTransportConnection},
    error::UpgradeError,
    fingerprint::CertificateFingerprint,
    muxer::{MuxerFactory, MuxerInit},
    native::NativeSession,
    peer::id::PeerId,
    stream::Direction,
};

/// An authenticated session that has not been upgraded yet.
#[derive(Debug, Clone)]
pub struct RawConnection<S> {
    /// The native session.
    pub session: S,

    /// The remote's authenticated identity.
    pub remote_peer_id: PeerId,

    /// Fingerprints the remote reported during the handshake.
    pub remote_fingerprints: Vec<CertificateFingerprint>,

    /// The dialed address, if we dialed.
    pub remote_addr: Option<SocketAddr>,
}

/// How to upgrade a [`RawConnection`].
#[derive(Debug, Clone)]
pub struct UpgradeOptions {
    /// Do not negotiate an extra encryption layer.
    pub skip_encryption: bool,

    /// Do not negotiate connection protection.
    pub skip_protection: bool,

    /// Builds the stream muxer.
    pub muxer_factory: MuxerFactory,

    /// Cancels the upgrade if fired before the muxer exists.
    pub abort: Option<CancellationToken>,
}

impl UpgradeOptions {
    /// Options for a session whose transport already provides encryption and
    /// stream multiplexing.
    #[must_use]
    pub const fn new(muxer_factory: MuxerFactory) -> Self {
        Self {
            skip_encryption: true,
            skip_protection: true,
            muxer_factory,
            abort: None,
        }
    }

    /// Attach an abort signal.
    #[must_use]
    pub fn with_abort(mut self, abort: Option<CancellationToken>) -> Self {
        self.abort = abort;
        self
    }
}

/// Upgrades authenticated sessions into connections.
pub trait Upgrader<S: NativeSession>: Send + Sync + 'static {
    /// The resulting connection type.
    type Connection: Connection + Clone + Send + Sync + 'static;

    /// Upgrade a session we dialed.
    fn upgrade_outbound(
        &self,
        raw: RawConnection<S>,
        options: UpgradeOptions,
    ) -> BoxFuture<'_, Result<Self::Connection, UpgradeError>>;

    /// Upgrade a session we accepted.
    fn upgrade_inbound(
        &self,
        raw: RawConnection<S>,
        options: UpgradeOptions,
    ) -> BoxFuture<'_, Result<Self::Connection, UpgradeError>>;
}

/// Installs the muxer emulator and nothing else.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MuxUpgrader;

impl MuxUpgrader {
    fn upgrade<S: NativeSession>(
        raw: RawConnection<S>,
        options: UpgradeOptions,
        direction: Direction,
    ) -> Result<WebTransportConnection<S>, UpgradeError> {
        if !options.skip_encryption {
            return Err(UpgradeError::Refused(
                "sessions are already encrypted by QUIC; skip_encryption must be set".into(),
            ));
        }

        let muxer = options.muxer_factory.create_stream_muxer(
            raw.session,
            MuxerInit {
                abort: options.abort,
                direction,
            },
        )?;
        tracing::debug!(peer_id = %raw.remote_peer_id, %direction, "upgraded session");

        Ok(WebTransportConnection::new(
            muxer,
            raw.remote_peer_id,
            raw.remote_fingerprints,
            raw.remote_addr,
        ))
    }
}

impl<S: NativeSession> Upgrader<S> for MuxUpgrader {
    type Connection = WebTransportConnection<S>;

    fn upgrade_outbound(
        &self,
        raw: RawConnection<S>,
        options: UpgradeOptions,
    ) -> BoxFuture<'_, Result<Self::Connection, UpgradeError>> {
        async move { Self::upgrade(raw, options, Direction::Outbound) }.boxed()
    }

    fn upgrade_inbound(
        &self,
        raw: RawConnection<S>,
        options: UpgradeOptions,
    ) -> BoxFuture<'_, Result<Self::Connection, UpgradeError>> {
        async move { Self::upgrade(raw, options, Direction::Inbound) }.boxed()
    }
}
