//! WebTransport peer addresses.
//!
//! Addresses use a multiaddr-style slash-separated text form:
//!
//! ```text
//! /ip4/192.0.2.1/udp/4433/quic-v1/webtransport/certhash/uEiA.../certhash/uEiB.../p2p/<hex peer id>
//! ```
//!
//! Host and port must come first. Transport markers and certificate hashes
//! are only accepted once both are known, the port may appear only once, and
//! a `/p2p/` component (if present) must be last.

use core::{fmt, str::FromStr};
use std::net::{IpAddr, SocketAddr};

use thiserror::Error;

use crate::{
    fingerprint::{CertificateFingerprint, FingerprintError},
    peer::id::{PeerId, PeerIdParseError},
};

/// A dialable (or advertised) WebTransport address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WebTransportAddr {
    socket_addr: SocketAddr,
    fingerprints: Vec<CertificateFingerprint>,
    peer_id: Option<PeerId>,
}

impl WebTransportAddr {
    /// Build an address from its parts.
    #[must_use]
    pub const fn new(
        socket_addr: SocketAddr,
        fingerprints: Vec<CertificateFingerprint>,
        peer_id: Option<PeerId>,
    ) -> Self {
        Self {
            socket_addr,
            fingerprints,
            peer_id,
        }
    }

    /// The UDP socket address.
    #[must_use]
    pub const fn socket_addr(&self) -> SocketAddr {
        self.socket_addr
    }

    /// Certificate fingerprints the address vouches for.
    #[must_use]
    pub fn fingerprints(&self) -> &[CertificateFingerprint] {
        &self.fingerprints
    }

    /// The peer identity suffix, if any.
    #[must_use]
    pub const fn peer_id(&self) -> Option<PeerId> {
        self.peer_id
    }

    /// Replace the peer identity suffix.
    #[must_use]
    pub const fn with_peer_id(mut self, peer_id: PeerId) -> Self {
        self.peer_id = Some(peer_id);
        self
    }
}

impl fmt::Display for WebTransportAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.socket_addr.ip() {
            IpAddr::V4(ip) => write!(f, "/ip4/{ip}")?,
            IpAddr::V6(ip) => write!(f, "/ip6/{ip}")?,
        }
        write!(f, "/udp/{}/quic-v1/webtransport", self.socket_addr.port())?;
        for fingerprint in &self.fingerprints {
            write!(f, "/certhash/{fingerprint}")?;
        }
        if let Some(peer_id) = self.peer_id {
            write!(f, "/p2p/{peer_id}")?;
        }
        Ok(())
    }
}

impl FromStr for WebTransportAddr {
    type Err = AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s.strip_prefix('/').ok_or(AddrParseError::MissingLeadingSlash)?;
        let mut parts = rest.split('/');

        let mut host: Option<IpAddr> = None;
        let mut port: Option<u16> = None;
        let mut quic = false;
        let mut webtransport = false;
        let mut fingerprints = Vec::new();
        let mut peer_id = None;

        while let Some(protocol) = parts.next() {
            if peer_id.is_some() {
                return Err(AddrParseError::TrailingComponent(protocol.to_owned()));
            }

            match protocol {
                "ip4" | "ip6" => {
                    if host.is_some() {
                        return Err(AddrParseError::RepeatedHost);
                    }
                    let value = parts.next().ok_or(AddrParseError::MissingValue("ip"))?;
                    let ip: IpAddr = value
                        .parse()
                        .map_err(|_| AddrParseError::InvalidHost(value.to_owned()))?;
                    if (protocol == "ip4") != ip.is_ipv4() {
                        return Err(AddrParseError::InvalidHost(value.to_owned()));
                    }
                    host = Some(ip);
                }
                "udp" => {
                    if host.is_none() {
                        return Err(AddrParseError::OutOfOrder("udp"));
                    }
                    if port.is_some() {
                        return Err(AddrParseError::RepeatedPort);
                    }
                    let value = parts.next().ok_or(AddrParseError::MissingValue("udp"))?;
                    port = Some(
                        value
                            .parse()
                            .map_err(|_| AddrParseError::InvalidPort(value.to_owned()))?,
                    );
                }
                "quic-v1" => {
                    if host.is_none() || port.is_none() {
                        return Err(AddrParseError::OutOfOrder("quic-v1"));
                    }
                    quic = true;
                }
                "webtransport" => {
                    if !quic {
                        return Err(AddrParseError::OutOfOrder("webtransport"));
                    }
                    webtransport = true;
                }
                "certhash" => {
                    if !webtransport {
                        return Err(AddrParseError::OutOfOrder("certhash"));
                    }
                    let value = parts
                        .next()
                        .ok_or(AddrParseError::MissingValue("certhash"))?;
                    fingerprints.push(value.parse()?);
                }
                "p2p" => {
                    if !webtransport {
                        return Err(AddrParseError::OutOfOrder("p2p"));
                    }
                    let value = parts.next().ok_or(AddrParseError::MissingValue("p2p"))?;
                    peer_id = Some(value.parse()?);
                }
                other => return Err(AddrParseError::UnknownComponent(other.to_owned())),
            }
        }

        let (Some(ip), Some(port)) = (host, port) else {
            return Err(AddrParseError::MissingHostOrPort);
        };
        if !webtransport {
            return Err(AddrParseError::NotWebTransport);
        }

        Ok(Self {
            socket_addr: SocketAddr::new(ip, port),
            fingerprints,
            peer_id,
        })
    }
}

/// Problems parsing a [`WebTransportAddr`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AddrParseError {
    /// Addresses start with `/`.
    #[error("address must start with '/'")]
    MissingLeadingSlash,

    /// A component needs a value but the address ended.
    #[error("missing value for /{0}")]
    MissingValue(&'static str),

    /// A second `/ip4` or `/ip6`.
    #[error("host appears more than once")]
    RepeatedHost,

    /// A second `/udp`.
    #[error("port appears more than once")]
    RepeatedPort,

    /// A marker or fingerprint before host and port are established.
    #[error("/{0} appears before its prerequisites")]
    OutOfOrder(&'static str),

    /// Unparseable IP literal, or an IP of the wrong family.
    #[error("invalid host: {0}")]
    InvalidHost(String),

    /// Unparseable port.
    #[error("invalid port: {0}")]
    InvalidPort(String),

    /// Malformed `/certhash/` value.
    #[error("invalid certhash: {0}")]
    InvalidCertHash(#[from] FingerprintError),

    /// Malformed `/p2p/` value.
    #[error("invalid peer id: {0}")]
    InvalidPeerId(#[from] PeerIdParseError),

    /// A component this transport does not understand.
    #[error("unrecognized component: {0}")]
    UnknownComponent(String),

    /// Anything after `/p2p/<id>`.
    #[error("unexpected component after peer id: {0}")]
    TrailingComponent(String),

    /// Host or port never appeared.
    #[error("address has no host and port")]
    MissingHostOrPort,

    /// The `quic-v1/webtransport` markers are missing.
    #[error("address is not a WebTransport address")]
    NotWebTransport,
}
