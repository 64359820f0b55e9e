//! Session authentication.
//!
//! Runs once per session over its first bidirectional stream. Both peers
//! prove their ed25519 identity and bind the session to the certificate
//! fingerprints they vouch for.
//!
//! # Protocol Flow
//!
//! ```text
//!     Dialer                                          Listener
//!       │                                               │
//!       │  1. Signed<Challenge>                         │
//!       │  ─────────────────────────────────────────►   │
//!       │     { audience, timestamp, nonce,             │
//!       │       fingerprints used to dial }             │
//!       │                                               │
//!       │               2. Signed<Response> | Rejection │
//!       │  ◄─────────────────────────────────────────   │
//!       │     { challenge_digest, server_timestamp,     │
//!       │       fingerprints served with }              │
//!       ▼                                               ▼
//!   checks dialed ⊆ served                     checks dialed ⊆ served
//! ```
//!
//! Messages are CBOR, each framed with a 4-byte big-endian length prefix.
//! Confidentiality comes from the session's own TLS; this exchange only adds
//! identity and certificate binding.

use core::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use futures::{future::BoxFuture, FutureExt};
use thiserror::Error;

use crate::{
    crypto::{nonce::Nonce, signed::Signed, signer::Signer},
    fingerprint::{is_subset, CertificateFingerprint},
    native::{NativeError, NativeSession, RecvHalf, SendHalf},
    nonce_cache::NonceCache,
    peer::id::PeerId,
    timestamp::TimestampSeconds,
    PROTOCOL_ID,
};

/// Largest handshake frame either side will accept.
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

const LENGTH_PREFIX_SIZE: usize = 4;

/// The intended recipient of a challenge.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, minicbor::Encode, minicbor::Decode)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Audience {
    /// The dialer knows the listener's identity.
    #[n(0)]
    Known(#[n(0)] PeerId),

    /// The dialer only knows the protocol; carries `blake3(PROTOCOL_ID)`.
    #[n(1)]
    Discover(
        #[n(0)]
        #[cbor(with = "minicbor::bytes")]
        [u8; 32],
    ),
}

impl Audience {
    /// Address a specific peer.
    #[must_use]
    pub const fn known(id: PeerId) -> Self {
        Self::Known(id)
    }

    /// Address whoever serves this protocol.
    #[must_use]
    pub fn discover() -> Self {
        Self::Discover(*blake3::hash(PROTOCOL_ID).as_bytes())
    }

    fn accepts(&self, local: PeerId) -> bool {
        match self {
            Self::Known(id) => *id == local,
            Self::Discover(_) => *self == Self::discover(),
        }
    }
}

/// Sent (signed) by the dialer.
#[derive(Clone, Debug, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct Challenge {
    /// Who the dialer is connecting to.
    #[n(0)]
    pub audience: Audience,

    /// Dialer's clock.
    #[n(1)]
    pub timestamp: TimestampSeconds,

    /// Uniqueness for replay protection.
    #[n(2)]
    pub nonce: Nonce,

    /// Fingerprints the dialer used to establish the session.
    #[n(3)]
    pub fingerprints: Vec<CertificateFingerprint>,
}

/// Sent (signed) by the listener on success.
#[derive(Clone, Debug, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct Response {
    /// BLAKE3 of the exact challenge bytes being answered.
    #[n(0)]
    #[cbor(with = "minicbor::bytes")]
    pub challenge_digest: [u8; 32],

    /// Listener's clock.
    #[n(1)]
    pub server_timestamp: TimestampSeconds,

    /// Fingerprints of the certificates the listener serves with.
    #[n(2)]
    pub fingerprints: Vec<CertificateFingerprint>,
}

/// Why a listener refused a challenge.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, minicbor::Encode, minicbor::Decode)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RejectionReason {
    /// Challenge timestamp is too far from the listener's clock.
    #[n(0)]
    ClockDrift,

    /// The challenge is addressed to someone else.
    #[n(1)]
    InvalidAudience,

    /// This nonce was already used.
    #[n(2)]
    ReplayedNonce,

    /// The challenge signature does not verify.
    #[n(3)]
    InvalidSignature,

    /// The dialer trusts a certificate the listener does not serve.
    #[n(4)]
    FingerprintMismatch,
}

/// Unsigned refusal. Informational only.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, minicbor::Encode, minicbor::Decode)]
pub struct Rejection {
    /// Why.
    #[n(0)]
    pub reason: RejectionReason,

    /// Listener's clock.
    #[n(1)]
    pub server_timestamp: TimestampSeconds,
}

/// Everything that travels over the authentication stream.
#[derive(Clone, Debug, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum HandshakeMessage {
    /// Dialer → listener.
    #[n(0)]
    Challenge(#[n(0)] Signed<Challenge>),

    /// Listener → dialer on success.
    #[n(1)]
    Response(#[n(0)] Signed<Response>),

    /// Listener → dialer on failure.
    #[n(2)]
    Rejection(#[n(0)] Rejection),
}

impl HandshakeMessage {
    #[allow(clippy::expect_used)]
    fn to_bytes(&self) -> Vec<u8> {
        minicbor::to_vec(self).expect("encoding into a Vec should not fail")
    }
}

/// The verified result of a handshake.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandshakeOutcome {
    /// The remote's authenticated identity.
    pub remote_peer_id: PeerId,

    /// The fingerprints the remote reported.
    pub remote_fingerprints: Vec<CertificateFingerprint>,
}

/// A message-oriented channel to run the handshake over.
pub trait Handshake: Send {
    /// Transport failure.
    type Error: core::error::Error + Send + Sync + 'static;

    /// Send one message.
    fn send(&mut self, bytes: Vec<u8>) -> BoxFuture<'_, Result<(), Self::Error>>;

    /// Receive one message.
    fn recv(&mut self) -> BoxFuture<'_, Result<Vec<u8>, Self::Error>>;
}

/// Problems framing handshake messages on a native stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FramingError {
    /// The native stream failed.
    #[error("stream error: {0}")]
    Native(#[from] NativeError),

    /// The stream ended before a complete frame arrived.
    #[error("stream closed before a complete message arrived")]
    ClosedEarly,

    /// A frame exceeded [`MAX_FRAME_SIZE`].
    #[error("frame of {0} bytes exceeds the handshake limit")]
    FrameTooLarge(usize),
}

/// Length-prefixed framing over a native bidirectional stream.
pub struct StreamHandshake<S: NativeSession> {
    send: S::Send,
    recv: S::Recv,
    buffer: BytesMut,
}

impl<S: NativeSession> core::fmt::Debug for StreamHandshake<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("StreamHandshake")
            .field("buffered", &self.buffer.len())
            .finish_non_exhaustive()
    }
}

impl<S: NativeSession> StreamHandshake<S> {
    /// Wrap the authentication stream.
    #[must_use]
    pub fn new(send: S::Send, recv: S::Recv) -> Self {
        Self {
            send,
            recv,
            buffer: BytesMut::new(),
        }
    }

    /// Gracefully finish the write side and release the read side.
    pub async fn finish(mut self) {
        if let Err(e) = self.send.finish().await {
            tracing::debug!("authentication stream finish failed: {e}");
        }
        self.recv.stop(0);
    }

    fn take_frame(&mut self) -> Result<Option<Vec<u8>>, FramingError> {
        let Some(prefix) = self.buffer.get(..LENGTH_PREFIX_SIZE) else {
            return Ok(None);
        };
        let mut len_bytes = [0u8; LENGTH_PREFIX_SIZE];
        len_bytes.copy_from_slice(prefix);
        let len = u32::from_be_bytes(len_bytes) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(FramingError::FrameTooLarge(len));
        }
        if self.buffer.len() < LENGTH_PREFIX_SIZE + len {
            return Ok(None);
        }
        let _prefix = self.buffer.split_to(LENGTH_PREFIX_SIZE);
        Ok(Some(self.buffer.split_to(len).to_vec()))
    }
}

impl<S: NativeSession> Handshake for StreamHandshake<S> {
    type Error = FramingError;

    fn send(&mut self, bytes: Vec<u8>) -> BoxFuture<'_, Result<(), FramingError>> {
        async move {
            if bytes.len() > MAX_FRAME_SIZE {
                return Err(FramingError::FrameTooLarge(bytes.len()));
            }
            #[allow(clippy::cast_possible_truncation)] // bounded by MAX_FRAME_SIZE
            let len = bytes.len() as u32;
            let mut frame = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + bytes.len());
            frame.put_u32(len);
            frame.extend_from_slice(&bytes);
            self.send.write(frame.freeze()).await?;
            Ok(())
        }
        .boxed()
    }

    fn recv(&mut self) -> BoxFuture<'_, Result<Vec<u8>, FramingError>> {
        async move {
            loop {
                if let Some(frame) = self.take_frame()? {
                    return Ok(frame);
                }
                let chunk: Option<Bytes> = self.recv.read().await?;
                match chunk {
                    Some(chunk) => self.buffer.extend_from_slice(&chunk),
                    None => return Err(FramingError::ClosedEarly),
                }
            }
        }
        .boxed()
    }
}

/// Handshake failures.
#[derive(Debug, Error)]
pub enum AuthenticateError<E> {
    /// The underlying channel failed.
    #[error("transport error: {0}")]
    Transport(E),

    /// A message could not be decoded.
    #[error("malformed handshake message: {0}")]
    Decode(#[from] minicbor::decode::Error),

    /// A signature did not verify.
    #[error("invalid signature")]
    InvalidSignature,

    /// The listener refused the challenge.
    #[error("rejected by listener: {0:?}")]
    Rejected(RejectionReason),

    /// A message arrived out of turn.
    #[error("unexpected handshake message")]
    UnexpectedMessage,

    /// The response does not answer our challenge.
    #[error("response is bound to a different challenge")]
    ChallengeMismatch,

    /// The challenge is addressed to someone else.
    #[error("challenge addressed to another peer")]
    InvalidAudience,

    /// The challenge timestamp is outside the allowed drift.
    #[error("clock drift too large: remote={remote:?}, local={local:?}")]
    ClockDrift {
        /// Timestamp carried by the challenge.
        remote: TimestampSeconds,

        /// Our clock.
        local: TimestampSeconds,
    },

    /// The challenge nonce was already used.
    #[error("replayed nonce")]
    NonceReused,

    /// The responder is not the peer the dialer asked for.
    #[error("expected peer {expected}, got {actual}")]
    PeerMismatch {
        /// Identity from the dial address.
        expected: PeerId,

        /// Identity that answered.
        actual: PeerId,
    },

    /// The dialed fingerprints are not a subset of those the listener serves.
    #[error("certificate fingerprints do not match")]
    FingerprintMismatch,
}

/// Dialer-side handshake.
///
/// `dialed` are the fingerprints the dialer pinned when opening the session.
///
/// # Errors
///
/// Fails if the listener rejects the challenge, the response does not verify
/// or answer this challenge, the responder is not the expected peer, or
/// `dialed` is not a subset of the fingerprints the listener reports.
pub async fn initiate<H: Handshake, S: Signer + ?Sized>(
    handshake: &mut H,
    signer: &S,
    audience: Audience,
    dialed: &[CertificateFingerprint],
    now: TimestampSeconds,
    nonce: Nonce,
) -> Result<HandshakeOutcome, AuthenticateError<H::Error>> {
    let challenge = Challenge {
        audience,
        timestamp: now,
        nonce,
        fingerprints: dialed.to_vec(),
    };
    let signed_challenge = Signed::seal(signer, &challenge).await;
    let challenge_digest = *blake3::hash(signed_challenge.payload_bytes()).as_bytes();

    handshake
        .send(HandshakeMessage::Challenge(signed_challenge).to_bytes())
        .await
        .map_err(AuthenticateError::Transport)?;
    tracing::debug!("sent handshake challenge");

    let reply = handshake
        .recv()
        .await
        .map_err(AuthenticateError::Transport)?;
    let signed_response = match minicbor::decode::<HandshakeMessage>(&reply)? {
        HandshakeMessage::Response(signed) => signed,
        HandshakeMessage::Rejection(rejection) => {
            return Err(AuthenticateError::Rejected(rejection.reason))
        }
        HandshakeMessage::Challenge(_) => return Err(AuthenticateError::UnexpectedMessage),
    };

    let verified = signed_response
        .try_verify()
        .map_err(|_| AuthenticateError::InvalidSignature)?;
    let remote_peer_id = verified.issuer();
    let response = verified.into_payload();

    if response.challenge_digest != challenge_digest {
        return Err(AuthenticateError::ChallengeMismatch);
    }
    if let Audience::Known(expected) = audience {
        if expected != remote_peer_id {
            return Err(AuthenticateError::PeerMismatch {
                expected,
                actual: remote_peer_id,
            });
        }
    }
    if !is_subset(&response.fingerprints, dialed) {
        return Err(AuthenticateError::FingerprintMismatch);
    }

    Ok(HandshakeOutcome {
        remote_peer_id,
        remote_fingerprints: response.fingerprints,
    })
}

/// Listener-side parameters for [`respond`].
#[derive(Debug)]
pub struct Responder<'a, S: ?Sized> {
    /// Our identity.
    pub signer: &'a S,

    /// Replay protection shared by all sessions of one listener.
    pub nonce_cache: &'a NonceCache,

    /// Fingerprints of the certificates this session is served with.
    pub fingerprints: &'a [CertificateFingerprint],

    /// Tolerated distance between the challenge timestamp and `now`.
    pub max_drift: Duration,
}

/// Listener-side handshake.
///
/// Every refusal after a challenge has been read is reported to the dialer
/// with an unsigned [`Rejection`] before the error is returned.
///
/// # Errors
///
/// Fails if the first message is not a valid challenge for us, is stale or
/// replayed, or names a fingerprint we do not serve.
pub async fn respond<H: Handshake, S: Signer + ?Sized>(
    handshake: &mut H,
    responder: Responder<'_, S>,
    now: TimestampSeconds,
) -> Result<HandshakeOutcome, AuthenticateError<H::Error>> {
    let first = handshake
        .recv()
        .await
        .map_err(AuthenticateError::Transport)?;
    let HandshakeMessage::Challenge(signed_challenge) = minicbor::decode::<HandshakeMessage>(&first)?
    else {
        return Err(AuthenticateError::UnexpectedMessage);
    };

    let checked = check_challenge(&signed_challenge, &responder, now).await;
    let (remote_peer_id, challenge) = match checked {
        Ok(ok) => ok,
        Err((reason, err)) => {
            let rejection = HandshakeMessage::Rejection(Rejection {
                reason,
                server_timestamp: now,
            });
            if let Err(e) = handshake.send(rejection.to_bytes()).await {
                tracing::debug!("failed to deliver handshake rejection: {e}");
            }
            return Err(err);
        }
    };

    let response = Response {
        challenge_digest: *blake3::hash(signed_challenge.payload_bytes()).as_bytes(),
        server_timestamp: now,
        fingerprints: responder.fingerprints.to_vec(),
    };
    let signed_response = Signed::seal(responder.signer, &response).await;
    handshake
        .send(HandshakeMessage::Response(signed_response).to_bytes())
        .await
        .map_err(AuthenticateError::Transport)?;
    tracing::debug!(peer_id = %remote_peer_id, "answered handshake challenge");

    Ok(HandshakeOutcome {
        remote_peer_id,
        remote_fingerprints: challenge.fingerprints,
    })
}

async fn check_challenge<E, S: Signer + ?Sized>(
    signed: &Signed<Challenge>,
    responder: &Responder<'_, S>,
    now: TimestampSeconds,
) -> Result<(PeerId, Challenge), (RejectionReason, AuthenticateError<E>)> {
    let verified = signed.try_verify().map_err(|_| {
        (
            RejectionReason::InvalidSignature,
            AuthenticateError::InvalidSignature,
        )
    })?;
    let remote = verified.issuer();
    let challenge = verified.into_payload();

    if !challenge.audience.accepts(responder.signer.peer_id()) {
        return Err((
            RejectionReason::InvalidAudience,
            AuthenticateError::InvalidAudience,
        ));
    }
    if challenge.timestamp.abs_diff(now) > responder.max_drift {
        return Err((
            RejectionReason::ClockDrift,
            AuthenticateError::ClockDrift {
                remote: challenge.timestamp,
                local: now,
            },
        ));
    }
    if !is_subset(responder.fingerprints, &challenge.fingerprints) {
        return Err((
            RejectionReason::FingerprintMismatch,
            AuthenticateError::FingerprintMismatch,
        ));
    }
    responder
        .nonce_cache
        .try_claim(remote, challenge.nonce, challenge.timestamp)
        .await
        .map_err(|_| (RejectionReason::ReplayedNonce, AuthenticateError::NonceReused))?;

    Ok((remote, challenge))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::signer::LocalSigner;

    const MAX_DRIFT: Duration = Duration::from_secs(600);

    /// One end of an in-process message pipe.
    struct ChannelHandshake {
        tx: async_channel::Sender<Vec<u8>>,
        rx: async_channel::Receiver<Vec<u8>>,
    }

    #[derive(Debug, Error)]
    #[error("channel closed")]
    struct ChannelClosed;

    impl Handshake for ChannelHandshake {
        type Error = ChannelClosed;

        fn send(&mut self, bytes: Vec<u8>) -> BoxFuture<'_, Result<(), ChannelClosed>> {
            async move { self.tx.send(bytes).await.map_err(|_| ChannelClosed) }.boxed()
        }

        fn recv(&mut self) -> BoxFuture<'_, Result<Vec<u8>, ChannelClosed>> {
            async move { self.rx.recv().await.map_err(|_| ChannelClosed) }.boxed()
        }
    }

    fn channel_pair() -> (ChannelHandshake, ChannelHandshake) {
        let (a_tx, a_rx) = async_channel::unbounded();
        let (b_tx, b_rx) = async_channel::unbounded();
        (
            ChannelHandshake { tx: a_tx, rx: b_rx },
            ChannelHandshake { tx: b_tx, rx: a_rx },
        )
    }

    fn fp(seed: u8) -> CertificateFingerprint {
        CertificateFingerprint::sha256(&[seed; 4])
    }

    struct Peers {
        dialer: LocalSigner,
        listener: LocalSigner,
        cache: NonceCache,
        served: Vec<CertificateFingerprint>,
    }

    impl Peers {
        fn new() -> Self {
            Self {
                dialer: LocalSigner::from_bytes(&[1; 32]),
                listener: LocalSigner::from_bytes(&[2; 32]),
                cache: NonceCache::default(),
                served: vec![fp(1), fp(2)],
            }
        }

        fn responder(&self) -> Responder<'_, LocalSigner> {
            Responder {
                signer: &self.listener,
                nonce_cache: &self.cache,
                fingerprints: &self.served,
                max_drift: MAX_DRIFT,
            }
        }

        async fn run(
            &self,
            audience: Audience,
            dialed: &[CertificateFingerprint],
            dialer_now: TimestampSeconds,
            nonce: Nonce,
        ) -> (
            Result<HandshakeOutcome, AuthenticateError<ChannelClosed>>,
            Result<HandshakeOutcome, AuthenticateError<ChannelClosed>>,
        ) {
            let (mut a, mut b) = channel_pair();
            futures::join!(
                initiate(&mut a, &self.dialer, audience, dialed, dialer_now, nonce),
                respond(&mut b, self.responder(), TimestampSeconds::new(10_000)),
            )
        }
    }

    #[tokio::test]
    async fn discovery_handshake_succeeds() {
        let peers = Peers::new();
        let (dialer, listener) = peers
            .run(
                Audience::discover(),
                &[fp(2)],
                TimestampSeconds::new(10_000),
                Nonce::new(1),
            )
            .await;

        let dialer = dialer.unwrap_or_else(|e| unreachable!("{e}"));
        let listener = listener.unwrap_or_else(|e| unreachable!("{e}"));
        assert_eq!(dialer.remote_peer_id, peers.listener.peer_id());
        assert_eq!(dialer.remote_fingerprints, peers.served);
        assert_eq!(listener.remote_peer_id, peers.dialer.peer_id());
        assert_eq!(listener.remote_fingerprints, vec![fp(2)]);
    }

    #[tokio::test]
    async fn known_peer_handshake_succeeds() {
        let peers = Peers::new();
        let (dialer, listener) = peers
            .run(
                Audience::known(peers.listener.peer_id()),
                &[fp(1)],
                TimestampSeconds::new(10_000),
                Nonce::new(2),
            )
            .await;
        assert!(dialer.is_ok());
        assert!(listener.is_ok());
    }

    #[tokio::test]
    async fn wrong_audience_is_rejected() {
        let peers = Peers::new();
        let (dialer, listener) = peers
            .run(
                Audience::known(PeerId::new([9; 32])),
                &[fp(1)],
                TimestampSeconds::new(10_000),
                Nonce::new(3),
            )
            .await;
        assert!(matches!(
            dialer,
            Err(AuthenticateError::Rejected(RejectionReason::InvalidAudience))
        ));
        assert!(matches!(listener, Err(AuthenticateError::InvalidAudience)));
    }

    #[tokio::test]
    async fn stale_challenge_is_rejected() {
        let peers = Peers::new();
        let (dialer, listener) = peers
            .run(
                Audience::discover(),
                &[fp(1)],
                TimestampSeconds::new(1_000),
                Nonce::new(4),
            )
            .await;
        assert!(matches!(
            dialer,
            Err(AuthenticateError::Rejected(RejectionReason::ClockDrift))
        ));
        assert!(matches!(listener, Err(AuthenticateError::ClockDrift { .. })));
    }

    #[tokio::test]
    async fn replayed_nonce_is_rejected() {
        let peers = Peers::new();
        let now = TimestampSeconds::new(10_000);
        let (first, _) = peers
            .run(Audience::discover(), &[fp(1)], now, Nonce::new(5))
            .await;
        assert!(first.is_ok());

        let (dialer, listener) = peers
            .run(Audience::discover(), &[fp(1)], now, Nonce::new(5))
            .await;
        assert!(matches!(
            dialer,
            Err(AuthenticateError::Rejected(RejectionReason::ReplayedNonce))
        ));
        assert!(matches!(listener, Err(AuthenticateError::NonceReused)));
    }

    #[tokio::test]
    async fn unserved_fingerprint_is_rejected_by_listener() {
        let peers = Peers::new();
        let (dialer, listener) = peers
            .run(
                Audience::discover(),
                &[fp(7)],
                TimestampSeconds::new(10_000),
                Nonce::new(6),
            )
            .await;
        assert!(matches!(
            dialer,
            Err(AuthenticateError::Rejected(
                RejectionReason::FingerprintMismatch
            ))
        ));
        assert!(matches!(listener, Err(AuthenticateError::FingerprintMismatch)));
    }

    #[tokio::test]
    async fn dialer_checks_reported_fingerprints() {
        // A listener that answers correctly but reports other certificates.
        let dialer = LocalSigner::from_bytes(&[1; 32]);
        let listener = LocalSigner::from_bytes(&[2; 32]);
        let (mut a, mut b) = channel_pair();

        let rogue = async {
            let bytes = b.recv().await.unwrap_or_else(|e| unreachable!("{e}"));
            let HandshakeMessage::Challenge(challenge) = minicbor::decode(&bytes)
                .unwrap_or_else(|e: minicbor::decode::Error| unreachable!("{e}"))
            else {
                unreachable!("expected a challenge")
            };
            let response = Response {
                challenge_digest: *blake3::hash(challenge.payload_bytes()).as_bytes(),
                server_timestamp: TimestampSeconds::new(10_000),
                fingerprints: vec![fp(8)],
            };
            let signed = Signed::seal(&listener, &response).await;
            b.send(HandshakeMessage::Response(signed).to_bytes())
                .await
                .unwrap_or_else(|e| unreachable!("{e}"));
        };

        let dialed = [fp(1)];
        let (result, ()) = futures::join!(
            initiate(
                &mut a,
                &dialer,
                Audience::discover(),
                &dialed,
                TimestampSeconds::new(10_000),
                Nonce::new(7),
            ),
            rogue
        );
        assert!(matches!(result, Err(AuthenticateError::FingerprintMismatch)));
    }

    #[tokio::test]
    async fn listener_must_be_the_expected_peer() {
        let dialer = LocalSigner::from_bytes(&[1; 32]);
        let impostor = LocalSigner::from_bytes(&[3; 32]);
        let expected = LocalSigner::from_bytes(&[2; 32]).peer_id();
        let served = vec![fp(1)];
        let (mut a, mut b) = channel_pair();

        // The impostor ignores the audience and answers anyway.
        let impostor_side = async {
            let bytes = b.recv().await.unwrap_or_else(|e| unreachable!("{e}"));
            let HandshakeMessage::Challenge(challenge) = minicbor::decode(&bytes)
                .unwrap_or_else(|e: minicbor::decode::Error| unreachable!("{e}"))
            else {
                unreachable!("expected a challenge")
            };
            let response = Response {
                challenge_digest: *blake3::hash(challenge.payload_bytes()).as_bytes(),
                server_timestamp: TimestampSeconds::new(10_000),
                fingerprints: served.clone(),
            };
            let signed = Signed::seal(&impostor, &response).await;
            b.send(HandshakeMessage::Response(signed).to_bytes())
                .await
                .unwrap_or_else(|e| unreachable!("{e}"));
        };

        let (result, ()) = futures::join!(
            initiate(
                &mut a,
                &dialer,
                Audience::known(expected),
                &served,
                TimestampSeconds::new(10_000),
                Nonce::new(8),
            ),
            impostor_side
        );
        assert!(matches!(result, Err(AuthenticateError::PeerMismatch { .. })));
    }

    #[tokio::test]
    async fn response_first_is_unexpected() {
        let peers = Peers::new();
        let (mut a, mut b) = channel_pair();
        let bogus = HandshakeMessage::Rejection(Rejection {
            reason: RejectionReason::ClockDrift,
            server_timestamp: TimestampSeconds::new(0),
        });
        a.send(bogus.to_bytes())
            .await
            .unwrap_or_else(|e| unreachable!("{e}"));

        let result = respond(&mut b, peers.responder(), TimestampSeconds::new(10_000)).await;
        assert!(matches!(result, Err(AuthenticateError::UnexpectedMessage)));
    }

    mod framing {
        use std::net::SocketAddr;

        use super::*;
        use crate::{
            memory::{MemoryNetwork, MemorySession},
            native::{NativeRuntime, NativeServer},
        };

        async fn stream_pair() -> (StreamHandshake<MemorySession>, StreamHandshake<MemorySession>) {
            let runtime = MemoryNetwork::new().runtime(Vec::new());
            let server = runtime
                .bind(SocketAddr::from(([127, 0, 0, 1], 0)))
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
            let (cs, cr) = client.open_bi().await.unwrap_or_else(|e| unreachable!("{e}"));
            let (ss, sr) = accepted
                .accept_bi()
                .await
                .unwrap_or_else(|e| unreachable!("{e}"));
            (StreamHandshake::new(cs, cr), StreamHandshake::new(ss, sr))
        }

        #[tokio::test]
        async fn frames_arrive_whole_and_in_order() {
            let (mut a, mut b) = stream_pair().await;
            a.send(vec![1, 2, 3]).await.unwrap_or_else(|e| unreachable!("{e}"));
            a.send(Vec::new()).await.unwrap_or_else(|e| unreachable!("{e}"));

            assert_eq!(b.recv().await, Ok(vec![1, 2, 3]));
            assert_eq!(b.recv().await, Ok(Vec::new()));
        }

        #[tokio::test]
        async fn split_frames_are_reassembled() {
            let (a, mut b) = stream_pair().await;
            let (mut raw, _recv) = (a.send, a.recv);
            raw.write(Bytes::from_static(&[0, 0]))
                .await
                .unwrap_or_else(|e| unreachable!("{e}"));
            raw.write(Bytes::from_static(&[0, 2, 7]))
                .await
                .unwrap_or_else(|e| unreachable!("{e}"));
            raw.write(Bytes::from_static(&[8]))
                .await
                .unwrap_or_else(|e| unreachable!("{e}"));

            assert_eq!(b.recv().await, Ok(vec![7, 8]));
        }

        #[tokio::test]
        async fn early_close_is_reported() {
            let (a, mut b) = stream_pair().await;
            a.finish().await;
            assert_eq!(b.recv().await, Err(FramingError::ClosedEarly));
        }

        #[tokio::test]
        async fn oversized_frames_are_refused() {
            let (mut a, _b) = stream_pair().await;
            assert_eq!(
                a.send(vec![0; MAX_FRAME_SIZE + 1]).await,
                Err(FramingError::FrameTooLarge(MAX_FRAME_SIZE + 1))
            );
        }

        #[tokio::test]
        async fn oversized_prefix_is_refused() {
            let (a, mut b) = stream_pair().await;
            let (mut raw, _recv) = (a.send, a.recv);
            raw.write(Bytes::from_static(&[0xff, 0xff, 0xff, 0xff]))
                .await
                .unwrap_or_else(|e| unreachable!("{e}"));
            assert_eq!(
                b.recv().await,
                Err(FramingError::FrameTooLarge(0xffff_ffff))
            );
        }
    }
}
