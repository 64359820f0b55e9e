//! Transport and listener settings.

use core::time::Duration;

use crate::muxer::DEFAULT_MAX_INBOUND_STREAMS;

/// Default wait for an accepted session to become ready.
pub const DEFAULT_SESSION_READY_TIMEOUT: Duration = Duration::from_millis(1000);

/// Default tolerance between a challenge timestamp and the listener's clock.
pub const DEFAULT_HANDSHAKE_MAX_DRIFT: Duration = Duration::from_secs(10 * 60);

/// Settings shared by dialing and listening.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TransportConfig {
    /// Open streams per session beyond which inbound streams are refused.
    pub max_inbound_streams: usize,

    /// How long a listener waits for an accepted session to become ready.
    pub session_ready_timeout: Duration,

    /// Upper bound on the authentication handshake. `None` waits forever.
    pub handshake_timeout: Option<Duration>,

    /// Accepted distance between a challenge timestamp and local time.
    pub handshake_max_drift: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_inbound_streams: DEFAULT_MAX_INBOUND_STREAMS,
            session_ready_timeout: DEFAULT_SESSION_READY_TIMEOUT,
            handshake_timeout: None,
            handshake_max_drift: DEFAULT_HANDSHAKE_MAX_DRIFT,
        }
    }
}

impl TransportConfig {
    /// Set the inbound stream ceiling.
    #[must_use]
    pub const fn with_max_inbound_streams(mut self, max: usize) -> Self {
        self.max_inbound_streams = max;
        self
    }

    /// Set the session-ready timeout.
    #[must_use]
    pub const fn with_session_ready_timeout(mut self, timeout: Duration) -> Self {
        self.session_ready_timeout = timeout;
        self
    }

    /// Bound the handshake.
    #[must_use]
    pub const fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = Some(timeout);
        self
    }

    /// Set the challenge drift tolerance.
    #[must_use]
    pub const fn with_handshake_max_drift(mut self, drift: Duration) -> Self {
        self.handshake_max_drift = drift;
        self
    }
}

/// Per-listener overrides. Unset fields fall back to the [`TransportConfig`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ListenerOptions {
    /// Overrides [`TransportConfig::max_inbound_streams`].
    pub max_inbound_streams: Option<usize>,

    /// Overrides [`TransportConfig::session_ready_timeout`].
    pub session_ready_timeout: Option<Duration>,
}

impl ListenerOptions {
    /// Override the inbound stream ceiling.
    #[must_use]
    pub const fn with_max_inbound_streams(mut self, max: usize) -> Self {
        self.max_inbound_streams = Some(max);
        self
    }

    /// Override the session-ready timeout.
    #[must_use]
    pub const fn with_session_ready_timeout(mut self, timeout: Duration) -> Self {
        self.session_ready_timeout = Some(timeout);
        self
    }

    /// Resolve against transport defaults.
    #[must_use]
    pub fn resolve(&self, config: &TransportConfig) -> TransportConfig {
        TransportConfig {
            max_inbound_streams: self
                .max_inbound_streams
                .unwrap_or(config.max_inbound_streams),
            session_ready_timeout: self
                .session_ready_timeout
                .unwrap_or(config.session_ready_timeout),
            ..*config
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = TransportConfig::default();
        assert_eq!(config.max_inbound_streams, 1000);
        assert_eq!(config.session_ready_timeout, Duration::from_millis(1000));
        assert_eq!(config.handshake_timeout, None);
    }

    #[test]
    fn listener_overrides_win() {
        let config = TransportConfig::default().with_handshake_timeout(Duration::from_secs(3));
        let resolved = ListenerOptions::default()
            .with_max_inbound_streams(4)
            .resolve(&config);

        assert_eq!(resolved.max_inbound_streams, 4);
        assert_eq!(resolved.session_ready_timeout, config.session_ready_timeout);
        assert_eq!(resolved.handshake_timeout, Some(Duration::from_secs(3)));
    }
}
