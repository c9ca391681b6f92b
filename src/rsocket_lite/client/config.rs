use std::time::Duration;

use bon::Builder;

use crate::rsocket_lite::transport::TransportConfig;

/// Bound and backoff for reconnect loops.
///
/// Applies to consecutive resumption rejections (each answered with a fresh session) and to
/// failed dials while resuming a dropped session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Builder)]
pub struct RetryPolicy {
    /// Fresh-session attempts allowed after consecutive resumption rejections.
    #[builder(default = 5)]
    pub max_attempts: u32,

    #[builder(default = Duration::from_millis(100))]
    pub initial_backoff: Duration,

    #[builder(default = Duration::from_secs(5))]
    pub max_backoff: Duration,

    #[builder(default = 2)]
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (zero based): exponential, capped at `max_backoff`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.initial_backoff
            .saturating_mul(self.multiplier.saturating_pow(attempt))
            .min(self.max_backoff)
    }
}

/// Session parameters negotiated in the setup frame.
#[derive(Debug, Clone, Builder)]
pub struct SessionConfig {
    /// How long a dropped session may be resumed.
    #[builder(default = Duration::from_secs(60))]
    pub resume_timeout: Duration,

    /// Keepalive period. Zero disables keepalives.
    #[builder(default = Duration::from_secs(20))]
    pub keepalive_interval: Duration,

    /// Deadline for the server to answer a setup or resume frame.
    #[builder(default = Duration::from_secs(10))]
    pub handshake_timeout: Duration,

    #[builder(default)]
    pub retry: RetryPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Everything [`ConnectionManager::connect`](super::ConnectionManager::connect) needs.
#[derive(Debug, Clone, Default, Builder)]
pub struct ConnectConfig {
    #[builder(default)]
    pub transport: TransportConfig,

    #[builder(default)]
    pub session: SessionConfig,
}
