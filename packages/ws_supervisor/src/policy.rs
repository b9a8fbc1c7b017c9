//! Reconnect delay policies.
//!
//! Every policy retries forever; only the wait between attempts differs.

use std::time::Duration;

/// Delay used when nothing else is configured.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(2);

pub trait ReconnectPolicy: Send + Sync + 'static {
    /// How long to wait before reconnect attempt `attempt` (starting at 1).
    fn delay(&self, attempt: u32) -> Duration;
}

impl<P: ReconnectPolicy + ?Sized> ReconnectPolicy for Box<P> {
    fn delay(&self, attempt: u32) -> Duration {
        (**self).delay(attempt)
    }
}

/// Same delay before every attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedDelay(pub Duration);

impl Default for FixedDelay {
    fn default() -> Self {
        Self(DEFAULT_RECONNECT_DELAY)
    }
}

impl ReconnectPolicy for FixedDelay {
    fn delay(&self, _attempt: u32) -> Duration {
        self.0
    }
}

/// Doubles the delay after each failed attempt, up to `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExponentialBackoff {
    pub base: Duration,
    pub max: Duration,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            base: DEFAULT_RECONNECT_DELAY,
            max: Duration::from_secs(30),
        }
    }
}

impl ReconnectPolicy for ExponentialBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.base.saturating_mul(1u32 << exp).min(self.max)
    }
}
