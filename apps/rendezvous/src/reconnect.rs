use std::time::Duration;

use rand::Rng;

/// What a server activity does after its connection ends or fails to open.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ReconnectPolicy {
    /// One attempt per `start_all`; the activity ends with the connection.
    #[default]
    Never,
    /// Exponential backoff: `initial * 2^n` capped at `max_delay`, where `n`
    /// counts consecutive failures. A successful handshake resets `n`.
    Backoff {
        initial: Duration,
        max_delay: Duration,
        /// Retries allowed in a row without a successful handshake. `None`
        /// retries forever.
        max_attempts: Option<u32>,
        /// Scale each delay by a random factor in `[0.5, 1.5)`.
        jitter: bool,
    },
}

impl ReconnectPolicy {
    pub fn backoff(initial: Duration, max_delay: Duration) -> Self {
        ReconnectPolicy::Backoff {
            initial,
            max_delay,
            max_attempts: None,
            jitter: false,
        }
    }

    /// Delay before the next attempt after `failures` consecutive failures,
    /// or `None` when the activity should stop.
    pub fn delay(&self, failures: u32) -> Option<Duration> {
        match *self {
            ReconnectPolicy::Never => None,
            ReconnectPolicy::Backoff {
                initial,
                max_delay,
                max_attempts,
                ..
            } => {
                if max_attempts.is_some_and(|max| failures >= max) {
                    return None;
                }
                let factor = 1u32.checked_shl(failures).unwrap_or(u32::MAX);
                Some(initial.saturating_mul(factor).min(max_delay))
            }
        }
    }

    /// [`delay`](Self::delay) with jitter applied when enabled.
    pub fn next_delay(&self, failures: u32) -> Option<Duration> {
        let base = self.delay(failures)?;
        match self {
            ReconnectPolicy::Backoff { jitter: true, .. } => {
                let scale = rand::thread_rng().gen_range(0.5..1.5);
                Some(base.mul_f64(scale))
            }
            _ => Some(base),
        }
    }
}
