use std::time::Duration;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    /// `base * attempt`
    #[default]
    Linear,
    /// `base * 2^(attempt - 1)`
    Exponential,
}

/// How long to wait for a response to show up in the receive buffer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Unconditional wait after a command before the first look at the buffer
    pub settle_ms: u64,
    pub base_delay_ms: u64,
    /// Extra looks at the buffer after the first one
    pub max_attempts: u32,
    pub backoff: Backoff,
    /// Ceiling on a single delay
    pub max_delay_ms: u64,
    /// Time an instrument gets to prepare its `*IDN?` reply before `++read`
    pub identify_settle_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            settle_ms: 300,
            base_delay_ms: 100,
            max_attempts: 5,
            backoff: Backoff::Linear,
            max_delay_ms: 2000,
            identify_settle_ms: 500,
        }
    }
}

impl RetryPolicy {
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn identify_settle(&self) -> Duration {
        Duration::from_millis(self.identify_settle_ms)
    }

    /// Delay before look number `attempt` (1-based). Attempt 0 has no delay.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let ms = match self.backoff {
            Backoff::Linear => self.base_delay_ms.saturating_mul(attempt as u64),
            Backoff::Exponential => {
                // cap the shift so large attempt counts can't overflow
                let shift = (attempt - 1).min(30);
                self.base_delay_ms.saturating_mul(1u64 << shift)
            }
        };
        Duration::from_millis(ms.min(self.max_delay_ms))
    }

    /// Longest a single read can block: settle plus every retry delay
    pub fn worst_case(&self) -> Duration {
        (1..=self.max_attempts).fold(self.settle(), |total, attempt| total + self.delay_for(attempt))
    }
}
