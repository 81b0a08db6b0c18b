use std::time::Duration;

use crate::autolink::ports::RetryStrategy;

/// Reconnects as soon as the loss is observed.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImmediateRetry;

impl RetryStrategy for ImmediateRetry {
    fn delay_for(&self, _attempt: u32) -> Duration {
        Duration::ZERO
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackoff {
    pub base_ms: u64,
    pub max_ms: u64,
}

impl ExponentialBackoff {
    pub fn new(base_ms: u64, max_ms: u64) -> Self {
        Self { base_ms, max_ms }
    }
}

impl RetryStrategy for ExponentialBackoff {
    fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_ms.max(1) as f64;
        let max = self.max_ms.max(1) as f64;
        let exp = attempt.saturating_sub(1).min(30) as i32;
        let without_jitter = (base * 2f64.powi(exp)).min(max);
        let jitter_factor = 0.9 + (attempt as f64 % 3.0) * 0.05;
        Duration::from_millis((without_jitter * jitter_factor) as u64)
    }
}
