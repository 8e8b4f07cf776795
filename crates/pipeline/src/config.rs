use std::time::Duration;

/// Tunables for the scheduler loop.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Delay before the first retry after a systemic failure.
    pub retry_backoff: Duration,
    /// Growth factor per retry. `1.0` keeps the delay fixed.
    pub backoff_multiplier: f64,
    /// Upper bound on any single backoff delay.
    pub max_backoff: Duration,
    /// Bound on one call to the synthesis engine.
    pub engine_timeout: Duration,
    /// Rest between consecutive windows of the same task.
    pub window_pause: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            retry_backoff: Duration::from_secs(5),
            backoff_multiplier: 1.0,
            max_backoff: Duration::from_secs(60),
            engine_timeout: Duration::from_secs(120),
            window_pause: Duration::from_secs(1),
        }
    }
}

impl SchedulerConfig {
    /// Delay before retry number `retry` (1-based), clamped to `max_backoff`.
    pub fn backoff_for(&self, retry: u32) -> Duration {
        if self.backoff_multiplier <= 1.0 {
            return self.retry_backoff.min(self.max_backoff);
        }
        let factor = self
            .backoff_multiplier
            .powi(retry.saturating_sub(1).min(i32::MAX as u32) as i32);
        let delay_ms = self.retry_backoff.as_millis() as f64 * factor;
        Duration::from_millis(delay_ms as u64).min(self.max_backoff)
    }
}
