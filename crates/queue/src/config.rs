//! Engine configuration.

use std::time::Duration;

/// Shared queue configuration.
///
/// All values are plain scalars shared by every worker against the same
/// store; there are no per-job overrides. `lease_duration` is the effective
/// "is this worker still alive" timeout.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// How long a claim holds the job before the reaper may reclaim it
    pub lease_duration: Duration,
    /// Default claim batch size
    pub batch_size: usize,
    /// How often the reaper scans for expired leases
    pub reaper_interval: Duration,
    /// How often owners extend their lease; must stay well under
    /// `lease_duration` so a late tick does not read as a crash
    pub heartbeat_interval: Duration,
    /// Worker sleep between empty polls
    pub poll_interval: Duration,
    /// Fraction of `poll_interval` added as random jitter (0.0–1.0)
    pub poll_jitter: f64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        let lease_duration = Duration::from_secs(120);
        Self {
            lease_duration,
            batch_size: 10,
            reaper_interval: Duration::from_secs(60),
            heartbeat_interval: lease_duration / 3,
            poll_interval: Duration::from_secs(1),
            poll_jitter: 0.2,
        }
    }
}

impl QueueConfig {
    /// Set the lease duration, keeping the heartbeat at a third of it.
    pub fn with_lease_duration(mut self, lease: Duration) -> Self {
        self.lease_duration = lease;
        self.heartbeat_interval = lease / 3;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_reaper_interval(mut self, interval: Duration) -> Self {
        self.reaper_interval = interval;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_keep_heartbeat_under_lease() {
        let config = QueueConfig::default();
        assert!(config.heartbeat_interval < config.lease_duration);
    }

    #[test]
    fn lease_builder_rescales_heartbeat() {
        let config = QueueConfig::default().with_lease_duration(Duration::from_secs(30));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(10));
    }
}
