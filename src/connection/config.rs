use std::time::Duration;

/// Connection pool configuration
///
/// Bounds and timings for a [`ConnectionPool`](super::pool::ConnectionPool).
/// Built with the same chained-setter style as a driver connection config.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Connections opened eagerly at startup and kept as a warm floor
    pub min_connections: usize,

    /// Hard ceiling on live connections (idle + in use + being retired)
    pub max_connections: usize,

    /// How long `acquire` waits on a saturated pool before giving up
    pub acquire_timeout: Duration,

    /// Timeout for a single connection attempt
    pub connect_timeout: Duration,

    /// Attempts made to open a connection before reporting the pool unavailable
    pub connect_retries: u32,

    /// Base delay between connection attempts, doubled after each failure
    pub retry_backoff: Duration,

    /// Idle connections unused for longer than this are closed
    pub idle_timeout: Option<Duration>,

    /// Maximum connection lifetime
    pub max_lifetime: Option<Duration>,

    /// Upper bound on a single liveness probe
    pub health_check_timeout: Duration,

    /// Probe connections when they are released, not only during sweeps
    pub test_on_release: bool,
}

impl PoolConfig {
    /// Create a configuration with the given bounds and default timings
    pub fn new(min_connections: usize, max_connections: usize) -> Self {
        Self {
            min_connections,
            max_connections,
            ..Self::default()
        }
    }

    /// Set minimum connections
    pub fn min_connections(mut self, min: usize) -> Self {
        self.min_connections = min;
        self
    }

    /// Set maximum connections
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Set the bounded wait used by `acquire`
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Set connection timeout
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set how many times connection creation is attempted
    pub fn connect_retries(mut self, retries: u32) -> Self {
        self.connect_retries = retries;
        self
    }

    /// Set the base retry backoff
    pub fn retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Set idle timeout (retention window)
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    /// Keep idle connections indefinitely
    pub fn no_idle_timeout(mut self) -> Self {
        self.idle_timeout = None;
        self
    }

    /// Set maximum lifetime
    pub fn max_lifetime(mut self, lifetime: Duration) -> Self {
        self.max_lifetime = Some(lifetime);
        self
    }

    /// Keep connections regardless of age
    pub fn no_max_lifetime(mut self) -> Self {
        self.max_lifetime = None;
        self
    }

    /// Set the per-connection liveness probe timeout
    pub fn health_check_timeout(mut self, timeout: Duration) -> Self {
        self.health_check_timeout = timeout;
        self
    }

    /// Probe every connection as it is released
    pub fn test_on_release(mut self, enabled: bool) -> Self {
        self.test_on_release = enabled;
        self
    }

    /// Delay before the given connection attempt (1-based) is retried
    pub(crate) fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.retry_backoff.saturating_mul(factor)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.max_connections == 0 {
            return Err("max_connections must be > 0".to_string());
        }

        if self.min_connections > self.max_connections {
            return Err("min_connections cannot exceed max_connections".to_string());
        }

        if self.connect_retries == 0 {
            return Err("connect_retries must be > 0".to_string());
        }

        if self.acquire_timeout.is_zero() {
            return Err("acquire_timeout must be > 0".to_string());
        }

        Ok(())
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 1,
            max_connections: 10,
            acquire_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            connect_retries: 3,
            retry_backoff: Duration::from_millis(100),
            idle_timeout: Some(Duration::from_secs(600)), // 10 minutes
            max_lifetime: Some(Duration::from_secs(1800)), // 30 minutes
            health_check_timeout: Duration::from_secs(2),
            test_on_release: false,
        }
    }
}
