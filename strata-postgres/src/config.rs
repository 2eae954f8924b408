use std::time::Duration;

/// Connection settings for [`Store::connect`](crate::Store::connect).
///
/// Settings are given in code; reading them from files or the environment is
/// left to the application.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    /// How often reads that await open transactions re-check them.
    pub poll_interval: Duration,
}

impl Config {
    pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;
    pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: Self::DEFAULT_MAX_CONNECTIONS,
            acquire_timeout: Self::DEFAULT_ACQUIRE_TIMEOUT,
            poll_interval: Self::DEFAULT_POLL_INTERVAL,
        }
    }

    #[must_use]
    pub fn max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections;
        self
    }

    #[must_use]
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    #[must_use]
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}
