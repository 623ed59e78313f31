use serde::Deserialize;
use std::net::IpAddr;

/// Configuration shared by every session driver.
///
/// `save_path` is interpreted per backend: a table name for the database
/// driver, a directory for the files driver, and a namespace-bearing server
/// target for the cache driver.
///
/// # Example
///
/// ```rust
/// use sessile::SessionConfig;
///
/// let config = SessionConfig::build()
///     .save_path("/var/lib/sessions")
///     .cookie_name("app_session")
///     .match_ip(true)
///     .lifetime(7200);
/// ```
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Storage location: table name, directory, or server list.
    pub save_path: String,
    /// Session cookie name; used as the record-name prefix on file and
    /// cache backends.
    pub cookie_name: String,
    /// Bind each record to the client address it was created from.
    pub match_ip: bool,
    /// Record lifetime in seconds; cache TTL and the default gc threshold.
    pub lifetime_secs: i64,
    /// Upper bound on waiting for the relational advisory lock.
    pub lock_wait_secs: u64,
    /// Attempt cap for the cache lock's poll-retry loop.
    pub lock_attempts: u32,
    /// Sleep between lock polls, in seconds.
    pub lock_retry_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            save_path: String::new(),
            cookie_name: "session".to_string(),
            match_ip: false,
            lifetime_secs: 7200,
            lock_wait_secs: 300,
            lock_attempts: 30,
            lock_retry_secs: 1,
        }
    }
}

impl SessionConfig {
    /// Creates a new `SessionConfig` with default values.
    pub fn build() -> Self {
        Self::default()
    }

    pub fn save_path(mut self, save_path: impl Into<String>) -> Self {
        self.save_path = save_path.into();
        self
    }

    pub fn cookie_name(mut self, name: impl Into<String>) -> Self {
        self.cookie_name = name.into();
        self
    }

    pub fn match_ip(mut self, match_ip: bool) -> Self {
        self.match_ip = match_ip;
        self
    }

    pub fn lifetime(mut self, seconds: i64) -> Self {
        self.lifetime_secs = seconds;
        self
    }

    pub fn lock_wait(mut self, seconds: u64) -> Self {
        self.lock_wait_secs = seconds;
        self
    }

    pub fn lock_attempts(mut self, attempts: u32) -> Self {
        self.lock_attempts = attempts;
        self
    }

    pub fn lock_retry(mut self, seconds: u64) -> Self {
        self.lock_retry_secs = seconds;
        self
    }
}

/// Per-request context passed explicitly into every driver call.
///
/// Replaces any reliance on ambient request state: the client address used
/// by `match_ip` predicates travels with the call.
#[derive(Clone, Copy, Debug, Default)]
pub struct RequestContext {
    pub remote_addr: Option<IpAddr>,
}

impl RequestContext {
    pub fn new(remote_addr: Option<IpAddr>) -> Self {
        Self { remote_addr }
    }

    pub fn from_addr(remote_addr: IpAddr) -> Self {
        Self {
            remote_addr: Some(remote_addr),
        }
    }

    /// The client address rendered for storage predicates.
    pub fn addr_string(&self) -> Option<String> {
        self.remote_addr.map(|addr| addr.to_string())
    }
}
