//! The thin facade the host's session subsystem talks to.
//!
//! Everything here flattens driver errors into degraded returns: a failing
//! session store must cost the request its persisted state, never its
//! response. Fatal configuration problems are the one exception and surface
//! from [`Session::open`].

use crate::config::{RequestContext, SessionConfig};
use crate::driver::{Result, SessionDriver};
use crate::id;

/// A session handle bound to one request.
///
/// Wraps the selected driver with the host-facing contract: raw session
/// bytes by id, strict id validation at the boundary, and error-to-degraded
/// flattening.
///
/// # Example
///
/// ```rust,no_run
/// use sessile::{DriverKind, DriverRegistry, Session, SessionConfig};
///
/// # async fn handle() {
/// let config = SessionConfig::build()
///     .save_path("/var/lib/sessions")
///     .cookie_name("app_session");
///
/// let registry = DriverRegistry::new();
/// let driver = registry.build(DriverKind::Files, &config).unwrap();
///
/// let mut session = Session::new(driver, config);
/// session.open().await.unwrap();
///
/// let id = sessile::id::generate();
/// let state = session.get(&id).await;
/// session.set(&id, b"count=1").await;
/// session.close().await;
/// # let _ = state;
/// # }
/// ```
pub struct Session {
    driver: Box<dyn SessionDriver>,
    config: SessionConfig,
    ctx: RequestContext,
}

impl Session {
    pub fn new(driver: Box<dyn SessionDriver>, config: SessionConfig) -> Self {
        Self {
            driver,
            config,
            ctx: RequestContext::default(),
        }
    }

    /// Attaches the request context used for `match_ip` predicates.
    pub fn with_context(mut self, ctx: RequestContext) -> Self {
        self.ctx = ctx;
        self
    }

    /// Prepares the underlying storage.
    ///
    /// Errors here are fatal misconfigurations and are the only driver
    /// errors this facade propagates instead of degrading.
    pub async fn open(&mut self) -> Result<()> {
        self.driver
            .open(&self.config.save_path, &self.config.cookie_name)
            .await
    }

    /// Reads the raw session payload, locking the session.
    ///
    /// Malformed ids, missing records, and storage failures all come back
    /// as an empty payload.
    #[tracing::instrument(name = "reading session", skip(self))]
    pub async fn get(&mut self, session_id: &str) -> Vec<u8> {
        if !id::is_valid(session_id) {
            tracing::debug!("rejected malformed session id");
            return Vec::new();
        }

        match self.driver.read(&self.ctx, session_id).await {
            Ok(data) => data,
            Err(err) => {
                tracing::error!(err = %err, "failed to read session, degrading to empty");
                Vec::new()
            }
        }
    }

    /// Persists the raw session payload.
    ///
    /// Returns `false` when nothing was persisted; the request proceeds
    /// without session continuity in that case.
    #[tracing::instrument(name = "writing session", skip(self, data))]
    pub async fn set(&mut self, session_id: &str, data: &[u8]) -> bool {
        if !id::is_valid(session_id) {
            tracing::debug!("rejected malformed session id");
            return false;
        }

        match self.driver.write(&self.ctx, session_id, data).await {
            Ok(()) => true,
            Err(err) => {
                tracing::error!(err = %err, "failed to write session");
                false
            }
        }
    }

    /// Releases the session lock. Safe to call any number of times.
    #[tracing::instrument(name = "closing session", skip(self))]
    pub async fn close(&mut self) -> bool {
        match self.driver.close().await {
            Ok(()) => true,
            Err(err) => {
                tracing::error!(err = %err, "failed to close session");
                false
            }
        }
    }

    /// Deletes the session record. Cookie invalidation stays with the
    /// transport layer and should only happen when this returns `true`.
    #[tracing::instrument(name = "destroying session", skip(self))]
    pub async fn destroy(&mut self, session_id: &str) -> bool {
        if !id::is_valid(session_id) {
            tracing::debug!("rejected malformed session id");
            return false;
        }

        match self.driver.destroy(&self.ctx, session_id).await {
            Ok(()) => true,
            Err(err) => {
                tracing::error!(err = %err, "failed to destroy session");
                false
            }
        }
    }

    /// Garbage-collects records older than the configured lifetime.
    /// Returns the number of records removed.
    #[tracing::instrument(name = "sweeping sessions", skip(self))]
    pub async fn sweep(&mut self) -> u64 {
        match self.driver.gc(self.config.lifetime_secs).await {
            Ok(removed) => removed,
            Err(err) => {
                tracing::error!(err = %err, "session gc failed");
                0
            }
        }
    }
}
