//! The session driver contract and its backend implementations.

use async_trait::async_trait;

use crate::config::RequestContext;

#[cfg(feature = "database-driver")]
pub mod database;
mod files;
#[cfg(feature = "redis-driver")]
pub mod redis;

pub use files::FilesDriver;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Fatal misconfiguration detected at `open` or construction time.
    /// Session initialization must abort loudly on this variant.
    #[error("session storage is misconfigured: {0}")]
    Config(String),

    /// A write was attempted while no lock is held for the session.
    #[error("no lock is held for session {0}")]
    NotLocked(String),

    /// The lock could not be acquired within the backend's bounded wait.
    #[error("could not acquire lock for session {0}")]
    LockUnavailable(String),

    /// `match_ip` is enabled but the request context carries no address.
    #[error("match_ip is enabled and the request has no client address")]
    AddressRequired,

    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),

    #[cfg(feature = "database-driver")]
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[cfg(feature = "redis-driver")]
    #[error("cache error: {0}")]
    Cache(#[from] fred::error::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Whether the record for the current session id is known to exist in
/// storage. Decides insert-vs-update on the next write; reset whenever the
/// session id changes under the driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RecordState {
    Absent,
    Present,
}

/// Seconds since the Unix epoch.
pub(crate) fn unix_now() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}

/// A session storage backend.
///
/// One driver instance serves one in-flight request; all concurrency is
/// between instances (same or different processes) targeting the same
/// session id, serialized by the backend-native lock taken in [`read`] and
/// released in [`close`].
///
/// Per-request failures are recoverable `Err` values and must never leave
/// storage partially mutated: in particular a driver's fingerprint only
/// advances after the backend has confirmed a write.
///
/// [`read`]: SessionDriver::read
/// [`close`]: SessionDriver::close
#[async_trait]
pub trait SessionDriver: Send {
    /// Validates and prepares the storage location.
    ///
    /// Failure here is a fatal misconfiguration ([`Error::Config`]), not a
    /// per-request error.
    async fn open(&mut self, save_path: &str, name: &str) -> Result<()>;

    /// Acquires the session lock and loads the record's payload.
    ///
    /// A missing record, an undecodable record, and a failed lock
    /// acquisition all return an empty payload without creating anything;
    /// absence is a normal condition for a new session. After a failed lock
    /// acquisition the driver holds no lock, so subsequent writes fail.
    async fn read(&mut self, ctx: &RequestContext, session_id: &str) -> Result<Vec<u8>>;

    /// Persists the payload for `session_id`.
    ///
    /// If the id differs from the one last read (regenerated mid-request),
    /// the old lock is released and a fresh one acquired before anything is
    /// written; the whole write fails if either step fails. An unchanged
    /// payload (by fingerprint) only refreshes the record's last-touched
    /// timestamp and the lock TTL.
    async fn write(&mut self, ctx: &RequestContext, session_id: &str, data: &[u8]) -> Result<()>;

    /// Releases the lock if one is held. Idempotent.
    async fn close(&mut self) -> Result<()>;

    /// Deletes the record for `session_id` under the same `match_ip`
    /// predicate as reads and writes, then releases the lock.
    async fn destroy(&mut self, ctx: &RequestContext, session_id: &str) -> Result<()>;

    /// Removes records whose last-touched timestamp is older than
    /// `max_lifetime_secs`. Returns the number of records removed; backends
    /// whose storage expires records natively return 0.
    async fn gc(&mut self, max_lifetime_secs: i64) -> Result<u64>;
}
