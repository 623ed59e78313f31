//! Relational session driver backed by Postgres.
//!
//! Sessions are rows in a single table; mutual exclusion uses the server's
//! session-scoped advisory locks, keyed by a hash of the session id (and the
//! client address when `match_ip` is on). The lock lives on a dedicated
//! pooled connection held for the duration of the critical section, because
//! advisory locks are scoped to the connection that took them.

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use sqlx::pool::PoolConnection;
use sqlx::{PgPool, Postgres};
use std::time::Duration;

use crate::config::{RequestContext, SessionConfig};
use crate::driver::{Error, RecordState, Result, SessionDriver, unix_now};
use crate::fingerprint::Fingerprint;

/// A database session driver.
///
/// The backing table is created on `open` when `create_table` is enabled:
///
/// ```sql
/// create table if not exists "sessions" (
///     id text primary key,
///     ip_address text,
///     created_at bigint not null,
///     updated_at bigint not null,
///     data text not null default ''
/// );
/// ```
///
/// Payloads are stored base64-encoded in the `data` text column; rows that
/// fail to decode read as empty sessions.
pub struct DatabaseDriver {
    pool: PgPool,
    config: SessionConfig,
    create_table: bool,
    table: String,
    lock: Option<AdvisoryLock>,
    current_id: Option<String>,
    record: RecordState,
    fingerprint: Fingerprint,
    opened: bool,
}

struct AdvisoryLock {
    conn: PoolConnection<Postgres>,
    key: i64,
}

impl DatabaseDriver {
    /// Creates a driver over an already-connected pool.
    ///
    /// The pool must allow at least two connections: one is parked on the
    /// advisory lock while the others serve queries.
    pub fn new(pool: PgPool, config: SessionConfig) -> Self {
        Self {
            pool,
            config,
            create_table: false,
            table: String::new(),
            lock: None,
            current_id: None,
            record: RecordState::Absent,
            fingerprint: Fingerprint::empty(),
            opened: false,
        }
    }

    /// Create the session table and its gc index on `open` if missing.
    pub fn with_create_table(mut self, create_table: bool) -> Self {
        self.create_table = create_table;
        self
    }

    fn ensure_open(&self) -> Result<()> {
        if self.opened {
            Ok(())
        } else {
            Err(Error::Config(
                "database driver used before open()".to_string(),
            ))
        }
    }

    fn addr_predicate(&self, ctx: &RequestContext) -> Result<Option<String>> {
        if self.config.match_ip {
            ctx.addr_string().map(Some).ok_or(Error::AddressRequired)
        } else {
            Ok(None)
        }
    }

    /// Bounded advisory-lock acquisition: polls `pg_try_advisory_lock` once
    /// per retry interval until `lock_wait_secs` elapses. Returns `false` on
    /// timeout, leaving no lock state behind.
    async fn acquire_lock(&mut self, ctx: &RequestContext, session_id: &str) -> Result<bool> {
        let key = lock_key(session_id, self.addr_predicate(ctx)?.as_deref());
        let mut conn = self.pool.acquire().await?;
        let deadline =
            tokio::time::Instant::now() + Duration::from_secs(self.config.lock_wait_secs);

        loop {
            let locked: bool = sqlx::query_scalar("select pg_try_advisory_lock($1)")
                .bind(key)
                .fetch_one(&mut *conn)
                .await?;

            if locked {
                self.lock = Some(AdvisoryLock { conn, key });
                return Ok(true);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(Duration::from_secs(self.config.lock_retry_secs.max(1))).await;
        }
    }

    /// Idempotent release. Unlocks on the same connection that holds the
    /// lock; if the unlock cannot be issued the connection is detached from
    /// the pool so the server reclaims the lock when it closes.
    async fn release_lock(&mut self) -> Result<()> {
        let Some(mut lock) = self.lock.take() else {
            return Ok(());
        };

        let unlocked = sqlx::query("select pg_advisory_unlock($1)")
            .bind(lock.key)
            .execute(&mut *lock.conn)
            .await;

        self.current_id = None;
        self.record = RecordState::Absent;

        if let Err(err) = unlocked {
            drop(lock.conn.detach());
            return Err(err.into());
        }
        Ok(())
    }
}

#[async_trait]
impl SessionDriver for DatabaseDriver {
    async fn open(&mut self, save_path: &str, _name: &str) -> Result<()> {
        if !valid_identifier(save_path) {
            return Err(Error::Config(format!(
                "'{save_path}' is not a valid session table name"
            )));
        }
        if self.pool.options().get_max_connections() < 2 {
            return Err(Error::Config(
                "session pool must allow at least 2 connections; one is held by the advisory lock"
                    .to_string(),
            ));
        }

        self.table = format!("\"{save_path}\"");

        if self.create_table {
            sqlx::raw_sql(&format!(
                r#"
                create table if not exists {table} (
                    id text primary key,
                    ip_address text,
                    created_at bigint not null,
                    updated_at bigint not null,
                    data text not null default ''
                );
                create index if not exists idx_{save_path}_updated_at on {table}(updated_at);
                "#,
                table = self.table,
            ))
            .execute(&self.pool)
            .await
            .map_err(|err| Error::Config(format!("could not prepare session table: {err}")))?;
        } else {
            sqlx::query("select 1")
                .execute(&self.pool)
                .await
                .map_err(|err| Error::Config(format!("database unreachable: {err}")))?;
        }

        self.opened = true;
        Ok(())
    }

    async fn read(&mut self, ctx: &RequestContext, session_id: &str) -> Result<Vec<u8>> {
        self.ensure_open()?;

        if self.current_id.as_deref() != Some(session_id) {
            self.release_lock().await?;
            if !self.acquire_lock(ctx, session_id).await? {
                tracing::warn!(session_id, "advisory lock unavailable, session degrades to empty");
                self.fingerprint = Fingerprint::empty();
                return Ok(Vec::new());
            }
            self.current_id = Some(session_id.to_string());
        }

        let addr = self.addr_predicate(ctx)?;
        let query = match addr {
            Some(_) => format!(
                "select data from {} where id = $1 and ip_address = $2",
                self.table
            ),
            None => format!("select data from {} where id = $1", self.table),
        };

        let mut q = sqlx::query_scalar(&query).bind(session_id);
        if let Some(addr) = &addr {
            q = q.bind(addr.as_str());
        }
        let row: Option<String> = q.fetch_optional(&self.pool).await?;

        let Some(encoded) = row else {
            self.record = RecordState::Absent;
            self.fingerprint = Fingerprint::empty();
            return Ok(Vec::new());
        };

        match BASE64.decode(encoded.trim_end()) {
            Ok(data) => {
                self.record = RecordState::Present;
                self.fingerprint = Fingerprint::of(&data);
                Ok(data)
            }
            Err(err) => {
                // An undecodable row reads as empty, but the row is still
                // there: the next write must update, not insert.
                tracing::warn!(session_id, err = %err, "session payload failed to decode");
                self.record = RecordState::Present;
                self.fingerprint = Fingerprint::empty();
                Ok(Vec::new())
            }
        }
    }

    async fn write(&mut self, ctx: &RequestContext, session_id: &str, data: &[u8]) -> Result<()> {
        self.ensure_open()?;

        if self.current_id.as_deref() != Some(session_id) {
            // Id regenerated mid-request: trade the old lock for a fresh one
            // and forget everything tracked for the old row.
            self.release_lock().await?;
            if !self.acquire_lock(ctx, session_id).await? {
                return Err(Error::LockUnavailable(session_id.to_string()));
            }
            self.record = RecordState::Absent;
            self.fingerprint = Fingerprint::empty();
            self.current_id = Some(session_id.to_string());
        } else if self.lock.is_none() {
            return Err(Error::NotLocked(session_id.to_string()));
        }

        let now = unix_now();
        let addr = self.addr_predicate(ctx)?;

        if self.record == RecordState::Absent {
            let query = format!(
                "insert into {} (id, ip_address, created_at, updated_at, data) values ($1, $2, $3, $3, $4)",
                self.table
            );
            sqlx::query(&query)
                .bind(session_id)
                .bind(ctx.addr_string())
                .bind(now)
                .bind(BASE64.encode(data))
                .execute(&self.pool)
                .await?;

            self.record = RecordState::Present;
            self.fingerprint = Fingerprint::of(data);
            return Ok(());
        }

        if self.fingerprint.matches(data) {
            // Touch-only: the payload is unchanged, but gc must still see
            // the session as live.
            let query = match addr {
                Some(_) => format!(
                    "update {} set updated_at = $2 where id = $1 and ip_address = $3",
                    self.table
                ),
                None => format!("update {} set updated_at = $2 where id = $1", self.table),
            };
            let mut q = sqlx::query(&query).bind(session_id).bind(now);
            if let Some(addr) = &addr {
                q = q.bind(addr.as_str());
            }
            q.execute(&self.pool).await?;
            return Ok(());
        }

        let query = match addr {
            Some(_) => format!(
                "update {} set updated_at = $2, data = $3 where id = $1 and ip_address = $4",
                self.table
            ),
            None => format!(
                "update {} set updated_at = $2, data = $3 where id = $1",
                self.table
            ),
        };
        let mut q = sqlx::query(&query)
            .bind(session_id)
            .bind(now)
            .bind(BASE64.encode(data));
        if let Some(addr) = &addr {
            q = q.bind(addr.as_str());
        }
        q.execute(&self.pool).await?;

        self.fingerprint = Fingerprint::of(data);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.release_lock().await
    }

    async fn destroy(&mut self, ctx: &RequestContext, session_id: &str) -> Result<()> {
        self.ensure_open()?;

        if self.lock.is_some() {
            let addr = self.addr_predicate(ctx)?;
            let query = match addr {
                Some(_) => format!(
                    "delete from {} where id = $1 and ip_address = $2",
                    self.table
                ),
                None => format!("delete from {} where id = $1", self.table),
            };
            let mut q = sqlx::query(&query).bind(session_id);
            if let Some(addr) = &addr {
                q = q.bind(addr.as_str());
            }
            q.execute(&self.pool).await?;
        }

        self.close().await
    }

    async fn gc(&mut self, max_lifetime_secs: i64) -> Result<u64> {
        self.ensure_open()?;

        let threshold = unix_now() - max_lifetime_secs.max(0);
        let query = format!("delete from {} where updated_at < $1", self.table);
        let result = sqlx::query(&query)
            .bind(threshold)
            .execute(&self.pool)
            .await?;

        tracing::debug!(removed = result.rows_affected(), "session gc swept table");
        Ok(result.rows_affected())
    }
}

fn valid_identifier(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

/// Advisory lock key for a session: the first 8 bytes of the hashed id
/// (and client address, when bound) as a big-endian i64.
fn lock_key(session_id: &str, addr: Option<&str>) -> i64 {
    let mut material = String::from(session_id);
    if let Some(addr) = addr {
        material.push('_');
        material.push_str(addr);
    }
    let digest = blake3::hash(material.as_bytes());
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&digest.as_bytes()[..8]);
    i64::from_be_bytes(buf)
}
