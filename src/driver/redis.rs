//! Distributed-cache session driver.
//!
//! The payload lives at `<name>:[<ip>:]<id>` with the configured lifetime as
//! its TTL; expiry is therefore the cache's own eviction and `gc` has
//! nothing to do. Mutual exclusion is emulated with a sibling `...:lock` key
//! written check-and-set (`SET NX`) under a short TTL, polled a bounded
//! number of times. A holder that crashes before releasing leaks the lock
//! only until that TTL runs out.

use async_trait::async_trait;
use fred::clients::Client;
use fred::interfaces::{ClientLike, KeysInterface};
use fred::types::{Expiration, SetOptions};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{RequestContext, SessionConfig};
use crate::driver::{Error, Result, SessionDriver, unix_now};
use crate::fingerprint::Fingerprint;

/// TTL of the emulated lock key, in seconds. Bounds how long a crashed
/// holder can block other requests for the same session.
const LOCK_TTL: i64 = 300;

/// A cache session driver, generic over the `fred` client like the
/// rest of the ecosystem; works with a single client or a pool.
pub struct RedisDriver<C = Client>
where
    C: KeysInterface + ClientLike + Clone + Send + Sync + 'static,
{
    client: Arc<C>,
    config: SessionConfig,
    name: String,
    lock_key: Option<String>,
    current_id: Option<String>,
    fingerprint: Fingerprint,
    opened: bool,
}

impl<C> RedisDriver<C>
where
    C: KeysInterface + ClientLike + Clone + Send + Sync + 'static,
{
    /// Creates a driver over an already-connected client.
    pub fn new(client: Arc<C>, config: SessionConfig) -> Self {
        Self {
            client,
            config,
            name: String::new(),
            lock_key: None,
            current_id: None,
            fingerprint: Fingerprint::empty(),
            opened: false,
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.opened {
            Ok(())
        } else {
            Err(Error::Config("cache driver used before open()".to_string()))
        }
    }

    fn payload_key(&self, ctx: &RequestContext, session_id: &str) -> Result<String> {
        let addr = if self.config.match_ip {
            Some(ctx.addr_string().ok_or(Error::AddressRequired)?)
        } else {
            None
        };
        Ok(payload_key(&self.name, addr.as_deref(), session_id))
    }

    /// Acquires (or, when already held, TTL-refreshes) the emulated lock.
    /// Returns `false` once the bounded poll is exhausted; no lock state is
    /// left behind in that case.
    async fn acquire_lock(&mut self, ctx: &RequestContext, session_id: &str) -> Result<bool> {
        if let Some(lock_key) = &self.lock_key {
            let refreshed: Option<String> = self
                .client
                .set(
                    lock_key.as_str(),
                    unix_now(),
                    Some(Expiration::EX(LOCK_TTL)),
                    Some(SetOptions::XX),
                    false,
                )
                .await?;
            return Ok(refreshed.is_some());
        }

        let lock_key = format!("{}:lock", self.payload_key(ctx, session_id)?);
        for attempt in 0..self.config.lock_attempts {
            let set: Option<String> = self
                .client
                .set(
                    lock_key.as_str(),
                    unix_now(),
                    Some(Expiration::EX(LOCK_TTL)),
                    Some(SetOptions::NX),
                    false,
                )
                .await?;

            if set.is_some() {
                self.lock_key = Some(lock_key);
                return Ok(true);
            }

            tracing::debug!(session_id, attempt, "session lock busy, retrying");
            tokio::time::sleep(Duration::from_secs(self.config.lock_retry_secs.max(1))).await;
        }

        Ok(false)
    }

    /// Idempotent release of the lock key. Deleting an already-expired key
    /// is a no-op on the server side.
    async fn release_lock(&mut self) -> Result<()> {
        if let Some(lock_key) = self.lock_key.take() {
            let _: i64 = self.client.del(lock_key.as_str()).await?;
        }
        self.current_id = None;
        Ok(())
    }
}

#[async_trait]
impl<C> SessionDriver for RedisDriver<C>
where
    C: KeysInterface + ClientLike + Clone + Send + Sync + 'static,
{
    async fn open(&mut self, _save_path: &str, name: &str) -> Result<()> {
        if !self.client.is_connected() {
            return Err(Error::Config(
                "cache client is not connected".to_string(),
            ));
        }

        self.name = name.to_string();
        self.opened = true;
        Ok(())
    }

    async fn read(&mut self, ctx: &RequestContext, session_id: &str) -> Result<Vec<u8>> {
        self.ensure_open()?;

        if self.current_id.as_deref() != Some(session_id) {
            self.release_lock().await?;
            if !self.acquire_lock(ctx, session_id).await? {
                tracing::warn!(session_id, "cache lock unavailable, session degrades to empty");
                self.fingerprint = Fingerprint::empty();
                return Ok(Vec::new());
            }
            self.current_id = Some(session_id.to_string());
        }

        let key = self.payload_key(ctx, session_id)?;
        let data: Option<Vec<u8>> = self.client.get(key.as_str()).await?;
        let data = data.unwrap_or_default();

        self.fingerprint = Fingerprint::of(&data);
        Ok(data)
    }

    async fn write(&mut self, ctx: &RequestContext, session_id: &str, data: &[u8]) -> Result<()> {
        self.ensure_open()?;

        if self.current_id.as_deref() != Some(session_id) {
            // Id regenerated mid-request.
            self.release_lock().await?;
            if !self.acquire_lock(ctx, session_id).await? {
                return Err(Error::LockUnavailable(session_id.to_string()));
            }
            self.fingerprint = Fingerprint::empty();
            self.current_id = Some(session_id.to_string());
        } else {
            if self.lock_key.is_none() {
                return Err(Error::NotLocked(session_id.to_string()));
            }
            // Keep the lock from expiring under a long-running request.
            self.acquire_lock(ctx, session_id).await?;
        }

        let key = self.payload_key(ctx, session_id)?;
        let ttl = self.config.lifetime_secs.max(1);

        if self.fingerprint.matches(data) {
            // Unchanged payload: refresh its TTL only.
            let _: bool = self.client.expire(key.as_str(), ttl, None).await?;
            return Ok(());
        }

        let _: () = self
            .client
            .set(
                key.as_str(),
                data.to_vec(),
                Some(Expiration::EX(ttl)),
                None,
                false,
            )
            .await?;

        self.fingerprint = Fingerprint::of(data);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.release_lock().await
    }

    async fn destroy(&mut self, ctx: &RequestContext, session_id: &str) -> Result<()> {
        self.ensure_open()?;

        if self.lock_key.is_some() {
            let key = self.payload_key(ctx, session_id)?;
            let _: i64 = self.client.del(key.as_str()).await?;
            self.fingerprint = Fingerprint::empty();
        }

        self.close().await
    }

    async fn gc(&mut self, _max_lifetime_secs: i64) -> Result<u64> {
        // The payload TTL set on every write already evicts stale sessions.
        Ok(0)
    }
}

fn payload_key(name: &str, addr: Option<&str>, session_id: &str) -> String {
    match addr {
        Some(addr) => format!("{name}:{addr}:{session_id}"),
        None => format!("{name}:{session_id}"),
    }
}
