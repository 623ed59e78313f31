//! # Sessile: locking session persistence drivers
//!
//! `sessile` stores, locks, and garbage-collects server-side session state
//! across interchangeable storage backends. Every backend implements the
//! same lifecycle contract (open, read-with-lock, write-with-fingerprint
//! diff, close/unlock, destroy, gc) so any driver is a drop-in replacement
//! for any other.
//!
//! # Quick Start
//!
//! The filesystem driver needs nothing but a writable directory:
//!
//! ```rust,no_run
//! use sessile::{DriverKind, DriverRegistry, Session, SessionConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = SessionConfig::build()
//!         .save_path("/var/lib/sessions")
//!         .cookie_name("app_session")
//!         .lifetime(7200);
//!
//!     let registry = DriverRegistry::new();
//!     let driver = registry.build(DriverKind::Files, &config).unwrap();
//!
//!     let mut session = Session::new(driver, config);
//!     session.open().await.expect("session storage misconfigured");
//!
//!     let id = sessile::id::generate();
//!     let state = session.get(&id).await; // empty for a new session
//!     session.set(&id, b"count=1").await;
//!     session.close().await;
//!     # let _ = state;
//! }
//! ```
//!
//! # Drivers
//!
//! ## Files
//!
//! One file per session under the configured directory, named with the
//! cookie-name prefix. The exclusive advisory lock on the open file is the
//! session lock; gc sweeps the directory by filename pattern and mtime age.
//!
//! ## Database
//!
//! Requires the `database-driver` feature. Sessions are rows in a Postgres
//! table reached through an [`sqlx`] pool you provide; mutual exclusion uses
//! the server's advisory locks on a dedicated pooled connection.
//!
//! ```rust,no_run
//! # #[cfg(feature = "database-driver")]
//! # async fn wire() {
//! use sessile::driver::database::DatabaseDriver;
//! use sessile::{DriverKind, DriverRegistry, SessionConfig};
//!
//! let pool = sessile::sqlx::PgPool::connect("postgres://localhost/app")
//!     .await
//!     .unwrap();
//!
//! let mut registry = DriverRegistry::new();
//! registry.register(DriverKind::Database, move |config| {
//!     Box::new(DatabaseDriver::new(pool.clone(), config.clone()).with_create_table(true))
//! });
//! # }
//! ```
//!
//! ## Redis
//!
//! Requires the `redis-driver` feature. The payload is a single key with the
//! configured lifetime as TTL; the lock is a sibling `...:lock` key written
//! check-and-set with a bounded retry loop. Works with any connected
//! [`fred`] client or pool.
//!
//! ```rust,no_run
//! # #[cfg(feature = "redis-driver")]
//! # async fn wire() {
//! use sessile::driver::redis::RedisDriver;
//! use sessile::fred::clients::Client;
//! use sessile::fred::interfaces::ClientLike;
//! use sessile::{DriverKind, DriverRegistry};
//! use std::sync::Arc;
//!
//! let client = Client::default();
//! client.connect();
//! client.wait_for_connect().await.unwrap();
//! let client = Arc::new(client);
//!
//! let mut registry = DriverRegistry::new();
//! registry.register(DriverKind::Redis, move |config| {
//!     Box::new(RedisDriver::new(Arc::clone(&client), config.clone()))
//! });
//! # }
//! ```
//!
//! # Degradation policy
//!
//! Per-request storage trouble never aborts the request. A failed lock
//! acquisition reads as an empty session; a failed write reports `false`
//! through [`Session::set`] and the request proceeds without persisted
//! state. Only `open`-time misconfiguration is fatal.

mod config;
pub mod driver;
mod fingerprint;
pub mod id;
mod registry;
mod session;

pub use config::{RequestContext, SessionConfig};
pub use driver::{Error, FilesDriver, SessionDriver};
pub use fingerprint::Fingerprint;
pub use registry::{DriverKind, DriverRegistry};
pub use session::Session;

#[cfg(feature = "redis-driver")]
pub use fred;

#[cfg(feature = "database-driver")]
pub use sqlx;
