use serde::Deserialize;
use std::collections::HashMap;
use std::str::FromStr;

use crate::config::SessionConfig;
use crate::driver::{Error, FilesDriver, Result, SessionDriver};

/// The selectable session backends.
///
/// Driver selection is resolved once at startup through [`DriverRegistry`];
/// configuration strings parse into this enum instead of being interpreted
/// at use time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    Database,
    Files,
    Redis,
}

impl FromStr for DriverKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "database" => Ok(Self::Database),
            "files" => Ok(Self::Files),
            "redis" => Ok(Self::Redis),
            other => Err(Error::Config(format!("unknown session driver '{other}'"))),
        }
    }
}

type DriverFactory = Box<dyn Fn(&SessionConfig) -> Box<dyn SessionDriver> + Send + Sync>;

/// Maps a [`DriverKind`] to a constructor for that backend.
///
/// The files driver is registered out of the box; backends that need a live
/// handle are registered with a closure capturing it:
///
/// ```rust,no_run
/// # #[cfg(feature = "database-driver")]
/// # fn wire(pool: sessile::sqlx::PgPool) {
/// use sessile::{DriverKind, DriverRegistry, driver::database::DatabaseDriver};
///
/// let mut registry = DriverRegistry::new();
/// registry.register(DriverKind::Database, move |config| {
///     Box::new(DatabaseDriver::new(pool.clone(), config.clone()).with_create_table(true))
/// });
/// # }
/// ```
pub struct DriverRegistry {
    factories: HashMap<DriverKind, DriverFactory>,
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DriverRegistry {
    pub fn new() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };
        registry.register(DriverKind::Files, |config| {
            Box::new(FilesDriver::new(config.clone()))
        });
        registry
    }

    pub fn register<F>(&mut self, kind: DriverKind, factory: F)
    where
        F: Fn(&SessionConfig) -> Box<dyn SessionDriver> + Send + Sync + 'static,
    {
        self.factories.insert(kind, Box::new(factory));
    }

    /// Constructs a driver for `kind`, or fails with a configuration error
    /// when no factory has been registered for it.
    pub fn build(&self, kind: DriverKind, config: &SessionConfig) -> Result<Box<dyn SessionDriver>> {
        let factory = self.factories.get(&kind).ok_or_else(|| {
            Error::Config(format!("no factory registered for the {kind:?} driver"))
        })?;
        Ok(factory(config))
    }
}
