//! Configuration management.
//!
//! A [`StoreConfig`] is a mapping from accessor type name to
//! [`AccessorConfig`]. It can be built programmatically with the `with_*`
//! setters or loaded from a TOML file where each top-level table is one
//! accessor:
//!
//! ```toml
//! [postgres]
//! host = "db.internal"
//! port = 5432
//! username = "app"
//! password = "hunter2"
//! db = "app"
//! pool_size = 10
//!
//! [redis]
//! host = "cache.internal"
//! ```
//!
//! Structural validation (credentials pairing, required backend fields)
//! happens once, when an accessor is constructed from its config slice.

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::{Error, Result};

/// Default host when none is configured.
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Default connect-attempt deadline in seconds.
const DEFAULT_CONNECT_TIMEOUT: f64 = 5.0;
/// Default pause between reconnect attempts in seconds.
const DEFAULT_RECONNECT_TIMEOUT: f64 = 1.0;
/// Default per-request (acquire/statement) deadline in seconds.
const DEFAULT_REQUEST_TIMEOUT: f64 = 15.0;
/// Default pool size for pooled backends.
const DEFAULT_POOL_SIZE: usize = 10;

/// Per-accessor connection settings.
///
/// All fields are optional in the serialized form; backend-specific
/// requirements (e.g. `db` for relational and document stores) are enforced
/// by the accessor constructors.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AccessorConfig {
    /// Backend host. Defaults to [`DEFAULT_HOST`].
    pub host: Option<String>,
    /// Backend port. Each accessor supplies its own default.
    pub port: Option<u16>,
    /// Username. Must be paired with `password`.
    pub username: Option<String>,
    /// Password. Must be paired with `username`. Never logged.
    pub password: Option<SecretString>,
    /// Database name (relational and document backends) or numeric database
    /// index (key-value backend).
    pub db: Option<String>,
    /// Pool size for pooled backends. The key-value backend accepts this for
    /// compatibility but multiplexes over a single managed connection.
    pub pool_size: Option<usize>,
    /// Deadline for one connect attempt, in seconds (fractional allowed).
    pub connect_timeout: Option<f64>,
    /// Pause between reconnect attempts, in seconds.
    pub reconnect_timeout: Option<f64>,
    /// Deadline for acquiring a connection or running one statement, in
    /// seconds.
    pub request_timeout: Option<f64>,
}

impl AccessorConfig {
    /// Creates an empty config (all defaults).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the host.
    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Sets the port.
    #[must_use]
    pub const fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Sets username and password together.
    ///
    /// The two are only valid as a pair; this is the only setter for either.
    #[must_use]
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(SecretString::from(password.into()));
        self
    }

    /// Sets the database name/index.
    #[must_use]
    pub fn with_db(mut self, db: impl Into<String>) -> Self {
        self.db = Some(db.into());
        self
    }

    /// Sets the pool size.
    #[must_use]
    pub const fn with_pool_size(mut self, size: usize) -> Self {
        self.pool_size = Some(size);
        self
    }

    /// Sets the connect-attempt deadline in seconds.
    #[must_use]
    pub const fn with_connect_timeout(mut self, seconds: f64) -> Self {
        self.connect_timeout = Some(seconds);
        self
    }

    /// Sets the reconnect pause in seconds.
    #[must_use]
    pub const fn with_reconnect_timeout(mut self, seconds: f64) -> Self {
        self.reconnect_timeout = Some(seconds);
        self
    }

    /// Sets the per-request deadline in seconds.
    #[must_use]
    pub const fn with_request_timeout(mut self, seconds: f64) -> Self {
        self.request_timeout = Some(seconds);
        self
    }

    /// Resolved host.
    #[must_use]
    pub fn host(&self) -> &str {
        self.host.as_deref().unwrap_or(DEFAULT_HOST)
    }

    /// Resolved port, falling back to the accessor's default.
    #[must_use]
    pub fn port_or(&self, default: u16) -> u16 {
        self.port.unwrap_or(default)
    }

    /// Configured username, if any.
    #[must_use]
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    /// Exposes the configured password, if any.
    #[must_use]
    pub fn password(&self) -> Option<&str> {
        self.password.as_ref().map(ExposeSecret::expose_secret)
    }

    /// True when both username and password are configured.
    #[must_use]
    pub const fn has_credentials(&self) -> bool {
        self.username.is_some() && self.password.is_some()
    }

    /// Resolved pool size.
    #[must_use]
    pub fn pool_size(&self) -> usize {
        self.pool_size.unwrap_or(DEFAULT_POOL_SIZE).max(1)
    }

    /// Resolved connect-attempt deadline.
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Self::seconds(self.connect_timeout, DEFAULT_CONNECT_TIMEOUT)
    }

    /// Resolved reconnect pause.
    #[must_use]
    pub fn reconnect_timeout(&self) -> Duration {
        Self::seconds(self.reconnect_timeout, DEFAULT_RECONNECT_TIMEOUT)
    }

    /// Resolved per-request deadline.
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Self::seconds(self.request_timeout, DEFAULT_REQUEST_TIMEOUT)
    }

    /// Validates the credential pairing invariant.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if only one of username/password is
    /// set.
    pub fn validate(&self) -> Result<()> {
        if self.username.is_some() != self.password.is_some() {
            return Err(Error::Configuration(
                "either both username and password must be set, or neither".to_string(),
            ));
        }
        Ok(())
    }

    /// Requires the `db` field, naming the accessor kind in the error.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if `db` is absent.
    pub fn require_db(&self, kind: &str) -> Result<&str> {
        self.db
            .as_deref()
            .ok_or_else(|| Error::Configuration(format!("'db' is required for the {kind} accessor")))
    }

    fn seconds(value: Option<f64>, default: f64) -> Duration {
        Duration::from_secs_f64(value.unwrap_or(default).max(0.0))
    }
}

/// Configuration mapping for a whole [`Store`](crate::Store): accessor type
/// name → [`AccessorConfig`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct StoreConfig {
    accessors: HashMap<String, AccessorConfig>,
}

impl StoreConfig {
    /// Creates an empty config.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a store configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        toml::from_str(&contents)
            .map_err(|e| Error::Configuration(format!("cannot parse {}: {e}", path.display())))
    }

    /// Adds (or replaces) one accessor's config.
    #[must_use]
    pub fn with_accessor(mut self, name: impl Into<String>, config: AccessorConfig) -> Self {
        self.accessors.insert(name.into(), config);
        self
    }

    /// Returns the config slice for `name`, if present.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&AccessorConfig> {
        self.accessors.get(name)
    }

    /// Iterates over the configured accessor names.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.accessors.keys().map(String::as_str)
    }
}
