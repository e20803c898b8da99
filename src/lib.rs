//! # Polystore
//!
//! Multi-backend data-store connection and transaction management.
//!
//! Polystore lets a process talk to one or more heterogeneous databases
//! (relational, document, key-value, plain socket) under a single lifecycle
//! contract: a [`Store`] owns a named set of backend [`Accessor`]s, brings
//! them up concurrently, and tears them down at shutdown.
//!
//! ## Features
//!
//! - Concurrent fan-out bring-up: one failing backend never blocks the rest
//! - Per-accessor connect/disconnect state machines with re-entrancy guards
//! - Pooled relational access with acquire timeouts and deadlock-aware
//!   transaction retry
//! - Typed key-value surface over raw Redis values
//! - Explicit accessor registry — unknown backend names fail at construction
//!
//! ## Example
//!
//! ```rust,ignore
//! use polystore::{Store, StoreConfig};
//!
//! let config = StoreConfig::from_file("store.toml".as_ref())?;
//! let store = Store::new(config, &["postgres", "redis"])?;
//! store.connect().await;
//! store.wait_connected().await;
//!
//! let pg = store.get_typed::<polystore::PostgresAccessor>("postgres")?;
//! let rows = pg.query(None, "SELECT id FROM jobs WHERE state = $1", &[&"ready"]).await?;
//! ```

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(missing_docs)]
#![forbid(unsafe_code)]
#![allow(clippy::multiple_crate_versions)]

use thiserror::Error as ThisError;

// Module declarations
pub mod accessor;
pub mod config;
pub mod store;

// Re-exports for convenience
pub use accessor::mongo::MongoAccessor;
pub use accessor::postgres::{PgTransaction, PostgresAccessor};
pub use accessor::redis::{FromKv, KvValue, RedisAccessor};
pub use accessor::retry::RetryPolicy;
pub use accessor::socket::SocketAccessor;
pub use accessor::{Accessor, AccessorCore};
pub use config::{AccessorConfig, StoreConfig};
pub use store::{ConnectSummary, Registry, Store};

/// Error type for polystore operations.
///
/// Uses `thiserror` for automatic `Display` and `Error` trait implementations.
///
/// # Error Variant Triggers
///
/// | Variant | Raised When |
/// |---------|-------------|
/// | `Configuration` | Missing/invalid config fields at accessor construction |
/// | `UnknownAccessorType` | A need-name has no registered accessor factory |
/// | `AccessorNotRegistered` | Lookup of a name outside the Store's need set |
/// | `NotConnected` | Operation against a pool/client that was never built |
/// | `Timeout` | Acquire/connect-attempt/statement exceeded its deadline |
/// | `Deadlock` | Backend reported a transactional deadlock |
/// | `DuplicateKey` | Backend unique-constraint violation |
/// | `Backend` | Any other backend failure, surfaced with operation context |
#[derive(Debug, ThisError)]
pub enum Error {
    /// Invalid or missing configuration.
    ///
    /// Raised when:
    /// - A required backend field is absent (e.g. `db` for relational/document
    ///   accessors)
    /// - Only one of username/password is set
    /// - The accessor type name is empty
    ///
    /// Fatal at construction time; never raised later.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A need-name did not resolve to a registered accessor factory.
    #[error("no accessor registered for type '{0}'")]
    UnknownAccessorType(String),

    /// Lookup of an accessor that is not part of this Store's need set.
    #[error("accessor '{0}' not found in store (not in the need set?)")]
    AccessorNotRegistered(String),

    /// Operation attempted against a backend that was never connected.
    ///
    /// Distinct from [`Error::Timeout`]: the pool/client does not exist, as
    /// opposed to existing but responding slowly.
    #[error("{fingerprint} not connected")]
    NotConnected {
        /// Fingerprint of the accessor the operation targeted.
        fingerprint: String,
    },

    /// A bounded operation exceeded its deadline.
    ///
    /// Retryable by the caller; the layer itself never retries timeouts.
    #[error("operation '{operation}' timed out after {waited_ms}ms")]
    Timeout {
        /// The operation that timed out.
        operation: String,
        /// The configured deadline, in milliseconds.
        waited_ms: u64,
    },

    /// The backend reported a transactional deadlock.
    ///
    /// Retried internally by the transaction wrapper up to the configured
    /// bound, then surfaced.
    #[error("transaction deadlock detected")]
    Deadlock,

    /// The backend rejected a statement with a unique-constraint violation.
    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    /// Any other backend failure.
    ///
    /// Logged with full context (operation, statement/command, fingerprint)
    /// at the call site and surfaced unchanged — never swallowed.
    #[error("operation '{operation}' failed: {cause}")]
    Backend {
        /// The operation that failed.
        operation: String,
        /// The underlying cause.
        cause: String,
    },
}

impl Error {
    /// Builds an [`Error::Backend`] from an operation name and any
    /// displayable cause.
    pub(crate) fn backend(operation: &str, cause: impl std::fmt::Display) -> Self {
        Self::Backend {
            operation: operation.to_string(),
            cause: cause.to_string(),
        }
    }

    /// Builds an [`Error::Timeout`] from an operation name and its deadline.
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn timeout(operation: &str, waited: std::time::Duration) -> Self {
        Self::Timeout {
            operation: operation.to_string(),
            waited_ms: waited.as_millis() as u64,
        }
    }
}

/// Result type alias for polystore operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Configuration("port missing".to_string());
        assert_eq!(err.to_string(), "configuration error: port missing");

        let err = Error::UnknownAccessorType("voltdb".to_string());
        assert_eq!(err.to_string(), "no accessor registered for type 'voltdb'");

        let err = Error::NotConnected {
            fingerprint: "postgres://127.0.0.1:5432".to_string(),
        };
        assert_eq!(err.to_string(), "postgres://127.0.0.1:5432 not connected");

        let err = Error::timeout("acquire", std::time::Duration::from_secs(15));
        assert_eq!(
            err.to_string(),
            "operation 'acquire' timed out after 15000ms"
        );
    }

    #[test]
    fn test_backend_helper_carries_context() {
        let err = Error::backend("execute", "connection reset");
        assert_eq!(
            err.to_string(),
            "operation 'execute' failed: connection reset"
        );
    }
}
