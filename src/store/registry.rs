//! Accessor type registry.
//!
//! The registry is an explicit startup-time table mapping an accessor type
//! name to a factory. Resolution failure is a single error path
//! ([`Error::UnknownAccessorType`]), raised when the [`Store`](crate::Store)
//! is constructed — never later.

use std::collections::HashMap;
use std::sync::Arc;

use crate::accessor::mongo::MongoAccessor;
use crate::accessor::postgres::PostgresAccessor;
use crate::accessor::redis::RedisAccessor;
use crate::accessor::socket::SocketAccessor;
use crate::accessor::Accessor;
use crate::config::AccessorConfig;
use crate::{Error, Result};

/// Factory building one accessor from `(kind, store label, config slice)`.
pub type AccessorFactory =
    Box<dyn Fn(&str, &str, AccessorConfig) -> Result<Arc<dyn Accessor>> + Send + Sync>;

/// Registration table for accessor factories.
pub struct Registry {
    factories: HashMap<String, AccessorFactory>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl Registry {
    /// Creates an empty registry (no built-in backends).
    #[must_use]
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Creates a registry with the built-in backends registered:
    /// `postgres`, `mongo`, `redis`, and `socket`.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register("postgres", |kind, store, config| {
            Ok(Arc::new(PostgresAccessor::new(kind, store, config)?))
        });
        registry.register("mongo", |kind, store, config| {
            Ok(Arc::new(MongoAccessor::new(kind, store, config)?))
        });
        registry.register("redis", |kind, store, config| {
            Ok(Arc::new(RedisAccessor::new(kind, store, config)?))
        });
        registry.register("socket", |kind, store, config| {
            Ok(Arc::new(SocketAccessor::new(kind, store, config)?))
        });
        registry
    }

    /// Registers (or replaces) a factory for `kind`.
    pub fn register<F>(&mut self, kind: impl Into<String>, factory: F)
    where
        F: Fn(&str, &str, AccessorConfig) -> Result<Arc<dyn Accessor>> + Send + Sync + 'static,
    {
        self.factories.insert(kind.into(), Box::new(factory));
    }

    /// True when a factory is registered for `kind`.
    #[must_use]
    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    /// Registered type names, sorted.
    #[must_use]
    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }

    /// Builds an accessor of type `kind`.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownAccessorType`] when no factory is registered, or the
    /// factory's own construction error.
    pub fn build(
        &self,
        kind: &str,
        store: &str,
        config: AccessorConfig,
    ) -> Result<Arc<dyn Accessor>> {
        let factory = self
            .factories
            .get(kind)
            .ok_or_else(|| Error::UnknownAccessorType(kind.to_string()))?;
        factory(kind, store, config)
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("kinds", &self.kinds())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_are_registered() {
        let registry = Registry::with_builtins();
        assert_eq!(registry.kinds(), vec!["mongo", "postgres", "redis", "socket"]);
        assert!(registry.contains("postgres"));
        assert!(!registry.contains("voltdb"));
    }

    #[test]
    fn test_unknown_kind_is_an_error() {
        let registry = Registry::with_builtins();
        let result = registry.build("voltdb", "store", AccessorConfig::new());
        assert!(matches!(result, Err(Error::UnknownAccessorType(_))));
    }

    #[test]
    fn test_factory_errors_propagate() {
        let registry = Registry::with_builtins();
        // postgres requires `db`.
        let result = registry.build("postgres", "store", AccessorConfig::new());
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[test]
    fn test_custom_registration_overrides() {
        let mut registry = Registry::empty();
        registry.register("socket", |kind, store, config| {
            Ok(Arc::new(SocketAccessor::new(kind, store, config)?))
        });
        assert_eq!(registry.kinds(), vec!["socket"]);

        let accessor = registry
            .build("socket", "store", AccessorConfig::new().with_port(3301))
            .unwrap();
        assert_eq!(accessor.kind(), "socket");
    }
}
