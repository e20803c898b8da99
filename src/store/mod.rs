//! Store: the registry/orchestrator owning a named set of accessors.
//!
//! A [`Store`] is constructed from a [`StoreConfig`] and a "need" set of
//! accessor type names. Construction resolves every need-name through the
//! [`Registry`] and validates each accessor's config slice; lookup after
//! construction can therefore never produce a half-built accessor.
//!
//! Bring-up is a concurrent fan-out with fan-in barrier semantics: every
//! accessor's connect attempt runs as its own task, and [`Store::connect`]
//! returns only once all attempts have finished — success, failure, or
//! cancellation. Individual failures are logged and summarized, never raised.

pub mod registry;

pub use registry::{AccessorFactory, Registry};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::task::{AbortHandle, JoinHandle};

use crate::accessor::Accessor;
use crate::config::StoreConfig;
use crate::{Error, Result};

/// Outcome of one [`Store::connect`] fan-out.
#[derive(Debug, Default)]
pub struct ConnectSummary {
    /// How many connect attempts were launched.
    pub attempted: usize,
    /// Names of accessors whose attempt failed or was cancelled.
    pub failed: Vec<String>,
}

impl ConnectSummary {
    /// True when every launched attempt succeeded.
    #[must_use]
    pub fn all_connected(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Registry/orchestrator owning a named set of accessors.
pub struct Store {
    label: String,
    accessors: HashMap<String, Arc<dyn Accessor>>,
    pending: Mutex<Vec<AbortHandle>>,
}

impl Store {
    /// Creates a store with the built-in accessor registry.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownAccessorType`] when a need-name has no registered
    /// factory, [`Error::Configuration`] when a need-name has no config
    /// section or its slice is invalid.
    pub fn new(config: &StoreConfig, need: &[&str]) -> Result<Self> {
        Self::named("store", config, need, &Registry::default())
    }

    /// Creates a store resolving need-names through a caller-supplied
    /// registry.
    ///
    /// # Errors
    ///
    /// See [`Store::new`].
    pub fn with_registry(config: &StoreConfig, need: &[&str], registry: &Registry) -> Result<Self> {
        Self::named("store", config, need, registry)
    }

    /// Creates a labeled store. The label appears in accessor log fields,
    /// which matters when a process runs more than one store.
    ///
    /// # Errors
    ///
    /// See [`Store::new`].
    pub fn named(
        label: impl Into<String>,
        config: &StoreConfig,
        need: &[&str],
        registry: &Registry,
    ) -> Result<Self> {
        let label = label.into();
        let mut accessors: HashMap<String, Arc<dyn Accessor>> = HashMap::new();

        for &name in need {
            let slice = config.get(name).cloned().ok_or_else(|| {
                Error::Configuration(format!("missing config section for accessor '{name}'"))
            })?;
            let accessor = registry.build(name, &label, slice)?;
            accessors.insert(name.to_string(), accessor);
        }

        Ok(Self {
            label,
            accessors,
            pending: Mutex::new(Vec::new()),
        })
    }

    /// The store's log label.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Names of the owned accessors, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.accessors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Number of owned accessors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.accessors.len()
    }

    /// True when the need set was empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.accessors.is_empty()
    }

    /// Returns the accessor registered under `name`.
    ///
    /// # Errors
    ///
    /// [`Error::AccessorNotRegistered`] when `name` was not in the need set.
    pub fn get(&self, name: &str) -> Result<Arc<dyn Accessor>> {
        self.accessors
            .get(name)
            .cloned()
            .ok_or_else(|| Error::AccessorNotRegistered(name.to_string()))
    }

    /// Returns the accessor registered under `name`, downcast to its
    /// concrete type.
    ///
    /// # Errors
    ///
    /// [`Error::AccessorNotRegistered`] when `name` was not in the need set
    /// or is not of type `T`.
    pub fn get_typed<T: Accessor>(&self, name: &str) -> Result<Arc<T>> {
        self.get(name)?.as_any().downcast::<T>().map_err(|_| {
            Error::AccessorNotRegistered(format!("{name} is not the requested accessor type"))
        })
    }

    /// Connects every owned accessor concurrently.
    ///
    /// Waits for all launched attempts to finish, whatever their outcome.
    /// Per-accessor errors and cancellations are logged with the accessor's
    /// fingerprint and recorded in the returned summary; none are raised.
    pub async fn connect(&self) -> ConnectSummary {
        type ConnectTask = (String, String, JoinHandle<crate::Result<()>>);
        let mut tasks: Vec<ConnectTask> = Vec::new();

        {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            for (name, accessor) in &self.accessors {
                let accessor = Arc::clone(accessor);
                let fingerprint = accessor.fingerprint().to_string();
                let handle = tokio::spawn(async move { accessor.connect().await });
                pending.push(handle.abort_handle());
                tasks.push((name.clone(), fingerprint, handle));
            }
        }

        if tasks.is_empty() {
            tracing::info!(store = self.label, "no accessors to connect");
            return ConnectSummary::default();
        }

        let mut summary = ConnectSummary {
            attempted: tasks.len(),
            failed: Vec::new(),
        };

        // Fan-in barrier: every launched attempt is awaited to completion,
        // whatever the outcome.
        for (name, fingerprint, handle) in tasks {
            match handle.await {
                Ok(Ok(())) => {},
                Ok(Err(e)) => {
                    tracing::error!(fingerprint, error = %e, "error while connecting");
                    summary.failed.push(name);
                },
                Err(join_err) if join_err.is_cancelled() => {
                    tracing::error!(fingerprint, "connection attempt cancelled");
                    summary.failed.push(name);
                },
                Err(join_err) => {
                    tracing::error!(fingerprint, error = %join_err, "connection task failed");
                    summary.failed.push(name);
                },
            }
        }

        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();

        if summary.all_connected() {
            tracing::info!(store = self.label, "connected to all accessors");
        } else {
            tracing::info!(
                store = self.label,
                failed = summary.failed.len(),
                "connected to all accessors with errors"
            );
        }
        summary
    }

    /// Disconnects every owned accessor, best effort.
    ///
    /// Any still-outstanding connect attempt is cancelled first. Accessors
    /// are torn down one at a time; per-accessor errors are logged, never
    /// raised.
    pub async fn disconnect(&self) {
        let outstanding = std::mem::take(
            &mut *self.pending.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for handle in outstanding {
            handle.abort();
        }

        for name in self.names() {
            if let Some(accessor) = self.accessors.get(name) {
                if let Err(e) = accessor.disconnect().await {
                    tracing::error!(
                        fingerprint = accessor.fingerprint(),
                        error = %e,
                        "error while disconnecting"
                    );
                }
            }
        }
        tracing::info!(store = self.label, "disconnected");
    }

    /// Resolves once every owned accessor's connected-signal has fired.
    ///
    /// Does not trigger a connect.
    pub async fn wait_connected(&self) {
        for accessor in self.accessors.values() {
            accessor.wait_connected().await;
        }
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("label", &self.label)
            .field("accessors", &self.names())
            .finish_non_exhaustive()
    }
}
