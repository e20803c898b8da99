//! Backend accessors and the lifecycle plumbing they share.
//!
//! Every backend accessor embeds an [`AccessorCore`]: the connection state
//! machine (`disconnected → connecting → connected → disconnecting →
//! disconnected`), the connected-signal observers can wait on, and the stable
//! `type://host:port` fingerprint used for log correlation.
//!
//! The [`Accessor`] trait supplies `connect()`/`disconnect()` as provided
//! methods around the backend-specific `open()`/`close()` primitives, so the
//! re-entrancy guards and signal handling behave identically across backends.

pub mod mongo;
pub mod postgres;
pub mod redis;
pub mod retry;
pub mod socket;

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::watch;

use crate::config::AccessorConfig;
use crate::{Error, Result};

/// Connection state machine and identity shared by every accessor.
///
/// Held by composition: each backend accessor owns one and returns it from
/// [`Accessor::core`].
#[derive(Debug)]
pub struct AccessorCore {
    kind: String,
    store: String,
    host: String,
    port: u16,
    fingerprint: String,
    connecting: AtomicBool,
    disconnecting: AtomicBool,
    connected: watch::Sender<bool>,
}

impl AccessorCore {
    /// Creates the core for an accessor of type `kind`, validating the parts
    /// of the config every backend shares.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if `kind` is empty or the config's
    /// credentials are not paired.
    pub fn new(
        kind: impl Into<String>,
        store: impl Into<String>,
        config: &AccessorConfig,
        default_port: u16,
    ) -> Result<Self> {
        let kind = kind.into();
        if kind.is_empty() {
            return Err(Error::Configuration(
                "accessor type name must not be empty".to_string(),
            ));
        }
        config.validate()?;

        let host = config.host().to_string();
        let port = config.port_or(default_port);
        let fingerprint = format!("{kind}://{host}:{port}");

        Ok(Self {
            kind,
            store: store.into(),
            host,
            port,
            fingerprint,
            connecting: AtomicBool::new(false),
            disconnecting: AtomicBool::new(false),
            connected: watch::Sender::new(false),
        })
    }

    /// Logical accessor type name.
    #[must_use]
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Label of the owning store. Used in log fields only.
    #[must_use]
    pub fn store_label(&self) -> &str {
        &self.store
    }

    /// Resolved backend host.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Resolved backend port.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Stable `type://host:port` identifier for log correlation.
    #[must_use]
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Current connected state.
    #[must_use]
    pub fn connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Resolves once the connected-signal is set.
    ///
    /// Resolves immediately when already connected; after a disconnect the
    /// signal is cleared and this blocks again until the next connect.
    pub async fn wait_connected(&self) {
        let mut rx = self.connected.subscribe();
        // The sender lives in self, so the channel cannot close mid-wait.
        let _ = rx.wait_for(|ready| *ready).await;
    }

    /// Sets or clears the connected-signal.
    pub(crate) fn set_connected(&self, value: bool) {
        self.connected.send_replace(value);
    }

    /// Claims the connecting flag, or returns `None` when a connect is
    /// already in flight. The flag resets when the guard drops, including on
    /// task cancellation.
    pub(crate) fn begin_connect(&self) -> Option<FlagGuard<'_>> {
        FlagGuard::claim(&self.connecting)
    }

    /// Claims the disconnecting flag; see [`Self::begin_connect`].
    pub(crate) fn begin_disconnect(&self) -> Option<FlagGuard<'_>> {
        FlagGuard::claim(&self.disconnecting)
    }
}

/// RAII claim on a re-entrancy flag; clears the flag on drop.
pub(crate) struct FlagGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> FlagGuard<'a> {
    fn claim(flag: &'a AtomicBool) -> Option<Self> {
        if flag.swap(true, Ordering::AcqRel) {
            None
        } else {
            Some(Self { flag })
        }
    }
}

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// A backend accessor: one backend's connections plus its lifecycle contract.
///
/// Implementations provide [`open`](Self::open)/[`close`](Self::close); the
/// trait supplies idempotent, re-entrancy-guarded
/// [`connect`](Self::connect)/[`disconnect`](Self::disconnect) around them.
#[async_trait]
pub trait Accessor: Send + Sync + 'static {
    /// The shared lifecycle core.
    fn core(&self) -> &AccessorCore;

    /// Backend-specific connection steps (build pool/client, probe).
    async fn open(&self) -> Result<()>;

    /// Backend-specific teardown.
    async fn close(&self) -> Result<()>;

    /// Upcast for typed lookup through [`Store::get_typed`](crate::Store::get_typed).
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;

    /// Logical accessor type name.
    fn kind(&self) -> &str {
        self.core().kind()
    }

    /// Stable `type://host:port` identifier.
    fn fingerprint(&self) -> &str {
        self.core().fingerprint()
    }

    /// Current connected state.
    fn connected(&self) -> bool {
        self.core().connected()
    }

    /// Connects the backend.
    ///
    /// No-op when already connecting or already connected. On the first real
    /// connect, runs [`open`](Self::open), then marks the accessor connected
    /// and fires the connected-signal.
    async fn connect(&self) -> Result<()> {
        let core = self.core();
        let Some(_guard) = core.begin_connect() else {
            tracing::debug!(
                fingerprint = core.fingerprint(),
                "connect already in flight, skipping"
            );
            return Ok(());
        };
        if core.connected() {
            return Ok(());
        }

        tracing::info!(
            fingerprint = core.fingerprint(),
            store = core.store_label(),
            "connecting"
        );
        self.open().await?;
        core.set_connected(true);
        metrics::counter!("store_accessor_connects_total", "kind" => core.kind().to_string())
            .increment(1);
        tracing::info!(fingerprint = core.fingerprint(), "connected");
        Ok(())
    }

    /// Disconnects the backend.
    ///
    /// No-op when already disconnecting or not connected. Clears the
    /// connected-signal so a later [`wait_connected`](Self::wait_connected)
    /// blocks until the next connect.
    async fn disconnect(&self) -> Result<()> {
        let core = self.core();
        let Some(_guard) = core.begin_disconnect() else {
            tracing::debug!(
                fingerprint = core.fingerprint(),
                "disconnect already in flight, skipping"
            );
            return Ok(());
        };
        if !core.connected() {
            return Ok(());
        }

        tracing::info!(fingerprint = core.fingerprint(), "disconnecting");
        self.close().await?;
        core.set_connected(false);
        tracing::info!(fingerprint = core.fingerprint(), "disconnected");
        Ok(())
    }

    /// Resolves once this accessor's connected-signal is set.
    async fn wait_connected(&self) {
        self.core().wait_connected().await;
    }
}
