//! Pool-backed relational accessor (PostgreSQL).
//!
//! Connecting builds a `deadpool-postgres` pool and probes one connection;
//! the connect loop retries indefinitely until cancelled, so a database that
//! comes up late is picked up without operator intervention. Acquisition and
//! statement execution are deadline-bounded per call.
//!
//! Transactional work goes through [`PostgresAccessor::run_in_transaction`],
//! which retries the whole unit of work on a reported deadlock up to the
//! configured [`RetryPolicy`] bound. Each attempt leases its own connection;
//! the lease returns to the pool when the handle drops, on every exit path.

use std::any::Any;
use std::pin::Pin;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use deadpool_postgres::{ManagerConfig, Object, Pool, PoolError, RecyclingMethod, Runtime};
use tokio_postgres::error::SqlState;
use tokio_postgres::types::ToSql;
use tokio_postgres::{NoTls, Row};

use crate::accessor::retry::{RetryPolicy, retry_on_deadlock};
use crate::accessor::{Accessor, AccessorCore};
use crate::config::AccessorConfig;
use crate::{Error, Result};

/// Boxed unit of work executed inside one transaction attempt.
pub type TxUnit<'t, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 't>>;

/// Relational accessor backed by a `deadpool-postgres` pool.
pub struct PostgresAccessor {
    core: AccessorCore,
    config: AccessorConfig,
    db: String,
    pool: RwLock<Option<Pool>>,
    retry: RetryPolicy,
}

impl PostgresAccessor {
    /// Default PostgreSQL port.
    pub const DEFAULT_PORT: u16 = 5432;

    /// Creates the accessor, validating its config slice.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the config is invalid or `db` is
    /// missing.
    pub fn new(kind: &str, store: &str, config: AccessorConfig) -> Result<Self> {
        let core = AccessorCore::new(kind, store, &config, Self::DEFAULT_PORT)?;
        let db = config.require_db(core.kind())?.to_string();
        Ok(Self {
            core,
            config,
            db,
            pool: RwLock::new(None),
            retry: RetryPolicy::default(),
        })
    }

    /// Overrides the deadlock retry policy.
    #[must_use]
    pub const fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Connection string for diagnostics. The password is omitted.
    #[must_use]
    pub fn dsn(&self) -> String {
        let auth = self
            .config
            .username()
            .map(|u| format!("{u}@"))
            .unwrap_or_default();
        format!(
            "postgres://{auth}{}:{}/{}",
            self.core.host(),
            self.core.port(),
            self.db
        )
    }

    /// Builds the pool and probes one connection so a returned pool is known
    /// reachable, not just constructed.
    async fn build_pool(&self) -> Result<Pool> {
        let mut cfg = deadpool_postgres::Config::new();
        cfg.host = Some(self.core.host().to_string());
        cfg.port = Some(self.core.port());
        cfg.user = self.config.username().map(String::from);
        cfg.password = self.config.password().map(String::from);
        cfg.dbname = Some(self.db.clone());
        cfg.pool = Some(deadpool_postgres::PoolConfig {
            max_size: self.config.pool_size(),
            timeouts: deadpool_postgres::Timeouts {
                wait: Some(self.config.request_timeout()),
                create: Some(self.config.connect_timeout()),
                recycle: Some(self.config.connect_timeout()),
            },
            ..Default::default()
        });
        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });

        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| Error::backend("postgres_create_pool", e))?;

        let client = pool
            .get()
            .await
            .map_err(|e| Error::backend("postgres_probe", e))?;
        client
            .simple_query("SELECT 1")
            .await
            .map_err(|e| Error::backend("postgres_probe", e))?;

        Ok(pool)
    }

    fn current_pool(&self) -> Result<Pool> {
        self.pool
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| Error::NotConnected {
                fingerprint: self.core.fingerprint().to_string(),
            })
    }

    /// Leases one pooled connection, bounded by `request_timeout`.
    ///
    /// The lease returns to the pool when dropped.
    ///
    /// # Errors
    ///
    /// [`Error::NotConnected`] when the pool was never built,
    /// [`Error::Timeout`] when no connection became available in time.
    pub async fn acquire(&self) -> Result<Object> {
        let pool = self.current_pool()?;
        let deadline = self.config.request_timeout();

        match tokio::time::timeout(deadline, pool.get()).await {
            Err(_) | Ok(Err(PoolError::Timeout(_))) => {
                tracing::warn!(
                    fingerprint = self.core.fingerprint(),
                    waited = ?deadline,
                    "connection acquisition timed out"
                );
                Err(Error::timeout("acquire", deadline))
            },
            Ok(Err(e)) => Err(Error::backend("acquire", e)),
            Ok(Ok(client)) => {
                metrics::counter!("store_pool_acquires_total", "kind" => self.core.kind().to_string())
                    .increment(1);
                Ok(client)
            },
        }
    }

    /// Executes one statement, returning the affected row count.
    ///
    /// Runs on `conn` when supplied, otherwise leases a connection for the
    /// duration of the call.
    pub async fn execute(
        &self,
        conn: Option<&Object>,
        statement: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<u64> {
        match conn {
            Some(client) => self.execute_on(client, statement, params).await,
            None => {
                let client = self.acquire().await?;
                self.execute_on(&client, statement, params).await
            },
        }
    }

    async fn execute_on(
        &self,
        client: &Object,
        statement: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<u64> {
        client
            .execute(statement, params)
            .await
            .map_err(|e| map_statement_error(self.core.fingerprint(), "execute", statement, &e))
    }

    /// Runs a query, returning all rows.
    pub async fn query(
        &self,
        conn: Option<&Object>,
        statement: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Vec<Row>> {
        match conn {
            Some(client) => self.query_on(client, statement, params).await,
            None => {
                let client = self.acquire().await?;
                self.query_on(&client, statement, params).await
            },
        }
    }

    async fn query_on(
        &self,
        client: &Object,
        statement: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Vec<Row>> {
        client
            .query(statement, params)
            .await
            .map_err(|e| map_statement_error(self.core.fingerprint(), "query", statement, &e))
    }

    /// Runs a query expected to return at most one row.
    pub async fn query_opt(
        &self,
        conn: Option<&Object>,
        statement: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Option<Row>> {
        match conn {
            Some(client) => self.query_opt_on(client, statement, params).await,
            None => {
                let client = self.acquire().await?;
                self.query_opt_on(&client, statement, params).await
            },
        }
    }

    async fn query_opt_on(
        &self,
        client: &Object,
        statement: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Option<Row>> {
        client
            .query_opt(statement, params)
            .await
            .map_err(|e| map_statement_error(self.core.fingerprint(), "query_opt", statement, &e))
    }

    /// Liveness probe: leases a connection and runs `SELECT 1`.
    ///
    /// Used by health checks, not by the connect loop.
    pub async fn ping(&self) -> bool {
        match self.acquire().await {
            Ok(client) => client.simple_query("SELECT 1").await.is_ok(),
            Err(_) => false,
        }
    }

    /// Opens a caller-managed transaction on a freshly leased connection.
    ///
    /// Work on the returned handle is never retried by the layer; use
    /// [`Self::run_in_transaction`] for deadlock-retried units.
    pub async fn begin(&self) -> Result<PgTransaction> {
        let client = self.acquire().await?;
        client
            .batch_execute("BEGIN")
            .await
            .map_err(|e| map_statement_error(self.core.fingerprint(), "begin", "BEGIN", &e))?;
        Ok(PgTransaction {
            client: Some(client),
            state: TxState::Begun,
            fingerprint: self.core.fingerprint().to_string(),
        })
    }

    /// Runs `work` inside a transaction with deadlock-aware retry.
    ///
    /// Each attempt leases a fresh connection, begins, runs the unit, and
    /// commits on success or rolls back on error. On [`Error::Deadlock`] the
    /// whole unit is re-run up to the policy bound; the final deadlock is
    /// surfaced. Any other error rolls back once and propagates unchanged.
    pub async fn run_in_transaction<T, F>(&self, work: F) -> Result<T>
    where
        T: Send,
        F: for<'t> Fn(&'t mut PgTransaction) -> TxUnit<'t, T> + Send + Sync,
    {
        let work = &work;
        retry_on_deadlock(self.retry, |attempt| async move {
            if attempt > 1 {
                tracing::warn!(
                    fingerprint = self.core.fingerprint(),
                    attempt,
                    "retrying transactional unit"
                );
            }
            let mut trx = self.begin().await?;
            match work(&mut trx).await {
                Ok(value) => {
                    trx.commit().await?;
                    Ok(value)
                },
                Err(e) => {
                    trx.rollback_after_error().await;
                    Err(e)
                },
            }
        })
        .await
    }

    /// Executes one statement inside its own deadlock-retried transaction.
    ///
    /// Equivalent to [`Self::run_in_transaction`] with a unit that runs a
    /// single `execute`, specialised here because borrowed `params` cannot
    /// satisfy the higher-ranked bound on `run_in_transaction`.
    pub async fn execute_trx(
        &self,
        statement: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<u64> {
        retry_on_deadlock(self.retry, |attempt| async move {
            if attempt > 1 {
                tracing::warn!(
                    fingerprint = self.core.fingerprint(),
                    attempt,
                    "retrying transactional unit"
                );
            }
            let mut trx = self.begin().await?;
            match trx.execute(statement, params).await {
                Ok(value) => {
                    trx.commit().await?;
                    Ok(value)
                },
                Err(e) => {
                    trx.rollback_after_error().await;
                    Err(e)
                },
            }
        })
        .await
    }
}

#[async_trait]
impl Accessor for PostgresAccessor {
    fn core(&self) -> &AccessorCore {
        &self.core
    }

    /// Connect loop: build-and-probe bounded by `connect_timeout`; on
    /// failure sleep `reconnect_timeout` and try again until cancelled.
    async fn open(&self) -> Result<()> {
        let connect_timeout = self.config.connect_timeout();
        let reconnect_timeout = self.config.reconnect_timeout();
        let mut attempt: u64 = 1;

        loop {
            match tokio::time::timeout(connect_timeout, self.build_pool()).await {
                Ok(Ok(pool)) => {
                    *self.pool.write().unwrap_or_else(PoisonError::into_inner) = Some(pool);
                    return Ok(());
                },
                Ok(Err(e)) => {
                    tracing::error!(
                        fingerprint = self.core.fingerprint(),
                        attempt,
                        error = %e,
                        retry_in = ?reconnect_timeout,
                        "cannot connect to database"
                    );
                },
                Err(_) => {
                    tracing::error!(
                        fingerprint = self.core.fingerprint(),
                        attempt,
                        waited = ?connect_timeout,
                        retry_in = ?reconnect_timeout,
                        "connect attempt timed out"
                    );
                },
            }
            metrics::counter!("store_connect_retries_total", "kind" => self.core.kind().to_string())
                .increment(1);
            tokio::time::sleep(reconnect_timeout).await;
            attempt += 1;
        }
    }

    async fn close(&self) -> Result<()> {
        let pool = self
            .pool
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(pool) = pool {
            pool.close();
        }
        Ok(())
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Maps a backend error onto the crate taxonomy, logging the statement for
/// anything that is not a recognized domain condition.
fn map_statement_error(
    fingerprint: &str,
    operation: &str,
    statement: &str,
    e: &tokio_postgres::Error,
) -> Error {
    if let Some(db) = e.as_db_error() {
        let code = db.code();
        if *code == SqlState::T_R_DEADLOCK_DETECTED {
            tracing::warn!(fingerprint, statement, "deadlock detected");
            return Error::Deadlock;
        }
        if *code == SqlState::UNIQUE_VIOLATION {
            return Error::DuplicateKey(db.message().to_string());
        }
    }
    tracing::error!(fingerprint, statement, error = %e, "statement failed");
    Error::backend(operation, e)
}

/// Transaction lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxState {
    Begun,
    Committed,
    RolledBack,
}

/// An open transaction bound to one leased connection.
///
/// [`commit`](Self::commit) and [`rollback`](Self::rollback) consume the
/// handle, so each terminal state is reached at most once. A handle dropped
/// while still begun discards its connection instead of returning a dirty
/// session to the pool.
pub struct PgTransaction {
    client: Option<Object>,
    state: TxState,
    fingerprint: String,
}

impl PgTransaction {
    fn client(&self) -> Result<&Object> {
        self.client.as_ref().ok_or_else(|| {
            Error::backend("transaction", "transaction already finished")
        })
    }

    /// Executes one statement inside the transaction.
    pub async fn execute(
        &mut self,
        statement: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<u64> {
        let fingerprint = self.fingerprint.clone();
        self.client()?
            .execute(statement, params)
            .await
            .map_err(|e| map_statement_error(&fingerprint, "execute", statement, &e))
    }

    /// Runs a query inside the transaction.
    pub async fn query(
        &mut self,
        statement: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Vec<Row>> {
        let fingerprint = self.fingerprint.clone();
        self.client()?
            .query(statement, params)
            .await
            .map_err(|e| map_statement_error(&fingerprint, "query", statement, &e))
    }

    /// Commits and releases the connection back to the pool.
    pub async fn commit(mut self) -> Result<()> {
        let client = self.client.take().ok_or_else(|| {
            Error::backend("commit", "transaction already finished")
        })?;
        self.state = TxState::Committed;
        match client.batch_execute("COMMIT").await {
            Ok(()) => Ok(()),
            Err(e) => {
                // The session state is unknown after a failed COMMIT; discard
                // the connection rather than recycle it.
                drop(Object::take(client));
                Err(map_statement_error(&self.fingerprint, "commit", "COMMIT", &e))
            },
        }
    }

    /// Rolls back and releases the connection back to the pool.
    pub async fn rollback(mut self) -> Result<()> {
        let client = self.client.take().ok_or_else(|| {
            Error::backend("rollback", "transaction already finished")
        })?;
        self.state = TxState::RolledBack;
        match client.batch_execute("ROLLBACK").await {
            Ok(()) => Ok(()),
            Err(e) => {
                drop(Object::take(client));
                Err(map_statement_error(&self.fingerprint, "rollback", "ROLLBACK", &e))
            },
        }
    }

    /// Rollback on the error path of a retried unit; a secondary rollback
    /// failure is logged, never surfaced over the primary error.
    async fn rollback_after_error(self) {
        let fingerprint = self.fingerprint.clone();
        if let Err(rb) = self.rollback().await {
            tracing::warn!(
                fingerprint,
                error = %rb,
                "rollback failed after transactional error"
            );
        }
    }
}

impl Drop for PgTransaction {
    fn drop(&mut self) {
        if self.state == TxState::Begun {
            if let Some(client) = self.client.take() {
                tracing::warn!(
                    fingerprint = %self.fingerprint,
                    "transaction dropped while begun; discarding its connection"
                );
                drop(Object::take(client));
            }
        }
    }
}
