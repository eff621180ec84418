//! Generic SQL connector.
//!
//! [`SqlConnector`] owns the tenant index and dials one dedicated connection per
//! `connect` call. [`SqlDatabase`] is that connection bound to its tenant, and
//! [`Transaction`] is a unit of work on it that ends in exactly one of commit or rollback.

use crate::connector::{Connector, ConnectorOptions, Database, TxFuture};
use crate::convert::ConverterChain;
use crate::db::{
    DatabaseType, DbConnection, DbTransaction, ExecResult, QueryParam, Row, Rows,
    StatementDeadline, deadline, query_failed,
};
use crate::error::{Error, Result};
use crate::tenant::{ProviderError, TenantConfig, TenantIndex, TenantProvider};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Connector for PostgreSQL-wire and SQLite tenant databases.
pub struct SqlConnector {
    provider: Arc<dyn TenantProvider>,
    index: RwLock<Arc<TenantIndex>>,
    next_generation: AtomicU64,
    options: ConnectorOptions,
}

impl SqlConnector {
    /// Configure the provider, load the initial tenant set and build the index.
    pub async fn new(provider: Arc<dyn TenantProvider>, options: ConnectorOptions) -> Result<Self> {
        provider.configure().await?;
        let connector = Self {
            provider,
            index: RwLock::new(Arc::new(TenantIndex::empty())),
            next_generation: AtomicU64::new(1),
            options,
        };
        connector.reload().await?;
        Ok(connector)
    }

    pub fn options(&self) -> &ConnectorOptions {
        &self.options
    }

    /// Swap `index` in unless a newer snapshot is already installed.
    ///
    /// Returns whether the index was installed.
    async fn install(&self, index: Arc<TenantIndex>) -> bool {
        let mut current = self.index.write().await;
        if current.generation() > index.generation() {
            return false;
        }
        *current = index;
        true
    }
}

#[async_trait]
impl Connector for SqlConnector {
    type Database = SqlDatabase;

    async fn connect(&self, tenant_id: &str) -> Result<SqlDatabase> {
        // Clone the snapshot so no lock is held while dialing
        let index = self.tenants().await;
        let tenant = index
            .get(tenant_id)
            .cloned()
            .ok_or_else(|| Error::tenant_not_found(tenant_id))?;
        SqlDatabase::open(tenant, self.options).await
    }

    async fn reload(&self) -> Result<bool, ProviderError> {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let configs = self.provider.load_tenants().await?;
        let index = Arc::new(TenantIndex::build(generation, configs));
        let tenants = index.len();

        let installed = self.install(index).await;
        if installed {
            info!(generation, tenants, "Tenant index reloaded");
        } else {
            info!(generation, "Discarded tenant snapshot older than the installed index");
        }
        Ok(installed)
    }

    async fn tenants(&self) -> Arc<TenantIndex> {
        self.index.read().await.clone()
    }
}

impl std::fmt::Debug for SqlConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlConnector")
            .field("options", &self.options)
            .field("next_generation", &self.next_generation)
            .finish_non_exhaustive()
    }
}

/// Extra client-side wait on PostgreSQL-wire connections so the server cancels an
/// overrunning statement before the local deadline gives up on it.
const SERVER_CANCEL_GRACE: Duration = Duration::from_secs(1);

/// A dedicated connection to one tenant's database.
#[derive(Debug)]
pub struct SqlDatabase {
    tenant: Arc<TenantConfig>,
    conn: DbConnection,
    deadline: StatementDeadline,
    session_id: String,
}

impl SqlDatabase {
    /// Dial `tenant`'s database.
    pub(crate) async fn open(tenant: Arc<TenantConfig>, options: ConnectorOptions) -> Result<Self> {
        let session_id = format!("db_{}", Uuid::new_v4());
        let conn = deadline(
            Some(options.connect_timeout),
            "connect",
            DbConnection::open(tenant.database_url(), options.statement_timeout),
        )
        .await
        .map_err(|err| match err {
            Error::Native(native) => Error::connection_failed(tenant.tenant_id(), &native),
            other => other,
        });

        let conn = match conn {
            Ok(conn) => conn,
            Err(err) => {
                warn!(
                    tenant_id = %tenant.tenant_id(),
                    url = %tenant.masked_database_url(),
                    error = %err,
                    "Failed to connect to tenant database"
                );
                return Err(err);
            }
        };

        info!(
            tenant_id = %tenant.tenant_id(),
            session_id = %session_id,
            db_type = %conn.db_type(),
            url = %tenant.masked_database_url(),
            "Connected to tenant database"
        );

        let local_timeout = match conn.db_type() {
            DatabaseType::PostgreSQL => options.statement_timeout.map(|t| t + SERVER_CANCEL_GRACE),
            DatabaseType::SQLite => options.statement_timeout,
        };

        Ok(Self {
            deadline: StatementDeadline::new(tenant.clone(), local_timeout),
            tenant,
            conn,
            session_id,
        })
    }

    /// Identifier correlating this connection's log lines.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn db_type(&self) -> DatabaseType {
        self.conn.db_type()
    }

    /// Whether a timed-out statement left this connection unusable. Every later
    /// operation except `close` fails with `Error::Abandoned`.
    pub fn is_abandoned(&self) -> bool {
        self.deadline.is_abandoned()
    }

    /// Begin a transaction that the caller must finish with `commit`, `rollback` or
    /// `commit_or_rollback`. Dropping it unfinished rolls it back.
    pub async fn begin(&mut self) -> Result<Transaction<'_>> {
        let tenant_id = self.tenant.tenant_id();
        let inner = self
            .deadline
            .run("begin", self.conn.begin())
            .await
            .map_err(|err| match err {
                Error::Native(native) => Error::cannot_begin_tx(tenant_id, &native),
                other => other,
            })?;

        debug!(
            tenant_id = %tenant_id,
            session_id = %self.session_id,
            "Transaction started"
        );

        Ok(Transaction {
            session_id: self.session_id.clone(),
            inner,
            deadline: self.deadline.clone(),
        })
    }
}

#[async_trait]
impl Database for SqlDatabase {
    fn tenant_config(&self) -> &TenantConfig {
        &self.tenant
    }

    async fn query<'a>(&'a mut self, sql: &'a str, args: &'a [QueryParam]) -> Result<Rows<'a>> {
        debug!(tenant_id = %self.tenant.tenant_id(), session_id = %self.session_id, sql, "Executing query");
        let stream = self.conn.executor().fetch(sql, args);
        Rows::open(self.deadline.clone(), stream, sql, args).await
    }

    async fn query_row(&mut self, sql: &str, args: &[QueryParam]) -> Row {
        debug!(tenant_id = %self.tenant.tenant_id(), session_id = %self.session_id, sql, "Executing query_row");
        let result = self
            .deadline
            .run("query", self.conn.executor().fetch_optional(sql, args))
            .await;
        Row::new(result.map_err(|err| query_failed(self.tenant.tenant_id(), sql, args, err)))
    }

    async fn run_in_transaction<R, F>(&mut self, mut f: F) -> Result<R>
    where
        R: Send,
        F: for<'t> FnMut(&'t mut Transaction<'_>) -> TxFuture<'t, R> + Send,
    {
        let mut tx = self.begin().await?;
        let outcome = f(&mut tx).await;
        tx.commit_or_rollback(outcome).await
    }

    /// Close the connection. An abandoned connection is dropped without the close
    /// handshake, which would wait behind the statement still running on it.
    async fn close(self) -> Result<()> {
        let Self {
            tenant,
            conn,
            deadline,
            session_id,
        } = self;

        if deadline.is_abandoned() {
            drop(conn);
            warn!(
                tenant_id = %tenant.tenant_id(),
                session_id = %session_id,
                "Dropped abandoned tenant database connection"
            );
            return Ok(());
        }

        deadline
            .run("close", conn.close())
            .await
            .map_err(|err| match err {
                Error::Native(native) => Error::close_failed(tenant.tenant_id(), &native),
                other => other,
            })?;

        info!(
            tenant_id = %tenant.tenant_id(),
            session_id = %session_id,
            "Closed tenant database connection"
        );
        Ok(())
    }
}

/// A transaction on a [`SqlDatabase`].
///
/// `commit` and `rollback` consume the transaction, so it completes at most once.
#[derive(Debug)]
pub struct Transaction<'c> {
    session_id: String,
    inner: DbTransaction<'c>,
    deadline: StatementDeadline,
}

impl<'c> Transaction<'c> {
    pub fn tenant_config(&self) -> &TenantConfig {
        self.deadline.tenant()
    }

    fn tenant_id(&self) -> &str {
        self.deadline.tenant().tenant_id()
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub async fn query<'a>(&'a mut self, sql: &'a str, args: &'a [QueryParam]) -> Result<Rows<'a>> {
        debug!(tenant_id = %self.tenant_id(), session_id = %self.session_id, sql, "Executing query in transaction");
        let stream = self.inner.executor().fetch(sql, args);
        Rows::open(self.deadline.clone(), stream, sql, args).await
    }

    pub async fn query_row(&mut self, sql: &str, args: &[QueryParam]) -> Row {
        debug!(tenant_id = %self.tenant_id(), session_id = %self.session_id, sql, "Executing query_row in transaction");
        let result = self
            .deadline
            .run("query", self.inner.executor().fetch_optional(sql, args))
            .await;
        Row::new(result.map_err(|err| query_failed(self.tenant_id(), sql, args, err)))
    }

    /// Execute a statement that returns no rows.
    ///
    /// Driver errors are returned as they are; wrap them yourself if the statement
    /// context matters.
    pub async fn exec(&mut self, sql: &str, args: &[QueryParam]) -> Result<ExecResult> {
        debug!(tenant_id = %self.tenant_id(), session_id = %self.session_id, sql, "Executing statement");
        let rows_affected = self
            .deadline
            .run("exec", self.inner.executor().execute(sql, args))
            .await?;
        Ok(ExecResult::new(self.tenant_id(), rows_affected))
    }

    /// Commit. Failures are reported as `CannotCommitTx`.
    pub async fn commit(self) -> Result<()> {
        let Self {
            session_id,
            inner,
            deadline,
        } = self;
        let tenant_id = deadline.tenant().tenant_id();
        deadline
            .run("commit", inner.commit())
            .await
            .map_err(|err| ConverterChain::cannot_commit_tx(tenant_id).convert(err))?;
        debug!(tenant_id = %tenant_id, session_id = %session_id, "Transaction committed");
        Ok(())
    }

    /// Roll back. Failures go through the same conversion as commit failures.
    pub async fn rollback(self) -> Result<()> {
        let Self {
            session_id,
            inner,
            deadline,
        } = self;
        let tenant_id = deadline.tenant().tenant_id();
        deadline
            .run("rollback", inner.rollback())
            .await
            .map_err(|err| ConverterChain::cannot_commit_tx(tenant_id).convert(err))?;
        debug!(tenant_id = %tenant_id, session_id = %session_id, "Transaction rolled back");
        Ok(())
    }

    /// Finish the transaction according to `outcome`.
    ///
    /// A successful outcome is committed. A failed one is converted and rolled back; if
    /// the rollback fails too, both causes are returned in a `CannotRollbackTx`. After a
    /// statement timeout no rollback is attempted: the connection is abandoned and the
    /// timeout is returned.
    pub async fn commit_or_rollback<R>(self, outcome: Result<R>) -> Result<R> {
        let err = match outcome {
            Ok(value) => {
                self.commit().await?;
                return Ok(value);
            }
            Err(err) => err,
        };

        let original = ConverterChain::cannot_commit_tx(self.tenant_id()).convert(err);

        if self.deadline.is_abandoned() {
            warn!(
                tenant_id = %self.tenant_id(),
                session_id = %self.session_id,
                error = %original,
                "Skipping rollback on abandoned connection"
            );
            return Err(original);
        }

        warn!(
            tenant_id = %self.tenant_id(),
            session_id = %self.session_id,
            error = %original,
            "Rolling back transaction"
        );

        match self.rollback().await {
            Ok(()) => Err(original),
            Err(rollback_err) => Err(Error::cannot_rollback_tx(rollback_err, original)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::tenant::StaticTenantProvider;
    use futures_util::FutureExt;

    async fn memory_connector() -> SqlConnector {
        let provider = StaticTenantProvider::single("acme", "sqlite::memory:");
        SqlConnector::new(Arc::new(provider), ConnectorOptions::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_new_loads_initial_index() {
        let connector = memory_connector().await;
        let index = connector.tenants().await;
        assert_eq!(index.generation(), 1);
        assert!(index.contains("acme"));
    }

    #[tokio::test]
    async fn test_connect_unknown_tenant() {
        let connector = memory_connector().await;
        let err = connector.connect("nonexistent").await.unwrap_err();
        assert!(err.is(ErrorCode::TenantNotFound));
        assert_eq!(err.tenant_id(), Some("nonexistent"));
    }

    #[tokio::test]
    async fn test_stale_snapshot_is_not_installed() {
        let connector = memory_connector().await;
        assert!(connector.install(Arc::new(TenantIndex::build(5, Vec::new()))).await);
        assert!(!connector.install(Arc::new(TenantIndex::build(3, Vec::new()))).await);
        assert_eq!(connector.tenants().await.generation(), 5);
    }

    #[tokio::test]
    async fn test_superseded_reload_reports_discard() {
        let connector = memory_connector().await;
        assert!(connector.reload().await.unwrap());
        assert_eq!(connector.tenants().await.generation(), 2);

        // A later reload already installed generation 10; the next load gets 3.
        assert!(connector.install(Arc::new(TenantIndex::build(10, Vec::new()))).await);
        assert!(!connector.reload().await.unwrap());
        let index = connector.tenants().await;
        assert_eq!(index.generation(), 10);
        assert!(index.is_empty());
    }

    #[tokio::test]
    async fn test_session_ids_are_unique() {
        let connector = memory_connector().await;
        let a = connector.connect("acme").await.unwrap();
        let b = connector.connect("acme").await.unwrap();
        assert!(a.session_id().starts_with("db_"));
        assert_ne!(a.session_id(), b.session_id());
        a.close().await.unwrap();
        b.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_query_row_select_one() {
        let connector = memory_connector().await;
        let mut db = connector.connect("acme").await.unwrap();
        let row = db.query_row("SELECT 1", &[]).await.scan().unwrap();
        assert_eq!(row.try_get::<i32, _>(0).unwrap(), 1);
        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_transaction_returns_value() {
        let connector = memory_connector().await;
        let mut db = connector.connect("acme").await.unwrap();
        let affected = db
            .run_in_transaction(|tx| {
                async move {
                    tx.exec("create table t (id integer)", &[]).await?;
                    let result = tx.exec("insert into t (id) values (1)", &[]).await?;
                    Ok::<_, Error>(result.rows_affected())
                }
                .boxed()
            })
            .await
            .unwrap();
        assert_eq!(affected, 1);
    }

    #[tokio::test]
    async fn test_explicit_begin_and_rollback() {
        let connector = memory_connector().await;
        let mut db = connector.connect("acme").await.unwrap();
        db.run_in_transaction(|tx| {
            async move {
                tx.exec("create table t (id integer)", &[]).await?;
                Ok::<_, Error>(())
            }
            .boxed()
        })
        .await
        .unwrap();

        let mut tx = db.begin().await.unwrap();
        tx.exec("insert into t (id) values (1)", &[]).await.unwrap();
        tx.rollback().await.unwrap();

        let row = db
            .query_row("select count(*) from t", &[])
            .await
            .scan()
            .unwrap();
        assert_eq!(row.try_get::<i64, _>(0).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_closure_error_is_rolled_back() {
        let connector = memory_connector().await;
        let mut db = connector.connect("acme").await.unwrap();
        db.run_in_transaction(|tx| {
            async move {
                tx.exec("create table t (id integer)", &[]).await?;
                Ok::<_, Error>(())
            }
            .boxed()
        })
        .await
        .unwrap();

        let err = db
            .run_in_transaction(|tx| {
                async move {
                    tx.exec("insert into t (id) values (1)", &[]).await?;
                    Err::<(), _>(Error::other("validation failed"))
                }
                .boxed()
            })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "validation failed");

        let row = db
            .query_row("select count(*) from t", &[])
            .await
            .scan()
            .unwrap();
        assert_eq!(row.try_get::<i64, _>(0).unwrap(), 0);
    }
}
