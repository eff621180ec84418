//! CockroachDB flavour of the SQL connector.
//!
//! CockroachDB runs every transaction at SERIALIZABLE isolation and asks clients to
//! retry the whole transaction when it reports a serialization conflict (SQLSTATE
//! `40001`). [`CockroachDatabase::run_in_transaction`] does that: the closure is re-run
//! from a fresh transaction until it commits, fails for another reason or the
//! [`RetryPolicy`] is exhausted. Everything else delegates to the generic connector.

use crate::connector::{
    Connector, ConnectorOptions, Database, SqlConnector, SqlDatabase, Transaction, TxFuture,
};
use crate::convert::ConverterChain;
use crate::db::{QueryParam, Row, Rows};
use crate::error::Result;
use crate::tenant::{ProviderError, TenantConfig, TenantIndex, TenantProvider};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

pub const DEFAULT_MAX_RETRIES: u32 = 50;

/// How often a conflicting transaction is re-run before giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; `0` disables retrying.
    pub max_retries: u32,
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES)
    }
}

/// Connector handing out [`CockroachDatabase`] connections.
#[derive(Debug)]
pub struct CockroachConnector {
    base: SqlConnector,
    policy: RetryPolicy,
}

impl CockroachConnector {
    pub async fn new(
        provider: Arc<dyn TenantProvider>,
        options: ConnectorOptions,
        policy: RetryPolicy,
    ) -> Result<Self> {
        let base = SqlConnector::new(provider, options).await?;
        Ok(Self::from_base(base, policy))
    }

    /// Wrap an already initialized connector.
    pub fn from_base(base: SqlConnector, policy: RetryPolicy) -> Self {
        Self { base, policy }
    }

    pub fn base(&self) -> &SqlConnector {
        &self.base
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }
}

#[async_trait]
impl Connector for CockroachConnector {
    type Database = CockroachDatabase;

    async fn connect(&self, tenant_id: &str) -> Result<CockroachDatabase> {
        let base = self.base.connect(tenant_id).await?;
        Ok(CockroachDatabase {
            base,
            policy: self.policy,
        })
    }

    async fn reload(&self) -> Result<bool, ProviderError> {
        self.base.reload().await
    }

    async fn tenants(&self) -> Arc<TenantIndex> {
        self.base.tenants().await
    }
}

/// A tenant connection whose transactions retry on serialization conflicts.
#[derive(Debug)]
pub struct CockroachDatabase {
    base: SqlDatabase,
    policy: RetryPolicy,
}

impl CockroachDatabase {
    /// The underlying connection, e.g. for explicit [`SqlDatabase::begin`].
    pub fn base_mut(&mut self) -> &mut SqlDatabase {
        &mut self.base
    }

    pub fn into_inner(self) -> SqlDatabase {
        self.base
    }

    pub fn session_id(&self) -> &str {
        self.base.session_id()
    }
}

/// One begin, closure, commit cycle. A failed closure is rolled back and its error
/// returned as is, so the caller can decide whether to retry.
async fn execute_attempt<R, F>(db: &mut SqlDatabase, f: &mut F) -> Result<R>
where
    R: Send,
    F: for<'t> FnMut(&'t mut Transaction<'_>) -> TxFuture<'t, R> + Send,
{
    let mut tx = db.begin().await?;
    match f(&mut tx).await {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(err) => {
            let tenant_id = tx.tenant_config().tenant_id().to_string();
            let session_id = tx.session_id().to_string();
            if let Err(rollback_err) = tx.rollback().await {
                warn!(
                    tenant_id = %tenant_id,
                    session_id = %session_id,
                    error = %rollback_err,
                    "Rollback failed after transaction error"
                );
            }
            Err(err)
        }
    }
}

#[async_trait]
impl Database for CockroachDatabase {
    fn tenant_config(&self) -> &TenantConfig {
        self.base.tenant_config()
    }

    async fn query<'a>(&'a mut self, sql: &'a str, args: &'a [QueryParam]) -> Result<Rows<'a>> {
        self.base.query(sql, args).await
    }

    async fn query_row(&mut self, sql: &str, args: &[QueryParam]) -> Row {
        self.base.query_row(sql, args).await
    }

    async fn run_in_transaction<R, F>(&mut self, mut f: F) -> Result<R>
    where
        R: Send,
        F: for<'t> FnMut(&'t mut Transaction<'_>) -> TxFuture<'t, R> + Send,
    {
        let tenant_id = self.base.tenant_config().tenant_id().to_string();
        let mut attempt: u32 = 1;
        loop {
            match execute_attempt(&mut self.base, &mut f).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(tenant_id = %tenant_id, attempt, "Transaction committed after retry");
                    }
                    return Ok(value);
                }
                Err(err) if err.is_retryable_serialization() && attempt <= self.policy.max_retries => {
                    warn!(
                        tenant_id = %tenant_id,
                        session_id = %self.base.session_id(),
                        attempt,
                        error = %err,
                        "Serialization conflict, retrying transaction"
                    );
                    attempt += 1;
                }
                Err(err) => return Err(ConverterChain::cannot_commit_tx(&tenant_id).convert(err)),
            }
        }
    }

    async fn close(self) -> Result<()> {
        self.base.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::tests::db_error;
    use crate::error::{Error, ErrorCode};
    use crate::tenant::StaticTenantProvider;
    use futures_util::FutureExt;
    use std::sync::atomic::{AtomicU32, Ordering};

    async fn memory_database(policy: RetryPolicy) -> CockroachDatabase {
        let provider = StaticTenantProvider::single("acme", "sqlite::memory:");
        let connector =
            CockroachConnector::new(Arc::new(provider), ConnectorOptions::default(), policy)
                .await
                .unwrap();
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
        db
    }

    async fn count(db: &mut CockroachDatabase) -> i64 {
        db.query_row("select count(*) from t", &[])
            .await
            .scan()
            .unwrap()
            .try_get::<i64, _>(0)
            .unwrap()
    }

    #[test]
    fn test_default_policy() {
        assert_eq!(RetryPolicy::default().max_retries, DEFAULT_MAX_RETRIES);
    }

    #[tokio::test]
    async fn test_conflict_reruns_whole_closure() {
        let mut db = memory_database(RetryPolicy::default()).await;
        let calls = Arc::new(AtomicU32::new(0));

        let counter = calls.clone();
        let attempt = db
            .run_in_transaction(move |tx| {
                let counter = counter.clone();
                async move {
                    let attempt = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    tx.exec("insert into t (id) values (?)", &crate::params![attempt])
                        .await?;
                    if attempt < 3 {
                        return Err(db_error("40001", "restart transaction"));
                    }
                    Ok::<_, Error>(attempt)
                }
                .boxed()
            })
            .await
            .unwrap();

        assert_eq!(attempt, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(count(&mut db).await, 1);
    }

    #[tokio::test]
    async fn test_non_retryable_error_is_converted() {
        let mut db = memory_database(RetryPolicy::default()).await;
        let calls = Arc::new(AtomicU32::new(0));

        let counter = calls.clone();
        let err = db
            .run_in_transaction(move |tx| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    tx.exec("insert into t (id) values (1)", &[]).await?;
                    Err::<(), _>(db_error("23505", "duplicate key value"))
                }
                .boxed()
            })
            .await
            .unwrap_err();

        assert!(err.is(ErrorCode::CannotCommitTx));
        assert_eq!(err.sql_state().as_deref(), Some("23505"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(count(&mut db).await, 0);
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let mut db = memory_database(RetryPolicy::new(2)).await;
        let calls = Arc::new(AtomicU32::new(0));

        let counter = calls.clone();
        let err = db
            .run_in_transaction(move |_tx| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(db_error("40001", "restart transaction"))
                }
                .boxed()
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(err.is(ErrorCode::CannotCommitTx));
        assert!(err.is_retryable_serialization());
    }

    #[tokio::test]
    async fn test_caller_errors_pass_through() {
        let mut db = memory_database(RetryPolicy::default()).await;
        let err = db
            .run_in_transaction(|_tx| async { Err::<(), _>(Error::other("bad input")) }.boxed())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Other(_)));
    }
}
