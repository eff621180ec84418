//! Tenant-routed connections.
//!
//! A [`Connector`] resolves a tenant id to a dedicated [`Database`] connection. The
//! generic implementation lives in [`sql`]; [`cockroach`] wraps it with automatic retry
//! of serialization conflicts.

pub mod cockroach;
pub mod sql;

pub use cockroach::{CockroachConnector, CockroachDatabase, RetryPolicy};
pub use sql::{SqlConnector, SqlDatabase, Transaction};

use crate::db::{QueryParam, Row, Rows};
use crate::error::Result;
use crate::tenant::{ProviderError, TenantConfig, TenantIndex};
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Settings applied to every connection a connector opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectorOptions {
    /// Upper bound for dialing a tenant database.
    pub connect_timeout: Duration,
    /// Upper bound for each statement, transaction boundary and close. `None` disables it.
    pub statement_timeout: Option<Duration>,
}

impl Default for ConnectorOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            statement_timeout: None,
        }
    }
}

/// Future returned by a transaction closure, borrowing the transaction for `'t`.
pub type TxFuture<'t, R> = BoxFuture<'t, Result<R>>;

/// Resolves tenants to live database connections.
#[async_trait]
pub trait Connector: Send + Sync {
    type Database: Database;

    /// Open a new dedicated connection to `tenant_id`'s database.
    ///
    /// Unknown tenants fail with `TenantNotFound` without dialing.
    async fn connect(&self, tenant_id: &str) -> Result<Self::Database>;

    /// Re-fetch tenants from the provider and swap in a fresh index.
    ///
    /// Returns `false` when a concurrent reload that started later had already installed
    /// its snapshot, so this load was discarded.
    async fn reload(&self) -> Result<bool, ProviderError>;

    /// Current tenant index snapshot.
    async fn tenants(&self) -> Arc<TenantIndex>;
}

/// A live connection bound to one tenant.
#[async_trait]
pub trait Database: Send {
    fn tenant_config(&self) -> &TenantConfig;

    async fn query<'a>(&'a mut self, sql: &'a str, args: &'a [QueryParam]) -> Result<Rows<'a>>;

    /// Run a statement expected to return at most one row. Failures surface from
    /// [`Row::scan`].
    async fn query_row(&mut self, sql: &str, args: &[QueryParam]) -> Row;

    /// Run `f` inside a transaction, committing when it succeeds and rolling back
    /// when it fails.
    ///
    /// `f` may be called more than once by retrying implementations, so it must not
    /// have side effects outside the transaction.
    async fn run_in_transaction<R, F>(&mut self, f: F) -> Result<R>
    where
        R: Send,
        F: for<'t> FnMut(&'t mut Transaction<'_>) -> TxFuture<'t, R> + Send;

    async fn close(self) -> Result<()>;
}
