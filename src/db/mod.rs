//! Database abstraction layer.
//!
//! This module provides the backend plumbing the connector is built on:
//! - Backend dispatch for dedicated connections and native transactions
//! - Query arguments and their binding
//! - Result handles (`Rows`, `Row`, `ExecResult`)

pub mod backend;
pub mod params;
pub mod rows;

pub use backend::{DatabaseType, DbConnection, DbExecutor, DbTransaction};
pub use params::QueryParam;
pub use rows::{DbRow, ExecResult, Row, Rows};
pub(crate) use rows::query_failed;

use crate::error::{Error, Result};
use crate::tenant::TenantConfig;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::warn;

/// Run `fut` under an optional deadline.
///
/// An elapsed deadline drops the in-flight operation and reports `Error::Timeout`.
pub(crate) async fn deadline<F, T, E>(
    timeout: Option<Duration>,
    operation: &'static str,
    fut: F,
) -> Result<T>
where
    F: Future<Output = std::result::Result<T, E>>,
    E: Into<Error>,
{
    match timeout {
        Some(limit) => match tokio::time::timeout(limit, fut).await {
            Ok(result) => result.map_err(Into::into),
            Err(_) => Err(Error::timeout(operation, limit)),
        },
        None => fut.await.map_err(Into::into),
    }
}

/// Statement deadline shared by a connection and everything borrowing it.
///
/// Dropping a timed-out statement does not stop it on the connection, so the first
/// timeout marks the connection abandoned and later statements are refused with
/// `Error::Abandoned` instead of queueing behind it.
#[derive(Debug, Clone)]
pub(crate) struct StatementDeadline {
    tenant: Arc<TenantConfig>,
    timeout: Option<Duration>,
    abandoned: Arc<AtomicBool>,
}

impl StatementDeadline {
    pub(crate) fn new(tenant: Arc<TenantConfig>, timeout: Option<Duration>) -> Self {
        Self {
            tenant,
            timeout,
            abandoned: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn tenant(&self) -> &Arc<TenantConfig> {
        &self.tenant
    }

    pub(crate) fn is_abandoned(&self) -> bool {
        self.abandoned.load(Ordering::Acquire)
    }

    pub(crate) fn ensure_usable(&self) -> Result<()> {
        if self.is_abandoned() {
            return Err(Error::abandoned(self.tenant.tenant_id()));
        }
        Ok(())
    }

    /// Run one statement-level operation under the deadline.
    pub(crate) async fn run<F, T, E>(&self, operation: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, E>>,
        E: Into<Error>,
    {
        self.ensure_usable()?;
        let result = deadline(self.timeout, operation, fut).await;
        if let Err(Error::Timeout { .. }) = &result {
            self.abandoned.store(true, Ordering::Release);
            warn!(
                tenant_id = %self.tenant.tenant_id(),
                operation,
                "Statement timed out, abandoning connection"
            );
        }
        result
    }
}
