//! Error types for the tenant database connector.
//!
//! Every failure that crosses a component boundary is a coded [`Error`] carrying a
//! strongly typed detail payload. Callers branch on [`Error::code`] instead of on
//! concrete driver error types. Driver errors that no converter recognized travel as
//! [`Error::Native`].

use crate::db::QueryParam;
use crate::tenant::ProviderError;
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use std::time::Duration;
use thiserror::Error;

/// Prefix shared by every registered error code.
pub const MODULE_CODE: &str = "tenantdb";

/// SQLSTATE raised by serializable-isolation conflicts.
pub const SQLSTATE_SERIALIZATION_FAILURE: &str = "40001";

/// Legacy CockroachDB code for a client-side retryable error.
pub const SQLSTATE_CRDB_RETRY: &str = "CR000";

/// Registered error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorCode {
    ConnectionFailed,
    TenantNotFound,
    CannotBeginTx,
    CannotCommitTx,
    CannotRollbackTx,
    NotSupported,
    QueryFailed,
    CloseFailed,
    GenericDbError,
}

impl ErrorCode {
    /// All registered codes, in registry order.
    pub const ALL: [ErrorCode; 9] = [
        ErrorCode::ConnectionFailed,
        ErrorCode::TenantNotFound,
        ErrorCode::CannotBeginTx,
        ErrorCode::CannotCommitTx,
        ErrorCode::CannotRollbackTx,
        ErrorCode::NotSupported,
        ErrorCode::QueryFailed,
        ErrorCode::CloseFailed,
        ErrorCode::GenericDbError,
    ];

    /// Stable string form, e.g. `tenantdb.003`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConnectionFailed => "tenantdb.002",
            Self::TenantNotFound => "tenantdb.003",
            Self::CannotBeginTx => "tenantdb.005",
            Self::CannotCommitTx => "tenantdb.006",
            Self::CannotRollbackTx => "tenantdb.007",
            Self::NotSupported => "tenantdb.008",
            Self::QueryFailed => "tenantdb.009",
            Self::CloseFailed => "tenantdb.010",
            Self::GenericDbError => "tenantdb.011",
        }
    }

    /// Short human-readable description registered for the code.
    pub fn message(&self) -> &'static str {
        match self {
            Self::ConnectionFailed => "connection failed",
            Self::TenantNotFound => "tenant not found",
            Self::CannotBeginTx => "cannot begin transaction",
            Self::CannotCommitTx => "cannot commit transaction",
            Self::CannotRollbackTx => "cannot rollback transaction",
            Self::NotSupported => "not supported",
            Self::QueryFailed => "query failed",
            Self::CloseFailed => "close failed",
            Self::GenericDbError => "generic database error",
        }
    }

    /// Look a code up by its string form.
    pub fn from_code_str(code: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == code)
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Detail attached to errors that only concern a tenant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantErrorDetail {
    pub tenant_id: String,
}

impl TenantErrorDetail {
    pub fn new(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
        }
    }
}

/// Tenant detail extended with the database's own error code and message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseErrorDetail {
    #[serde(flatten)]
    pub tenant: TenantErrorDetail,
    /// e.g., "42P01" for undefined table
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_error_code: Option<String>,
    pub database_error: String,
}

impl DatabaseErrorDetail {
    pub fn new(
        tenant_id: impl Into<String>,
        database_error_code: Option<String>,
        database_error: impl Into<String>,
    ) -> Self {
        Self {
            tenant: TenantErrorDetail::new(tenant_id),
            database_error_code,
            database_error: database_error.into(),
        }
    }

    /// Build a detail from a driver error.
    ///
    /// Structured database errors contribute their code and bare message; any other
    /// driver error contributes its display text only.
    pub fn from_native(tenant_id: impl Into<String>, err: &sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db_err) => Self::new(
                tenant_id,
                db_err.code().map(|c| c.into_owned()),
                db_err.message(),
            ),
            other => Self::new(tenant_id, None, other.to_string()),
        }
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant.tenant_id
    }
}

/// Database detail extended with the failing statement and its arguments.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryErrorDetail {
    #[serde(flatten)]
    pub database: DatabaseErrorDetail,
    pub query_script: String,
    #[serde(rename = "args")]
    pub query_args: Vec<QueryParam>,
}

impl QueryErrorDetail {
    pub fn tenant_id(&self) -> &str {
        self.database.tenant_id()
    }
}

/// Both causes of a failed rollback: the rollback's own error and the error that
/// triggered the rollback in the first place.
#[derive(Debug)]
pub struct RollbackErrorDetail {
    pub database_error: Error,
    pub original_error: Error,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Connection failed for tenant '{}': {}", .0.tenant.tenant_id, .0.database_error)]
    ConnectionFailed(DatabaseErrorDetail),

    #[error("Tenant not found: {}", .0.tenant_id)]
    TenantNotFound(TenantErrorDetail),

    #[error("Cannot begin transaction for tenant '{}': {}", .0.tenant.tenant_id, .0.database_error)]
    CannotBeginTx(DatabaseErrorDetail),

    #[error("Cannot commit transaction for tenant '{}': {}", .0.tenant.tenant_id, .0.database_error)]
    CannotCommitTx(DatabaseErrorDetail),

    #[error(
        "Cannot rollback transaction: {} (original error: {})",
        .0.database_error,
        .0.original_error
    )]
    CannotRollbackTx(Box<RollbackErrorDetail>),

    #[error("Operation not supported for tenant '{}'", .0.tenant_id)]
    NotSupported(TenantErrorDetail),

    #[error(
        "Query failed for tenant '{}': {} (query: {})",
        .0.database.tenant.tenant_id,
        .0.database.database_error,
        .0.query_script
    )]
    QueryFailed(Box<QueryErrorDetail>),

    #[error("Close failed for tenant '{}': {}", .0.tenant.tenant_id, .0.database_error)]
    CloseFailed(DatabaseErrorDetail),

    #[error("Database error for tenant '{}': {}", .0.tenant.tenant_id, .0.database_error)]
    GenericDbError(DatabaseErrorDetail),

    #[error("Timeout: {operation} exceeded {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("Connection for tenant '{tenant_id}' was abandoned after a statement timed out")]
    Abandoned { tenant_id: String },

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Native(#[from] sqlx::Error),

    #[error("{0}")]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// Create a tenant not found error.
    pub fn tenant_not_found(tenant_id: impl Into<String>) -> Self {
        Self::TenantNotFound(TenantErrorDetail::new(tenant_id))
    }

    /// Create a not supported error.
    pub fn not_supported(tenant_id: impl Into<String>) -> Self {
        Self::NotSupported(TenantErrorDetail::new(tenant_id))
    }

    /// Create a connection failed error from a driver error.
    pub fn connection_failed(tenant_id: impl Into<String>, err: &sqlx::Error) -> Self {
        Self::ConnectionFailed(DatabaseErrorDetail::from_native(tenant_id, err))
    }

    /// Create a cannot begin transaction error from a driver error.
    pub fn cannot_begin_tx(tenant_id: impl Into<String>, err: &sqlx::Error) -> Self {
        Self::CannotBeginTx(DatabaseErrorDetail::from_native(tenant_id, err))
    }

    /// Create a close failed error from a driver error.
    pub fn close_failed(tenant_id: impl Into<String>, err: &sqlx::Error) -> Self {
        Self::CloseFailed(DatabaseErrorDetail::from_native(tenant_id, err))
    }

    /// Create a query failed error carrying the statement and its arguments.
    pub fn query_failed(
        tenant_id: impl Into<String>,
        sql: impl Into<String>,
        args: &[QueryParam],
        err: &sqlx::Error,
    ) -> Self {
        Self::QueryFailed(Box::new(QueryErrorDetail {
            database: DatabaseErrorDetail::from_native(tenant_id, err),
            query_script: sql.into(),
            query_args: args.to_vec(),
        }))
    }

    /// Compose a rollback failure with the error that caused the rollback.
    pub fn cannot_rollback_tx(database_error: Error, original_error: Error) -> Self {
        Self::CannotRollbackTx(Box::new(RollbackErrorDetail {
            database_error,
            original_error,
        }))
    }

    /// Create a timeout error.
    pub fn timeout(operation: &'static str, timeout: Duration) -> Self {
        Self::Timeout { operation, timeout }
    }

    /// The connection can no longer be used because a timed-out statement may still be
    /// running on it.
    pub fn abandoned(tenant_id: impl Into<String>) -> Self {
        Self::Abandoned {
            tenant_id: tenant_id.into(),
        }
    }

    /// Wrap a caller-defined error, typically returned from a transaction closure.
    pub fn other<E>(err: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::Other(err.into())
    }

    /// Registered code of this error, `None` for pass-through errors.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::ConnectionFailed(_) => Some(ErrorCode::ConnectionFailed),
            Self::TenantNotFound(_) => Some(ErrorCode::TenantNotFound),
            Self::CannotBeginTx(_) => Some(ErrorCode::CannotBeginTx),
            Self::CannotCommitTx(_) => Some(ErrorCode::CannotCommitTx),
            Self::CannotRollbackTx(_) => Some(ErrorCode::CannotRollbackTx),
            Self::NotSupported(_) => Some(ErrorCode::NotSupported),
            Self::QueryFailed(_) => Some(ErrorCode::QueryFailed),
            Self::CloseFailed(_) => Some(ErrorCode::CloseFailed),
            Self::GenericDbError(_) => Some(ErrorCode::GenericDbError),
            Self::Timeout { .. }
            | Self::Abandoned { .. }
            | Self::Provider(_)
            | Self::Native(_)
            | Self::Other(_) => None,
        }
    }

    /// Check whether this error carries the given code.
    pub fn is(&self, code: ErrorCode) -> bool {
        self.code() == Some(code)
    }

    /// Database detail, for codes whose payload is (or extends) one.
    pub fn database_detail(&self) -> Option<&DatabaseErrorDetail> {
        match self {
            Self::ConnectionFailed(d)
            | Self::CannotBeginTx(d)
            | Self::CannotCommitTx(d)
            | Self::CloseFailed(d)
            | Self::GenericDbError(d) => Some(d),
            Self::QueryFailed(d) => Some(&d.database),
            _ => None,
        }
    }

    /// Query detail, only for `QueryFailed`.
    pub fn query_detail(&self) -> Option<&QueryErrorDetail> {
        match self {
            Self::QueryFailed(d) => Some(d),
            _ => None,
        }
    }

    /// Rollback detail, only for `CannotRollbackTx`.
    pub fn rollback_detail(&self) -> Option<&RollbackErrorDetail> {
        match self {
            Self::CannotRollbackTx(d) => Some(d),
            _ => None,
        }
    }

    /// Tenant the error belongs to, when the payload names one.
    pub fn tenant_id(&self) -> Option<&str> {
        match self {
            Self::TenantNotFound(d) | Self::NotSupported(d) => Some(&d.tenant_id),
            Self::Abandoned { tenant_id } => Some(tenant_id),
            Self::CannotRollbackTx(d) => d
                .original_error
                .tenant_id()
                .or_else(|| d.database_error.tenant_id()),
            other => other.database_detail().map(|d| d.tenant_id()),
        }
    }

    /// SQLSTATE (or backend specific code) reported by the database, if any.
    pub fn sql_state(&self) -> Option<String> {
        match self {
            Self::Native(sqlx::Error::Database(db_err)) => db_err.code().map(|c| c.into_owned()),
            other => other
                .database_detail()
                .and_then(|d| d.database_error_code.clone()),
        }
    }

    /// Check if this error is a serialization conflict the whole transaction can be
    /// retried on.
    pub fn is_retryable_serialization(&self) -> bool {
        matches!(
            self.sql_state().as_deref(),
            Some(SQLSTATE_SERIALIZATION_FAILURE) | Some(SQLSTATE_CRDB_RETRY)
        )
    }

    /// Structured payload as JSON: `{code, message, detail}`.
    pub fn to_json(&self) -> JsonValue {
        let Some(code) = self.code() else {
            return json!({ "code": JsonValue::Null, "message": self.to_string() });
        };
        let detail = match self {
            Self::TenantNotFound(d) | Self::NotSupported(d) => to_json_value(d),
            Self::QueryFailed(d) => to_json_value(d),
            Self::CannotRollbackTx(d) => json!({
                "databaseError": d.database_error.to_json(),
                "originalError": d.original_error.to_json(),
            }),
            other => other
                .database_detail()
                .map(to_json_value)
                .unwrap_or(JsonValue::Null),
        };
        json!({
            "code": code.as_str(),
            "message": code.message(),
            "detail": detail,
        })
    }
}

fn to_json_value<T: Serialize>(value: &T) -> JsonValue {
    serde_json::to_value(value).unwrap_or(JsonValue::Null)
}

/// Result type alias for connector operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;
