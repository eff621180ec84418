//! Tenant DB Connector Library
//!
//! This library resolves an opaque tenant id to that tenant's database, hands out a
//! dedicated connection to it and runs queries and transactions on it. Driver failures
//! are normalized into coded [`Error`] values. The CockroachDB connector adds automatic
//! retry of transactions that hit serialization conflicts.

pub mod config;
pub mod connector;
pub mod convert;
pub mod db;
pub mod error;
pub mod tenant;

pub use config::Config;
pub use connector::{
    CockroachConnector, CockroachDatabase, Connector, ConnectorOptions, Database, RetryPolicy,
    SqlConnector, SqlDatabase, Transaction,
};
pub use db::{DbRow, ExecResult, QueryParam, Row, Rows};
pub use error::{Error, ErrorCode, Result};
pub use tenant::{
    FileTenantProvider, ProviderError, StaticTenantProvider, TenantConfig, TenantProvider,
};
