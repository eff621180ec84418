//! Backend-specific connections and transactions.
//!
//! A tenant's endpoint URL selects the backend. Each [`DbConnection`] is one dedicated
//! connection (no pooling); [`DbTransaction`] borrows it for the transaction's lifetime.
//! Statement execution goes through [`DbExecutor`], a borrowed view shared by both.

use crate::db::params::{QueryParam, bind_postgres_param, bind_sqlite_param};
use crate::db::rows::DbRow;
use futures_util::stream::BoxStream;
use futures_util::{StreamExt, TryStreamExt};
use sqlx::postgres::PgConnectOptions;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{ConnectOptions, Connection, PgConnection, Postgres, Sqlite, SqliteConnection};
use std::str::FromStr;
use std::time::Duration;

/// Supported database backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DatabaseType {
    /// Also covers CockroachDB, which speaks the PostgreSQL wire protocol.
    PostgreSQL,
    SQLite,
}

impl DatabaseType {
    /// Parse database type from a connection string.
    pub fn from_connection_string(connection_string: &str) -> Option<Self> {
        let lower = connection_string.to_lowercase();
        if lower.starts_with("postgres://") || lower.starts_with("postgresql://") {
            Some(Self::PostgreSQL)
        } else if lower.starts_with("sqlite:") {
            Some(Self::SQLite)
        } else {
            None
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Self::PostgreSQL => "PostgreSQL",
            Self::SQLite => "SQLite",
        }
    }
}

impl std::fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// Dispatch over the backend variants of a [`DbConnection`], [`DbTransaction`] or
/// [`DbExecutor`] value with the same body for every variant.
macro_rules! dispatch {
    ($enum:ident, $value:expr, $inner:ident => $body:expr) => {
        match $value {
            $enum::Postgres($inner) => $body,
            $enum::SQLite($inner) => $body,
        }
    };
}

/// A live connection to one tenant database.
pub enum DbConnection {
    Postgres(PgConnection),
    SQLite(SqliteConnection),
}

impl DbConnection {
    /// Open a connection to `url`.
    ///
    /// PostgreSQL-wire servers enforce `statement_timeout` themselves and cancel a
    /// statement that runs over it. Unknown schemes and unparsable URLs are reported as
    /// configuration errors.
    pub async fn open(url: &str, statement_timeout: Option<Duration>) -> Result<Self, sqlx::Error> {
        match DatabaseType::from_connection_string(url) {
            Some(DatabaseType::PostgreSQL) => {
                let options = postgres_options(url, statement_timeout)?;
                Ok(Self::Postgres(options.connect().await?))
            }
            Some(DatabaseType::SQLite) => {
                let options = SqliteConnectOptions::from_str(url)?;
                Ok(Self::SQLite(options.connect().await?))
            }
            None => {
                let scheme = url.split_once(':').map(|(s, _)| s).unwrap_or(url);
                Err(sqlx::Error::Configuration(
                    format!("unsupported database url scheme '{scheme}'").into(),
                ))
            }
        }
    }

    pub fn db_type(&self) -> DatabaseType {
        match self {
            Self::Postgres(_) => DatabaseType::PostgreSQL,
            Self::SQLite(_) => DatabaseType::SQLite,
        }
    }

    /// Begin a native transaction.
    pub async fn begin(&mut self) -> Result<DbTransaction<'_>, sqlx::Error> {
        match self {
            Self::Postgres(conn) => Ok(DbTransaction::Postgres(conn.begin().await?)),
            Self::SQLite(conn) => Ok(DbTransaction::SQLite(conn.begin().await?)),
        }
    }

    /// Gracefully close the connection.
    pub async fn close(self) -> Result<(), sqlx::Error> {
        dispatch!(DbConnection, self, conn => conn.close().await)
    }

    pub fn executor(&mut self) -> DbExecutor<'_> {
        match self {
            Self::Postgres(conn) => DbExecutor::Postgres(conn),
            Self::SQLite(conn) => DbExecutor::SQLite(conn),
        }
    }
}

/// Connect options for a PostgreSQL-wire endpoint, with the server-side statement limit.
fn postgres_options(
    url: &str,
    statement_timeout: Option<Duration>,
) -> Result<PgConnectOptions, sqlx::Error> {
    let options = PgConnectOptions::from_str(url)?;
    Ok(match statement_timeout {
        // 0 would disable the limit on the server
        Some(limit) => {
            let millis = limit.as_millis().max(1);
            options.options([("statement_timeout", millis)])
        }
        None => options,
    })
}

impl std::fmt::Debug for DbConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("DbConnection").field(&self.db_type()).finish()
    }
}

/// A native transaction, borrowing its connection.
///
/// Dropping an uncommitted transaction queues a rollback on the connection.
pub enum DbTransaction<'c> {
    Postgres(sqlx::Transaction<'c, Postgres>),
    SQLite(sqlx::Transaction<'c, Sqlite>),
}

impl<'c> DbTransaction<'c> {
    pub fn db_type(&self) -> DatabaseType {
        match self {
            Self::Postgres(_) => DatabaseType::PostgreSQL,
            Self::SQLite(_) => DatabaseType::SQLite,
        }
    }

    pub async fn commit(self) -> Result<(), sqlx::Error> {
        dispatch!(DbTransaction, self, tx => tx.commit().await)
    }

    pub async fn rollback(self) -> Result<(), sqlx::Error> {
        dispatch!(DbTransaction, self, tx => tx.rollback().await)
    }

    pub fn executor(&mut self) -> DbExecutor<'_> {
        match self {
            Self::Postgres(tx) => DbExecutor::Postgres(&mut **tx),
            Self::SQLite(tx) => DbExecutor::SQLite(&mut **tx),
        }
    }
}

impl std::fmt::Debug for DbTransaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("DbTransaction").field(&self.db_type()).finish()
    }
}

/// Borrowed connection that statements run on.
pub enum DbExecutor<'a> {
    Postgres(&'a mut PgConnection),
    SQLite(&'a mut SqliteConnection),
}

impl<'a> DbExecutor<'a> {
    /// Stream the rows produced by `sql`.
    pub fn fetch(
        self,
        sql: &'a str,
        args: &'a [QueryParam],
    ) -> BoxStream<'a, Result<DbRow, sqlx::Error>> {
        match self {
            Self::Postgres(conn) => {
                let mut query = sqlx::query(sql);
                for arg in args {
                    query = bind_postgres_param(query, arg);
                }
                query.fetch(conn).map_ok(DbRow::Postgres).boxed()
            }
            Self::SQLite(conn) => {
                let mut query = sqlx::query(sql);
                for arg in args {
                    query = bind_sqlite_param(query, arg);
                }
                query.fetch(conn).map_ok(DbRow::SQLite).boxed()
            }
        }
    }

    /// Fetch at most one row.
    pub async fn fetch_optional(
        self,
        sql: &'a str,
        args: &'a [QueryParam],
    ) -> Result<Option<DbRow>, sqlx::Error> {
        match self {
            Self::Postgres(conn) => {
                let mut query = sqlx::query(sql);
                for arg in args {
                    query = bind_postgres_param(query, arg);
                }
                Ok(query.fetch_optional(conn).await?.map(DbRow::Postgres))
            }
            Self::SQLite(conn) => {
                let mut query = sqlx::query(sql);
                for arg in args {
                    query = bind_sqlite_param(query, arg);
                }
                Ok(query.fetch_optional(conn).await?.map(DbRow::SQLite))
            }
        }
    }

    /// Execute a statement and return the number of affected rows.
    pub async fn execute(self, sql: &'a str, args: &'a [QueryParam]) -> Result<u64, sqlx::Error> {
        match self {
            Self::Postgres(conn) => {
                let mut query = sqlx::query(sql);
                for arg in args {
                    query = bind_postgres_param(query, arg);
                }
                Ok(query.execute(conn).await?.rows_affected())
            }
            Self::SQLite(conn) => {
                let mut query = sqlx::query(sql);
                for arg in args {
                    query = bind_sqlite_param(query, arg);
                }
                Ok(query.execute(conn).await?.rows_affected())
            }
        }
    }
}
