//! Result handles returned by query execution.

use crate::convert::ConverterChain;
use crate::db::StatementDeadline;
use crate::db::params::QueryParam;
use crate::error::{Error, Result};
use futures_util::TryStreamExt;
use futures_util::stream::BoxStream;
use sqlx::postgres::PgRow;
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, ColumnIndex, Decode, Postgres, Row as SqlxRow, Sqlite, Type};

/// Attach the statement to a driver error raised while executing it.
///
/// Non-driver errors such as timeouts pass through unchanged.
pub(crate) fn query_failed(tenant_id: &str, sql: &str, args: &[QueryParam], err: Error) -> Error {
    match err {
        Error::Native(native) => Error::query_failed(tenant_id, sql, args, &native),
        other => other,
    }
}

/// One result row from either backend.
pub enum DbRow {
    Postgres(PgRow),
    SQLite(SqliteRow),
}

impl DbRow {
    /// Decode a column by position or by name.
    pub fn try_get<'r, T, I>(&'r self, index: I) -> Result<T>
    where
        I: ColumnIndex<PgRow> + ColumnIndex<SqliteRow>,
        T: Decode<'r, Postgres> + Type<Postgres> + Decode<'r, Sqlite> + Type<Sqlite>,
    {
        let value = match self {
            Self::Postgres(row) => row.try_get(index)?,
            Self::SQLite(row) => row.try_get(index)?,
        };
        Ok(value)
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Postgres(row) => row.len(),
            Self::SQLite(row) => row.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn column_names(&self) -> Vec<String> {
        match self {
            Self::Postgres(row) => row.columns().iter().map(|c| c.name().to_string()).collect(),
            Self::SQLite(row) => row.columns().iter().map(|c| c.name().to_string()).collect(),
        }
    }
}

impl std::fmt::Debug for DbRow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let backend = match self {
            Self::Postgres(_) => "Postgres",
            Self::SQLite(_) => "SQLite",
        };
        f.debug_struct("DbRow")
            .field("backend", &backend)
            .field("columns", &self.column_names())
            .finish()
    }
}

/// Outcome of a single-row query. Any failure is deferred to [`Row::scan`].
#[derive(Debug)]
pub struct Row {
    result: Result<Option<DbRow>>,
}

impl Row {
    pub(crate) fn new(result: Result<Option<DbRow>>) -> Self {
        Self { result }
    }

    /// The execution error, if the statement itself failed.
    pub fn err(&self) -> Option<&Error> {
        self.result.as_ref().err()
    }

    /// Take the row. An empty result is reported as [`sqlx::Error::RowNotFound`].
    pub fn scan(self) -> Result<DbRow> {
        match self.result {
            Ok(Some(row)) => Ok(row),
            Ok(None) => Err(Error::Native(sqlx::Error::RowNotFound)),
            Err(err) => Err(err),
        }
    }
}

/// Forward-only cursor over a result set.
///
/// The cursor borrows its connection; close it (or drop it) before issuing the next
/// statement on the same database or transaction.
pub struct Rows<'a> {
    deadline: StatementDeadline,
    stream: Option<BoxStream<'a, std::result::Result<DbRow, sqlx::Error>>>,
    pending: Option<DbRow>,
    err: Option<Error>,
}

impl<'a> Rows<'a> {
    /// Start the statement and fetch its first row.
    ///
    /// Failures before the first row are execution failures and become `QueryFailed`.
    pub(crate) async fn open(
        deadline: StatementDeadline,
        mut stream: BoxStream<'a, std::result::Result<DbRow, sqlx::Error>>,
        sql: &str,
        args: &[QueryParam],
    ) -> Result<Self> {
        let first = deadline
            .run("query", stream.try_next())
            .await
            .map_err(|err| query_failed(deadline.tenant().tenant_id(), sql, args, err))?;
        let stream = first.is_some().then_some(stream);
        Ok(Self {
            deadline,
            stream,
            pending: first,
            err: None,
        })
    }

    /// Advance to the next row. `None` means the set is exhausted or failed; check
    /// [`Rows::err`] to tell the two apart.
    pub async fn next(&mut self) -> Option<DbRow> {
        if let Some(row) = self.pending.take() {
            return Some(row);
        }
        let stream = self.stream.as_mut()?;
        let next = self.deadline.run("fetch row", stream.try_next()).await;
        match next {
            Ok(Some(row)) => Some(row),
            Ok(None) => {
                self.stream = None;
                None
            }
            Err(err) => {
                self.stream = None;
                let chain = ConverterChain::generic(self.deadline.tenant().tenant_id());
                self.err = Some(chain.convert(err));
                None
            }
        }
    }

    /// Error that ended the iteration early, if any.
    pub fn err(&self) -> Option<&Error> {
        self.err.as_ref()
    }

    /// Drain the remaining rows, failing with the iteration error if one occurs.
    pub async fn all(mut self) -> Result<Vec<DbRow>> {
        let mut rows = Vec::new();
        while let Some(row) = self.next().await {
            rows.push(row);
        }
        match self.err.take() {
            Some(err) => Err(err),
            None => Ok(rows),
        }
    }

    /// Release the cursor and its borrow of the connection.
    pub fn close(self) {}
}

impl std::fmt::Debug for Rows<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rows")
            .field("tenant_id", &self.deadline.tenant().tenant_id())
            .field("open", &self.stream.is_some())
            .field("err", &self.err)
            .finish()
    }
}

/// Outcome of a statement executed with `exec`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecResult {
    tenant_id: String,
    rows_affected: u64,
}

impl ExecResult {
    pub(crate) fn new(tenant_id: impl Into<String>, rows_affected: u64) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            rows_affected,
        }
    }

    pub fn rows_affected(&self) -> u64 {
        self.rows_affected
    }

    /// Always `NotSupported`; use a `RETURNING` clause instead.
    pub fn last_insert_id(&self) -> Result<i64> {
        Err(Error::not_supported(self.tenant_id.as_str()))
    }
}
