//! Conversion of driver errors into coded errors.
//!
//! A converter is bound to one target [`ErrorCode`] and one tenant. Converters are
//! composed into a [`ConverterChain`]: the first converter that recognizes an error
//! produces the coded error, and an error nobody recognizes passes through unchanged.

use crate::error::{DatabaseErrorDetail, Error, ErrorCode};

/// Recognizes a class of errors and re-emits them under a registered code.
pub trait ErrorConverter: Send + Sync {
    /// Returns the converted error, or `None` when this converter does not recognize `err`.
    fn convert(&self, err: &Error) -> Option<Error>;
}

/// Codes a converter can emit: those whose payload is a [`DatabaseErrorDetail`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConversionTarget {
    ConnectionFailed,
    CannotBeginTx,
    CannotCommitTx,
    CloseFailed,
    GenericDbError,
}

impl ConversionTarget {
    pub fn code(self) -> ErrorCode {
        match self {
            Self::ConnectionFailed => ErrorCode::ConnectionFailed,
            Self::CannotBeginTx => ErrorCode::CannotBeginTx,
            Self::CannotCommitTx => ErrorCode::CannotCommitTx,
            Self::CloseFailed => ErrorCode::CloseFailed,
            Self::GenericDbError => ErrorCode::GenericDbError,
        }
    }

    fn build(self, detail: DatabaseErrorDetail) -> Error {
        match self {
            Self::ConnectionFailed => Error::ConnectionFailed(detail),
            Self::CannotBeginTx => Error::CannotBeginTx(detail),
            Self::CannotCommitTx => Error::CannotCommitTx(detail),
            Self::CloseFailed => Error::CloseFailed(detail),
            Self::GenericDbError => Error::GenericDbError(detail),
        }
    }
}

impl From<ConversionTarget> for ErrorCode {
    fn from(target: ConversionTarget) -> Self {
        target.code()
    }
}

impl TryFrom<ErrorCode> for ConversionTarget {
    /// The rejected code; its payload is not a plain database detail.
    type Error = ErrorCode;

    fn try_from(code: ErrorCode) -> Result<Self, Self::Error> {
        match code {
            ErrorCode::ConnectionFailed => Ok(Self::ConnectionFailed),
            ErrorCode::CannotBeginTx => Ok(Self::CannotBeginTx),
            ErrorCode::CannotCommitTx => Ok(Self::CannotCommitTx),
            ErrorCode::CloseFailed => Ok(Self::CloseFailed),
            ErrorCode::GenericDbError => Ok(Self::GenericDbError),
            ErrorCode::TenantNotFound
            | ErrorCode::CannotRollbackTx
            | ErrorCode::NotSupported
            | ErrorCode::QueryFailed => Err(code),
        }
    }
}

/// Recognizes structured database errors (a SQLSTATE plus a message).
#[derive(Debug, Clone)]
pub struct DatabaseErrorConverter {
    target: ConversionTarget,
    tenant_id: String,
}

impl DatabaseErrorConverter {
    pub fn new(target: ConversionTarget, tenant_id: impl Into<String>) -> Self {
        Self {
            target,
            tenant_id: tenant_id.into(),
        }
    }
}

impl ErrorConverter for DatabaseErrorConverter {
    fn convert(&self, err: &Error) -> Option<Error> {
        match err {
            Error::Native(native @ sqlx::Error::Database(_)) => Some(
                self.target
                    .build(DatabaseErrorDetail::from_native(self.tenant_id.as_str(), native)),
            ),
            _ => None,
        }
    }
}

/// Recognizes any driver error, structured or not.
#[derive(Debug, Clone)]
pub struct NativeErrorConverter {
    target: ConversionTarget,
    tenant_id: String,
}

impl NativeErrorConverter {
    pub fn new(target: ConversionTarget, tenant_id: impl Into<String>) -> Self {
        Self {
            target,
            tenant_id: tenant_id.into(),
        }
    }
}

impl ErrorConverter for NativeErrorConverter {
    fn convert(&self, err: &Error) -> Option<Error> {
        match err {
            Error::Native(native) => Some(
                self.target
                    .build(DatabaseErrorDetail::from_native(self.tenant_id.as_str(), native)),
            ),
            _ => None,
        }
    }
}

/// Ordered list of converters; the first match wins.
#[derive(Default)]
pub struct ConverterChain {
    converters: Vec<Box<dyn ErrorConverter>>,
}

impl ConverterChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a converter to the end of the chain.
    pub fn with(mut self, converter: impl ErrorConverter + 'static) -> Self {
        self.converters.push(Box::new(converter));
        self
    }

    /// Chain used for commit failures and errors returned from transaction closures.
    pub fn cannot_commit_tx(tenant_id: &str) -> Self {
        Self::new().with(DatabaseErrorConverter::new(
            ConversionTarget::CannotCommitTx,
            tenant_id,
        ))
    }

    /// Catch-all chain: every driver error becomes `GenericDbError`.
    pub fn generic(tenant_id: &str) -> Self {
        Self::new()
            .with(DatabaseErrorConverter::new(
                ConversionTarget::GenericDbError,
                tenant_id,
            ))
            .with(NativeErrorConverter::new(
                ConversionTarget::GenericDbError,
                tenant_id,
            ))
    }

    pub fn len(&self) -> usize {
        self.converters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.converters.is_empty()
    }

    /// Convert `err` with the first converter that recognizes it.
    pub fn convert(&self, err: Error) -> Error {
        self.converters
            .iter()
            .find_map(|c| c.convert(&err))
            .unwrap_or(err)
    }
}

impl std::fmt::Debug for ConverterChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConverterChain")
            .field("converters", &self.converters.len())
            .finish()
    }
}
