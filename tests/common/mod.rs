//! Shared helpers for the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use sqlx::error::{DatabaseError, ErrorKind};
use std::borrow::Cow;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::NamedTempFile;
use tenant_dbconnector::{Error, ProviderError, TenantConfig, TenantProvider};

/// Provider whose tenant list can be swapped between reloads.
#[derive(Debug, Default)]
pub struct MockTenantProvider {
    tenants: Mutex<Vec<TenantConfig>>,
    configure_calls: AtomicUsize,
    load_calls: AtomicUsize,
}

impl MockTenantProvider {
    pub fn new(tenants: Vec<TenantConfig>) -> Self {
        Self {
            tenants: Mutex::new(tenants),
            ..Default::default()
        }
    }

    pub fn set_tenants(&self, tenants: Vec<TenantConfig>) {
        *self.tenants.lock().unwrap() = tenants;
    }

    pub fn configure_calls(&self) -> usize {
        self.configure_calls.load(Ordering::SeqCst)
    }

    pub fn load_calls(&self) -> usize {
        self.load_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TenantProvider for MockTenantProvider {
    async fn configure(&self) -> Result<(), ProviderError> {
        self.configure_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn load_tenants(&self) -> Result<Vec<TenantConfig>, ProviderError> {
        self.load_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.tenants.lock().unwrap().clone())
    }
}

pub fn tenant(id: &str, url: &str) -> TenantConfig {
    TenantConfig::builder()
        .tenant_id(id)
        .tenant_name(format!("Test {id}"))
        .database_url(url)
        .build()
}

/// Create an empty SQLite database file; keep the handle alive for the test's duration.
pub fn sqlite_file() -> (NamedTempFile, String) {
    let temp_file = NamedTempFile::new().expect("Failed to create temp file");
    let url = format!("sqlite:{}?mode=rwc", temp_file.path().display());
    (temp_file, url)
}

/// Structured database error with a chosen SQLSTATE.
#[derive(Debug)]
pub struct FakeDbError {
    pub code: &'static str,
    pub message: &'static str,
}

impl std::fmt::Display for FakeDbError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (SQLSTATE {})", self.message, self.code)
    }
}

impl std::error::Error for FakeDbError {}

impl DatabaseError for FakeDbError {
    fn message(&self) -> &str {
        self.message
    }

    fn code(&self) -> Option<Cow<'_, str>> {
        Some(Cow::Borrowed(self.code))
    }

    fn as_error(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
        self
    }

    fn as_error_mut(&mut self) -> &mut (dyn std::error::Error + Send + Sync + 'static) {
        self
    }

    fn into_error(self: Box<Self>) -> Box<dyn std::error::Error + Send + Sync + 'static> {
        self
    }

    fn kind(&self) -> ErrorKind {
        ErrorKind::Other
    }
}

pub fn db_error(code: &'static str, message: &'static str) -> Error {
    Error::Native(sqlx::Error::Database(Box::new(FakeDbError { code, message })))
}
