//! Tenant metadata.
//!
//! This module defines the tenant configuration value, the provider contract the
//! connector loads tenants from, two ready-made providers and the immutable tenant
//! index snapshot used for routing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

/// Connection settings of one tenant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TenantConfig {
    id: String,
    #[serde(default)]
    name: String,
    /// Contains sensitive data - never log
    url: String,
}

impl TenantConfig {
    /// Start building a tenant configuration.
    pub fn builder() -> TenantConfigBuilder {
        TenantConfigBuilder::default()
    }

    pub fn tenant_id(&self) -> &str {
        &self.id
    }

    pub fn tenant_name(&self) -> &str {
        &self.name
    }

    pub fn database_url(&self) -> &str {
        &self.url
    }

    /// Get a display-safe version of the database URL (credentials masked).
    pub fn masked_database_url(&self) -> String {
        match Url::parse(&self.url) {
            Ok(mut url) if url.password().is_some() => {
                // Only fails for cannot-be-a-base URLs, which carry no password.
                let _ = url.set_password(Some("****"));
                url.to_string()
            }
            Ok(_) => self.url.clone(),
            Err(_) => match (self.url.find("://"), self.url.rfind('@')) {
                (Some(scheme_end), Some(at_pos)) if at_pos > scheme_end => {
                    format!("{}****{}", &self.url[..scheme_end + 3], &self.url[at_pos..])
                }
                _ => self.url.clone(),
            },
        }
    }
}

/// Fluent builder for [`TenantConfig`]; unset fields stay empty.
#[derive(Debug, Clone, Default)]
pub struct TenantConfigBuilder {
    config: TenantConfig,
}

impl TenantConfigBuilder {
    pub fn tenant_id(mut self, id: impl Into<String>) -> Self {
        self.config.id = id.into();
        self
    }

    pub fn tenant_name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    pub fn database_url(mut self, url: impl Into<String>) -> Self {
        self.config.url = url.into();
        self
    }

    pub fn build(self) -> TenantConfig {
        self.config
    }
}

/// Errors raised by a [`TenantProvider`].
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Tenant provider configuration failed: {0}")]
    Configure(String),

    #[error("Failed to load tenants: {0}")]
    Load(String),
}

/// Source of tenant configurations.
///
/// `load_tenants` returns the full current set, not a delta; the connector treats each
/// result as the authoritative list.
#[async_trait]
pub trait TenantProvider: Send + Sync {
    /// One-time setup, called once before the first load.
    async fn configure(&self) -> Result<(), ProviderError>;

    /// Fetch every tenant currently known to the provider.
    async fn load_tenants(&self) -> Result<Vec<TenantConfig>, ProviderError>;
}

/// Provider backed by a fixed list of tenants.
#[derive(Debug, Clone, Default)]
pub struct StaticTenantProvider {
    tenants: Vec<TenantConfig>,
}

impl StaticTenantProvider {
    /// Name given to the tenant created by [`StaticTenantProvider::single`].
    pub const DEFAULT_TENANT_NAME: &'static str = "default";

    pub fn new(tenants: Vec<TenantConfig>) -> Self {
        Self { tenants }
    }

    /// Single-tenant deployment: one tenant id mapped to one database.
    pub fn single(tenant_id: impl Into<String>, database_url: impl Into<String>) -> Self {
        Self::new(vec![
            TenantConfig::builder()
                .tenant_id(tenant_id)
                .tenant_name(Self::DEFAULT_TENANT_NAME)
                .database_url(database_url)
                .build(),
        ])
    }
}

#[async_trait]
impl TenantProvider for StaticTenantProvider {
    async fn configure(&self) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn load_tenants(&self) -> Result<Vec<TenantConfig>, ProviderError> {
        Ok(self.tenants.clone())
    }
}

/// Provider reading a JSON array of `{"id", "name", "url"}` objects.
///
/// The file is re-read on every load, so a connector reload picks up edits.
#[derive(Debug, Clone)]
pub struct FileTenantProvider {
    path: PathBuf,
}

impl FileTenantProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

#[async_trait]
impl TenantProvider for FileTenantProvider {
    async fn configure(&self) -> Result<(), ProviderError> {
        let metadata = tokio::fs::metadata(&self.path).await.map_err(|e| {
            ProviderError::Configure(format!("cannot access {}: {}", self.path.display(), e))
        })?;
        if !metadata.is_file() {
            return Err(ProviderError::Configure(format!(
                "{} is not a file",
                self.path.display()
            )));
        }
        Ok(())
    }

    async fn load_tenants(&self) -> Result<Vec<TenantConfig>, ProviderError> {
        let raw = tokio::fs::read(&self.path)
            .await
            .map_err(|e| ProviderError::Load(format!("{}: {}", self.path.display(), e)))?;
        let tenants: Vec<TenantConfig> = serde_json::from_slice(&raw)
            .map_err(|e| ProviderError::Load(format!("{}: {}", self.path.display(), e)))?;
        debug!(path = %self.path.display(), count = tenants.len(), "Loaded tenants from file");
        Ok(tenants)
    }
}

/// One immutable snapshot of the provider's tenant list, indexed by tenant id.
#[derive(Debug, Clone)]
pub struct TenantIndex {
    generation: u64,
    loaded_at: DateTime<Utc>,
    tenants: Vec<Arc<TenantConfig>>,
    positions: HashMap<String, usize>,
}

impl TenantIndex {
    /// Build an index from one provider snapshot.
    ///
    /// When an id appears more than once the last entry wins.
    pub fn build(generation: u64, configs: Vec<TenantConfig>) -> Self {
        let tenants: Vec<Arc<TenantConfig>> = configs.into_iter().map(Arc::new).collect();
        let mut positions = HashMap::with_capacity(tenants.len());
        for (idx, tenant) in tenants.iter().enumerate() {
            if positions.insert(tenant.tenant_id().to_string(), idx).is_some() {
                warn!(
                    tenant_id = %tenant.tenant_id(),
                    generation,
                    "Duplicate tenant id in provider snapshot, last entry wins"
                );
            }
        }
        Self {
            generation,
            loaded_at: Utc::now(),
            tenants,
            positions,
        }
    }

    /// Index with no tenants, generation 0.
    pub fn empty() -> Self {
        Self::build(0, Vec::new())
    }

    pub fn get(&self, tenant_id: &str) -> Option<&Arc<TenantConfig>> {
        self.positions.get(tenant_id).map(|&idx| &self.tenants[idx])
    }

    pub fn contains(&self, tenant_id: &str) -> bool {
        self.positions.contains_key(tenant_id)
    }

    /// Distinct tenant ids, in provider order.
    pub fn tenant_ids(&self) -> Vec<&str> {
        self.tenants
            .iter()
            .enumerate()
            .filter(|(idx, t)| self.positions.get(t.tenant_id()) == Some(idx))
            .map(|(_, t)| t.tenant_id())
            .collect()
    }

    /// Number of distinct tenant ids.
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }
}
