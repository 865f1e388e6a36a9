//! Tenant resource registry.
//!
//! One [`ResourceBundle`] per tenant, held in a sharded map so construction
//! and removal contend per key, not process-wide. There is no ambient
//! global: the registry is an explicit object passed by handle to every
//! component that needs tenant scoping, and bundle lifecycle
//! (construct / invalidate) is an explicit API.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{info, warn};

use keyfort_core::{AppKey, TenantKey};
use keyfort_storage::SessionStore;

use crate::config::AuthConfig;
use crate::error::{AuthError, AuthResult};

/// The resources owned by one tenant.
///
/// Bundles are shared read-only (`Arc`); nothing hands out mutable access
/// across tenants.
pub struct ResourceBundle {
    tenant: TenantKey,
    storage: Arc<dyn SessionStore>,
    config: Arc<AuthConfig>,
}

impl std::fmt::Debug for ResourceBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceBundle")
            .field("tenant", &self.tenant)
            .finish_non_exhaustive()
    }
}

impl ResourceBundle {
    /// Creates a bundle over a tenant's storage handle and effective config.
    #[must_use]
    pub fn new(tenant: TenantKey, storage: Arc<dyn SessionStore>, config: Arc<AuthConfig>) -> Self {
        Self {
            tenant,
            storage,
            config,
        }
    }

    /// The tenant this bundle belongs to.
    #[must_use]
    pub fn tenant(&self) -> &TenantKey {
        &self.tenant
    }

    /// The tenant's storage handle.
    #[must_use]
    pub fn storage(&self) -> &Arc<dyn SessionStore> {
        &self.storage
    }

    /// The tenant's effective configuration.
    #[must_use]
    pub fn config(&self) -> &Arc<AuthConfig> {
        &self.config
    }
}

/// Identity of a storage instance, for de-duplicating tenants that share a
/// backend.
fn storage_identity(storage: &Arc<dyn SessionStore>) -> usize {
    Arc::as_ptr(storage) as *const () as usize
}

/// Registry of per-tenant resource bundles.
#[derive(Default)]
pub struct TenantRegistry {
    bundles: DashMap<TenantKey, Arc<ResourceBundle>>,
}

impl TenantRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached bundle for a tenant.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::TenantNotFound`] if no bundle exists; callers
    /// that can construct on demand use [`TenantRegistry::set`].
    pub fn get(&self, tenant: &TenantKey) -> AuthResult<Arc<ResourceBundle>> {
        self.bundles
            .get(tenant)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| AuthError::tenant_not_found(tenant))
    }

    /// Returns the bundle for a tenant, constructing it with `factory` if
    /// absent.
    ///
    /// Idempotent-if-absent: when a bundle already exists it is returned
    /// unchanged and `factory` never runs, so racing callers cannot
    /// construct duplicates. A factory error leaves the key absent — the
    /// registry is never poisoned and the call can be retried.
    pub fn set<F>(&self, tenant: TenantKey, factory: F) -> AuthResult<Arc<ResourceBundle>>
    where
        F: FnOnce() -> AuthResult<ResourceBundle>,
    {
        match self.bundles.entry(tenant) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                let bundle = Arc::new(factory()?);
                entry.insert(bundle.clone());
                info!(tenant = %bundle.tenant(), "registered tenant bundle");
                Ok(bundle)
            }
        }
    }

    /// Removes a tenant's bundle, releasing its storage handle if no other
    /// tenant shares the same underlying store.
    ///
    /// Returns `true` if a bundle was removed.
    pub async fn remove(&self, tenant: &TenantKey) -> bool {
        let Some((_, bundle)) = self.bundles.remove(tenant) else {
            return false;
        };

        let identity = storage_identity(bundle.storage());
        let still_shared = self
            .bundles
            .iter()
            .any(|entry| storage_identity(entry.value().storage()) == identity);
        if !still_shared {
            if let Err(e) = bundle.storage().close().await {
                warn!(tenant = %tenant, error = %e, "failed to close tenant storage");
            }
        }
        info!(tenant = %tenant, "removed tenant bundle");
        true
    }

    /// Stable snapshot of the registered tenants, optionally filtered by
    /// app. Safe to iterate while the registry is concurrently mutated.
    #[must_use]
    pub fn list_tenants(&self, app: Option<&AppKey>) -> Vec<TenantKey> {
        self.bundles
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|tenant| app.is_none_or(|a| tenant.app_key() == *a))
            .collect()
    }

    /// Stable snapshot of the distinct apps with at least one tenant.
    #[must_use]
    pub fn list_apps(&self) -> Vec<AppKey> {
        let mut apps: Vec<AppKey> = Vec::new();
        for entry in self.bundles.iter() {
            let app = entry.key().app_key();
            if !apps.contains(&app) {
                apps.push(app);
            }
        }
        apps
    }

    /// Stable snapshot of `(tenant, storage)` pairs, one per distinct
    /// storage instance. Tenants sharing a backend appear once.
    #[must_use]
    pub fn distinct_storages(
        &self,
        app: Option<&AppKey>,
    ) -> Vec<(TenantKey, Arc<dyn SessionStore>)> {
        let mut seen: Vec<usize> = Vec::new();
        let mut result = Vec::new();
        for entry in self.bundles.iter() {
            if let Some(a) = app {
                if entry.key().app_key() != *a {
                    continue;
                }
            }
            let identity = storage_identity(entry.value().storage());
            if !seen.contains(&identity) {
                seen.push(identity);
                result.push((entry.key().clone(), entry.value().storage().clone()));
            }
        }
        result
    }

    /// Any storage handle serving the given app, if one is registered.
    #[must_use]
    pub fn storage_for_app(&self, app: &AppKey) -> Option<Arc<dyn SessionStore>> {
        self.bundles
            .iter()
            .find(|entry| entry.key().app_key() == *app)
            .map(|entry| entry.value().storage().clone())
    }

    /// Number of registered tenants.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bundles.len()
    }

    /// Returns `true` if no tenant is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bundles.is_empty()
    }
}
