//! Tenant and app identity types.
//!
//! Every piece of state in Keyfort is scoped either to a tenant or to an
//! app. A tenant is identified by the triple (connection URI domain, app id,
//! tenant id); signing keys are scoped one level up, to the (connection URI
//! domain, app id) pair, because tokens must verify across all tenant
//! aliases of an app.
//!
//! Empty components normalize to the defaults, so `TenantKey::new("", "", "")`
//! and [`TenantKey::base`] compare equal. Equality is structural and the
//! types implement `Hash`, making them usable as map keys everywhere.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Default connection URI domain (single-domain deployments).
pub const DEFAULT_CONNECTION_URI_DOMAIN: &str = "";

/// Default app id.
pub const DEFAULT_APP_ID: &str = "public";

/// Default tenant id.
pub const DEFAULT_TENANT_ID: &str = "public";

fn normalize(value: &str, default: &str) -> String {
    if value.is_empty() {
        default.to_string()
    } else {
        value.to_string()
    }
}

/// Identity of an app: the scope of signing-key state.
///
/// All tenants under one app share signing keys, so a token issued for one
/// tenant alias verifies under any other alias of the same app.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AppKey {
    /// Connection URI domain, `""` for single-domain deployments.
    pub connection_uri_domain: String,

    /// App id, `"public"` for the default app.
    pub app_id: String,
}

impl AppKey {
    /// Creates an app key, normalizing empty components to the defaults.
    #[must_use]
    pub fn new(connection_uri_domain: impl AsRef<str>, app_id: impl AsRef<str>) -> Self {
        Self {
            connection_uri_domain: normalize(
                connection_uri_domain.as_ref(),
                DEFAULT_CONNECTION_URI_DOMAIN,
            ),
            app_id: normalize(app_id.as_ref(), DEFAULT_APP_ID),
        }
    }

    /// The default app in a single-domain deployment.
    #[must_use]
    pub fn base() -> Self {
        Self::new(DEFAULT_CONNECTION_URI_DOMAIN, DEFAULT_APP_ID)
    }

    /// The public (default) tenant of this app.
    #[must_use]
    pub fn public_tenant(&self) -> TenantKey {
        TenantKey {
            connection_uri_domain: self.connection_uri_domain.clone(),
            app_id: self.app_id.clone(),
            tenant_id: DEFAULT_TENANT_ID.to_string(),
        }
    }
}

impl fmt::Display for AppKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.connection_uri_domain, self.app_id)
    }
}

/// Identity of a tenant: the scope of session and resource-bundle state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TenantKey {
    /// Connection URI domain, `""` for single-domain deployments.
    pub connection_uri_domain: String,

    /// App id, `"public"` for the default app.
    pub app_id: String,

    /// Tenant id, `"public"` for the default tenant.
    pub tenant_id: String,
}

impl TenantKey {
    /// Creates a tenant key, normalizing empty components to the defaults.
    #[must_use]
    pub fn new(
        connection_uri_domain: impl AsRef<str>,
        app_id: impl AsRef<str>,
        tenant_id: impl AsRef<str>,
    ) -> Self {
        Self {
            connection_uri_domain: normalize(
                connection_uri_domain.as_ref(),
                DEFAULT_CONNECTION_URI_DOMAIN,
            ),
            app_id: normalize(app_id.as_ref(), DEFAULT_APP_ID),
            tenant_id: normalize(tenant_id.as_ref(), DEFAULT_TENANT_ID),
        }
    }

    /// The default tenant of the default app.
    #[must_use]
    pub fn base() -> Self {
        Self::new(
            DEFAULT_CONNECTION_URI_DOMAIN,
            DEFAULT_APP_ID,
            DEFAULT_TENANT_ID,
        )
    }

    /// The app this tenant belongs to.
    #[must_use]
    pub fn app_key(&self) -> AppKey {
        AppKey {
            connection_uri_domain: self.connection_uri_domain.clone(),
            app_id: self.app_id.clone(),
        }
    }

    /// Returns `true` if this is the default tenant of its app.
    #[must_use]
    pub fn is_public(&self) -> bool {
        self.tenant_id == DEFAULT_TENANT_ID
    }
}

impl fmt::Display for TenantKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.connection_uri_domain, self.app_id, self.tenant_id
        )
    }
}

impl From<&TenantKey> for AppKey {
    fn from(tenant: &TenantKey) -> Self {
        tenant.app_key()
    }
}
