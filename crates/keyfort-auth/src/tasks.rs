//! The maintenance tasks shipped with the core.
//!
//! Each task is a thin consumer of the storage port or the signing key
//! manager: iterate targets, call one method, tolerate partial failure.
//! Default cadences follow the shape of the original service; tests inject
//! overrides through the scheduler.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use keyfort_core::now_utc;

use crate::error::AuthResult;
use crate::keys::KeyManagerSet;
use crate::registry::TenantRegistry;
use crate::scheduler::{MaintenanceTask, TaskScope, TaskSpec, TaskTarget, TaskTiming};

/// Task name: expired-session sweep.
pub const EXPIRED_SESSION_SWEEP: &str = "expired-session-sweep";

/// Task name: expired short-lived code sweep.
pub const EXPIRED_CODE_SWEEP: &str = "expired-code-sweep";

/// Task name: signing-key rotation check.
pub const SIGNING_KEY_ROTATION: &str = "signing-key-rotation";

/// Task name: expired signing-key sweep.
pub const EXPIRED_KEY_SWEEP: &str = "expired-key-sweep";

/// Deletes expired sessions, once per distinct storage instance.
pub struct ExpiredSessionSweep;

impl ExpiredSessionSweep {
    /// The task's registration spec.
    #[must_use]
    pub fn spec() -> TaskSpec {
        TaskSpec {
            name: EXPIRED_SESSION_SWEEP,
            timing: TaskTiming {
                interval: Duration::from_secs(12 * 3600),
                initial_wait: Duration::from_secs(60),
            },
            scope: TaskScope::PerStorage,
        }
    }
}

#[async_trait]
impl MaintenanceTask for ExpiredSessionSweep {
    async fn run(&self, target: &TaskTarget) -> AuthResult<()> {
        if let TaskTarget::Storage { tenant, storage } = target {
            let deleted = storage.delete_expired_sessions(now_utc()).await?;
            if deleted > 0 {
                info!(tenant = %tenant, deleted, "swept expired sessions");
            }
        }
        Ok(())
    }
}

/// Deletes expired short-lived codes (password reset, passwordless, SAML
/// relay), once per distinct storage instance.
pub struct ExpiredCodeSweep;

impl ExpiredCodeSweep {
    /// The task's registration spec.
    #[must_use]
    pub fn spec() -> TaskSpec {
        TaskSpec {
            name: EXPIRED_CODE_SWEEP,
            timing: TaskTiming {
                interval: Duration::from_secs(3600),
                initial_wait: Duration::from_secs(60),
            },
            scope: TaskScope::PerStorage,
        }
    }
}

#[async_trait]
impl MaintenanceTask for ExpiredCodeSweep {
    async fn run(&self, target: &TaskTarget) -> AuthResult<()> {
        if let TaskTarget::Storage { tenant, storage } = target {
            let deleted = storage.delete_expired_codes(now_utc()).await?;
            if deleted > 0 {
                info!(tenant = %tenant, deleted, "swept expired codes");
            }
        }
        Ok(())
    }
}

/// Checks every app's current signing key and rotates it when its remaining
/// validity drops below the configured threshold.
pub struct SigningKeyRotation {
    registry: Arc<TenantRegistry>,
    keys: Arc<KeyManagerSet>,
}

impl SigningKeyRotation {
    /// Creates the task over the registry and key manager set.
    #[must_use]
    pub fn new(registry: Arc<TenantRegistry>, keys: Arc<KeyManagerSet>) -> Self {
        Self { registry, keys }
    }

    /// The task's registration spec.
    #[must_use]
    pub fn spec() -> TaskSpec {
        TaskSpec {
            name: SIGNING_KEY_ROTATION,
            timing: TaskTiming {
                interval: Duration::from_secs(3600),
                initial_wait: Duration::from_secs(30),
            },
            scope: TaskScope::PerApp,
        }
    }
}

#[async_trait]
impl MaintenanceTask for SigningKeyRotation {
    async fn run(&self, target: &TaskTarget) -> AuthResult<()> {
        if let TaskTarget::App(app) = target {
            if let Some(storage) = self.registry.storage_for_app(app) {
                let manager = self.keys.get_or_create(app, storage);
                manager.rotate_if_needed().await?;
            }
        }
        Ok(())
    }
}

/// Deletes retired signing keys once every token they could have signed has
/// expired.
pub struct ExpiredKeySweep {
    registry: Arc<TenantRegistry>,
    keys: Arc<KeyManagerSet>,
}

impl ExpiredKeySweep {
    /// Creates the task over the registry and key manager set.
    #[must_use]
    pub fn new(registry: Arc<TenantRegistry>, keys: Arc<KeyManagerSet>) -> Self {
        Self { registry, keys }
    }

    /// The task's registration spec.
    #[must_use]
    pub fn spec() -> TaskSpec {
        TaskSpec {
            name: EXPIRED_KEY_SWEEP,
            timing: TaskTiming {
                interval: Duration::from_secs(24 * 3600),
                initial_wait: Duration::from_secs(120),
            },
            scope: TaskScope::PerApp,
        }
    }
}

#[async_trait]
impl MaintenanceTask for ExpiredKeySweep {
    async fn run(&self, target: &TaskTarget) -> AuthResult<()> {
        if let TaskTarget::App(app) = target {
            if let Some(storage) = self.registry.storage_for_app(app) {
                let manager = self.keys.get_or_create(app, storage);
                manager.clean_expired_keys().await?;
            }
        }
        Ok(())
    }
}
