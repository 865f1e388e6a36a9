//! # keyfort-auth
//!
//! Multi-tenant session and signing-key core for the Keyfort session
//! service.
//!
//! This crate provides:
//! - Per-tenant resource registry with explicit lifecycle
//! - Signing-key generation, rotation, and retirement with overlapping
//!   validity windows
//! - Session create/refresh/revoke/validate with lineage-counter token
//!   theft detection
//! - A recurring maintenance scheduler (expiry sweeps, rotation checks)
//!
//! ## Overview
//!
//! A transport layer embeds [`AuthCore`], feeds it the tenant topology via
//! [`AuthCore::apply_tenant_config`], and calls the session operations per
//! request. Storage is pluggable behind the
//! [`SessionStore`](keyfort_storage::SessionStore) port.
//!
//! ## Modules
//!
//! - [`config`] - Session and signing-key configuration
//! - [`core`] - The [`AuthCore`] facade
//! - [`jwt`] - Token signing primitives and JWKS export
//! - [`keys`] - Per-app signing key management
//! - [`registry`] - Tenant resource registry
//! - [`scheduler`] - Recurring maintenance task runner
//! - [`session`] - Session lifecycle state machine
//! - [`tasks`] - The shipped maintenance tasks

pub mod config;
pub mod core;
pub mod error;
pub mod jwt;
pub mod keys;
pub mod registry;
pub mod scheduler;
pub mod session;
pub mod tasks;

pub use config::{AuthConfig, ConfigError, SigningConfig, TokenTransport};
pub use core::{AuthCore, TenantConfigEntry};
pub use error::{AuthError, AuthResult, ErrorKind};
pub use jwt::{Jwk, Jwks};
pub use keys::{KeyManagerSet, KeyPolicy, SessionKey, SigningKeyManager};
pub use registry::{ResourceBundle, TenantRegistry};
pub use scheduler::{
    MaintenanceTask, Scheduler, TaskFailure, TaskScope, TaskSpec, TaskTarget, TaskTiming,
    TickReport,
};
pub use session::{
    SessionClaims, SessionInfo, SessionInformationHolder, SessionManager, TokenInfo,
};
