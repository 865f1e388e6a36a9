//! # keyfort-core
//!
//! Core identity types and small utilities shared by every Keyfort crate.
//!
//! The central types are [`TenantKey`] and [`AppKey`] — the identity tuples
//! that scope all session and signing-key state. Everything else in the
//! workspace takes them by reference and treats them as opaque lookup keys.

pub mod id;
pub mod tenant;
pub mod time;

pub use id::{generate_handle, generate_opaque_token};
pub use tenant::{AppKey, DEFAULT_APP_ID, DEFAULT_CONNECTION_URI_DOMAIN, DEFAULT_TENANT_ID, TenantKey};
pub use time::now_utc;
