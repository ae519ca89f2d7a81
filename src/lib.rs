//! CV Entitlements
//!
//! Usage quota, entitlement and Stripe payment reconciliation for the CV builder.
//! Anonymous visitors (by browser fingerprint) and FREEMIUM accounts share a small
//! free-action quota; PRO and LIFETIME accounts are unlimited; single actions can be
//! bought one-off.
//!
//! ## Standalone
//!
//! Run the binary:
//! ```bash
//! cv-entitlements-server
//! ```
//!
//! ## Embedded (Axum)
//!
//! When the `server` feature is enabled, this crate can be embedded into a larger Axum app:
//! ```rust,ignore
//! use axum::Router;
//! use cv_entitlements::infrastructure::AppConfig;
//! use cv_entitlements::server::{build_state_with_pool, router};
//! use sqlx::PgPool;
//!
//! let cfg = AppConfig::from_env()?;
//! let pool = PgPool::connect(&cfg.database_url).await?;
//! let state = build_state_with_pool(cfg, pool, true).await?;
//! let app = Router::new().nest("/entitlements", router(state));
//! ```

pub mod application;
pub mod domain;
pub mod infrastructure;

// Standalone + embedded HTTP server support (Axum).
// Enabled behind the `server` feature so the core library can be used without Axum.
#[cfg(feature = "server")]
pub mod server;

pub use application::*;
pub use domain::*;
pub use infrastructure::*;

#[cfg(feature = "server")]
pub use server::*;
