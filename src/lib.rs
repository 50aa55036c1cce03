//! MCP Kubernetes server library
//!
//! An MCP server for Kubernetes that carries its own OAuth 2.1 authorization
//! server and reaches workload clusters discovered through Cluster API.
//!
//! # Features
//!
//! - **OAuth 2.1**: dynamic client registration, PKCE, Client ID Metadata
//!   Documents, rotating refresh tokens with replay detection, tokens
//!   encrypted at rest (memory or Valkey store)
//! - **SSO trust**: upstream ID tokens with a trusted audience are accepted
//!   as bearer tokens
//! - **Federation**: per-user clients for CAPI workload clusters via
//!   impersonation or SSO passthrough, cached with TTL + LRU and built
//!   single-flight
//! - **Hybrid credentials**: privileged service-account reads for kubeconfig
//!   secrets and discovery, rate-limited per user, fail-closed in strict mode

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod error;
pub mod failsafe;
pub mod federation;
pub mod metrics;
pub mod oauth;
pub mod security;
pub mod server;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging; `RUST_LOG` wins over `level`
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|e| Error::Config(format!("invalid log level '{level}': {e}")))?;

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| Error::Internal(e.to_string())),
        _ => subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| Error::Internal(e.to_string())),
    }
}
