//! QWED gateway: a multi-tenant verification gateway that sits between
//! untrusted language-model output and the applications that consume it.
//!
//! Natural-language queries are admitted through a layered policy gate,
//! translated by an upstream provider into a structured artifact, verified
//! by one of eight deterministic engines, sanitized, and recorded in a
//! tamper-evident audit chain. See `DESIGN.md` for the module map.

pub mod attestation;
pub mod audit;
pub mod cache;
pub mod config;
pub mod consensus;
pub mod control;
pub mod dispatch;
pub mod errors;
pub mod metrics;
pub mod model;
pub mod policy;
pub mod providers;
pub mod rate_limit;
pub mod reflection;
pub mod sandbox;
pub mod server;
pub mod storage;

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::config::GatewayConfig;
use crate::control::ControlPlane;
use crate::dispatch::EngineDispatcher;
use crate::errors::GatewayResult;
use crate::providers::{HttpProvider, MockProvider, Provider, ProviderRouter};
use crate::storage::Store;

/// Wire the full control plane from configuration. Providers with
/// configured endpoints get HTTP adapters; with none at all, the
/// deterministic mock keeps the gateway usable offline.
pub fn build_control_plane(config: GatewayConfig) -> GatewayResult<Arc<ControlPlane>> {
    let store = Store::open(&config.database_url, &config.audit_secret)?;
    if let Some(path) = &config.tenants_file {
        store.load_seed_file(path)?;
    }

    let mut providers: Vec<Arc<dyn Provider>> = Vec::new();
    for name in ["primary", "secondary"] {
        if let Some(settings) = config.provider_settings(name) {
            info!(provider = name, endpoint = %settings.endpoint, "provider configured");
            providers.push(Arc::new(HttpProvider::new(
                settings,
                Duration::from_secs(20),
            ).map_err(|err| errors::GatewayError::Internal(err.to_string()))?));
        }
    }
    if providers.is_empty() {
        info!("no provider endpoints configured; using the offline mock translator");
        providers.push(Arc::new(MockProvider::new("mock")));
    }

    let router = Arc::new(ProviderRouter::new(
        providers,
        &config.active_provider,
        config.provider_cooldown,
    ));
    let sandbox: Arc<dyn sandbox::SandboxExec> =
        Arc::from(sandbox::build_sandbox(config.sandbox_timeout));
    let dispatcher = EngineDispatcher::new(router.clone(), sandbox, config.solver_timeout);

    Ok(Arc::new(ControlPlane::new(
        config, store, router, dispatcher,
    )?))
}
