//! Environment-driven configuration.

use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub listen_addr: String,
    pub database_url: String,
    pub tenants_file: Option<String>,
    pub active_provider: String,
    pub max_input_length: usize,
    pub rate_limit_per_key: u32,
    pub rate_limit_global: u32,
    pub cache_ttl: Duration,
    pub cache_max_entries: usize,
    pub request_timeout: Duration,
    pub solver_timeout: Duration,
    pub sandbox_timeout: Duration,
    pub sandbox_memory_limit: u64,
    pub sandbox_cpu_limit: f64,
    pub provider_cooldown: Duration,
    pub max_inflight: usize,
    pub audit_secret: String,
    pub attestation_seed: Option<String>,
    pub semantic_threshold: Option<f64>,
}

impl GatewayConfig {
    pub fn from_env() -> Self {
        Self {
            listen_addr: env_string("QWED_LISTEN_ADDR", "127.0.0.1:8000"),
            database_url: env_string("QWED_DATABASE_URL", "qwed.db"),
            tenants_file: env::var("TENANTS_FILE").ok().filter(|v| !v.is_empty()),
            active_provider: env_string("ACTIVE_PROVIDER", "auto"),
            max_input_length: env_parse("MAX_INPUT_LENGTH", 2000),
            rate_limit_per_key: env_parse("RATE_LIMIT_PER_KEY", 100),
            rate_limit_global: env_parse("RATE_LIMIT_GLOBAL", 1000),
            cache_ttl: Duration::from_secs(env_parse("CACHE_TTL_SECONDS", 3600)),
            cache_max_entries: env_parse("CACHE_MAX_ENTRIES", 1024),
            request_timeout: Duration::from_secs(env_parse("REQUEST_TIMEOUT_SECS", 30)),
            solver_timeout: Duration::from_millis(env_parse("SOLVER_TIMEOUT_MS", 5000)),
            sandbox_timeout: Duration::from_secs(env_parse("SANDBOX_TIMEOUT", 10)),
            sandbox_memory_limit: env_parse("SANDBOX_MEMORY_LIMIT", 512 * 1024 * 1024),
            sandbox_cpu_limit: env_parse("SANDBOX_CPU_LIMIT", 0.5),
            provider_cooldown: Duration::from_secs(env_parse("PROVIDER_COOLDOWN_SECS", 30)),
            max_inflight: env_parse("MAX_INFLIGHT", 256),
            audit_secret: env_string("AUDIT_SECRET_KEY", "qwed-dev-audit-secret"),
            attestation_seed: env::var("ATTESTATION_KEY").ok().filter(|v| !v.is_empty()),
            semantic_threshold: env::var("SEMANTIC_BLOCK_THRESHOLD")
                .ok()
                .and_then(|v| v.parse().ok()),
        }
    }

    /// Endpoint/key/model triple for a named provider, if configured.
    pub fn provider_settings(&self, name: &str) -> Option<ProviderSettings> {
        let prefix = name.to_uppercase();
        let endpoint = env::var(format!("{prefix}_ENDPOINT")).ok()?;
        Some(ProviderSettings {
            name: name.to_string(),
            endpoint,
            api_key: env::var(format!("{prefix}_KEY")).unwrap_or_default(),
            model: env::var(format!("{prefix}_MODEL")).unwrap_or_else(|_| "default".into()),
        })
    }
}

#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub name: String,
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
}

fn env_string(name: &str, default: &str) -> String {
    env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_parse<T: std::str::FromStr + Copy>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<T>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let config = GatewayConfig::from_env();
        assert_eq!(config.max_input_length, 2000);
        assert_eq!(config.rate_limit_per_key, 100);
        assert_eq!(config.rate_limit_global, 1000);
        assert_eq!(config.cache_ttl, Duration::from_secs(3600));
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.sandbox_timeout, Duration::from_secs(10));
    }
}
