//! Provider selection with health-aware failover.
//!
//! Selection order: explicit request preference → tenant default → system
//! default. `auto` walks every configured provider. A per-provider circuit
//! counts consecutive failover-class failures; at three it opens for a
//! cool-down and the provider is skipped until the window passes. Any
//! success closes it again.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::metrics;

use super::{Provider, ProviderError};

pub const AUTO_PROVIDER: &str = "auto";
const OPEN_AFTER_FAILURES: u32 = 3;

#[derive(Debug, Clone, Copy, Default)]
struct Circuit {
    consecutive_failures: u32,
    open_until: Option<Instant>,
}

impl Circuit {
    fn is_open(&self, now: Instant) -> bool {
        self.open_until.map(|until| now < until).unwrap_or(false)
    }
}

pub struct ProviderRouter {
    providers: Vec<Arc<dyn Provider>>,
    circuits: DashMap<String, Circuit>,
    default_provider: String,
    cooldown: Duration,
}

impl ProviderRouter {
    pub fn new(
        providers: Vec<Arc<dyn Provider>>,
        default_provider: &str,
        cooldown: Duration,
    ) -> Self {
        Self {
            providers,
            circuits: DashMap::new(),
            default_provider: default_provider.to_string(),
            cooldown,
        }
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.name().to_string()).collect()
    }

    /// Ordered candidates for this request.
    fn candidates(&self, preference: Option<&str>) -> Vec<Arc<dyn Provider>> {
        let choice = preference.unwrap_or(&self.default_provider);
        if choice == AUTO_PROVIDER {
            return self.providers.clone();
        }
        let mut ordered: Vec<Arc<dyn Provider>> = self
            .providers
            .iter()
            .filter(|p| p.name() == choice)
            .cloned()
            .collect();
        // The preferred provider goes first; the rest remain as fallbacks.
        ordered.extend(
            self.providers
                .iter()
                .filter(|p| p.name() != choice)
                .cloned(),
        );
        ordered
    }

    /// Run `call` against the first healthy candidate, failing over on
    /// connection errors and upstream 5xx. Returns the result together with
    /// the name of the provider that served it.
    pub async fn call<T, F, Fut>(
        &self,
        preference: Option<&str>,
        call: F,
    ) -> Result<(T, String), ProviderError>
    where
        F: Fn(Arc<dyn Provider>) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let now = Instant::now();
        let mut last_error = ProviderError::Exhausted;

        for provider in self.candidates(preference) {
            let name = provider.name().to_string();
            if self
                .circuits
                .get(&name)
                .map(|c| c.is_open(now))
                .unwrap_or(false)
            {
                debug!(provider = %name, "skipping provider with open circuit");
                continue;
            }

            match call(provider.clone()).await {
                Ok(value) => {
                    self.record_success(&name);
                    return Ok((value, name));
                }
                Err(err) if err.is_failover() => {
                    warn!(provider = %name, %err, "provider failed; trying next");
                    metrics::PROVIDER_FAILOVERS.with_label_values(&[&name]).inc();
                    self.record_failure(&name);
                    last_error = err;
                }
                Err(err) => {
                    // Non-failover errors (bad output, 4xx) are the
                    // caller's problem; another provider will not fix them.
                    self.record_success(&name);
                    return Err(err);
                }
            }
        }

        Err(last_error)
    }

    fn record_failure(&self, name: &str) {
        let mut circuit = self.circuits.entry(name.to_string()).or_default();
        circuit.consecutive_failures += 1;
        if circuit.consecutive_failures >= OPEN_AFTER_FAILURES {
            circuit.open_until = Some(Instant::now() + self.cooldown);
            warn!(provider = %name, cooldown_secs = self.cooldown.as_secs(), "circuit opened");
        }
    }

    fn record_success(&self, name: &str) {
        if let Some(mut circuit) = self.circuits.get_mut(name) {
            circuit.consecutive_failures = 0;
            circuit.open_until = None;
        }
    }

    #[cfg(test)]
    fn force_open(&self, name: &str) {
        self.circuits.insert(
            name.to_string(),
            Circuit {
                consecutive_failures: OPEN_AFTER_FAILURES,
                open_until: Some(Instant::now() + self.cooldown),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::MockProvider;

    fn router(primary: Arc<MockProvider>, secondary: Arc<MockProvider>) -> ProviderRouter {
        ProviderRouter::new(
            vec![primary, secondary],
            AUTO_PROVIDER,
            Duration::from_secs(30),
        )
    }

    #[tokio::test]
    async fn fails_over_to_secondary_on_5xx() {
        let primary = Arc::new(MockProvider::new("primary"));
        let secondary = Arc::new(MockProvider::new("secondary"));
        primary.fail_next(1, Some(502));

        let router = router(primary, secondary);
        let (translation, served_by) = router
            .call(None, |p| async move { p.translate_math("2 + 2", None).await })
            .await
            .unwrap();
        assert_eq!(served_by, "secondary");
        assert_eq!(translation.claimed, 4.0);
    }

    #[tokio::test]
    async fn invalid_output_does_not_fail_over() {
        let primary = Arc::new(MockProvider::new("primary"));
        let secondary = Arc::new(MockProvider::new("secondary"));
        let router = router(primary, secondary);

        let result = router
            .call(Some("primary"), |p| async move {
                p.translate_logic_dsl("not an s-expression", None).await
            })
            .await;
        assert!(matches!(result, Err(ProviderError::InvalidOutput(_))));
    }

    #[tokio::test]
    async fn open_circuit_skips_provider() {
        let primary = Arc::new(MockProvider::new("primary"));
        let secondary = Arc::new(MockProvider::new("secondary"));
        let router = router(primary, secondary);
        router.force_open("primary");

        let (_, served_by) = router
            .call(None, |p| async move { p.translate_math("1 + 1", None).await })
            .await
            .unwrap();
        assert_eq!(served_by, "secondary");
    }

    #[tokio::test]
    async fn three_failures_open_the_circuit() {
        let primary = Arc::new(MockProvider::new("primary"));
        let secondary = Arc::new(MockProvider::new("secondary"));
        primary.fail_next(3, None);
        let router = router(primary.clone(), secondary);

        for _ in 0..3 {
            let _ = router
                .call(None, |p| async move { p.translate_math("1", None).await })
                .await;
        }
        let circuit = router.circuits.get("primary").unwrap();
        assert!(circuit.is_open(Instant::now()));
    }

    #[tokio::test]
    async fn all_providers_down_is_exhausted_class_error() {
        let primary = Arc::new(MockProvider::new("primary"));
        let secondary = Arc::new(MockProvider::new("secondary"));
        primary.fail_next(1, None);
        secondary.fail_next(1, None);
        let router = router(primary, secondary);

        let result = router
            .call(None, |p| async move { p.translate_math("1", None).await })
            .await;
        assert!(matches!(
            result,
            Err(ProviderError::Connection(_)) | Err(ProviderError::Exhausted)
        ));
    }
}
