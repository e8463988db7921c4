//! Self-reflection loop.
//!
//! Translators are probabilistic; engines are not. When an engine rejects a
//! translated artifact with a recoverable diagnostic, the diagnostic goes
//! back to the translator verbatim and the pair runs again, at most three
//! retries with exponential back-off, each one charged against the
//! request's rate budget and logged.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tracing::{info, warn};

use crate::dispatch::{EngineFailure, EngineOutcome};
use crate::errors::GatewayError;
use crate::metrics;
use crate::providers::ProviderError;

pub const MAX_RETRIES: u32 = 3;
const BACKOFF: [Duration; 3] = [
    Duration::from_millis(500),
    Duration::from_millis(1000),
    Duration::from_millis(2000),
];

pub type BoxFut<T> = Pin<Box<dyn Future<Output = T> + Send>>;

#[derive(Debug)]
pub enum ReflectionOutcome {
    Done {
        outcome: EngineOutcome,
        provider: String,
        attempts: u32,
    },
    Failed {
        diagnostic: String,
        attempts: u32,
    },
    Fatal(GatewayError),
}

/// Drive translate → verify with bounded reflection.
///
/// `translate` receives the previous diagnostic (None on the first pass)
/// and returns the translated artifact plus the provider that produced it.
/// `budget` is consulted before each retry; when it says no, the loop stops
/// with the last diagnostic.
pub async fn reflect_verify<T: Send + 'static>(
    mut translate: impl FnMut(Option<String>) -> BoxFut<Result<(T, String), ProviderError>>,
    mut verify: impl FnMut(T) -> BoxFut<Result<EngineOutcome, EngineFailure>>,
    mut budget: impl FnMut() -> bool,
) -> ReflectionOutcome {
    let mut feedback: Option<String> = None;

    for attempt in 0..=MAX_RETRIES {
        let (artifact, provider) = match translate(feedback.clone()).await {
            Ok(pair) => pair,
            Err(err) => {
                warn!(attempt, %err, "translation failed");
                return ReflectionOutcome::Failed {
                    diagnostic: err.to_string(),
                    attempts: attempt + 1,
                };
            }
        };

        match verify(artifact).await {
            Ok(outcome) => {
                if attempt > 0 {
                    info!(attempt, provider = %provider, "reflection recovered the translation");
                }
                return ReflectionOutcome::Done {
                    outcome,
                    provider,
                    attempts: attempt + 1,
                };
            }
            Err(EngineFailure::Fatal(err)) => return ReflectionOutcome::Fatal(err),
            Err(EngineFailure::Recoverable { diagnostic }) => {
                warn!(attempt, diagnostic = %diagnostic, "engine rejected translation");
                if attempt == MAX_RETRIES {
                    return ReflectionOutcome::Failed {
                        diagnostic,
                        attempts: attempt + 1,
                    };
                }
                if !budget() {
                    return ReflectionOutcome::Failed {
                        diagnostic: format!("rate budget exhausted during reflection: {diagnostic}"),
                        attempts: attempt + 1,
                    };
                }
                metrics::REFLECTION_ATTEMPTS.inc();
                tokio::time::sleep(BACKOFF[attempt as usize]).await;
                feedback = Some(diagnostic);
            }
        }
    }

    unreachable!("loop returns on every branch of the final attempt")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use crate::model::Verdict;

    fn ok_outcome() -> EngineOutcome {
        EngineOutcome {
            verdict: Verdict::Sat,
            detail: json!({}),
            confidence: 1.0,
        }
    }

    #[tokio::test]
    async fn succeeds_first_try_without_backoff() {
        let result = reflect_verify(
            |_| Box::pin(async { Ok(("artifact".to_string(), "mock".to_string())) }),
            |_artifact| Box::pin(async { Ok(ok_outcome()) }),
            || true,
        )
        .await;
        let ReflectionOutcome::Done { attempts, .. } = result else {
            panic!("expected done");
        };
        assert_eq!(attempts, 1);
    }

    #[tokio::test]
    async fn recovers_after_two_diagnostics() {
        let verify_calls = Arc::new(AtomicU32::new(0));
        let calls = verify_calls.clone();
        let translations = Arc::new(AtomicU32::new(0));
        let seen_feedback = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let feedback_log = seen_feedback.clone();

        let result = reflect_verify(
            move |feedback| {
                translations.fetch_add(1, Ordering::SeqCst);
                feedback_log.lock().push(feedback);
                Box::pin(async { Ok(((), "mock".to_string())) })
            },
            move |_| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                Box::pin(async move {
                    if n < 2 {
                        Err(EngineFailure::Recoverable {
                            diagnostic: format!("parse error #{n}"),
                        })
                    } else {
                        Ok(ok_outcome())
                    }
                })
            },
            || true,
        )
        .await;

        let ReflectionOutcome::Done { attempts, .. } = result else {
            panic!("expected recovery");
        };
        assert_eq!(attempts, 3);
        let feedback = seen_feedback.lock();
        assert_eq!(feedback[0], None);
        assert_eq!(feedback[1].as_deref(), Some("parse error #0"));
        assert_eq!(feedback[2].as_deref(), Some("parse error #1"));
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let result = reflect_verify(
            |_| Box::pin(async { Ok(((), "mock".to_string())) }),
            |_| {
                Box::pin(async {
                    Err(EngineFailure::Recoverable {
                        diagnostic: "still broken".into(),
                    })
                })
            },
            || true,
        )
        .await;
        let ReflectionOutcome::Failed {
            diagnostic,
            attempts,
        } = result
        else {
            panic!("expected failure");
        };
        assert_eq!(attempts, MAX_RETRIES + 1);
        assert_eq!(diagnostic, "still broken");
    }

    #[tokio::test]
    async fn exhausted_budget_stops_retries() {
        let result = reflect_verify(
            |_| Box::pin(async { Ok(((), "mock".to_string())) }),
            |_| {
                Box::pin(async {
                    Err(EngineFailure::Recoverable {
                        diagnostic: "broken".into(),
                    })
                })
            },
            || false,
        )
        .await;
        let ReflectionOutcome::Failed { attempts, diagnostic } = result else {
            panic!("expected failure");
        };
        assert_eq!(attempts, 1);
        assert!(diagnostic.contains("rate budget exhausted"));
    }

    #[tokio::test]
    async fn translation_error_fails_without_retry() {
        let result = reflect_verify(
            |_| {
                Box::pin(async {
                    Err::<((), String), _>(ProviderError::Upstream {
                        status: 502,
                        body: "bad gateway".into(),
                    })
                })
            },
            |_| Box::pin(async { Ok(ok_outcome()) }),
            || true,
        )
        .await;
        assert!(matches!(result, ReflectionOutcome::Failed { .. }));
    }
}
