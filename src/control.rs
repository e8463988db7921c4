//! The control plane: admission → cache → translation → dispatch →
//! reflection → sanitizer → audit → response.
//!
//! Each request walks the state machine sequentially; the only fan-out is
//! the consensus mode. Every terminal state appends exactly one audit
//! entry, and no exit path skips the output sanitizer.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::attestation::{AttestationClaim, Attestor};
use crate::audit::{AuditDraft, AuditLog};
use crate::cache::VerificationCache;
use crate::config::GatewayConfig;
use crate::consensus::{run_consensus, ConsensusReport};
use crate::dispatch::{EngineDispatcher, EngineFailure, EngineOutcome};
use crate::errors::{GatewayError, GatewayResult};
use crate::metrics;
use crate::model::{
    ConsensusMode, RequestPayload, SecurityEvent, SecurityEventKind, Verdict,
    VerificationRequest, VerificationResult,
};
use crate::policy::{pii, PolicyGate};
use crate::providers::{LogicTranslation, MathTranslation, ProviderRouter, StatsTranslation};
use crate::rate_limit::{RateDecision, RateLimiter};
use crate::reflection::{reflect_verify, BoxFut, ReflectionOutcome};
use crate::storage::Store;

/// Longest query prefix recorded in audit rows.
const AUDIT_QUERY_CAP: usize = 500;

pub struct ControlPlane {
    config: GatewayConfig,
    store: Store,
    audit: AuditLog,
    gate: PolicyGate,
    limiter: RateLimiter,
    cache: VerificationCache,
    router: Arc<ProviderRouter>,
    dispatcher: EngineDispatcher,
    attestor: Attestor,
    secrets: Vec<String>,
}

/// What one engine pass produced, before audit and attestation.
struct Execution {
    outcome: EngineOutcome,
    provider: Option<String>,
    translation: Option<Value>,
    engine: &'static str,
}

impl ControlPlane {
    pub fn new(
        config: GatewayConfig,
        store: Store,
        router: Arc<ProviderRouter>,
        dispatcher: EngineDispatcher,
    ) -> GatewayResult<Self> {
        let audit = AuditLog::new(store.clone(), &config.audit_secret);
        let gate = PolicyGate::new(config.max_input_length, config.semantic_threshold);
        let limiter = RateLimiter::new(crate::rate_limit::RateLimitConfig {
            per_key: config.rate_limit_per_key,
            global: config.rate_limit_global,
        });
        let cache = VerificationCache::new(config.cache_max_entries, config.cache_ttl);
        let attestor = Attestor::from_seed(config.attestation_seed.as_deref())
            .map_err(|err| GatewayError::Internal(err.to_string()))?;
        let mut secrets = vec![config.audit_secret.clone()];
        secrets.extend(
            router
                .provider_names()
                .iter()
                .filter_map(|name| config.provider_settings(name))
                .map(|settings| settings.api_key)
                .filter(|key| !key.is_empty()),
        );
        Ok(Self {
            config,
            store,
            audit,
            gate,
            limiter,
            cache,
            router,
            dispatcher,
            attestor,
            secrets,
        })
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn audit_log(&self) -> &AuditLog {
        &self.audit
    }

    pub fn attestor(&self) -> &Attestor {
        &self.attestor
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Full pipeline for one authenticated request.
    pub async fn verify(
        &self,
        request: VerificationRequest,
        source_ip: &str,
    ) -> GatewayResult<VerificationResult> {
        let started = Instant::now();
        metrics::INFLIGHT.inc();
        let result = self.verify_inner(&request, source_ip, started).await;
        metrics::INFLIGHT.dec();
        metrics::REQUEST_LATENCY.observe(started.elapsed().as_secs_f64());
        let verdict_label = match &result {
            Ok(result) => result.verdict.as_str(),
            Err(err) => err.verdict().as_str(),
        };
        metrics::REQUESTS_TOTAL
            .with_label_values(&[request.kind.as_str(), verdict_label])
            .inc();
        result
    }

    async fn verify_inner(
        &self,
        request: &VerificationRequest,
        source_ip: &str,
        started: Instant,
    ) -> GatewayResult<VerificationResult> {
        let tenant = &request.tenant;

        // RBAC / permission set.
        if !tenant.allows(request.kind) {
            return Err(GatewayError::Forbidden(format!(
                "tenant is not permitted to call {}",
                request.kind
            )));
        }

        // Rate budget, per-minute then per-day.
        if let RateDecision::Limited { retry_after_secs } =
            self.limiter.check(&tenant.key_fingerprint)
        {
            metrics::RATE_LIMITED_TOTAL.inc();
            self.append_audit(request, Verdict::Error, "rate_limited", 0);
            return Err(GatewayError::RateLimited { retry_after_secs });
        }
        if !self.store.consume_daily_quota(&tenant.org_id)? {
            self.append_audit(request, Verdict::Error, "daily_quota_exhausted", 0);
            return Err(GatewayError::Forbidden("daily quota exhausted".into()));
        }

        // Admission gate. A block is terminal and writes a security event.
        if let Err(block) = self.gate.check(request.payload.admission_text()) {
            metrics::BLOCKED_TOTAL.with_label_values(&[block.layer]).inc();
            self.store.record_security_event(&SecurityEvent::new(
                Some(tenant.org_id.clone()),
                SecurityEventKind::Blocked,
                block.layer,
                &block.reason,
                source_ip,
            ));
            self.append_audit(request, Verdict::Blocked, &block.reason, 0);
            info!(org = %tenant.org_id, layer = block.layer, "request blocked at admission");
            return Err(GatewayError::Admission {
                layer: block.layer.to_string(),
                reason: block.reason,
            });
        }

        // Cache replay for deterministic kinds.
        if request.kind.deterministic() {
            if let Some(cached) = self.cache.get(&tenant.org_id, &request.fingerprint) {
                let mut result = (*cached).clone();
                let entry = self.append_audit(
                    request,
                    result.verdict,
                    "cache_replay",
                    started.elapsed().as_millis() as i64,
                );
                result.latency_ms = started.elapsed().as_millis() as u64;
                if let Some(entry_hash) = entry {
                    let (token, claim) = self.attest(request, result.verdict, &entry_hash);
                    result.attestation = Some(token);
                    result.attestation_claim = Some(claim);
                }
                return Ok(result);
            }
        }

        // Translate + dispatch under the request deadline.
        let executed = tokio::time::timeout(
            self.config.request_timeout,
            self.execute(request, source_ip),
        )
        .await;

        let execution = match executed {
            Ok(Ok(execution)) => execution,
            Ok(Err(err)) => {
                self.append_audit(
                    request,
                    err.verdict(),
                    &err.public_message(),
                    started.elapsed().as_millis() as i64,
                );
                return Err(err);
            }
            Err(_) => {
                warn!(org = %tenant.org_id, kind = %request.kind, "request deadline exceeded");
                self.append_audit(
                    request,
                    Verdict::Error,
                    "TIMEOUT",
                    started.elapsed().as_millis() as i64,
                );
                return Err(GatewayError::Deadline);
            }
        };

        // Sanitize everything that leaves the engine layer.
        let mut detail = execution.outcome.detail.clone();
        self.sanitize(&mut detail);
        let mut translation = execution.translation.clone();
        if let Some(translation) = translation.as_mut() {
            self.sanitize(translation);
        }

        let latency_ms = started.elapsed().as_millis() as u64;
        let verdict = execution.outcome.verdict;
        let entry_hash = self.append_audit(
            request,
            verdict,
            &detail.to_string(),
            latency_ms as i64,
        );

        let mut result = VerificationResult {
            verdict,
            final_answer: final_answer_of(execution.engine, &detail),
            detail,
            translation,
            provider_used: execution.provider.clone(),
            latency_ms,
            confidence: execution.outcome.confidence,
            correction: execution.outcome.detail.get("correction").cloned(),
            attestation: None,
            attestation_claim: None,
        };
        if let Some(entry_hash) = entry_hash {
            let (token, claim) = self.attest(request, verdict, &entry_hash);
            result.attestation = Some(token);
            result.attestation_claim = Some(claim);
        }

        self.cache
            .put(&tenant.org_id, &request.fingerprint, request.kind, &result);
        Ok(result)
    }

    async fn execute(
        &self,
        request: &VerificationRequest,
        source_ip: &str,
    ) -> GatewayResult<Execution> {
        match &request.payload {
            RequestPayload::NaturalLanguage { query } => {
                self.run_math(request, query).await
            }
            RequestPayload::Logic { query } => {
                let trimmed = query.trim();
                if trimmed.starts_with('(') {
                    // Already a DSL program; no translator involved.
                    return self.run_direct_logic(trimmed);
                }
                self.run_translated_logic(request, query).await
            }
            RequestPayload::Stats { query, csv } => {
                self.run_stats(request, query, csv, source_ip).await
            }
            RequestPayload::Fact { claim, context } => {
                let (outcome, provider) = self
                    .dispatcher
                    .verify_fact(claim, context, request.provider.as_deref())
                    .await
                    .map_err(engine_failure_to_error)?;
                Ok(Execution {
                    outcome,
                    provider: Some(provider),
                    translation: None,
                    engine: "fact",
                })
            }
            RequestPayload::Code { code, language } => {
                let outcome = self.dispatcher.verify_code(code, language);
                Ok(Execution {
                    outcome,
                    provider: None,
                    translation: None,
                    engine: "code",
                })
            }
            RequestPayload::Sql {
                query,
                schema,
                dialect,
            } => {
                let outcome = self.dispatcher.verify_sql(query, schema, dialect);
                Ok(Execution {
                    outcome,
                    provider: None,
                    translation: None,
                    engine: "sql",
                })
            }
            RequestPayload::Image { image_b64, claim } => {
                let (outcome, provider) = self
                    .dispatcher
                    .verify_image(image_b64, claim, request.provider.as_deref())
                    .await
                    .map_err(engine_failure_to_error)?;
                Ok(Execution {
                    outcome,
                    provider: Some(provider),
                    translation: None,
                    engine: "image",
                })
            }
            RequestPayload::Reasoning { steps } => {
                let outcome = self.dispatcher.verify_reasoning(steps);
                Ok(Execution {
                    outcome,
                    provider: None,
                    translation: None,
                    engine: "reasoning",
                })
            }
            RequestPayload::Consensus {
                query,
                mode,
                min_confidence,
            } => {
                self.run_consensus_request(request, query, *mode, *min_confidence)
                    .await
            }
        }
    }

    // ---- per-kind pipelines --------------------------------------------

    async fn run_math(
        &self,
        request: &VerificationRequest,
        query: &str,
    ) -> GatewayResult<Execution> {
        let router = self.router.clone();
        let preference = request.provider.clone();
        let query_owned = query.to_string();
        let translation_slot: Arc<Mutex<Option<Value>>> = Arc::new(Mutex::new(None));
        let slot = translation_slot.clone();
        let dispatcher = &self.dispatcher;

        let outcome = reflect_verify(
            move |feedback| {
                let router = router.clone();
                let query = query_owned.clone();
                let preference = preference.clone();
                let slot = slot.clone();
                Box::pin(async move {
                    let (translation, provider) = router
                        .call(preference.as_deref(), move |p| {
                            let query = query.clone();
                            let feedback = feedback.clone();
                            async move { p.translate_math(&query, feedback.as_deref()).await }
                        })
                        .await?;
                    *slot.lock() = Some(json!({
                        "expression": translation.expression.clone(),
                        "claimed": translation.claimed,
                        "reasoning": translation.reasoning.clone(),
                    }));
                    Ok((translation, provider))
                }) as BoxFut<_>
            },
            move |translation: MathTranslation| {
                let result = dispatcher.verify_math(&translation.expression, translation.claimed);
                Box::pin(async move { result }) as BoxFut<_>
            },
            || self.consume_reflection_budget(request),
        )
        .await;

        self.finish_reflected(outcome, translation_slot, "math")
    }

    fn run_direct_logic(&self, dsl: &str) -> GatewayResult<Execution> {
        match self.dispatcher.verify_logic(dsl, &[]) {
            Ok(outcome) => Ok(Execution {
                outcome,
                provider: None,
                translation: None,
                engine: "logic",
            }),
            Err(EngineFailure::Recoverable { diagnostic }) => {
                // User-authored DSL cannot be reflected; classify directly.
                let verdict = if diagnostic.starts_with("UNSAFE_DSL") {
                    Verdict::Unsafe
                } else {
                    Verdict::Failed
                };
                Ok(Execution {
                    outcome: EngineOutcome {
                        verdict,
                        detail: json!({"error": diagnostic, "dsl_code": dsl}),
                        confidence: 1.0,
                    },
                    provider: None,
                    translation: None,
                    engine: "logic",
                })
            }
            Err(EngineFailure::Fatal(err)) => Err(err),
        }
    }

    async fn run_translated_logic(
        &self,
        request: &VerificationRequest,
        query: &str,
    ) -> GatewayResult<Execution> {
        let router = self.router.clone();
        let preference = request.provider.clone();
        let query_owned = query.to_string();
        let translation_slot: Arc<Mutex<Option<Value>>> = Arc::new(Mutex::new(None));
        let slot = translation_slot.clone();
        let dispatcher = &self.dispatcher;

        let outcome = reflect_verify(
            move |feedback| {
                let router = router.clone();
                let query = query_owned.clone();
                let preference = preference.clone();
                let slot = slot.clone();
                Box::pin(async move {
                    let (translation, provider) = router
                        .call(preference.as_deref(), move |p| {
                            let query = query.clone();
                            let feedback = feedback.clone();
                            async move {
                                p.translate_logic_dsl(&query, feedback.as_deref()).await
                            }
                        })
                        .await?;
                    *slot.lock() = Some(json!({
                        "dsl_code": translation.dsl_code.clone(),
                        "variables": translation.variables.clone(),
                    }));
                    Ok((translation, provider))
                }) as BoxFut<_>
            },
            move |translation: LogicTranslation| {
                let result =
                    dispatcher.verify_logic(&translation.dsl_code, &translation.variables);
                Box::pin(async move { result }) as BoxFut<_>
            },
            || self.consume_reflection_budget(request),
        )
        .await;

        self.finish_reflected(outcome, translation_slot, "logic")
    }

    async fn run_stats(
        &self,
        request: &VerificationRequest,
        query: &str,
        csv: &str,
        source_ip: &str,
    ) -> GatewayResult<Execution> {
        let frame = qwed_engines::stats::Frame::from_csv(csv)
            .map_err(|err| GatewayError::Validation(format!("bad CSV upload: {err}")))?;
        let columns = frame.columns.clone();

        if self.dispatcher.sandbox_is_fallback() {
            self.store.record_security_event(&SecurityEvent::new(
                Some(request.tenant.org_id.clone()),
                SecurityEventKind::SandboxFallback,
                "sandbox",
                "stats executed on restricted fallback evaluator",
                source_ip,
            ));
        }

        let router = self.router.clone();
        let preference = request.provider.clone();
        let query_owned = query.to_string();
        let translation_slot: Arc<Mutex<Option<Value>>> = Arc::new(Mutex::new(None));
        let slot = translation_slot.clone();
        let dispatcher = &self.dispatcher;
        let csv_owned = csv.to_string();

        let outcome = reflect_verify(
            move |feedback| {
                let router = router.clone();
                let query = query_owned.clone();
                let preference = preference.clone();
                let columns = columns.clone();
                let slot = slot.clone();
                Box::pin(async move {
                    let (translation, provider) = router
                        .call(preference.as_deref(), move |p| {
                            let query = query.clone();
                            let columns = columns.clone();
                            let feedback = feedback.clone();
                            async move {
                                p.generate_stats_code(&query, &columns, feedback.as_deref())
                                    .await
                            }
                        })
                        .await?;
                    *slot.lock() = Some(json!({"code": translation.code.clone()}));
                    Ok((translation, provider))
                }) as BoxFut<_>
            },
            move |translation: StatsTranslation| {
                let csv = csv_owned.clone();
                let code = translation.code;
                let future = dispatcher.verify_stats_owned(code, csv);
                Box::pin(future) as BoxFut<_>
            },
            || self.consume_reflection_budget(request),
        )
        .await;

        self.finish_reflected(outcome, translation_slot, "stats")
    }

    async fn run_consensus_request(
        &self,
        request: &VerificationRequest,
        query: &str,
        mode: ConsensusMode,
        min_confidence: Option<f64>,
    ) -> GatewayResult<Execution> {
        let engines = self.consensus_engines(request, query, mode);
        let report = run_consensus(mode, engines, self.config.request_timeout / 2).await;

        let ConsensusReport {
            verdict,
            confidence,
            agreement,
            detail,
        } = report;

        let below_floor = min_confidence.map(|floor| confidence < floor).unwrap_or(false);
        let verdict = if below_floor && verdict != Verdict::Disputed {
            Verdict::Disputed
        } else {
            verdict
        };

        Ok(Execution {
            outcome: EngineOutcome {
                verdict,
                detail: json!({
                    "agreement": agreement,
                    "consensus": detail,
                    "mode": mode,
                }),
                confidence,
            },
            provider: None,
            translation: None,
            engine: "consensus",
        })
    }

    /// Independent engine passes for consensus mode. Each future owns its
    /// own translator call so votes are genuinely independent.
    fn consensus_engines(
        &self,
        request: &VerificationRequest,
        query: &str,
        mode: ConsensusMode,
    ) -> Vec<(String, BoxFut<Result<EngineOutcome, String>>)> {
        let count = match mode {
            ConsensusMode::Single => 1,
            ConsensusMode::High => 2,
            ConsensusMode::Maximum => 3,
        };
        let mut engines: Vec<(String, BoxFut<Result<EngineOutcome, String>>)> = Vec::new();

        for index in 0..count.min(2) {
            let name = if index == 0 { "math" } else { "math_recheck" };
            let router = self.router.clone();
            let preference = request.provider.clone();
            let query = query.to_string();
            engines.push((
                name.to_string(),
                Box::pin(async move {
                    let (translation, _provider) = router
                        .call(preference.as_deref(), move |p| {
                            let query = query.clone();
                            async move { p.translate_math(&query, None).await }
                        })
                        .await
                        .map_err(|err| err.to_string())?;
                    match qwed_engines::math::verify_math(
                        &translation.expression,
                        translation.claimed,
                    ) {
                        Ok(check) => Ok(EngineOutcome {
                            verdict: if check.is_correct {
                                Verdict::Verified
                            } else {
                                Verdict::Corrected
                            },
                            detail: json!({
                                "calculated_value": check.calculated_value,
                                "claimed_value": check.claimed_value,
                                "diff": check.diff,
                            }),
                            confidence: 1.0,
                        }),
                        Err(err) => Err(err.to_string()),
                    }
                }),
            ));
        }

        if count >= 3 {
            let router = self.router.clone();
            let preference = request.provider.clone();
            let query = query.to_string();
            let solver_timeout = self.config.solver_timeout;
            engines.push((
                "logic".to_string(),
                Box::pin(async move {
                    let (translation, _provider) = router
                        .call(preference.as_deref(), move |p| {
                            let query = query.clone();
                            async move { p.translate_logic_dsl(&query, None).await }
                        })
                        .await
                        .map_err(|err| err.to_string())?;
                    let declared = std::collections::BTreeMap::new();
                    let program =
                        qwed_dsl::parse_and_compile(&translation.dsl_code, &declared)
                            .map_err(|err| err.to_string())?;
                    use qwed_dsl::Solve as _;
                    let result =
                        qwed_dsl::BoundedSolver::new().solve(&program, solver_timeout);
                    Ok(match result {
                        qwed_dsl::Satisfiability::Sat { model } => EngineOutcome {
                            verdict: Verdict::Sat,
                            detail: json!({"model": model}),
                            confidence: 1.0,
                        },
                        qwed_dsl::Satisfiability::Unsat => EngineOutcome {
                            verdict: Verdict::Unsat,
                            detail: json!({}),
                            confidence: 1.0,
                        },
                        qwed_dsl::Satisfiability::Unknown => EngineOutcome {
                            verdict: Verdict::Unknown,
                            detail: json!({}),
                            confidence: 0.5,
                        },
                    })
                }),
            ));
        }

        engines
    }

    // ---- shared plumbing ------------------------------------------------

    fn finish_reflected(
        &self,
        outcome: ReflectionOutcome,
        translation_slot: Arc<Mutex<Option<Value>>>,
        engine: &'static str,
    ) -> GatewayResult<Execution> {
        let translation = translation_slot.lock().clone();
        match outcome {
            ReflectionOutcome::Done {
                outcome,
                provider,
                attempts,
            } => {
                let EngineOutcome {
                    verdict,
                    detail,
                    confidence,
                } = outcome;
                Ok(Execution {
                    outcome: EngineOutcome {
                        verdict,
                        detail: with_attempts(detail, attempts),
                        confidence,
                    },
                    provider: Some(provider),
                    translation,
                    engine,
                })
            }
            ReflectionOutcome::Failed {
                diagnostic,
                attempts,
            } => Ok(Execution {
                outcome: EngineOutcome {
                    verdict: Verdict::Failed,
                    detail: json!({
                        "error": diagnostic,
                        "attempts": attempts,
                    }),
                    confidence: 0.0,
                },
                provider: None,
                translation,
                engine,
            }),
            ReflectionOutcome::Fatal(err) => Err(err),
        }
    }

    /// Reflection retries draw from the same per-minute budget as fresh
    /// requests, so a pathological translator cannot amplify upstream cost.
    fn consume_reflection_budget(&self, request: &VerificationRequest) -> bool {
        matches!(
            self.limiter.check(&request.tenant.key_fingerprint),
            RateDecision::Allowed
        )
    }

    fn append_audit(
        &self,
        request: &VerificationRequest,
        verdict: Verdict,
        detail: &str,
        latency_ms: i64,
    ) -> Option<String> {
        let query: String = request
            .payload
            .admission_text()
            .chars()
            .take(AUDIT_QUERY_CAP)
            .collect();
        match self.audit.append(AuditDraft {
            org_id: request.tenant.org_id.clone(),
            kind: request.kind.as_str().to_string(),
            fingerprint: request.fingerprint.clone(),
            verdict: verdict.as_str().to_string(),
            query,
            detail: detail.to_string(),
            latency_ms,
        }) {
            Ok(entry) => Some(entry.entry_hash),
            Err(err) => {
                // An unauditable gateway is unhealthy, but failing the
                // user's request will not make the disk come back.
                warn!(%err, "audit append failed");
                None
            }
        }
    }

    fn attest(
        &self,
        request: &VerificationRequest,
        verdict: Verdict,
        entry_hash: &str,
    ) -> (String, Value) {
        let claim = AttestationClaim {
            org_id: request.tenant.org_id.clone(),
            fingerprint: request.fingerprint.clone(),
            verdict: verdict.as_str().to_string(),
            engine: request.kind.as_str().to_string(),
            entry_hash: entry_hash.to_string(),
            issued_at: chrono::Utc::now(),
        };
        let token = self.attestor.sign(&claim);
        let claim_value = serde_json::to_value(&claim).unwrap_or(Value::Null);
        (token, claim_value)
    }

    /// Strip secrets and PII from any string that would leave the gateway.
    fn sanitize(&self, value: &mut Value) {
        match value {
            Value::String(text) => {
                let mut clean = pii::redact(text);
                for secret in &self.secrets {
                    if !secret.is_empty() && clean.contains(secret.as_str()) {
                        clean = clean.replace(secret.as_str(), "[REDACTED]");
                    }
                }
                *text = clean;
            }
            Value::Array(items) => {
                for item in items {
                    self.sanitize(item);
                }
            }
            Value::Object(map) => {
                for (_, item) in map.iter_mut() {
                    self.sanitize(item);
                }
            }
            _ => {}
        }
    }
}

fn with_attempts(mut detail: Value, attempts: u32) -> Value {
    if attempts > 1 {
        if let Value::Object(map) = &mut detail {
            map.insert("reflection_attempts".into(), json!(attempts));
        }
    }
    detail
}

fn engine_failure_to_error(failure: EngineFailure) -> GatewayError {
    match failure {
        EngineFailure::Recoverable { diagnostic } => GatewayError::Translation(diagnostic),
        EngineFailure::Fatal(err) => err,
    }
}

/// The headline answer surfaced in the response envelope.
fn final_answer_of(engine: &str, detail: &Value) -> Value {
    match engine {
        "math" => detail.get("calculated_value").cloned().unwrap_or(Value::Null),
        "logic" => detail
            .get("model")
            .cloned()
            .or_else(|| detail.get("status").cloned())
            .unwrap_or(Value::Null),
        "stats" => detail.get("result").cloned().unwrap_or(Value::Null),
        "fact" => detail.get("label").cloned().unwrap_or(Value::Null),
        "sql" => detail.get("violations").cloned().unwrap_or(Value::Null),
        "code" => detail.get("issue_count").cloned().unwrap_or(Value::Null),
        "image" => detail.get("supported").cloned().unwrap_or(Value::Null),
        "consensus" => detail
            .get("consensus")
            .and_then(|c| c.get("answer"))
            .cloned()
            .unwrap_or(Value::Null),
        _ => Value::Null,
    }
}
