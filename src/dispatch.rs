//! Engine dispatcher: one adapter per task kind.
//!
//! Deterministic engines come from `qwed-engines` and `qwed-dsl`; fact and
//! image checks delegate to the provider layer (the external helper is the
//! authority there, not the translator). Adapters return either a finished
//! engine outcome or a recoverable diagnostic that the self-reflection loop
//! can feed back to the translator.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::debug;

use qwed_dsl::{BoundedSolver, Satisfiability, Solve, Ty};
use qwed_engines::{code, math, sql};

use crate::errors::GatewayError;
use crate::model::{ReasoningStep, Verdict};
use crate::providers::{ProviderRouter, VarDecl};
use crate::sandbox::{SandboxExec, SandboxOutcome};

/// Claims longer than this are rejected before any multimodal call.
const MAX_IMAGE_CLAIM_BYTES: usize = 1024;

#[derive(Debug, Clone)]
pub struct EngineOutcome {
    pub verdict: Verdict,
    pub detail: serde_json::Value,
    pub confidence: f64,
}

impl EngineOutcome {
    fn new(verdict: Verdict, detail: serde_json::Value) -> Self {
        Self {
            verdict,
            detail,
            confidence: 1.0,
        }
    }
}

/// Engine-side failure classification.
#[derive(Debug)]
pub enum EngineFailure {
    /// The translated artifact was malformed; retrying the translator with
    /// this diagnostic may fix it.
    Recoverable { diagnostic: String },
    Fatal(GatewayError),
}

pub struct EngineDispatcher {
    router: Arc<ProviderRouter>,
    sandbox: Arc<dyn SandboxExec>,
    solver_timeout: Duration,
}

impl EngineDispatcher {
    pub fn new(
        router: Arc<ProviderRouter>,
        sandbox: Arc<dyn SandboxExec>,
        solver_timeout: Duration,
    ) -> Self {
        Self {
            router,
            sandbox,
            solver_timeout,
        }
    }

    pub fn sandbox_is_fallback(&self) -> bool {
        self.sandbox.is_fallback()
    }

    // ---- math -----------------------------------------------------------

    pub fn verify_math(
        &self,
        expression: &str,
        claimed: f64,
    ) -> Result<EngineOutcome, EngineFailure> {
        let check = math::verify_math(expression, claimed).map_err(|err| {
            EngineFailure::Recoverable {
                diagnostic: format!("expression rejected: {err}"),
            }
        })?;
        let verdict = if check.is_correct {
            Verdict::Verified
        } else {
            Verdict::Corrected
        };
        let mut outcome = EngineOutcome::new(
            verdict,
            json!({
                "is_correct": check.is_correct,
                "calculated_value": check.calculated_value,
                "claimed_value": check.claimed_value,
                "diff": check.diff,
                "expression": expression,
            }),
        );
        if verdict == Verdict::Corrected {
            outcome.detail["correction"] = json!(check.calculated_value);
        }
        Ok(outcome)
    }

    // ---- logic ----------------------------------------------------------

    pub fn verify_logic(
        &self,
        dsl_code: &str,
        variables: &[VarDecl],
    ) -> Result<EngineOutcome, EngineFailure> {
        let declared: BTreeMap<String, Ty> = variables
            .iter()
            .filter_map(|v| {
                let ty = match v.var_type.as_str() {
                    "Int" => Ty::Int,
                    "Real" => Ty::Real,
                    "Bool" => Ty::Bool,
                    _ => return None,
                };
                Some((v.name.clone(), ty))
            })
            .collect();

        let program =
            qwed_dsl::parse_and_compile(dsl_code, &declared).map_err(|err| {
                EngineFailure::Recoverable {
                    diagnostic: format!("{}: {err}", err.wire_code()),
                }
            })?;

        let result = BoundedSolver::new().solve(&program, self.solver_timeout);
        debug!(dsl = dsl_code, ?result, "logic engine finished");
        let outcome = match result {
            Satisfiability::Sat { model } => EngineOutcome::new(
                Verdict::Sat,
                json!({"status": "SAT", "model": model, "dsl_code": dsl_code}),
            ),
            Satisfiability::Unsat => EngineOutcome::new(
                Verdict::Unsat,
                json!({"status": "UNSAT", "dsl_code": dsl_code}),
            ),
            Satisfiability::Unknown => EngineOutcome {
                verdict: Verdict::Unknown,
                detail: json!({
                    "status": "UNKNOWN",
                    "dsl_code": dsl_code,
                    "reason": "solver budget exhausted",
                }),
                confidence: 0.5,
            },
        };
        Ok(outcome)
    }

    // ---- stats ----------------------------------------------------------

    pub async fn verify_stats(
        &self,
        code: &str,
        csv: &str,
    ) -> Result<EngineOutcome, EngineFailure> {
        stats_outcome(self.sandbox.run(code, csv).await, code)
    }

    /// Owned variant whose future is `'static`, for the reflection loop.
    pub fn verify_stats_owned(
        &self,
        code: String,
        csv: String,
    ) -> impl std::future::Future<Output = Result<EngineOutcome, EngineFailure>> + Send + 'static
    {
        let sandbox = self.sandbox.clone();
        async move { stats_outcome(sandbox.run(&code, &csv).await, &code) }
    }

    // ---- fact -----------------------------------------------------------

    pub async fn verify_fact(
        &self,
        claim: &str,
        context: &str,
        preference: Option<&str>,
    ) -> Result<(EngineOutcome, String), EngineFailure> {
        let claim_owned = claim.to_string();
        let context_owned = context.to_string();
        let (judgment, provider) = self
            .router
            .call(preference, move |p| {
                let claim = claim_owned.clone();
                let context = context_owned.clone();
                async move { p.verify_fact(&claim, &context).await }
            })
            .await
            .map_err(|err| EngineFailure::Fatal(GatewayError::Translation(err.to_string())))?;

        // Citations must be literal spans of the supplied context.
        let citations: Vec<&String> = judgment
            .citations
            .iter()
            .filter(|span| context.contains(span.as_str()))
            .collect();

        let verdict = match judgment.label {
            crate::providers::FactLabel::Supported => Verdict::Supported,
            crate::providers::FactLabel::Refuted => Verdict::Refuted,
            crate::providers::FactLabel::NotEnoughInfo => Verdict::NotEnoughInfo,
        };
        let outcome = EngineOutcome {
            verdict,
            detail: json!({
                "label": verdict.as_str(),
                "citations": citations,
                "claim": claim,
            }),
            confidence: judgment.confidence.clamp(0.0, 1.0),
        };
        Ok((outcome, provider))
    }

    // ---- code -----------------------------------------------------------

    pub fn verify_code(&self, source: &str, language: &str) -> EngineOutcome {
        let sources: Vec<String> = code::DEFAULT_TAINT_SOURCES
            .iter()
            .map(|s| s.to_string())
            .collect();
        let report = code::analyze(source, language, &sources);
        let verdict = if report.has_critical() || report.has_high() {
            Verdict::Unsafe
        } else {
            Verdict::Verified
        };
        let issues: Vec<serde_json::Value> = report
            .issues
            .iter()
            .map(|issue| {
                json!({
                    "severity": issue.severity,
                    "rule": issue.rule,
                    "line": issue.line,
                    "message": issue.message,
                })
            })
            .collect();
        EngineOutcome::new(
            verdict,
            json!({
                "issues": issues,
                "issue_count": report.issues.len(),
                "language": language,
            }),
        )
    }

    // ---- sql ------------------------------------------------------------

    pub fn verify_sql(&self, query: &str, schema_decl: &str, dialect: &str) -> EngineOutcome {
        let schema = sql::Schema::parse(schema_decl);
        let report = sql::verify_sql(query, &schema, sql::DEFAULT_ALLOWED);
        let verdict = if report.safe {
            Verdict::Verified
        } else {
            Verdict::Unsafe
        };
        let violations: Vec<String> =
            report.violations.iter().map(|v| v.to_string()).collect();
        EngineOutcome::new(
            verdict,
            json!({
                "violations": violations,
                "statements": report.statements,
                "dialect": dialect,
            }),
        )
    }

    // ---- image ----------------------------------------------------------

    pub async fn verify_image(
        &self,
        image_b64: &str,
        claim: &str,
        preference: Option<&str>,
    ) -> Result<(EngineOutcome, String), EngineFailure> {
        if claim.len() > MAX_IMAGE_CLAIM_BYTES {
            return Err(EngineFailure::Fatal(GatewayError::Validation(format!(
                "image claim exceeds {MAX_IMAGE_CLAIM_BYTES} bytes"
            ))));
        }
        let image = image_b64.to_string();
        let claim_owned = claim.to_string();
        let (judgment, provider) = self
            .router
            .call(preference, move |p| {
                let image = image.clone();
                let claim = claim_owned.clone();
                async move { p.verify_image(&image, &claim).await }
            })
            .await
            .map_err(|err| EngineFailure::Fatal(GatewayError::Translation(err.to_string())))?;

        let verdict = if judgment.supported {
            Verdict::Supported
        } else {
            Verdict::Refuted
        };
        let outcome = EngineOutcome {
            verdict,
            detail: json!({
                "supported": judgment.supported,
                "explanation": judgment.explanation,
            }),
            confidence: judgment.confidence.clamp(0.0, 1.0),
        };
        Ok((outcome, provider))
    }

    // ---- reasoning ------------------------------------------------------

    /// Verify each step with the engine its payload calls for; the first
    /// failing step short-circuits with its index and diagnostic.
    pub fn verify_reasoning(&self, steps: &[ReasoningStep]) -> EngineOutcome {
        let mut chain = Vec::new();
        for (index, step) in steps.iter().enumerate() {
            let step_outcome = self.verify_step(step);
            let (verdict, detail) = match &step_outcome {
                Ok(outcome) => (outcome.verdict, outcome.detail.clone()),
                Err(diagnostic) => (Verdict::Failed, json!({"diagnostic": diagnostic})),
            };
            let failed = matches!(
                verdict,
                Verdict::Corrected | Verdict::Unsat | Verdict::Unsafe | Verdict::Failed | Verdict::Error
            );
            chain.push(json!({
                "index": index,
                "description": step.description,
                "verdict": verdict.as_str(),
                "detail": detail,
            }));
            if failed {
                return EngineOutcome::new(
                    Verdict::Refuted,
                    json!({
                        "failed_at": index,
                        "diagnostic": chain.last().cloned(),
                        "steps": chain,
                    }),
                );
            }
        }
        EngineOutcome::new(
            Verdict::Verified,
            json!({"steps": chain, "step_count": steps.len()}),
        )
    }

    fn verify_step(&self, step: &ReasoningStep) -> Result<EngineOutcome, String> {
        if let (Some(expression), Some(claimed)) = (&step.expression, step.claimed) {
            return self.verify_math(expression, claimed).map_err(|err| match err {
                EngineFailure::Recoverable { diagnostic } => diagnostic,
                EngineFailure::Fatal(e) => e.to_string(),
            });
        }
        if let Some(dsl) = &step.dsl {
            return self.verify_logic(dsl, &[]).map_err(|err| match err {
                EngineFailure::Recoverable { diagnostic } => diagnostic,
                EngineFailure::Fatal(e) => e.to_string(),
            });
        }
        // A narration-only step has nothing to check.
        Ok(EngineOutcome::new(
            Verdict::Unknown,
            json!({"note": "no verifiable payload"}),
        ))
    }
}

fn stats_outcome(outcome: SandboxOutcome, code: &str) -> Result<EngineOutcome, EngineFailure> {
    match outcome {
        SandboxOutcome::Ok(value) => Ok(EngineOutcome::new(
            Verdict::Verified,
            json!({"result": value, "code": code}),
        )),
        SandboxOutcome::Grammar(diagnostic) => Err(EngineFailure::Recoverable {
            diagnostic: format!("statistics grammar violation: {diagnostic}"),
        }),
        SandboxOutcome::Unsafe(reason) => Ok(EngineOutcome {
            verdict: Verdict::Unsafe,
            detail: json!({"reason": reason, "code": code}),
            confidence: 1.0,
        }),
        SandboxOutcome::Error(reason) => Ok(EngineOutcome {
            verdict: Verdict::Error,
            detail: json!({"reason": reason, "code": code}),
            confidence: 0.0,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{MockProvider, ProviderRouter, AUTO_PROVIDER};
    use crate::sandbox::RestrictedSandbox;

    fn dispatcher() -> EngineDispatcher {
        let router = Arc::new(ProviderRouter::new(
            vec![Arc::new(MockProvider::new("mock"))],
            AUTO_PROVIDER,
            Duration::from_secs(30),
        ));
        EngineDispatcher::new(
            router,
            Arc::new(RestrictedSandbox::new(Duration::from_secs(5))),
            Duration::from_secs(5),
        )
    }

    #[test]
    fn math_correction_flow() {
        let d = dispatcher();
        let outcome = d.verify_math("1000 * (1 + 0.05) ** 2", 1100.0).unwrap();
        assert_eq!(outcome.verdict, Verdict::Corrected);
        assert!((outcome.detail["calculated_value"].as_f64().unwrap() - 1102.5).abs() < 1e-9);
        assert!((outcome.detail["diff"].as_f64().unwrap() - 2.5).abs() < 1e-9);
    }

    #[test]
    fn logic_sat_with_model() {
        let d = dispatcher();
        let outcome = d.verify_logic("(AND (GT x 5) (LT x 10))", &[]).unwrap();
        assert_eq!(outcome.verdict, Verdict::Sat);
        let x = outcome.detail["model"]["x"].as_i64().unwrap();
        assert!(x > 5 && x < 10);
    }

    #[test]
    fn hostile_dsl_is_recoverable_with_unsafe_label() {
        let d = dispatcher();
        let err = d.verify_logic("(IMPORT os)", &[]).unwrap_err();
        let EngineFailure::Recoverable { diagnostic } = err else {
            panic!("expected recoverable");
        };
        assert!(diagnostic.contains("UNSAFE_DSL"));
    }

    #[test]
    fn code_unsafe_on_os_system() {
        let d = dispatcher();
        let outcome = d.verify_code("import os; os.system('rm -rf /')", "python");
        assert_eq!(outcome.verdict, Verdict::Unsafe);
        let issues = outcome.detail["issues"].as_array().unwrap();
        assert!(issues
            .iter()
            .any(|i| i["message"].as_str().unwrap().contains("os.system")));
    }

    #[test]
    fn sql_stacked_statement_violations() {
        let d = dispatcher();
        let outcome = d.verify_sql(
            "SELECT * FROM users; DROP TABLE users;--",
            "users(id,name,email)",
            "sqlite",
        );
        assert_eq!(outcome.verdict, Verdict::Unsafe);
        let violations = outcome.detail["violations"].as_array().unwrap();
        let rendered: Vec<&str> = violations.iter().filter_map(|v| v.as_str()).collect();
        assert!(rendered.contains(&"MULTIPLE_STATEMENTS"));
        assert!(rendered.contains(&"DANGEROUS_STATEMENT(DROP)"));
    }

    #[tokio::test]
    async fn stats_through_sandbox() {
        let d = dispatcher();
        let outcome = d
            .verify_stats("df.mean(age)", "age\n10\n20\n30\n")
            .await
            .unwrap();
        assert_eq!(outcome.verdict, Verdict::Verified);
        assert_eq!(outcome.detail["result"].as_f64().unwrap(), 20.0);
    }

    #[tokio::test]
    async fn stats_grammar_violation_is_recoverable() {
        let d = dispatcher();
        let err = d.verify_stats("import os", "age\n1\n").await.unwrap_err();
        assert!(matches!(err, EngineFailure::Recoverable { .. }));
    }

    #[test]
    fn reasoning_short_circuits_on_first_bad_step() {
        let d = dispatcher();
        let steps = vec![
            ReasoningStep {
                description: "2 + 2 is 4".into(),
                expression: Some("2 + 2".into()),
                claimed: Some(4.0),
                dsl: None,
            },
            ReasoningStep {
                description: "so 4 * 3 is 13".into(),
                expression: Some("4 * 3".into()),
                claimed: Some(13.0),
                dsl: None,
            },
            ReasoningStep {
                description: "never reached".into(),
                expression: Some("1 + 1".into()),
                claimed: Some(2.0),
                dsl: None,
            },
        ];
        let outcome = d.verify_reasoning(&steps);
        assert_eq!(outcome.verdict, Verdict::Refuted);
        assert_eq!(outcome.detail["failed_at"].as_u64().unwrap(), 1);
        assert_eq!(outcome.detail["steps"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn fact_citations_must_be_literal_spans() {
        let d = dispatcher();
        let router = Arc::new(ProviderRouter::new(
            vec![{
                let p = MockProvider::new("mock");
                p.push_fact(crate::providers::FactJudgment {
                    label: crate::providers::FactLabel::Supported,
                    citations: vec!["the sky is blue".into(), "fabricated span".into()],
                    confidence: 0.9,
                });
                Arc::new(p)
            }],
            AUTO_PROVIDER,
            Duration::from_secs(30),
        ));
        let d = EngineDispatcher::new(router, d.sandbox.clone(), Duration::from_secs(5));
        let (outcome, _) = d
            .verify_fact("sky color", "we all know the sky is blue today", None)
            .await
            .unwrap();
        let citations = outcome.detail["citations"].as_array().unwrap();
        assert_eq!(citations.len(), 1);
    }
}
