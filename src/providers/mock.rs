//! Deterministic provider for tests and offline development.
//!
//! Unscripted, it gives best-effort translations of simple queries (enough
//! to run the gateway without credentials). Scripted, it returns queued
//! responses and can be told to fail N times first, which is how the
//! failover and reflection paths are exercised.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{
    FactJudgment, FactLabel, ImageJudgment, LogicTranslation, MathTranslation, Provider,
    ProviderError, StatsTranslation, VarDecl,
};

#[derive(Default)]
pub struct MockProvider {
    name: String,
    math: Mutex<VecDeque<MathTranslation>>,
    logic: Mutex<VecDeque<LogicTranslation>>,
    stats: Mutex<VecDeque<StatsTranslation>>,
    fact: Mutex<VecDeque<FactJudgment>>,
    fail_first: AtomicU32,
    fail_with_status: AtomicU32,
}

impl MockProvider {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn push_math(&self, translation: MathTranslation) -> &Self {
        self.math.lock().push_back(translation);
        self
    }

    pub fn push_logic(&self, dsl_code: &str, variables: Vec<VarDecl>) -> &Self {
        self.logic.lock().push_back(LogicTranslation {
            dsl_code: dsl_code.to_string(),
            variables,
        });
        self
    }

    pub fn push_stats(&self, code: &str) -> &Self {
        self.stats.lock().push_back(StatsTranslation {
            code: code.to_string(),
        });
        self
    }

    pub fn push_fact(&self, judgment: FactJudgment) -> &Self {
        self.fact.lock().push_back(judgment);
        self
    }

    /// Fail the next `n` calls with a connection error (or the given
    /// upstream status), then behave normally.
    pub fn fail_next(&self, n: u32, status: Option<u16>) -> &Self {
        self.fail_first.store(n, Ordering::SeqCst);
        self.fail_with_status
            .store(status.map(u32::from).unwrap_or(0), Ordering::SeqCst);
        self
    }

    fn maybe_fail(&self) -> Result<(), ProviderError> {
        let remaining = self.fail_first.load(Ordering::SeqCst);
        if remaining == 0 {
            return Ok(());
        }
        self.fail_first.store(remaining - 1, Ordering::SeqCst);
        let status = self.fail_with_status.load(Ordering::SeqCst);
        if status == 0 {
            Err(ProviderError::Connection("mock connection refused".into()))
        } else {
            Err(ProviderError::Upstream {
                status: status as u16,
                body: "mock upstream failure".into(),
            })
        }
    }
}

/// `What is 15% of 200?` → `200 * (15 / 100)`; `what is 2 + 2` → `2 + 2`.
fn derive_math(query: &str) -> MathTranslation {
    let lower = query.to_lowercase();
    if let Some(translation) = percent_of(&lower) {
        return translation;
    }
    // Strip a leading question prefix and trailing punctuation, keep the
    // arithmetic tail if it survives the safe grammar.
    let tail = lower
        .trim_start_matches("what is")
        .trim_start_matches("calculate")
        .trim_start_matches("compute")
        .trim()
        .trim_end_matches(&['?', '.', '!'][..])
        .to_string();
    let claimed = qwed_engines::math::evaluate(&tail).unwrap_or(0.0);
    MathTranslation {
        expression: tail,
        claimed,
        reasoning: Some("mock translation".into()),
    }
}

fn percent_of(lower: &str) -> Option<MathTranslation> {
    let percent_pos = lower.find('%')?;
    let number: String = lower[..percent_pos]
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect::<String>()
        .chars()
        .rev()
        .collect();
    let of_pos = lower.find(" of ")?;
    let base: String = lower[of_pos + 4..]
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    if number.is_empty() || base.is_empty() {
        return None;
    }
    let expression = format!("{base} * ({number} / 100)");
    let claimed = qwed_engines::math::evaluate(&expression).ok()?;
    Some(MathTranslation {
        expression,
        claimed,
        reasoning: Some("percentage of a base value".into()),
    })
}

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn translate_math(
        &self,
        query: &str,
        _feedback: Option<&str>,
    ) -> Result<MathTranslation, ProviderError> {
        self.maybe_fail()?;
        if let Some(scripted) = self.math.lock().pop_front() {
            return Ok(scripted);
        }
        Ok(derive_math(query))
    }

    async fn translate_logic_dsl(
        &self,
        query: &str,
        _feedback: Option<&str>,
    ) -> Result<LogicTranslation, ProviderError> {
        self.maybe_fail()?;
        if let Some(scripted) = self.logic.lock().pop_front() {
            return Ok(scripted);
        }
        // Queries that already are S-expressions pass straight through.
        let trimmed = query.trim();
        if trimmed.starts_with('(') {
            return Ok(LogicTranslation {
                dsl_code: trimmed.to_string(),
                variables: Vec::new(),
            });
        }
        Err(ProviderError::InvalidOutput(
            "mock provider has no scripted logic translation".into(),
        ))
    }

    async fn generate_stats_code(
        &self,
        _query: &str,
        columns: &[String],
        _feedback: Option<&str>,
    ) -> Result<StatsTranslation, ProviderError> {
        self.maybe_fail()?;
        if let Some(scripted) = self.stats.lock().pop_front() {
            return Ok(scripted);
        }
        let column = columns.first().cloned().unwrap_or_else(|| "value".into());
        Ok(StatsTranslation {
            code: format!("df.mean({column})"),
        })
    }

    async fn verify_fact(
        &self,
        claim: &str,
        context: &str,
    ) -> Result<FactJudgment, ProviderError> {
        self.maybe_fail()?;
        if let Some(scripted) = self.fact.lock().pop_front() {
            return Ok(scripted);
        }
        // Crude lexical overlap stands in for a real NLI helper.
        let claim_lower = claim.to_lowercase();
        let context_lower = context.to_lowercase();
        let words: Vec<&str> = claim_lower
            .split_whitespace()
            .filter(|w| w.len() > 3)
            .collect();
        let hits = words
            .iter()
            .filter(|w| context_lower.contains(**w))
            .count();
        let label = if words.is_empty() || hits * 2 < words.len() {
            FactLabel::NotEnoughInfo
        } else {
            FactLabel::Supported
        };
        Ok(FactJudgment {
            label,
            citations: Vec::new(),
            confidence: 0.6,
        })
    }

    async fn verify_image(
        &self,
        _image_b64: &str,
        claim: &str,
    ) -> Result<ImageJudgment, ProviderError> {
        self.maybe_fail()?;
        Ok(ImageJudgment {
            supported: false,
            explanation: format!("mock provider cannot inspect images (claim: {claim})"),
            confidence: 0.1,
        })
    }
}
