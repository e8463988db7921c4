//! Upstream model providers.
//!
//! A provider is an *untrusted translator*: it turns natural language into
//! a structured artifact (expression, DSL program, stats code, fact
//! judgment) that a deterministic engine then verifies. Nothing a provider
//! returns is trusted until the corresponding engine has had its say.

pub mod http;
pub mod mock;
pub mod router;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use http::HttpProvider;
pub use mock::MockProvider;
pub use router::{ProviderRouter, AUTO_PROVIDER};

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("connection to provider failed: {0}")]
    Connection(String),
    #[error("provider returned {status}: {body}")]
    Upstream { status: u16, body: String },
    #[error("provider output invalid: {0}")]
    InvalidOutput(String),
    #[error("no provider available")]
    Exhausted,
}

impl ProviderError {
    /// Failures that justify failing over to another provider.
    pub fn is_failover(&self) -> bool {
        match self {
            ProviderError::Connection(_) => true,
            ProviderError::Upstream { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MathTranslation {
    pub expression: String,
    pub claimed: f64,
    #[serde(default)]
    pub reasoning: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VarDecl {
    pub name: String,
    #[serde(rename = "type", default = "default_var_type")]
    pub var_type: String,
}

fn default_var_type() -> String {
    "Int".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogicTranslation {
    pub dsl_code: String,
    #[serde(default)]
    pub variables: Vec<VarDecl>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsTranslation {
    pub code: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FactLabel {
    Supported,
    Refuted,
    NotEnoughInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactJudgment {
    pub label: FactLabel,
    #[serde(default)]
    pub citations: Vec<String>,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageJudgment {
    pub supported: bool,
    #[serde(default)]
    pub explanation: String,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
}

fn default_confidence() -> f64 {
    0.8
}

/// The four translation capabilities plus the multimodal check. `feedback`
/// carries an engine diagnostic on reflection retries.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    async fn translate_math(
        &self,
        query: &str,
        feedback: Option<&str>,
    ) -> Result<MathTranslation, ProviderError>;

    async fn translate_logic_dsl(
        &self,
        query: &str,
        feedback: Option<&str>,
    ) -> Result<LogicTranslation, ProviderError>;

    async fn generate_stats_code(
        &self,
        query: &str,
        columns: &[String],
        feedback: Option<&str>,
    ) -> Result<StatsTranslation, ProviderError>;

    async fn verify_fact(&self, claim: &str, context: &str)
        -> Result<FactJudgment, ProviderError>;

    async fn verify_image(
        &self,
        image_b64: &str,
        claim: &str,
    ) -> Result<ImageJudgment, ProviderError>;
}

/// Pull the first balanced JSON object out of a completion.
pub fn extract_json_object(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in text[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(text[start..start + i + 1].to_string());
                }
            }
            _ => {}
        }
    }
    None
}
