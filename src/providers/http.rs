//! Generic chat-completion provider adapter.
//!
//! Speaks the common `messages` JSON shape over reqwest and digs the first
//! JSON object out of the completion text. Vendor-specific client SDKs are
//! deliberately out of scope; endpoint, key, and model come from
//! `<PROVIDER>_ENDPOINT` / `<PROVIDER>_KEY` / `<PROVIDER>_MODEL`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::ProviderSettings;

use super::{
    extract_json_object, FactJudgment, ImageJudgment, LogicTranslation, MathTranslation,
    Provider, ProviderError, StatsTranslation,
};

const MATH_SYSTEM: &str = "Translate the user's question into a JSON object \
{\"expression\": <arithmetic using only numbers, + - * / % ** and sqrt/sin/cos/log/exp/abs/floor/ceil>, \
\"claimed\": <your numeric answer>, \"reasoning\": <one sentence>}. Output only JSON.";

const LOGIC_SYSTEM: &str = "Translate the user's constraint into a JSON object \
{\"dsl_code\": <a single S-expression using AND OR NOT IMPLIES IFF PLUS MINUS MUL DIV MOD POW NEG \
EQ NEQ LT LE GT GE ITE FORALL EXISTS ASSERT PROGRAM>, \
\"variables\": [{\"name\": ..., \"type\": \"Int\"|\"Real\"|\"Bool\"}]}. Output only JSON.";

const STATS_SYSTEM: &str = "Write one line of analysis code over the frame variable `df` using only \
.count() .sum(col) .mean(col) .min(col) .max(col) .median(col) .std(col) .filter(col, op, value) \
.select(col). Reply as JSON {\"code\": <the line>}. Output only JSON.";

const FACT_SYSTEM: &str = "Judge whether the claim is supported by the context. Reply as JSON \
{\"label\": \"SUPPORTED\"|\"REFUTED\"|\"NOT_ENOUGH_INFO\", \
\"citations\": [<verbatim spans from the context>], \"confidence\": <0..1>}. Output only JSON.";

const IMAGE_SYSTEM: &str = "Judge whether the claim matches the attached image. Reply as JSON \
{\"supported\": true|false, \"explanation\": <short>, \"confidence\": <0..1>}. Output only JSON.";

pub struct HttpProvider {
    client: Client,
    settings: ProviderSettings,
}

impl HttpProvider {
    pub fn new(settings: ProviderSettings, timeout: Duration) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| ProviderError::Connection(format!("client build failed: {err}")))?;
        Ok(Self { client, settings })
    }

    async fn complete(&self, system: &str, user: String) -> Result<String, ProviderError> {
        let body = ChatRequest {
            model: self.settings.model.clone(),
            temperature: 0.0,
            messages: vec![
                ChatMessage {
                    role: "system".into(),
                    content: system.to_string(),
                },
                ChatMessage {
                    role: "user".into(),
                    content: user,
                },
            ],
        };

        let response = self
            .client
            .post(&self.settings.endpoint)
            .bearer_auth(&self.settings.api_key)
            .header("x-api-key", &self.settings.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|err| ProviderError::Connection(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<body unavailable>".into());
            return Err(ProviderError::Upstream {
                status: status.as_u16(),
                // Upstream bodies can carry our own prompt; cap what we keep.
                body: body.chars().take(256).collect(),
            });
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|err| ProviderError::InvalidOutput(format!("response not JSON: {err}")))?;
        parsed
            .text()
            .ok_or_else(|| ProviderError::InvalidOutput("completion missing content".into()))
    }

    async fn complete_json<T: serde::de::DeserializeOwned>(
        &self,
        system: &str,
        user: String,
    ) -> Result<T, ProviderError> {
        let text = self.complete(system, user).await?;
        let json = extract_json_object(&text)
            .ok_or_else(|| ProviderError::InvalidOutput("completion missing JSON object".into()))?;
        serde_json::from_str(&json)
            .map_err(|err| ProviderError::InvalidOutput(format!("bad translation JSON: {err}")))
    }
}

fn with_feedback(query: &str, feedback: Option<&str>) -> String {
    match feedback {
        Some(diagnostic) => format!(
            "{query}\n\nYour previous attempt failed verification with this \
diagnostic:\n{diagnostic}\nProduce a corrected translation."
        ),
        None => query.to_string(),
    }
}

#[async_trait]
impl Provider for HttpProvider {
    fn name(&self) -> &str {
        &self.settings.name
    }

    async fn translate_math(
        &self,
        query: &str,
        feedback: Option<&str>,
    ) -> Result<MathTranslation, ProviderError> {
        self.complete_json(MATH_SYSTEM, with_feedback(query, feedback))
            .await
    }

    async fn translate_logic_dsl(
        &self,
        query: &str,
        feedback: Option<&str>,
    ) -> Result<LogicTranslation, ProviderError> {
        self.complete_json(LOGIC_SYSTEM, with_feedback(query, feedback))
            .await
    }

    async fn generate_stats_code(
        &self,
        query: &str,
        columns: &[String],
        feedback: Option<&str>,
    ) -> Result<StatsTranslation, ProviderError> {
        let prompt = format!(
            "Frame columns: {}\nQuestion: {}",
            columns.join(", "),
            with_feedback(query, feedback)
        );
        self.complete_json(STATS_SYSTEM, prompt).await
    }

    async fn verify_fact(
        &self,
        claim: &str,
        context: &str,
    ) -> Result<FactJudgment, ProviderError> {
        let prompt = format!("Claim: {claim}\n\nContext:\n{context}");
        self.complete_json(FACT_SYSTEM, prompt).await
    }

    async fn verify_image(
        &self,
        image_b64: &str,
        claim: &str,
    ) -> Result<ImageJudgment, ProviderError> {
        let prompt = format!("Claim: {claim}\n\nImage (base64):\n{image_b64}");
        self.complete_json(IMAGE_SYSTEM, prompt).await
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    temperature: f32,
    messages: Vec<ChatMessage>,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

/// Accepts both the `choices[].message.content` and the `content[].text`
/// completion shapes.
#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    content: Vec<ContentPart>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct ContentPart {
    #[serde(default)]
    text: Option<String>,
}

impl ChatResponse {
    fn text(&self) -> Option<String> {
        if let Some(choice) = self.choices.first() {
            return Some(choice.message.content.clone());
        }
        let joined: Vec<String> = self
            .content
            .iter()
            .filter_map(|part| part.text.clone())
            .collect();
        if joined.is_empty() {
            None
        } else {
            Some(joined.join("\n"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_shapes_both_parse() {
        let openai_style: ChatResponse = serde_json::from_str(
            r#"{"choices": [{"message": {"content": "{\"code\": \"df.count()\"}"}}]}"#,
        )
        .unwrap();
        assert!(openai_style.text().unwrap().contains("df.count()"));

        let anthropic_style: ChatResponse = serde_json::from_str(
            r#"{"content": [{"type": "text", "text": "{\"dsl_code\": \"(GT x 5)\"}"}]}"#,
        )
        .unwrap();
        assert!(anthropic_style.text().unwrap().contains("GT x 5"));
    }

    #[test]
    fn feedback_is_appended() {
        let prompt = with_feedback("find x", Some("parse error at byte 3"));
        assert!(prompt.contains("find x"));
        assert!(prompt.contains("parse error at byte 3"));
    }
}
