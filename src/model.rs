//! Core data model shared by every stage of the pipeline.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Verification verdicts, the union of every engine's vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Verified,
    Corrected,
    Refuted,
    Supported,
    NotEnoughInfo,
    Sat,
    Unsat,
    Unknown,
    Failed,
    Unsafe,
    Blocked,
    Disputed,
    Error,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Verified => "VERIFIED",
            Verdict::Corrected => "CORRECTED",
            Verdict::Refuted => "REFUTED",
            Verdict::Supported => "SUPPORTED",
            Verdict::NotEnoughInfo => "NOT_ENOUGH_INFO",
            Verdict::Sat => "SAT",
            Verdict::Unsat => "UNSAT",
            Verdict::Unknown => "UNKNOWN",
            Verdict::Failed => "FAILED",
            Verdict::Unsafe => "UNSAFE",
            Verdict::Blocked => "BLOCKED",
            Verdict::Disputed => "DISPUTED",
            Verdict::Error => "ERROR",
        }
    }

    pub fn parse(text: &str) -> Option<Verdict> {
        Some(match text {
            "VERIFIED" => Verdict::Verified,
            "CORRECTED" => Verdict::Corrected,
            "REFUTED" => Verdict::Refuted,
            "SUPPORTED" => Verdict::Supported,
            "NOT_ENOUGH_INFO" => Verdict::NotEnoughInfo,
            "SAT" => Verdict::Sat,
            "UNSAT" => Verdict::Unsat,
            "UNKNOWN" => Verdict::Unknown,
            "FAILED" => Verdict::Failed,
            "UNSAFE" => Verdict::Unsafe,
            "BLOCKED" => Verdict::Blocked,
            "DISPUTED" => Verdict::Disputed,
            "ERROR" => Verdict::Error,
            _ => return None,
        })
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    NaturalLanguage,
    Logic,
    Stats,
    Fact,
    Code,
    Sql,
    Image,
    Reasoning,
    Consensus,
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::NaturalLanguage => "natural_language",
            RequestKind::Logic => "logic",
            RequestKind::Stats => "stats",
            RequestKind::Fact => "fact",
            RequestKind::Code => "code",
            RequestKind::Sql => "sql",
            RequestKind::Image => "image",
            RequestKind::Reasoning => "reasoning",
            RequestKind::Consensus => "consensus",
        }
    }

    /// Deterministic kinds are cacheable; fact and image are not.
    pub fn deterministic(&self) -> bool {
        !matches!(self, RequestKind::Fact | RequestKind::Image)
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusMode {
    Single,
    High,
    Maximum,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Member,
    Agent,
}

/// Immutable per-request tenant identity, constructed at ingress and
/// attached to every downstream call and log row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantContext {
    pub org_id: String,
    pub org_name: String,
    pub tier: String,
    pub key_fingerprint: String,
    pub role: Role,
    pub permissions: BTreeSet<String>,
    pub daily_quota: i64,
    pub minute_quota: i64,
}

impl TenantContext {
    pub fn allows(&self, kind: RequestKind) -> bool {
        self.permissions.is_empty()
            || self.permissions.contains("*")
            || self.permissions.contains(kind.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RequestPayload {
    NaturalLanguage {
        query: String,
    },
    Logic {
        query: String,
    },
    Stats {
        query: String,
        csv: String,
    },
    Fact {
        claim: String,
        context: String,
    },
    Code {
        code: String,
        language: String,
    },
    Sql {
        query: String,
        schema: String,
        dialect: String,
    },
    Image {
        image_b64: String,
        claim: String,
    },
    Reasoning {
        steps: Vec<ReasoningStep>,
    },
    Consensus {
        query: String,
        mode: ConsensusMode,
        min_confidence: Option<f64>,
    },
}

impl RequestPayload {
    pub fn kind(&self) -> RequestKind {
        match self {
            RequestPayload::NaturalLanguage { .. } => RequestKind::NaturalLanguage,
            RequestPayload::Logic { .. } => RequestKind::Logic,
            RequestPayload::Stats { .. } => RequestKind::Stats,
            RequestPayload::Fact { .. } => RequestKind::Fact,
            RequestPayload::Code { .. } => RequestKind::Code,
            RequestPayload::Sql { .. } => RequestKind::Sql,
            RequestPayload::Image { .. } => RequestKind::Image,
            RequestPayload::Reasoning { .. } => RequestKind::Reasoning,
            RequestPayload::Consensus { .. } => RequestKind::Consensus,
        }
    }

    /// The human-language surface the admission gate inspects.
    pub fn admission_text(&self) -> &str {
        match self {
            RequestPayload::NaturalLanguage { query }
            | RequestPayload::Logic { query }
            | RequestPayload::Stats { query, .. }
            | RequestPayload::Sql { query, .. }
            | RequestPayload::Consensus { query, .. } => query,
            RequestPayload::Fact { claim, .. } => claim,
            RequestPayload::Code { code, .. } => code,
            RequestPayload::Image { claim, .. } => claim,
            RequestPayload::Reasoning { steps } => steps
                .first()
                .map(|s| s.description.as_str())
                .unwrap_or(""),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningStep {
    pub description: String,
    #[serde(default)]
    pub expression: Option<String>,
    #[serde(default)]
    pub claimed: Option<f64>,
    #[serde(default)]
    pub dsl: Option<String>,
}

#[derive(Debug, Clone)]
pub struct VerificationRequest {
    pub tenant: TenantContext,
    pub kind: RequestKind,
    pub payload: RequestPayload,
    pub provider: Option<String>,
    pub mode: Option<ConsensusMode>,
    pub fingerprint: String,
}

impl VerificationRequest {
    pub fn new(
        tenant: TenantContext,
        payload: RequestPayload,
        provider: Option<String>,
        mode: Option<ConsensusMode>,
    ) -> Self {
        let kind = payload.kind();
        let fingerprint = fingerprint(&tenant.org_id, kind, &payload);
        Self {
            tenant,
            kind,
            payload,
            provider,
            mode,
            fingerprint,
        }
    }
}

/// Stable idempotency fingerprint: sha256 over org, kind, and the
/// canonical (key-sorted) JSON form of the payload.
pub fn fingerprint(org_id: &str, kind: RequestKind, payload: &RequestPayload) -> String {
    let value = serde_json::to_value(payload).unwrap_or(serde_json::Value::Null);
    let mut hasher = Sha256::new();
    hasher.update(org_id.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(kind.as_str().as_bytes());
    hasher.update(b"\x1f");
    hasher.update(canonical_json(&value).as_bytes());
    hex::encode(hasher.finalize())
}

/// Deterministic JSON rendering: object keys sorted, no whitespace.
pub fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        serde_json::Value::String(k.clone()),
                        canonical_json(&map[k])
                    )
                })
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        serde_json::Value::Array(items) => {
            let rendered: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", rendered.join(","))
        }
        other => other.to_string(),
    }
}

/// Typed artifact returned by a translator, validated before dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum TranslationTask {
    Math {
        expression: String,
        claimed: f64,
        #[serde(default)]
        reasoning: Option<String>,
    },
    Logic {
        dsl: String,
    },
    Stats {
        code: String,
    },
    Fact {
        claim: String,
        context: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct VerificationResult {
    pub verdict: Verdict,
    pub final_answer: serde_json::Value,
    pub detail: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub translation: Option<serde_json::Value>,
    pub provider_used: Option<String>,
    pub latency_ms: u64,
    pub confidence: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correction: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attestation: Option<String>,
    /// The claim the attestation token signs, so callers can verify it
    /// against the published key set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attestation_claim: Option<serde_json::Value>,
}

impl VerificationResult {
    pub fn bare(verdict: Verdict, detail: serde_json::Value) -> Self {
        Self {
            verdict,
            final_answer: serde_json::Value::Null,
            detail,
            translation: None,
            provider_used: None,
            latency_ms: 0,
            confidence: 1.0,
            correction: None,
            attestation: None,
            attestation_claim: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: i64,
    pub org_id: String,
    pub kind: String,
    pub fingerprint: String,
    pub verdict: String,
    pub query: String,
    pub detail: String,
    pub latency_ms: i64,
    pub created_at: DateTime<Utc>,
    pub previous_hash: String,
    pub entry_hash: String,
    pub hmac: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SecurityEventKind {
    Blocked,
    Anomaly,
    RotationDue,
    SandboxFallback,
}

impl SecurityEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityEventKind::Blocked => "BLOCKED",
            SecurityEventKind::Anomaly => "ANOMALY",
            SecurityEventKind::RotationDue => "ROTATION_DUE",
            SecurityEventKind::SandboxFallback => "SANDBOX_FALLBACK",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub org_id: Option<String>,
    pub kind: SecurityEventKind,
    pub layer: String,
    pub reason: String,
    pub source_ip: String,
    pub created_at: DateTime<Utc>,
}

impl SecurityEvent {
    pub fn new(
        org_id: Option<String>,
        kind: SecurityEventKind,
        layer: &str,
        reason: &str,
        source_ip: &str,
    ) -> Self {
        Self {
            org_id,
            kind,
            layer: layer.to_string(),
            reason: reason.to_string(),
            source_ip: source_ip.to_string(),
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tenant(org: &str) -> TenantContext {
        TenantContext {
            org_id: org.into(),
            org_name: org.into(),
            tier: "free".into(),
            key_fingerprint: "fp".into(),
            role: Role::Member,
            permissions: BTreeSet::new(),
            daily_quota: 1000,
            minute_quota: 100,
        }
    }

    #[test]
    fn fingerprint_is_stable_and_tenant_scoped() {
        let payload = RequestPayload::NaturalLanguage {
            query: "What is 15% of 200?".into(),
        };
        let a = fingerprint("org-a", RequestKind::NaturalLanguage, &payload);
        let b = fingerprint("org-a", RequestKind::NaturalLanguage, &payload);
        let other = fingerprint("org-b", RequestKind::NaturalLanguage, &payload);
        assert_eq!(a, b);
        assert_ne!(a, other);
    }

    #[test]
    fn canonical_json_sorts_keys() {
        let value = serde_json::json!({"b": 1, "a": {"z": true, "y": [1, 2]}});
        assert_eq!(canonical_json(&value), r#"{"a":{"y":[1,2],"z":true},"b":1}"#);
    }

    #[test]
    fn empty_permissions_allow_everything() {
        let t = tenant("org");
        assert!(t.allows(RequestKind::Logic));
        let mut restricted = tenant("org");
        restricted.permissions.insert("logic".into());
        assert!(restricted.allows(RequestKind::Logic));
        assert!(!restricted.allows(RequestKind::Sql));
    }

    #[test]
    fn verdict_round_trips() {
        for verdict in [
            Verdict::Verified,
            Verdict::NotEnoughInfo,
            Verdict::Disputed,
            Verdict::Unsat,
        ] {
            assert_eq!(Verdict::parse(verdict.as_str()), Some(verdict));
        }
    }
}
