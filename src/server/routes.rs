//! Request handlers: auth header → tenant context, JSON in, envelope out.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Multipart, Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use crate::errors::GatewayError;
use crate::model::{
    ConsensusMode, ReasoningStep, RequestPayload, Role, SecurityEvent, SecurityEventKind,
    TenantContext, VerificationRequest, VerificationResult,
};

use super::state::AppState;

const API_KEY_HEADER: &str = "x-api-key";

// ---- auth ---------------------------------------------------------------

fn authenticate(
    state: &AppState,
    headers: &HeaderMap,
    source_ip: &str,
) -> Result<TenantContext, GatewayError> {
    let api_key = headers
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or(GatewayError::Auth)?;

    let record = state
        .control
        .store()
        .lookup_key(api_key)?
        .ok_or(GatewayError::Auth)?;

    if record.expired {
        return Err(GatewayError::KeyExpired);
    }
    if record.rotation_required {
        state.control.store().record_security_event(&SecurityEvent::new(
            Some(record.tenant.org_id.clone()),
            SecurityEventKind::RotationDue,
            "auth",
            "api key flagged for rotation",
            source_ip,
        ));
    }
    Ok(record.tenant)
}

// ---- envelope / error rendering ----------------------------------------

fn envelope(result: &VerificationResult) -> Value {
    json!({
        "status": result.verdict.as_str(),
        "final_answer": result.final_answer,
        "verification": result.detail,
        "translation": result.translation,
        "provider_used": result.provider_used,
        "latency_ms": result.latency_ms,
        "confidence": result.confidence,
        "attestation": result.attestation,
        "attestation_claim": result.attestation_claim,
    })
}

fn error_response(err: GatewayError) -> Response {
    let status =
        StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    match &err {
        GatewayError::Admission { layer, reason } => {
            let body = json!({
                "status": "BLOCKED",
                "reason": {"layer": layer, "detail": reason},
            });
            (status, Json(body)).into_response()
        }
        GatewayError::RateLimited { retry_after_secs } => {
            let body = json!({
                "status": "ERROR",
                "error": "rate limit exceeded",
                "retry_after": retry_after_secs,
            });
            let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
            if let Ok(value) = retry_after_secs.to_string().parse() {
                response.headers_mut().insert("retry-after", value);
            }
            response
        }
        GatewayError::Translation(diagnostic) => {
            // The request succeeded; the translation did not.
            let body = json!({"status": "FAILED", "error": diagnostic});
            (StatusCode::OK, Json(body)).into_response()
        }
        _ => {
            let body = json!({"status": "ERROR", "error": err.public_message()});
            (status, Json(body)).into_response()
        }
    }
}

async fn run_verification(
    state: &AppState,
    tenant: TenantContext,
    payload: RequestPayload,
    provider: Option<String>,
    source_ip: &str,
) -> Response {
    let Some(_slot) = state.acquire_slot() else {
        return error_response(GatewayError::Overloaded);
    };
    let request = VerificationRequest::new(tenant, payload, provider, None);
    match state.control.verify(request, source_ip).await {
        Ok(result) => (StatusCode::OK, Json(envelope(&result))).into_response(),
        Err(err) => error_response(err),
    }
}

// ---- verification endpoints --------------------------------------------

#[derive(Debug, Deserialize)]
pub(crate) struct QueryBody {
    query: String,
    #[serde(default)]
    provider: Option<String>,
}

pub(crate) async fn verify_natural_language(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<QueryBody>,
) -> Response {
    let ip = addr.ip().to_string();
    let tenant = match authenticate(&state, &headers, &ip) {
        Ok(tenant) => tenant,
        Err(err) => return error_response(err),
    };
    run_verification(
        &state,
        tenant,
        RequestPayload::NaturalLanguage { query: body.query },
        body.provider,
        &ip,
    )
    .await
}

pub(crate) async fn verify_logic(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<QueryBody>,
) -> Response {
    let ip = addr.ip().to_string();
    let tenant = match authenticate(&state, &headers, &ip) {
        Ok(tenant) => tenant,
        Err(err) => return error_response(err),
    };
    run_verification(
        &state,
        tenant,
        RequestPayload::Logic { query: body.query },
        body.provider,
        &ip,
    )
    .await
}

pub(crate) async fn verify_stats(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Response {
    let ip = addr.ip().to_string();
    let tenant = match authenticate(&state, &headers, &ip) {
        Ok(tenant) => tenant,
        Err(err) => return error_response(err),
    };

    let mut csv = None;
    let mut query = None;
    let mut provider = None;
    loop {
        match multipart.next_field().await {
            Ok(Some(field)) => {
                let name = field.name().unwrap_or("").to_string();
                match name.as_str() {
                    "file" => match field.bytes().await {
                        Ok(bytes) => match String::from_utf8(bytes.to_vec()) {
                            Ok(text) => csv = Some(text),
                            Err(_) => {
                                return error_response(GatewayError::Validation(
                                    "uploaded file is not UTF-8 CSV".into(),
                                ))
                            }
                        },
                        Err(err) => {
                            return error_response(GatewayError::Validation(format!(
                                "upload read failed: {err}"
                            )))
                        }
                    },
                    "query" => query = field.text().await.ok(),
                    "provider" => provider = field.text().await.ok(),
                    other => {
                        warn!(field = other, "ignoring unknown multipart field");
                    }
                }
            }
            Ok(None) => break,
            Err(err) => {
                return error_response(GatewayError::Validation(format!(
                    "bad multipart body: {err}"
                )))
            }
        }
    }

    let (Some(csv), Some(query)) = (csv, query) else {
        return error_response(GatewayError::Validation(
            "stats verification needs `file` and `query` fields".into(),
        ));
    };

    run_verification(
        &state,
        tenant,
        RequestPayload::Stats { query, csv },
        provider,
        &ip,
    )
    .await
}

#[derive(Debug, Deserialize)]
pub(crate) struct FactBody {
    claim: String,
    context: String,
    #[serde(default)]
    provider: Option<String>,
}

pub(crate) async fn verify_fact(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<FactBody>,
) -> Response {
    let ip = addr.ip().to_string();
    let tenant = match authenticate(&state, &headers, &ip) {
        Ok(tenant) => tenant,
        Err(err) => return error_response(err),
    };
    run_verification(
        &state,
        tenant,
        RequestPayload::Fact {
            claim: body.claim,
            context: body.context,
        },
        body.provider,
        &ip,
    )
    .await
}

#[derive(Debug, Deserialize)]
pub(crate) struct CodeBody {
    code: String,
    #[serde(default = "default_language")]
    language: String,
}

fn default_language() -> String {
    "python".into()
}

pub(crate) async fn verify_code(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<CodeBody>,
) -> Response {
    let ip = addr.ip().to_string();
    let tenant = match authenticate(&state, &headers, &ip) {
        Ok(tenant) => tenant,
        Err(err) => return error_response(err),
    };
    run_verification(
        &state,
        tenant,
        RequestPayload::Code {
            code: body.code,
            language: body.language,
        },
        None,
        &ip,
    )
    .await
}

#[derive(Debug, Deserialize)]
pub(crate) struct SqlBody {
    query: String,
    schema: String,
    #[serde(default = "default_dialect")]
    dialect: String,
}

fn default_dialect() -> String {
    "sqlite".into()
}

pub(crate) async fn verify_sql(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<SqlBody>,
) -> Response {
    let ip = addr.ip().to_string();
    let tenant = match authenticate(&state, &headers, &ip) {
        Ok(tenant) => tenant,
        Err(err) => return error_response(err),
    };
    run_verification(
        &state,
        tenant,
        RequestPayload::Sql {
            query: body.query,
            schema: body.schema,
            dialect: body.dialect,
        },
        None,
        &ip,
    )
    .await
}

#[derive(Debug, Deserialize)]
pub(crate) struct ImageBody {
    image_b64: String,
    claim: String,
    #[serde(default)]
    provider: Option<String>,
}

pub(crate) async fn verify_image(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<ImageBody>,
) -> Response {
    let ip = addr.ip().to_string();
    let tenant = match authenticate(&state, &headers, &ip) {
        Ok(tenant) => tenant,
        Err(err) => return error_response(err),
    };
    run_verification(
        &state,
        tenant,
        RequestPayload::Image {
            image_b64: body.image_b64,
            claim: body.claim,
        },
        body.provider,
        &ip,
    )
    .await
}

#[derive(Debug, Deserialize)]
pub(crate) struct ReasoningBody {
    steps: Vec<ReasoningStep>,
}

pub(crate) async fn verify_reasoning(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<ReasoningBody>,
) -> Response {
    let ip = addr.ip().to_string();
    let tenant = match authenticate(&state, &headers, &ip) {
        Ok(tenant) => tenant,
        Err(err) => return error_response(err),
    };
    run_verification(
        &state,
        tenant,
        RequestPayload::Reasoning { steps: body.steps },
        None,
        &ip,
    )
    .await
}

#[derive(Debug, Deserialize)]
pub(crate) struct ConsensusBody {
    query: String,
    #[serde(default = "default_mode")]
    mode: ConsensusMode,
    #[serde(default)]
    min_confidence: Option<f64>,
    #[serde(default)]
    provider: Option<String>,
}

fn default_mode() -> ConsensusMode {
    ConsensusMode::Single
}

pub(crate) async fn verify_consensus(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<ConsensusBody>,
) -> Response {
    let ip = addr.ip().to_string();
    let tenant = match authenticate(&state, &headers, &ip) {
        Ok(tenant) => tenant,
        Err(err) => return error_response(err),
    };
    run_verification(
        &state,
        tenant,
        RequestPayload::Consensus {
            query: body.query,
            mode: body.mode,
            min_confidence: body.min_confidence,
        },
        body.provider,
        &ip,
    )
    .await
}

// ---- agents -------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub(crate) struct RegisterAgentBody {
    name: String,
    #[serde(default)]
    owner: Option<String>,
}

pub(crate) async fn register_agent(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<RegisterAgentBody>,
) -> Response {
    let ip = addr.ip().to_string();
    let tenant = match authenticate(&state, &headers, &ip) {
        Ok(tenant) => tenant,
        Err(err) => return error_response(err),
    };
    match state
        .control
        .store()
        .register_agent(&tenant.org_id, &body.name, body.owner.as_deref())
    {
        Ok(agent) => (
            StatusCode::OK,
            Json(json!({
                "agent_id": agent.id,
                "name": agent.name,
                "org_id": agent.org_id,
                "created_at": agent.created_at,
            })),
        )
            .into_response(),
        Err(err) => error_response(err),
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct AgentVerifyBody {
    #[serde(default = "default_agent_kind")]
    kind: String,
    #[serde(default)]
    query: Option<String>,
    #[serde(default)]
    code: Option<String>,
    #[serde(default = "default_language")]
    language: String,
    #[serde(default)]
    provider: Option<String>,
}

fn default_agent_kind() -> String {
    "natural_language".into()
}

pub(crate) async fn agent_verify(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(agent_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<AgentVerifyBody>,
) -> Response {
    let ip = addr.ip().to_string();
    let tenant = match authenticate(&state, &headers, &ip) {
        Ok(tenant) => tenant,
        Err(err) => return error_response(err),
    };

    let agent = match state.control.store().get_agent(&agent_id) {
        Ok(Some(agent)) => agent,
        Ok(None) => {
            return error_response(GatewayError::Validation(format!(
                "unknown agent {agent_id}"
            )))
        }
        Err(err) => return error_response(err),
    };
    if agent.org_id != tenant.org_id {
        return error_response(GatewayError::Forbidden(
            "agent belongs to a different organization".into(),
        ));
    }

    let payload = match body.kind.as_str() {
        "natural_language" => match body.query {
            Some(query) => RequestPayload::NaturalLanguage { query },
            None => return error_response(GatewayError::Validation("missing query".into())),
        },
        "logic" => match body.query {
            Some(query) => RequestPayload::Logic { query },
            None => return error_response(GatewayError::Validation("missing query".into())),
        },
        "code" => match body.code {
            Some(code) => RequestPayload::Code {
                code,
                language: body.language,
            },
            None => return error_response(GatewayError::Validation("missing code".into())),
        },
        other => {
            return error_response(GatewayError::Validation(format!(
                "agent verification does not support kind {other:?}"
            )))
        }
    };

    let kind_label = payload.kind().as_str().to_string();
    let response = run_verification(&state, tenant, payload, body.provider, &ip).await;

    // Attribution: record the verdict the agent saw.
    let verdict = response
        .status()
        .is_success()
        .then_some("OK")
        .unwrap_or("ERROR");
    if let Err(err) = state
        .control
        .store()
        .record_agent_activity(&agent.id, &kind_label, verdict)
    {
        warn!(%err, agent = %agent.id, "failed to record agent activity");
    }
    response
}

// ---- read-side endpoints ------------------------------------------------

#[derive(Debug, Deserialize)]
pub(crate) struct HistoryParams {
    #[serde(default = "default_history_limit")]
    limit: usize,
}

fn default_history_limit() -> usize {
    50
}

pub(crate) async fn history(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(params): Query<HistoryParams>,
) -> Response {
    let ip = addr.ip().to_string();
    let tenant = match authenticate(&state, &headers, &ip) {
        Ok(tenant) => tenant,
        Err(err) => return error_response(err),
    };
    match state
        .control
        .store()
        .history(&tenant.org_id, params.limit.min(500))
    {
        Ok(entries) => (StatusCode::OK, Json(json!({"entries": entries}))).into_response(),
        Err(err) => error_response(err),
    }
}

pub(crate) async fn global_metrics(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let ip = addr.ip().to_string();
    let tenant = match authenticate(&state, &headers, &ip) {
        Ok(tenant) => tenant,
        Err(err) => return error_response(err),
    };
    if tenant.role != Role::Admin {
        return error_response(GatewayError::Forbidden(
            "global metrics require the admin role".into(),
        ));
    }
    match crate::metrics::render() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(err) => error_response(GatewayError::Internal(err.to_string())),
    }
}

pub(crate) async fn tenant_metrics(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(org_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let ip = addr.ip().to_string();
    let tenant = match authenticate(&state, &headers, &ip) {
        Ok(tenant) => tenant,
        Err(err) => return error_response(err),
    };
    if tenant.role != Role::Admin && tenant.org_id != org_id {
        return error_response(GatewayError::Forbidden(
            "cross-tenant metrics access denied".into(),
        ));
    }
    match state.control.store().tenant_counters(&org_id) {
        Ok(counters) => (StatusCode::OK, Json(json!(counters))).into_response(),
        Err(err) => error_response(err),
    }
}

pub(crate) async fn attestation_keys(State(state): State<AppState>) -> Response {
    (StatusCode::OK, Json(state.control.attestor().public_jwks())).into_response()
}

pub(crate) async fn health() -> Response {
    (StatusCode::OK, Json(json!({"status": "ok"}))).into_response()
}
