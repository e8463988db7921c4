//! Signed attestations over completed verifications.
//!
//! A detached JWS (EdDSA, `b64: false`) over the canonical claim bytes.
//! Token shape is `header..signature`; the payload travels in the response
//! envelope, and verifiers rebuild the signing input from it. The public
//! key set is published at `/attestation/keys`.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier as _, VerifyingKey};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::info;

use crate::model::canonical_json;

#[derive(Debug, Error)]
pub enum AttestError {
    #[error("attestation key seed must be 32 hex-encoded bytes")]
    BadSeed,
    #[error("malformed token: {0}")]
    Malformed(&'static str),
    #[error("unsupported algorithm {0}")]
    BadAlg(String),
    #[error("unknown key id {0}")]
    UnknownKid(String),
    #[error("signature verification failed")]
    BadSignature,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttestationClaim {
    pub org_id: String,
    pub fingerprint: String,
    pub verdict: String,
    pub engine: String,
    pub entry_hash: String,
    pub issued_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ProtectedHeader {
    alg: String,
    kid: String,
    #[serde(default)]
    b64: bool,
    #[serde(default)]
    crit: Vec<String>,
}

pub struct Attestor {
    signing_key: SigningKey,
    kid: String,
}

impl Attestor {
    /// Build from a 32-byte hex seed, or generate a fresh dev key.
    pub fn from_seed(seed_hex: Option<&str>) -> Result<Attestor, AttestError> {
        let signing_key = match seed_hex {
            Some(seed) => {
                let bytes = hex::decode(seed).map_err(|_| AttestError::BadSeed)?;
                let bytes: [u8; 32] = bytes.try_into().map_err(|_| AttestError::BadSeed)?;
                SigningKey::from_bytes(&bytes)
            }
            None => {
                info!("no attestation key configured; generating an ephemeral one");
                SigningKey::generate(&mut rand::rngs::OsRng)
            }
        };
        let kid = hex::encode(&signing_key.verifying_key().to_bytes()[..8]);
        Ok(Attestor { signing_key, kid })
    }

    pub fn sign(&self, claim: &AttestationClaim) -> String {
        let header = ProtectedHeader {
            alg: "EdDSA".into(),
            kid: self.kid.clone(),
            b64: false,
            crit: vec!["b64".into()],
        };
        let header_segment =
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header).expect("static header"));
        let payload = claim_bytes(claim);
        let signing_input = build_signing_input(&header_segment, &payload);
        let signature = self.signing_key.sign(&signing_input);
        let signature_segment = URL_SAFE_NO_PAD.encode(signature.to_bytes());
        format!("{header_segment}..{signature_segment}")
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// JWK set served publicly.
    pub fn public_jwks(&self) -> serde_json::Value {
        json!({
            "keys": [{
                "kty": "OKP",
                "crv": "Ed25519",
                "kid": self.kid,
                "x": URL_SAFE_NO_PAD.encode(self.verifying_key().to_bytes()),
                "use": "sig",
                "alg": "EdDSA",
            }]
        })
    }

    pub fn verify(&self, claim: &AttestationClaim, token: &str) -> Result<(), AttestError> {
        let segments: Vec<&str> = token.split('.').collect();
        if segments.len() != 3 || !segments[1].is_empty() {
            return Err(AttestError::Malformed(
                "expected detached JWS with empty payload segment",
            ));
        }
        let header_bytes = URL_SAFE_NO_PAD
            .decode(segments[0])
            .map_err(|_| AttestError::Malformed("header is not base64url"))?;
        let header: ProtectedHeader = serde_json::from_slice(&header_bytes)
            .map_err(|_| AttestError::Malformed("header is not JSON"))?;
        if header.alg != "EdDSA" {
            return Err(AttestError::BadAlg(header.alg));
        }
        if header.b64 || !header.crit.iter().any(|c| c == "b64") {
            return Err(AttestError::Malformed("expected b64=false with crit entry"));
        }
        if header.kid != self.kid {
            return Err(AttestError::UnknownKid(header.kid));
        }

        let signature_bytes = URL_SAFE_NO_PAD
            .decode(segments[2])
            .map_err(|_| AttestError::Malformed("signature is not base64url"))?;
        let signature_bytes: [u8; 64] = signature_bytes
            .try_into()
            .map_err(|_| AttestError::Malformed("signature length"))?;
        let signature = Signature::from_bytes(&signature_bytes);

        let signing_input = build_signing_input(segments[0], &claim_bytes(claim));
        self.verifying_key()
            .verify(&signing_input, &signature)
            .map_err(|_| AttestError::BadSignature)
    }
}

fn claim_bytes(claim: &AttestationClaim) -> Vec<u8> {
    let value = json!({
        "org_id": claim.org_id,
        "fingerprint": claim.fingerprint,
        "verdict": claim.verdict,
        "engine": claim.engine,
        "entry_hash": claim.entry_hash,
        "issued_at": claim.issued_at.to_rfc3339(),
    });
    canonical_json(&value).into_bytes()
}

fn build_signing_input(header_segment: &str, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(header_segment.len() + 1 + payload.len());
    out.extend_from_slice(header_segment.as_bytes());
    out.push(b'.');
    out.extend_from_slice(payload);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claim() -> AttestationClaim {
        AttestationClaim {
            org_id: "acme".into(),
            fingerprint: "abcd".into(),
            verdict: "VERIFIED".into(),
            engine: "math".into(),
            entry_hash: "1234".into(),
            issued_at: Utc::now(),
        }
    }

    #[test]
    fn sign_verify_round_trip() {
        let attestor = Attestor::from_seed(None).unwrap();
        let claim = claim();
        let token = attestor.sign(&claim);
        attestor.verify(&claim, &token).unwrap();
    }

    #[test]
    fn altered_claim_fails() {
        let attestor = Attestor::from_seed(None).unwrap();
        let claim = claim();
        let token = attestor.sign(&claim);
        let mut altered = claim.clone();
        altered.verdict = "CORRECTED".into();
        assert!(matches!(
            attestor.verify(&altered, &token),
            Err(AttestError::BadSignature)
        ));
    }

    #[test]
    fn seed_is_deterministic() {
        let seed = "11".repeat(32);
        let a = Attestor::from_seed(Some(&seed)).unwrap();
        let b = Attestor::from_seed(Some(&seed)).unwrap();
        assert_eq!(
            a.verifying_key().to_bytes(),
            b.verifying_key().to_bytes()
        );
    }

    #[test]
    fn jwks_shape() {
        let attestor = Attestor::from_seed(None).unwrap();
        let jwks = attestor.public_jwks();
        assert_eq!(jwks["keys"][0]["crv"], "Ed25519");
        assert!(jwks["keys"][0]["x"].as_str().is_some());
    }

    #[test]
    fn bad_seed_is_rejected() {
        assert!(matches!(
            Attestor::from_seed(Some("zz")),
            Err(AttestError::BadSeed)
        ));
    }
}
