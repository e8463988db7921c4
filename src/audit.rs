//! Tamper-evident audit chain over the verification log.
//!
//! Entries form a linked list: each entry hashes the previous entry's hash
//! together with its own canonical bytes, and carries an HMAC over that
//! hash. Appends are serialized behind a mutex so the total order the `id`
//! column exposes is exactly the hash-chain order.

use chrono::Utc;
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use serde_json::json;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::errors::GatewayResult;
use crate::model::{canonical_json, AuditEntry};
use crate::policy::pii;
use crate::storage::Store;

type HmacSha256 = Hmac<Sha256>;

/// Hash of the chain's fixed origin; the first entry links to this.
pub fn genesis_hash() -> String {
    hex::encode(Sha256::digest(b"qwed-genesis"))
}

pub struct AuditLog {
    store: Store,
    secret: String,
    /// Serializes writers; holds the cached tail hash.
    tail: Mutex<Option<String>>,
}

/// Fields the control plane supplies for one append.
#[derive(Debug, Clone)]
pub struct AuditDraft {
    pub org_id: String,
    pub kind: String,
    pub fingerprint: String,
    pub verdict: String,
    pub query: String,
    pub detail: String,
    pub latency_ms: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChainStatus {
    Intact { entries: usize, tail_hash: String },
    BrokenAt { id: i64, reason: String },
}

impl AuditLog {
    pub fn new(store: Store, secret: &str) -> AuditLog {
        AuditLog {
            store,
            secret: secret.to_string(),
            tail: Mutex::new(None),
        }
    }

    /// Append one entry. PII is scrubbed from the query/detail strings
    /// before anything is hashed or persisted.
    pub fn append(&self, draft: AuditDraft) -> GatewayResult<AuditEntry> {
        let mut tail = self.tail.lock();

        let previous_hash = match tail.clone() {
            Some(hash) => hash,
            None => match self.store.last_chain_entry()? {
                Some((_, hash)) => hash,
                None => genesis_hash(),
            },
        };

        let mut entry = AuditEntry {
            id: 0,
            org_id: draft.org_id,
            kind: draft.kind,
            fingerprint: draft.fingerprint,
            verdict: draft.verdict,
            query: pii::redact(&draft.query),
            detail: pii::redact(&draft.detail),
            latency_ms: draft.latency_ms,
            created_at: Utc::now(),
            previous_hash: previous_hash.clone(),
            entry_hash: String::new(),
            hmac: String::new(),
        };
        entry.entry_hash = entry_hash(&entry);
        entry.hmac = entry_hmac(&self.secret, &entry.entry_hash);

        entry.id = self.store.insert_log_entry(&entry)?;
        *tail = Some(entry.entry_hash.clone());
        Ok(entry)
    }

    /// Walk the chain from genesis; report the first broken link.
    pub fn verify_chain(&self) -> GatewayResult<ChainStatus> {
        let mut expected_previous = genesis_hash();
        let mut after_id = 0i64;
        let mut entries = 0usize;

        loop {
            let batch = self.store.log_entries(after_id, 256)?;
            if batch.is_empty() {
                break;
            }
            for entry in &batch {
                if entry.previous_hash != expected_previous {
                    return Ok(ChainStatus::BrokenAt {
                        id: entry.id,
                        reason: "previous_hash does not match prior entry".into(),
                    });
                }
                let recomputed = entry_hash(entry);
                if recomputed != entry.entry_hash {
                    return Ok(ChainStatus::BrokenAt {
                        id: entry.id,
                        reason: "entry_hash does not match canonical bytes".into(),
                    });
                }
                let expected_mac = entry_hmac(&self.secret, &entry.entry_hash);
                if expected_mac
                    .as_bytes()
                    .ct_eq(entry.hmac.as_bytes())
                    .unwrap_u8()
                    != 1
                {
                    return Ok(ChainStatus::BrokenAt {
                        id: entry.id,
                        reason: "hmac verification failed".into(),
                    });
                }
                expected_previous = entry.entry_hash.clone();
                after_id = entry.id;
                entries += 1;
            }
        }

        Ok(ChainStatus::Intact {
            entries,
            tail_hash: expected_previous,
        })
    }
}

/// sha256(previous_hash || canonical_json(fields)), hex-encoded. The id is
/// excluded: SQLite assigns it after hashing.
fn entry_hash(entry: &AuditEntry) -> String {
    let fields = json!({
        "org_id": entry.org_id,
        "kind": entry.kind,
        "fingerprint": entry.fingerprint,
        "verdict": entry.verdict,
        "query": entry.query,
        "detail": entry.detail,
        "latency_ms": entry.latency_ms,
        "created_at": entry.created_at.to_rfc3339(),
    });
    let mut hasher = Sha256::new();
    hasher.update(entry.previous_hash.as_bytes());
    hasher.update(canonical_json(&fields).as_bytes());
    hex::encode(hasher.finalize())
}

fn entry_hmac(secret: &str, entry_hash: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(entry_hash.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log() -> AuditLog {
        AuditLog::new(Store::open_in_memory("secret").unwrap(), "audit-secret")
    }

    fn draft(n: usize) -> AuditDraft {
        AuditDraft {
            org_id: "acme".into(),
            kind: "logic".into(),
            fingerprint: format!("fp-{n}"),
            verdict: "SAT".into(),
            query: format!("query {n}"),
            detail: "{}".into(),
            latency_ms: 12,
        }
    }

    #[test]
    fn chain_links_every_entry() {
        let log = log();
        let first = log.append(draft(1)).unwrap();
        let second = log.append(draft(2)).unwrap();
        let third = log.append(draft(3)).unwrap();

        assert_eq!(first.previous_hash, genesis_hash());
        assert_eq!(second.previous_hash, first.entry_hash);
        assert_eq!(third.previous_hash, second.entry_hash);

        let status = log.verify_chain().unwrap();
        assert_eq!(
            status,
            ChainStatus::Intact {
                entries: 3,
                tail_hash: third.entry_hash,
            }
        );
    }

    #[test]
    fn tampering_is_detected_at_the_exact_index() {
        let log = log();
        for n in 0..5 {
            log.append(draft(n)).unwrap();
        }
        // Flip entry 3's recorded query, bypassing the writer.
        let entries = log.store.log_entries(0, 10).unwrap();
        let victim = &entries[2];
        log.store
            .tamper_entry_query(victim.id, &format!("{}-tampered", victim.query));

        let status = log.verify_chain().unwrap();
        let ChainStatus::BrokenAt { id, reason } = status else {
            panic!("tampering must break the chain");
        };
        assert_eq!(id, 3);
        assert!(reason.contains("entry_hash"));
    }

    #[test]
    fn pii_never_reaches_the_log() {
        let log = log();
        let entry = log
            .append(AuditDraft {
                query: "my email is ada@example.com".into(),
                ..draft(0)
            })
            .unwrap();
        assert!(!entry.query.contains("ada@example.com"));
        assert!(entry.query.contains("[REDACTED]"));
    }

    #[test]
    fn wrong_secret_fails_hmac_check() {
        let store = Store::open_in_memory("secret").unwrap();
        let writer = AuditLog::new(store.clone(), "secret-a");
        writer.append(draft(0)).unwrap();
        let reader = AuditLog::new(store, "secret-b");
        let status = reader.verify_chain().unwrap();
        assert!(matches!(status, ChainStatus::BrokenAt { id: 1, .. }));
    }
}
