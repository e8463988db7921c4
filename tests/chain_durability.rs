//! Audit chain durability: entries written before a shutdown must verify
//! after the database is reopened, and the chain must keep extending from
//! the persisted tail rather than restarting at genesis.

use qwed_gateway::audit::{AuditDraft, AuditLog, ChainStatus};
use qwed_gateway::storage::Store;

fn draft(n: usize) -> AuditDraft {
    AuditDraft {
        org_id: "acme".into(),
        kind: "natural_language".into(),
        fingerprint: format!("fp-{n}"),
        verdict: "VERIFIED".into(),
        query: format!("query {n}"),
        detail: "{}".into(),
        latency_ms: 3,
    }
}

#[test]
fn chain_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("qwed.db");
    let path = path.to_str().unwrap();

    let tail_before = {
        let store = Store::open(path, "durable-secret").unwrap();
        let audit = AuditLog::new(store, "audit-secret");
        for n in 0..4 {
            audit.append(draft(n)).unwrap();
        }
        let ChainStatus::Intact { entries, tail_hash } = audit.verify_chain().unwrap() else {
            panic!("chain must be intact before shutdown");
        };
        assert_eq!(entries, 4);
        tail_hash
    };

    // Fresh process: reopen and keep appending.
    let store = Store::open(path, "durable-secret").unwrap();
    let audit = AuditLog::new(store, "audit-secret");
    let fifth = audit.append(draft(4)).unwrap();
    assert_eq!(fifth.previous_hash, tail_before);

    let ChainStatus::Intact { entries, tail_hash } = audit.verify_chain().unwrap() else {
        panic!("chain must be intact after reopen");
    };
    assert_eq!(entries, 5);
    assert_eq!(tail_hash, fifth.entry_hash);
}

#[test]
fn key_lookup_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("qwed.db");
    let path = path.to_str().unwrap();

    let key = qwed_gateway::storage::generate_api_key();
    {
        let store = Store::open(path, "durable-secret").unwrap();
        store
            .create_organization("acme", "Acme", "pro", 1000, 100)
            .unwrap();
        store
            .insert_key(&key, "acme", "admin", &[], None, false)
            .unwrap();
    }

    let store = Store::open(path, "durable-secret").unwrap();
    let record = store.lookup_key(&key).unwrap().expect("key persisted");
    assert_eq!(record.tenant.org_id, "acme");
    assert!(matches!(
        record.tenant.role,
        qwed_gateway::model::Role::Admin
    ));
}
