//! SQLite persistence: organizations, API keys, the verification log
//! (audit chain), security events, quotas, and the agent registry.
//!
//! One connection behind a mutex, WAL mode, one transaction per logical
//! write. Schema init is idempotent; migrations must never rewrite
//! `entry_hash` / `previous_hash` on historical rows; the chain is the
//! source of truth.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{info, warn};

use crate::errors::{GatewayError, GatewayResult};
use crate::model::{AuditEntry, Role, SecurityEvent, TenantContext};

type HmacSha256 = Hmac<Sha256>;

pub const KEY_PREFIX: &str = "qwed_live";

#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
    key_secret: String,
}

/// Outcome of an API-key lookup, before auth policy is applied.
#[derive(Debug, Clone)]
pub struct KeyRecord {
    pub tenant: TenantContext,
    pub expired: bool,
    pub rotation_required: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: String,
    pub org_id: String,
    pub name: String,
    pub owner: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TenantCounters {
    pub total: i64,
    pub by_verdict: Vec<(String, i64)>,
}

/// YAML seed file: organizations and their keys, loaded at startup.
#[derive(Debug, Deserialize)]
pub struct TenantSeed {
    pub organizations: Vec<OrgSeed>,
}

#[derive(Debug, Deserialize)]
pub struct OrgSeed {
    pub id: String,
    pub name: String,
    #[serde(default = "default_tier")]
    pub tier: String,
    #[serde(default = "default_daily")]
    pub daily_quota: i64,
    #[serde(default = "default_minute")]
    pub minute_quota: i64,
    #[serde(default)]
    pub keys: Vec<KeySeed>,
}

#[derive(Debug, Deserialize)]
pub struct KeySeed {
    pub key: String,
    #[serde(default = "default_role")]
    pub role: String,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub rotation_required: bool,
}

fn default_tier() -> String {
    "free".into()
}
fn default_daily() -> i64 {
    10_000
}
fn default_minute() -> i64 {
    100
}
fn default_role() -> String {
    "member".into()
}

impl Store {
    pub fn open(path: &str, key_secret: &str) -> GatewayResult<Store> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        let store = Store {
            conn: Arc::new(Mutex::new(conn)),
            key_secret: key_secret.to_string(),
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn open_in_memory(key_secret: &str) -> GatewayResult<Store> {
        let conn = Connection::open_in_memory()?;
        let store = Store {
            conn: Arc::new(Mutex::new(conn)),
            key_secret: key_secret.to_string(),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> GatewayResult<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS organization (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                tier TEXT NOT NULL DEFAULT 'free',
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS api_key (
                fingerprint TEXT PRIMARY KEY,
                org_id TEXT NOT NULL REFERENCES organization(id),
                role TEXT NOT NULL DEFAULT 'member',
                permissions TEXT NOT NULL DEFAULT '[]',
                expires_at TEXT,
                rotation_required INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS verification_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                org_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                fingerprint TEXT NOT NULL,
                verdict TEXT NOT NULL,
                query TEXT NOT NULL,
                detail TEXT NOT NULL,
                latency_ms INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                previous_hash TEXT NOT NULL,
                entry_hash TEXT NOT NULL,
                hmac_signature TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_verification_log_org
                ON verification_log(org_id);
            CREATE TABLE IF NOT EXISTS security_event (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                org_id TEXT,
                event_type TEXT NOT NULL,
                layer TEXT NOT NULL,
                reason TEXT NOT NULL,
                source_ip TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS resource_quota (
                org_id TEXT PRIMARY KEY REFERENCES organization(id),
                daily_limit INTEGER NOT NULL,
                minute_limit INTEGER NOT NULL,
                used_today INTEGER NOT NULL DEFAULT 0,
                day TEXT NOT NULL DEFAULT ''
            );
            CREATE TABLE IF NOT EXISTS agent (
                id TEXT PRIMARY KEY,
                org_id TEXT NOT NULL REFERENCES organization(id),
                name TEXT NOT NULL,
                owner TEXT,
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS agent_activity (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                agent_id TEXT NOT NULL REFERENCES agent(id),
                kind TEXT NOT NULL,
                verdict TEXT NOT NULL,
                created_at TEXT NOT NULL
            );",
        )?;
        Ok(())
    }

    // ---- API keys -------------------------------------------------------

    /// HMAC fingerprint of a plaintext key; only fingerprints are stored.
    pub fn key_fingerprint(&self, api_key: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.key_secret.as_bytes())
            .expect("hmac accepts any key length");
        mac.update(api_key.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    pub fn lookup_key(&self, api_key: &str) -> GatewayResult<Option<KeyRecord>> {
        let fingerprint = self.key_fingerprint(api_key);
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT k.org_id, o.name, o.tier, k.role, k.permissions, k.expires_at,
                        k.rotation_required, q.daily_limit, q.minute_limit
                 FROM api_key k
                 JOIN organization o ON o.id = k.org_id
                 LEFT JOIN resource_quota q ON q.org_id = k.org_id
                 WHERE k.fingerprint = ?1",
                params![fingerprint],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, Option<String>>(5)?,
                        row.get::<_, bool>(6)?,
                        row.get::<_, Option<i64>>(7)?,
                        row.get::<_, Option<i64>>(8)?,
                    ))
                },
            )
            .optional()?;

        let Some((org_id, org_name, tier, role, permissions, expires_at, rotation, daily, minute)) =
            row
        else {
            return Ok(None);
        };

        let expired = expires_at
            .as_deref()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|t| t.with_timezone(&Utc) < Utc::now())
            .unwrap_or(false);

        let permissions: BTreeSet<String> =
            serde_json::from_str(&permissions).unwrap_or_default();
        let role = match role.as_str() {
            "admin" => Role::Admin,
            "agent" => Role::Agent,
            _ => Role::Member,
        };

        Ok(Some(KeyRecord {
            tenant: TenantContext {
                org_id,
                org_name,
                tier,
                key_fingerprint: fingerprint,
                role,
                permissions,
                daily_quota: daily.unwrap_or(default_daily()),
                minute_quota: minute.unwrap_or(default_minute()),
            },
            expired,
            rotation_required: rotation,
        }))
    }

    pub fn create_organization(
        &self,
        id: &str,
        name: &str,
        tier: &str,
        daily_quota: i64,
        minute_quota: i64,
    ) -> GatewayResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO organization (id, name, tier, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![id, name, tier, Utc::now().to_rfc3339()],
        )?;
        conn.execute(
            "INSERT OR REPLACE INTO resource_quota (org_id, daily_limit, minute_limit, used_today, day)
             VALUES (?1, ?2, ?3,
                     COALESCE((SELECT used_today FROM resource_quota WHERE org_id = ?1), 0),
                     COALESCE((SELECT day FROM resource_quota WHERE org_id = ?1), ''))",
            params![id, daily_quota, minute_quota],
        )?;
        Ok(())
    }

    pub fn insert_key(
        &self,
        api_key: &str,
        org_id: &str,
        role: &str,
        permissions: &[String],
        expires_at: Option<DateTime<Utc>>,
        rotation_required: bool,
    ) -> GatewayResult<String> {
        let fingerprint = self.key_fingerprint(api_key);
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO api_key
                (fingerprint, org_id, role, permissions, expires_at, rotation_required, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                fingerprint,
                org_id,
                role,
                serde_json::to_string(permissions).unwrap_or_else(|_| "[]".into()),
                expires_at.map(|t| t.to_rfc3339()),
                rotation_required,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(fingerprint)
    }

    pub fn seed_tenants(&self, seed: &TenantSeed) -> GatewayResult<()> {
        for org in &seed.organizations {
            self.create_organization(
                &org.id,
                &org.name,
                &org.tier,
                org.daily_quota,
                org.minute_quota,
            )?;
            for key in &org.keys {
                self.insert_key(
                    &key.key,
                    &org.id,
                    &key.role,
                    &key.permissions,
                    key.expires_at,
                    key.rotation_required,
                )?;
            }
            info!(org = %org.id, keys = org.keys.len(), "seeded organization");
        }
        Ok(())
    }

    pub fn load_seed_file(&self, path: &str) -> GatewayResult<()> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| GatewayError::Storage(format!("tenant seed {path}: {e}")))?;
        let seed: TenantSeed = serde_yaml::from_str(&raw)
            .map_err(|e| GatewayError::Storage(format!("tenant seed {path}: {e}")))?;
        self.seed_tenants(&seed)
    }

    // ---- quotas ---------------------------------------------------------

    /// Consume one unit of the org's daily quota; false when exhausted.
    pub fn consume_daily_quota(&self, org_id: &str) -> GatewayResult<bool> {
        let today = Utc::now().format("%Y-%m-%d").to_string();
        let conn = self.conn.lock();
        let row: Option<(i64, i64, String)> = conn
            .query_row(
                "SELECT daily_limit, used_today, day FROM resource_quota WHERE org_id = ?1",
                params![org_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        let Some((limit, used, day)) = row else {
            return Ok(true); // no quota row means unmetered
        };
        let used = if day == today { used } else { 0 };
        if used >= limit {
            return Ok(false);
        }
        conn.execute(
            "UPDATE resource_quota SET used_today = ?2, day = ?3 WHERE org_id = ?1",
            params![org_id, used + 1, today],
        )?;
        Ok(true)
    }

    // ---- verification log ----------------------------------------------

    pub fn last_chain_entry(&self) -> GatewayResult<Option<(i64, String)>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT id, entry_hash FROM verification_log ORDER BY id DESC LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(row)
    }

    /// Insert a fully-formed entry. The caller (the audit writer) is
    /// responsible for the chain fields; this is a plain durable append.
    pub fn insert_log_entry(&self, entry: &AuditEntry) -> GatewayResult<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO verification_log
                (org_id, kind, fingerprint, verdict, query, detail, latency_ms,
                 created_at, previous_hash, entry_hash, hmac_signature)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                entry.org_id,
                entry.kind,
                entry.fingerprint,
                entry.verdict,
                entry.query,
                entry.detail,
                entry.latency_ms,
                entry.created_at.to_rfc3339(),
                entry.previous_hash,
                entry.entry_hash,
                entry.hmac,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn log_entries(&self, after_id: i64, limit: usize) -> GatewayResult<Vec<AuditEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, org_id, kind, fingerprint, verdict, query, detail, latency_ms,
                    created_at, previous_hash, entry_hash, hmac_signature
             FROM verification_log WHERE id > ?1 ORDER BY id ASC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![after_id, limit as i64], row_to_entry)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn history(&self, org_id: &str, limit: usize) -> GatewayResult<Vec<AuditEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, org_id, kind, fingerprint, verdict, query, detail, latency_ms,
                    created_at, previous_hash, entry_hash, hmac_signature
             FROM verification_log WHERE org_id = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![org_id, limit as i64], row_to_entry)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn tenant_counters(&self, org_id: &str) -> GatewayResult<TenantCounters> {
        let conn = self.conn.lock();
        let total = conn.query_row(
            "SELECT COUNT(*) FROM verification_log WHERE org_id = ?1",
            params![org_id],
            |row| row.get(0),
        )?;
        let mut stmt = conn.prepare(
            "SELECT verdict, COUNT(*) FROM verification_log
             WHERE org_id = ?1 GROUP BY verdict ORDER BY COUNT(*) DESC",
        )?;
        let rows = stmt.query_map(params![org_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        let mut by_verdict = Vec::new();
        for row in rows {
            by_verdict.push(row?);
        }
        Ok(TenantCounters { total, by_verdict })
    }

    // ---- security events ------------------------------------------------

    pub fn record_security_event(&self, event: &SecurityEvent) {
        let conn = self.conn.lock();
        let outcome = conn.execute(
            "INSERT INTO security_event (org_id, event_type, layer, reason, source_ip, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                event.org_id,
                event.kind.as_str(),
                event.layer,
                event.reason,
                event.source_ip,
                event.created_at.to_rfc3339(),
            ],
        );
        if let Err(err) = outcome {
            // Security telemetry must never take the request down with it.
            warn!(%err, "failed to persist security event");
        }
    }

    pub fn security_event_count(&self, kind: &str) -> GatewayResult<i64> {
        let conn = self.conn.lock();
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM security_event WHERE event_type = ?1",
            params![kind],
            |row| row.get(0),
        )?)
    }

    // ---- agents ---------------------------------------------------------

    pub fn register_agent(&self, org_id: &str, name: &str, owner: Option<&str>) -> GatewayResult<AgentRecord> {
        let record = AgentRecord {
            id: uuid::Uuid::new_v4().to_string(),
            org_id: org_id.to_string(),
            name: name.to_string(),
            owner: owner.map(str::to_string),
            created_at: Utc::now(),
        };
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO agent (id, org_id, name, owner, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.id,
                record.org_id,
                record.name,
                record.owner,
                record.created_at.to_rfc3339()
            ],
        )?;
        Ok(record)
    }

    pub fn get_agent(&self, agent_id: &str) -> GatewayResult<Option<AgentRecord>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT id, org_id, name, owner, created_at FROM agent WHERE id = ?1",
                params![agent_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?;
        Ok(row.map(|(id, org_id, name, owner, created_at)| AgentRecord {
            id,
            org_id,
            name,
            owner,
            created_at: DateTime::parse_from_rfc3339(&created_at)
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
        }))
    }

    /// Test hook: rewrite a logged query in place, bypassing the chain
    /// writer, so verification tests can prove tampering is detected.
    #[cfg(test)]
    pub fn tamper_entry_query(&self, id: i64, query: &str) {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE verification_log SET query = ?2 WHERE id = ?1",
            params![id, query],
        )
        .expect("test tamper update");
    }

    pub fn record_agent_activity(&self, agent_id: &str, kind: &str, verdict: &str) -> GatewayResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO agent_activity (agent_id, kind, verdict, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![agent_id, kind, verdict, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditEntry> {
    let created_at: String = row.get(8)?;
    Ok(AuditEntry {
        id: row.get(0)?,
        org_id: row.get(1)?,
        kind: row.get(2)?,
        fingerprint: row.get(3)?,
        verdict: row.get(4)?,
        query: row.get(5)?,
        detail: row.get(6)?,
        latency_ms: row.get(7)?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        previous_hash: row.get(9)?,
        entry_hash: row.get(10)?,
        hmac: row.get(11)?,
    })
}

/// Mint a new plaintext API key. Only the HMAC fingerprint is ever stored.
pub fn generate_api_key() -> String {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine as _;
    use rand::RngCore;
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    format!("{KEY_PREFIX}_{}", URL_SAFE_NO_PAD.encode(bytes))
}

/// Display form: `qwed_live_ab****wxyz`.
pub fn mask_api_key(api_key: &str) -> String {
    if api_key.len() < 16 {
        return "****".to_string();
    }
    format!("{}****{}", &api_key[..10], &api_key[api_key.len() - 4..])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> Store {
        Store::open_in_memory("test-secret").unwrap()
    }

    fn seeded() -> (Store, String) {
        let store = store();
        store
            .create_organization("acme", "Acme Corp", "pro", 100, 10)
            .unwrap();
        let key = generate_api_key();
        store
            .insert_key(&key, "acme", "member", &[], None, false)
            .unwrap();
        (store, key)
    }

    #[test]
    fn key_lookup_round_trip() {
        let (store, key) = seeded();
        let record = store.lookup_key(&key).unwrap().expect("key exists");
        assert_eq!(record.tenant.org_id, "acme");
        assert_eq!(record.tenant.org_name, "Acme Corp");
        assert!(!record.expired);
        assert!(store.lookup_key("qwed_live_bogus").unwrap().is_none());
    }

    #[test]
    fn expired_key_is_flagged() {
        let store = store();
        store
            .create_organization("acme", "Acme", "free", 10, 5)
            .unwrap();
        let key = generate_api_key();
        store
            .insert_key(
                &key,
                "acme",
                "member",
                &[],
                Some(Utc::now() - chrono::Duration::hours(1)),
                false,
            )
            .unwrap();
        let record = store.lookup_key(&key).unwrap().unwrap();
        assert!(record.expired);
    }

    #[test]
    fn daily_quota_depletes_and_rolls_over() {
        let store = store();
        store
            .create_organization("tiny", "Tiny", "free", 2, 1)
            .unwrap();
        assert!(store.consume_daily_quota("tiny").unwrap());
        assert!(store.consume_daily_quota("tiny").unwrap());
        assert!(!store.consume_daily_quota("tiny").unwrap());
    }

    #[test]
    fn agents_are_tenant_scoped_rows() {
        let (store, _) = seeded();
        let agent = store.register_agent("acme", "checker-bot", Some("ops")).unwrap();
        let loaded = store.get_agent(&agent.id).unwrap().unwrap();
        assert_eq!(loaded.org_id, "acme");
        store
            .record_agent_activity(&agent.id, "logic", "SAT")
            .unwrap();
    }

    #[test]
    fn generated_keys_have_prefix_and_mask() {
        let key = generate_api_key();
        assert!(key.starts_with("qwed_live_"));
        let masked = mask_api_key(&key);
        assert!(masked.contains("****"));
        assert!(!masked.contains(&key[12..30]));
    }

    #[test]
    fn security_events_are_counted() {
        let store = store();
        store.record_security_event(&SecurityEvent::new(
            None,
            crate::model::SecurityEventKind::Blocked,
            "heuristic",
            "matched pattern",
            "127.0.0.1",
        ));
        assert_eq!(store.security_event_count("BLOCKED").unwrap(), 1);
    }
}
