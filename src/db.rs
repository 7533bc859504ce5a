// 🗄️ SQLite persistence
//
// Durable Store backed by rusqlite with WAL journaling. Each change batch is
// one SQLite transaction, so a crash leaves either the whole call or none of
// it on disk.

use crate::commission::{Commission, CommissionState, Provision};
use crate::entity::Entity;
use crate::error::{QuotaError, QuotaResult};
use crate::holding::Holding;
use crate::policy::{Flags, Limits, Policy};
use crate::store::{Change, Store, StoredState};
use crate::sync;
use crate::timeline::{TimelineEntry, TimelineQuery};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Mutex;

/// Fixed-width UTC timestamps so text order equals time order
pub fn format_time(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_time(idx: usize, text: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub fn setup_database(conn: &Connection) -> QuotaResult<()> {
    // Enable WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;

    // ==========================================================================
    // Entities (keys stored as SHA-256 digests)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS entities (
            name TEXT PRIMARY KEY,
            owner TEXT,
            key_hash TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Policies
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS policies (
            name TEXT PRIMARY KEY,
            quantity INTEGER NOT NULL,
            capacity INTEGER NOT NULL,
            import_limit INTEGER NOT NULL,
            export_limit INTEGER NOT NULL,
            flags INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Holdings (committed + reserved counters)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS holdings (
            entity TEXT NOT NULL,
            resource TEXT NOT NULL,
            policy TEXT NOT NULL,
            imported INTEGER NOT NULL DEFAULT 0,
            exported INTEGER NOT NULL DEFAULT 0,
            importing INTEGER NOT NULL DEFAULT 0,
            exporting INTEGER NOT NULL DEFAULT 0,
            version INTEGER NOT NULL DEFAULT 1,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (entity, resource)
        )",
        [],
    )?;

    // ==========================================================================
    // Commissions (provisions kept as JSON, like an event payload)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS commissions (
            serial INTEGER PRIMARY KEY,
            issuer TEXT NOT NULL,
            state TEXT NOT NULL,
            provisions TEXT NOT NULL,
            created_at TEXT NOT NULL,
            resolved_at TEXT
        )",
        [],
    )?;

    // ==========================================================================
    // Timeline (append-only audit trail)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS timeline (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            entry_id TEXT UNIQUE NOT NULL,
            entity TEXT NOT NULL,
            resource TEXT NOT NULL,
            delta INTEGER NOT NULL,
            usage INTEGER NOT NULL,
            serial INTEGER NOT NULL,
            issuer TEXT NOT NULL,
            timestamp TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS meta (
            key TEXT PRIMARY KEY,
            value INTEGER NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Indexes
    // ==========================================================================
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_entities_owner ON entities(owner)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_commissions_state ON commissions(state)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_timeline_holding ON timeline(entity, resource, timestamp)",
        [],
    )?;

    Ok(())
}

// ============================================================================
// ROW MAPPING
// ============================================================================

fn entity_from_row(row: &Row) -> rusqlite::Result<Entity> {
    let created_at: String = row.get(3)?;
    Ok(Entity::from_parts(
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        parse_time(3, &created_at)?,
    ))
}

fn policy_from_row(row: &Row) -> rusqlite::Result<Policy> {
    let flags: i64 = row.get(5)?;
    let updated_at: String = row.get(6)?;
    Ok(Policy {
        name: row.get(0)?,
        limits: Limits {
            quantity: row.get(1)?,
            capacity: row.get(2)?,
            import_limit: row.get(3)?,
            export_limit: row.get(4)?,
            flags: Flags(flags as u32),
        },
        updated_at: parse_time(6, &updated_at)?,
    })
}

fn holding_from_row(row: &Row) -> rusqlite::Result<Holding> {
    let version: i64 = row.get(7)?;
    let updated_at: String = row.get(8)?;
    Ok(Holding {
        entity: row.get(0)?,
        resource: row.get(1)?,
        policy: row.get(2)?,
        imported: row.get(3)?,
        exported: row.get(4)?,
        importing: row.get(5)?,
        exporting: row.get(6)?,
        version: version as u64,
        updated_at: parse_time(8, &updated_at)?,
    })
}

fn commission_from_row(row: &Row) -> rusqlite::Result<Commission> {
    let serial: i64 = row.get(0)?;
    let state: String = row.get(2)?;
    let provisions_json: String = row.get(3)?;
    let created_at: String = row.get(4)?;
    let resolved_at: Option<String> = row.get(5)?;

    let state = CommissionState::from_str(&state).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            Type::Text,
            format!("unknown commission state {}", state).into(),
        )
    })?;
    let provisions: Vec<Provision> = serde_json::from_str(&provisions_json)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e)))?;

    Ok(Commission {
        serial: serial as u64,
        issuer: row.get(1)?,
        provisions,
        state,
        created_at: parse_time(4, &created_at)?,
        resolved_at: resolved_at.map(|s| parse_time(5, &s)).transpose()?,
    })
}

fn timeline_from_row(row: &Row) -> rusqlite::Result<TimelineEntry> {
    let serial: i64 = row.get(5)?;
    let timestamp: String = row.get(7)?;
    Ok(TimelineEntry {
        id: row.get(0)?,
        entity: row.get(1)?,
        resource: row.get(2)?,
        delta: row.get(3)?,
        usage: row.get(4)?,
        serial: serial as u64,
        issuer: row.get(6)?,
        timestamp: parse_time(7, &timestamp)?,
    })
}

// ============================================================================
// WRITES
// ============================================================================

fn apply_change(conn: &Connection, change: &Change) -> rusqlite::Result<()> {
    match change {
        Change::PutEntity(e) => {
            conn.execute(
                "INSERT OR REPLACE INTO entities (name, owner, key_hash, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![e.name, e.owner, e.key_hash(), format_time(&e.created_at)],
            )?;
        }
        Change::DeleteEntity(name) => {
            conn.execute("DELETE FROM entities WHERE name = ?1", params![name])?;
        }
        Change::PutPolicy(p) => {
            conn.execute(
                "INSERT OR REPLACE INTO policies (
                    name, quantity, capacity, import_limit, export_limit, flags, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    p.name,
                    p.limits.quantity,
                    p.limits.capacity,
                    p.limits.import_limit,
                    p.limits.export_limit,
                    p.limits.flags.0 as i64,
                    format_time(&p.updated_at),
                ],
            )?;
        }
        Change::PutHolding(h) => {
            conn.execute(
                "INSERT OR REPLACE INTO holdings (
                    entity, resource, policy, imported, exported, importing, exporting,
                    version, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    h.entity,
                    h.resource,
                    h.policy,
                    h.imported,
                    h.exported,
                    h.importing,
                    h.exporting,
                    h.version as i64,
                    format_time(&h.updated_at),
                ],
            )?;
        }
        Change::DeleteHolding(key) => {
            conn.execute(
                "DELETE FROM holdings WHERE entity = ?1 AND resource = ?2",
                params![key.entity, key.resource],
            )?;
        }
        Change::PutCommission(c) => {
            let provisions_json = serde_json::to_string(&c.provisions)
                .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
            conn.execute(
                "INSERT OR REPLACE INTO commissions (
                    serial, issuer, state, provisions, created_at, resolved_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    c.serial as i64,
                    c.issuer,
                    c.state.as_str(),
                    provisions_json,
                    format_time(&c.created_at),
                    c.resolved_at.as_ref().map(format_time),
                ],
            )?;
        }
        Change::DeleteCommission(serial) => {
            conn.execute(
                "DELETE FROM commissions WHERE serial = ?1",
                params![*serial as i64],
            )?;
        }
        Change::AppendTimeline(entry) => {
            conn.execute(
                "INSERT INTO timeline (
                    entry_id, entity, resource, delta, usage, serial, issuer, timestamp
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    entry.id,
                    entry.entity,
                    entry.resource,
                    entry.delta,
                    entry.usage,
                    entry.serial as i64,
                    entry.issuer,
                    format_time(&entry.timestamp),
                ],
            )?;
        }
        Change::SetNextSerial(next) => {
            conn.execute(
                "INSERT OR REPLACE INTO meta (key, value) VALUES ('next_serial', ?1)",
                params![*next as i64],
            )?;
        }
    }
    Ok(())
}

// ============================================================================
// SQLITE STORE
// ============================================================================

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (creating if needed) a database file
    pub fn open(path: &Path) -> QuotaResult<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> QuotaResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    pub fn from_connection(conn: Connection) -> QuotaResult<Self> {
        setup_database(&conn)?;
        Ok(SqliteStore {
            conn: Mutex::new(conn),
        })
    }

    /// Row count of the timeline table
    pub fn timeline_count(&self) -> QuotaResult<i64> {
        let conn = sync::lock(&self.conn, "sqlite")?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM timeline", [], |row| row.get(0))?;
        Ok(count)
    }
}

impl Store for SqliteStore {
    fn load(&self) -> QuotaResult<StoredState> {
        let conn = sync::lock(&self.conn, "sqlite")?;

        let mut stmt =
            conn.prepare("SELECT name, owner, key_hash, created_at FROM entities ORDER BY name")?;
        let entities = stmt
            .query_map([], entity_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stmt = conn.prepare(
            "SELECT name, quantity, capacity, import_limit, export_limit, flags, updated_at
             FROM policies ORDER BY name",
        )?;
        let policies = stmt
            .query_map([], policy_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stmt = conn.prepare(
            "SELECT entity, resource, policy, imported, exported, importing, exporting,
                    version, updated_at
             FROM holdings ORDER BY entity, resource",
        )?;
        let holdings = stmt
            .query_map([], holding_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stmt = conn.prepare(
            "SELECT serial, issuer, state, provisions, created_at, resolved_at
             FROM commissions ORDER BY serial",
        )?;
        let commissions = stmt
            .query_map([], commission_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        let stored_next: Option<i64> = conn
            .query_row(
                "SELECT value FROM meta WHERE key = 'next_serial'",
                [],
                |row| row.get(0),
            )
            .optional()?;

        let max_serial = commissions.iter().map(|c| c.serial).max().unwrap_or(0);
        let next_serial = (stored_next.unwrap_or(1) as u64).max(max_serial + 1);

        Ok(StoredState {
            entities,
            policies,
            holdings,
            commissions,
            next_serial,
        })
    }

    fn apply(&self, changes: &[Change]) -> QuotaResult<()> {
        if changes.is_empty() {
            return Ok(());
        }
        let mut conn = sync::lock(&self.conn, "sqlite")?;
        let tx = conn.transaction()?;
        for change in changes {
            apply_change(&tx, change)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn timeline(&self, query: &TimelineQuery) -> QuotaResult<Vec<TimelineEntry>> {
        let conn = sync::lock(&self.conn, "sqlite")?;
        let mut stmt = conn.prepare(
            "SELECT entry_id, entity, resource, delta, usage, serial, issuer, timestamp
             FROM timeline
             WHERE entity = ?1
               AND (?2 IS NULL OR resource = ?2)
               AND (?3 IS NULL OR timestamp > ?3)
               AND (?4 IS NULL OR timestamp < ?4)
             ORDER BY timestamp ASC, seq ASC",
        )?;

        let entries = stmt
            .query_map(
                params![
                    query.entity,
                    query.resource,
                    query.after.as_ref().map(format_time),
                    query.before.as_ref().map(format_time),
                ],
                timeline_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()
            .map_err(QuotaError::from)?;

        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commission::Decision;
    use crate::holding::HoldingKey;
    use chrono::Duration;

    #[test]
    fn test_setup_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        setup_database(&conn).unwrap();
    }

    #[test]
    fn test_format_time_sorts_as_text() {
        let t0 = Utc::now();
        let t1 = t0 + Duration::milliseconds(1);
        assert!(format_time(&t0) < format_time(&t1));
        assert!(format_time(&t0).ends_with('Z'));
    }

    #[test]
    fn test_round_trip_all_tables() {
        let store = SqliteStore::open_in_memory().unwrap();
        let key = HoldingKey::new("e1", "cpu");

        let mut holding = Holding::new(&key, "gold");
        holding.imported = 7;
        holding.importing = 2;

        let pending = Commission::new(5, "system", vec![Provision::new("e1", "cpu", 2)]);
        let accepted = Commission::new(4, "system", vec![Provision::new("e1", "cpu", 7)])
            .resolved(Decision::Accept)
            .unwrap();

        store
            .apply(&[
                Change::PutEntity(Entity::new("system", None, "")),
                Change::PutEntity(Entity::new("e1", Some("system"), "k1")),
                Change::PutPolicy(Policy::new(
                    "gold",
                    Limits::uniform(10).with_flags(Flags::overdraft()),
                )),
                Change::PutHolding(holding.clone()),
                Change::PutCommission(pending.clone()),
                Change::PutCommission(accepted.clone()),
                Change::SetNextSerial(6),
            ])
            .unwrap();

        let state = store.load().unwrap();
        assert_eq!(state.entities.len(), 2);
        let e1 = state.entities.iter().find(|e| e.name == "e1").unwrap();
        assert!(e1.verify_key("k1"));
        assert_eq!(e1.owner.as_deref(), Some("system"));

        assert!(state.policies[0].limits.flags.allows_overdraft());
        assert_eq!(state.holdings[0].imported, 7);
        assert_eq!(state.holdings[0].importing, 2);
        assert_eq!(state.commissions.len(), 2);
        assert_eq!(state.commissions[0].state, CommissionState::Accepted);
        assert!(state.commissions[0].resolved_at.is_some());
        assert_eq!(state.commissions[1].provisions, pending.provisions);
        assert_eq!(state.next_serial, 6);
    }

    #[test]
    fn test_next_serial_never_below_stored_commissions() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .apply(&[Change::PutCommission(Commission::new(9, "system", vec![]))])
            .unwrap();
        assert_eq!(store.load().unwrap().next_serial, 10);
    }

    #[test]
    fn test_timeline_window_and_order() {
        let store = SqliteStore::open_in_memory().unwrap();
        let t0 = Utc::now();
        let entries = vec![
            TimelineEntry::new("e1", "cpu", 3, 3, 1, "system", t0),
            TimelineEntry::new("e1", "ram", 4, 4, 1, "system", t0),
            TimelineEntry::new("e1", "cpu", -1, 2, 2, "system", t0 + Duration::seconds(10)),
            TimelineEntry::new("e2", "cpu", 9, 9, 3, "system", t0),
        ];
        let changes: Vec<Change> = entries.into_iter().map(Change::AppendTimeline).collect();
        store.apply(&changes).unwrap();
        assert_eq!(store.timeline_count().unwrap(), 4);

        let all = store.timeline(&TimelineQuery::entity("e1")).unwrap();
        assert_eq!(all.len(), 3);
        // same timestamp keeps append order
        assert_eq!(all[0].resource, "cpu");
        assert_eq!(all[1].resource, "ram");
        assert_eq!(all[2].delta, -1);

        let cpu_late = store
            .timeline(
                &TimelineQuery::entity("e1")
                    .resource("cpu")
                    .after(t0 + Duration::seconds(1)),
            )
            .unwrap();
        assert_eq!(cpu_late.len(), 1);
        assert_eq!(cpu_late[0].usage, 2);

        let early = store
            .timeline(&TimelineQuery::entity("e1").before(t0 + Duration::seconds(1)))
            .unwrap();
        assert_eq!(early.len(), 2);
    }

    #[test]
    fn test_failed_batch_leaves_nothing() {
        let store = SqliteStore::open_in_memory().unwrap();
        let entry = TimelineEntry::new("e1", "cpu", 1, 1, 1, "system", Utc::now());

        // duplicate entry_id violates UNIQUE, so the whole batch rolls back
        let result = store.apply(&[
            Change::PutEntity(Entity::new("e1", Some("system"), "k1")),
            Change::AppendTimeline(entry.clone()),
            Change::AppendTimeline(entry),
        ]);
        assert!(matches!(result, Err(QuotaError::Storage(_))));

        let state = store.load().unwrap();
        assert!(state.entities.is_empty());
        assert_eq!(store.timeline_count().unwrap(), 0);
    }

    #[test]
    fn test_file_database_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quota.db");

        {
            let store = SqliteStore::open(&path).unwrap();
            store
                .apply(&[Change::PutPolicy(Policy::new("gold", Limits::uniform(3)))])
                .unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        let state = store.load().unwrap();
        assert_eq!(state.policies.len(), 1);
        assert_eq!(state.policies[0].limits.capacity, 3);
    }
}
