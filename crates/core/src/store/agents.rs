// Agent registry: presence metadata for coordinating processes.
//
// Liveness is heartbeat-driven: the supervisor touches its own row and
// demotes rows whose `last_active` has gone stale.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentStatus {
    Active,
    Inactive,
}

impl AgentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "inactive" => Some(Self::Inactive),
            _ => None,
        }
    }
}

/// A registered agent process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentRecord {
    pub agent_id: String,
    pub agent_type: String,
    pub session_label: Option<String>,
    pub registered_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    pub status: AgentStatus,
}

/// Stateless operations on the `agents` table.
pub struct AgentStore;

impl AgentStore {
    /// Register an agent, reactivating an existing row for the same id.
    pub fn register(
        conn: &Connection,
        agent_id: &str,
        agent_type: &str,
        session_label: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        conn.execute(
            "INSERT INTO agents (agent_id, agent_type, session_label, registered_at, last_active, status) \
             VALUES (?1, ?2, ?3, ?4, ?4, 'active') \
             ON CONFLICT(agent_id) DO UPDATE SET \
               agent_type = excluded.agent_type, \
               session_label = excluded.session_label, \
               last_active = excluded.last_active, \
               status = 'active'",
            params![agent_id, agent_type, session_label, now.to_rfc3339()],
        )
        .context("failed to register agent")?;
        Ok(())
    }

    pub fn get(conn: &Connection, agent_id: &str) -> Result<Option<AgentRecord>> {
        let mut stmt = conn
            .prepare(
                "SELECT agent_id, agent_type, session_label, registered_at, last_active, status \
                 FROM agents WHERE agent_id = ?1",
            )
            .context("failed to prepare agent query")?;

        let mut rows = stmt
            .query_map(params![agent_id], row_to_agent)
            .context("failed to query agent")?;

        match rows.next() {
            Some(row) => Ok(Some(row.context("failed to decode agent row")?)),
            None => Ok(None),
        }
    }

    /// Heartbeat: bump `last_active`.
    pub fn touch(conn: &Connection, agent_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let changed = conn
            .execute(
                "UPDATE agents SET last_active = ?1 WHERE agent_id = ?2",
                params![now.to_rfc3339(), agent_id],
            )
            .context("failed to touch agent")?;
        Ok(changed > 0)
    }

    pub fn set_status(conn: &Connection, agent_id: &str, status: AgentStatus) -> Result<bool> {
        let changed = conn
            .execute(
                "UPDATE agents SET status = ?1 WHERE agent_id = ?2",
                params![status.as_str(), agent_id],
            )
            .context("failed to update agent status")?;
        Ok(changed > 0)
    }

    /// Demote active agents whose heartbeat stopped before `cutoff`.
    pub fn mark_stale_inactive(conn: &Connection, cutoff: DateTime<Utc>) -> Result<usize> {
        let demoted = conn
            .execute(
                "UPDATE agents SET status = 'inactive' \
                 WHERE status = 'active' AND last_active < ?1",
                params![cutoff.to_rfc3339()],
            )
            .context("failed to demote stale agents")?;
        Ok(demoted)
    }

    pub fn list_active(conn: &Connection) -> Result<Vec<AgentRecord>> {
        let mut stmt = conn
            .prepare(
                "SELECT agent_id, agent_type, session_label, registered_at, last_active, status \
                 FROM agents WHERE status = 'active' \
                 ORDER BY last_active DESC",
            )
            .context("failed to prepare active agents query")?;

        let rows = stmt.query_map([], row_to_agent).context("failed to query active agents")?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .context("failed to collect active agents")
    }
}

fn row_to_agent(row: &rusqlite::Row<'_>) -> rusqlite::Result<AgentRecord> {
    let registered_raw: String = row.get(3)?;
    let active_raw: String = row.get(4)?;
    let status_raw: String = row.get(5)?;

    let registered_at = registered_raw.parse::<DateTime<Utc>>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let last_active = active_raw.parse::<DateTime<Utc>>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let status = AgentStatus::parse(&status_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            5,
            rusqlite::types::Type::Text,
            format!("invalid agent status `{status_raw}`").into(),
        )
    })?;

    Ok(AgentRecord {
        agent_id: row.get(0)?,
        agent_type: row.get(1)?,
        session_label: row.get(2)?,
        registered_at,
        last_active,
        status,
    })
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::{SystemTime, UNIX_EPOCH};

    use chrono::{Duration, TimeZone, Utc};

    use super::{AgentStatus, AgentStore};
    use crate::store::db::LeaseDb;

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    fn setup() -> (LeaseDb, PathBuf) {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("time should work")
            .as_nanos();
        let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
        let path = std::env::temp_dir().join(format!("leasehold-agents-{nanos}-{seq}.db"));
        let db = LeaseDb::open(&path).expect("lease db should open");
        (db, path)
    }

    fn cleanup(path: &PathBuf) {
        let s = path.display().to_string();
        let _ = std::fs::remove_file(path);
        let _ = std::fs::remove_file(format!("{s}-wal"));
        let _ = std::fs::remove_file(format!("{s}-shm"));
    }

    fn ts(seconds: i64) -> chrono::DateTime<Utc> {
        Utc.timestamp_opt(seconds, 0).single().expect("timestamp should be valid")
    }

    #[test]
    fn register_and_get() {
        let (db, path) = setup();
        let now = ts(1_700_000_000);

        AgentStore::register(db.connection(), "claude-host-42-abc123", "claude", Some("s1"), now)
            .expect("register should succeed");

        let agent = AgentStore::get(db.connection(), "claude-host-42-abc123")
            .expect("get should succeed")
            .expect("agent should exist");
        assert_eq!(agent.agent_type, "claude");
        assert_eq!(agent.session_label.as_deref(), Some("s1"));
        assert_eq!(agent.status, AgentStatus::Active);
        assert_eq!(agent.registered_at, now);

        drop(db);
        cleanup(&path);
    }

    #[test]
    fn register_reactivates_existing_row() {
        let (db, path) = setup();
        let t1 = ts(1_700_000_100);
        let t2 = ts(1_700_000_200);

        AgentStore::register(db.connection(), "a1", "codex", None, t1).unwrap();
        AgentStore::set_status(db.connection(), "a1", AgentStatus::Inactive).unwrap();
        AgentStore::register(db.connection(), "a1", "codex", Some("retry"), t2).unwrap();

        let agent = AgentStore::get(db.connection(), "a1").unwrap().unwrap();
        assert_eq!(agent.status, AgentStatus::Active);
        assert_eq!(agent.last_active, t2);
        assert_eq!(agent.registered_at, t1); // original registration kept

        drop(db);
        cleanup(&path);
    }

    #[test]
    fn stale_sweep_demotes_only_silent_agents() {
        let (db, path) = setup();
        let old = ts(1_700_000_000);
        let recent = ts(1_700_000_300);

        AgentStore::register(db.connection(), "quiet", "claude", None, old).unwrap();
        AgentStore::register(db.connection(), "chatty", "codex", None, old).unwrap();
        AgentStore::touch(db.connection(), "chatty", recent).unwrap();

        let demoted =
            AgentStore::mark_stale_inactive(db.connection(), ts(1_700_000_100)).unwrap();
        assert_eq!(demoted, 1);

        let active = AgentStore::list_active(db.connection()).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].agent_id, "chatty");

        drop(db);
        cleanup(&path);
    }

    #[test]
    fn touch_missing_agent_returns_false() {
        let (db, path) = setup();
        let touched = AgentStore::touch(db.connection(), "nobody", ts(1_700_000_400)).unwrap();
        assert!(!touched);
        drop(db);
        cleanup(&path);
    }

    #[test]
    fn demoted_agent_can_heartbeat_back_via_register() {
        let (db, path) = setup();
        let now = ts(1_700_000_500);

        AgentStore::register(db.connection(), "a1", "claude", None, now).unwrap();
        let _ = AgentStore::mark_stale_inactive(db.connection(), now + Duration::seconds(600))
            .unwrap();
        assert!(AgentStore::list_active(db.connection()).unwrap().is_empty());

        AgentStore::register(db.connection(), "a1", "claude", None, now + Duration::seconds(700))
            .unwrap();
        assert_eq!(AgentStore::list_active(db.connection()).unwrap().len(), 1);

        drop(db);
        cleanup(&path);
    }
}
