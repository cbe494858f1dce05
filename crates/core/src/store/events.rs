// Append-only event log.
//
// Coordination milestones (acquire, release, conflict) land here so other
// agents and humans can reconstruct what happened. Appends are
// fire-and-observe: callers log failures and move on.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord {
    pub event_type: String,
    pub agent_id: Option<String>,
    pub details: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

pub struct EventLog;

impl EventLog {
    pub fn append(
        conn: &Connection,
        event_type: &str,
        agent_id: Option<&str>,
        details: Option<serde_json::Value>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let details_json = match details {
            Some(value) => Some(
                serde_json::to_string(&value).context("failed to encode event details")?,
            ),
            None => None,
        };
        conn.execute(
            "INSERT INTO event_log (event_type, agent_id, details, created_at) \
             VALUES (?1, ?2, ?3, ?4)",
            params![event_type, agent_id, details_json, now.to_rfc3339()],
        )
        .context("failed to append event")?;
        Ok(())
    }

    /// Most recent events first.
    pub fn recent(conn: &Connection, limit: usize) -> Result<Vec<EventRecord>> {
        let mut stmt = conn
            .prepare(
                "SELECT event_type, agent_id, details, created_at \
                 FROM event_log ORDER BY id DESC LIMIT ?1",
            )
            .context("failed to prepare event query")?;

        let rows = stmt
            .query_map(params![limit as i64], |row| {
                let details_raw: Option<String> = row.get(2)?;
                let created_raw: String = row.get(3)?;
                Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?, details_raw, created_raw))
            })
            .context("failed to query events")?;

        let mut events = Vec::new();
        for row in rows {
            let (event_type, agent_id, details_raw, created_raw) =
                row.context("failed to decode event row")?;
            let details = match details_raw {
                Some(raw) => Some(
                    serde_json::from_str(&raw)
                        .with_context(|| format!("invalid event details `{raw}`"))?,
                ),
                None => None,
            };
            let created_at = created_raw
                .parse::<DateTime<Utc>>()
                .with_context(|| format!("invalid event timestamp `{created_raw}`"))?;
            events.push(EventRecord { event_type, agent_id, details, created_at });
        }

        Ok(events)
    }
}
