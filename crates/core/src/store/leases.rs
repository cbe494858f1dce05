// Durable lease rows.
//
// Rows are never deleted: a lease leaves `active` by flipping to
// `released` or `expired`, keeping the full acquisition history.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

/// Durable lease status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseStatus {
    Active,
    Released,
    Expired,
}

impl LeaseStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Released => "released",
            Self::Expired => "expired",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "released" => Some(Self::Released),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }
}

/// A time-bounded exclusive claim on a file path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub resource_path: String,
    pub agent_id: String,
    pub description: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    /// A lease at or past its expiry is treated as absent on every read
    /// path, whether or not the sweep has demoted it yet.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Stateless operations on the `file_leases` table.
pub struct LeaseStore;

impl LeaseStore {
    /// Insert a fresh active lease row for a path.
    ///
    /// An existing active row whose expiry has already passed is demoted to
    /// `expired` first (takeover of a stale, unswept lease). If another
    /// process holds a genuinely active row, the partial unique index makes
    /// the insert fail and the grant must be aborted.
    pub fn upsert_active(conn: &Connection, lease: &Lease) -> Result<i64> {
        conn.execute(
            "UPDATE file_leases SET status = 'expired' \
             WHERE resource_path = ?1 AND status = 'active' AND expires_at <= ?2",
            params![lease.resource_path, lease.acquired_at.to_rfc3339()],
        )
        .context("failed to demote stale active lease row")?;

        conn.execute(
            "INSERT INTO file_leases \
             (resource_path, agent_id, description, acquired_at, expires_at, status) \
             VALUES (?1, ?2, ?3, ?4, ?5, 'active')",
            params![
                lease.resource_path,
                lease.agent_id,
                lease.description,
                lease.acquired_at.to_rfc3339(),
                lease.expires_at.to_rfc3339(),
            ],
        )
        .context("failed to insert active lease row")?;

        Ok(conn.last_insert_rowid())
    }

    /// Extend the expiry of the active row for a path. Returns `false`
    /// when no active row exists.
    pub fn update_expiry(
        conn: &Connection,
        resource_path: &str,
        new_expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let changed = conn
            .execute(
                "UPDATE file_leases SET expires_at = ?1 \
                 WHERE resource_path = ?2 AND status = 'active'",
                params![new_expires_at.to_rfc3339(), resource_path],
            )
            .context("failed to update lease expiry")?;
        Ok(changed > 0)
    }

    /// Flip the active row for a path to `released`, holder-checked.
    pub fn mark_released(
        conn: &Connection,
        resource_path: &str,
        agent_id: &str,
        released_at: DateTime<Utc>,
    ) -> Result<bool> {
        let changed = conn
            .execute(
                "UPDATE file_leases SET status = 'released', released_at = ?1 \
                 WHERE resource_path = ?2 AND agent_id = ?3 AND status = 'active'",
                params![released_at.to_rfc3339(), resource_path, agent_id],
            )
            .context("failed to mark lease released")?;
        Ok(changed > 0)
    }

    /// All rows the store still considers active, including ones whose
    /// expiry has logically passed — the caller filters by `now`.
    pub fn list_active(conn: &Connection) -> Result<Vec<Lease>> {
        let mut stmt = conn
            .prepare(
                "SELECT resource_path, agent_id, description, acquired_at, expires_at \
                 FROM file_leases WHERE status = 'active' \
                 ORDER BY resource_path",
            )
            .context("failed to prepare active lease query")?;

        let rows = stmt
            .query_map([], row_to_lease)
            .context("failed to query active leases")?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .context("failed to collect active leases")
    }

    /// Flip active rows past their expiry to `expired`; returns the count.
    pub fn sweep_expired(conn: &Connection, now: DateTime<Utc>) -> Result<usize> {
        let flipped = conn
            .execute(
                "UPDATE file_leases SET status = 'expired' \
                 WHERE status = 'active' AND expires_at <= ?1",
                params![now.to_rfc3339()],
            )
            .context("failed to sweep expired leases")?;
        Ok(flipped)
    }
}

fn row_to_lease(row: &rusqlite::Row<'_>) -> rusqlite::Result<Lease> {
    let acquired_raw: String = row.get(3)?;
    let expires_raw: String = row.get(4)?;

    let acquired_at = acquired_raw.parse::<DateTime<Utc>>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let expires_at = expires_raw.parse::<DateTime<Utc>>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(Lease {
        resource_path: row.get(0)?,
        agent_id: row.get(1)?,
        description: row.get(2)?,
        acquired_at,
        expires_at,
    })
}
