// Lease-based lock coordination.
//
// One in-memory table of active leases plus the durable store, both behind
// a single async mutex: every check-then-act sequence, including its SQLite
// write, runs as one exclusive critical section. The durable write always
// precedes the in-memory mutation, so a failed write aborts the operation
// and a restart can never lose a lease another process believes it holds.
//
// Expiry is enforced lazily on every read and acquire; the background
// sweeper only keeps the tables tidy.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::store::events::EventLog;
use crate::store::leases::{Lease, LeaseStore};
use crate::store::LeaseDb;

/// Result of an acquire attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// A fresh lease was granted.
    Granted,
    /// The caller already held the lease; its expiry was extended.
    Renewed,
    /// Another agent holds an unexpired lease.
    Denied {
        holder: String,
        description: String,
        acquired_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    },
}

struct CoordinatorInner {
    db: LeaseDb,
    leases: HashMap<String, Lease>,
}

/// Mutual-exclusion manager for file-path leases.
pub struct LockCoordinator {
    inner: Mutex<CoordinatorInner>,
}

impl LockCoordinator {
    /// Startup recovery: seed the in-memory table from rows the store still
    /// reports active, discarding any already past expiry.
    pub fn recover(db: LeaseDb, now: DateTime<Utc>) -> Result<Self> {
        let mut leases = HashMap::new();
        for lease in LeaseStore::list_active(db.connection())? {
            if lease.is_expired_at(now) {
                continue;
            }
            leases.insert(lease.resource_path.clone(), lease);
        }
        info!(count = leases.len(), "restored active leases from store");
        Ok(Self { inner: Mutex::new(CoordinatorInner { db, leases }) })
    }

    /// Acquire or renew a lease on `resource_path`.
    pub async fn acquire(
        &self,
        resource_path: &str,
        agent_id: &str,
        description: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<AcquireOutcome> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;

        if let Some(existing) = inner.leases.get(resource_path) {
            if !existing.is_expired_at(now) {
                if existing.agent_id == agent_id {
                    let expires_at = now + ttl;
                    let renewed = Lease { expires_at, ..existing.clone() };
                    if !LeaseStore::update_expiry(inner.db.connection(), resource_path, expires_at)?
                    {
                        // The active row was swept underneath a live holder;
                        // recreate it rather than failing the renewal.
                        LeaseStore::upsert_active(inner.db.connection(), &renewed)?;
                    }
                    inner.leases.insert(resource_path.to_string(), renewed);
                    debug!(path = resource_path, agent = agent_id, "lease renewed");
                    return Ok(AcquireOutcome::Renewed);
                }

                warn!(path = resource_path, holder = %existing.agent_id, "lease denied");
                return Ok(AcquireOutcome::Denied {
                    holder: existing.agent_id.clone(),
                    description: existing.description.clone(),
                    acquired_at: existing.acquired_at,
                    expires_at: existing.expires_at,
                });
            }

            debug!(path = resource_path, "lease past expiry, evicting before grant");
            inner.leases.remove(resource_path);
        }

        let lease = Lease {
            resource_path: resource_path.to_string(),
            agent_id: agent_id.to_string(),
            description: description.to_string(),
            acquired_at: now,
            expires_at: now + ttl,
        };
        LeaseStore::upsert_active(inner.db.connection(), &lease)?;
        inner.leases.insert(resource_path.to_string(), lease);

        if let Err(error) = EventLog::append(
            inner.db.connection(),
            "lock_acquired",
            Some(agent_id),
            Some(json!({ "file": resource_path, "description": description })),
            now,
        ) {
            warn!(?error, "failed to append lock_acquired event");
        }
        info!(path = resource_path, agent = agent_id, "lease granted");
        Ok(AcquireOutcome::Granted)
    }

    /// Release a lease. Only the current holder may release; a missing or
    /// foreign-held path is a no-op `false`, never an error.
    pub async fn release(
        &self,
        resource_path: &str,
        agent_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;

        let Some(existing) = inner.leases.get(resource_path) else {
            warn!(path = resource_path, agent = agent_id, "release of unheld path ignored");
            return Ok(false);
        };
        if existing.agent_id != agent_id {
            warn!(
                path = resource_path,
                agent = agent_id,
                holder = %existing.agent_id,
                "release by non-holder ignored"
            );
            return Ok(false);
        }

        let flipped = LeaseStore::mark_released(inner.db.connection(), resource_path, agent_id, now)?;
        if !flipped {
            debug!(path = resource_path, "no active row to release; store already demoted it");
        }
        inner.leases.remove(resource_path);

        if let Err(error) = EventLog::append(
            inner.db.connection(),
            "lock_released",
            Some(agent_id),
            Some(json!({ "file": resource_path })),
            now,
        ) {
            warn!(?error, "failed to append lock_released event");
        }
        info!(path = resource_path, agent = agent_id, "lease released");
        Ok(true)
    }

    /// Current lease on a path, if any. A logically expired entry found
    /// here is evicted on the spot.
    pub async fn query(&self, resource_path: &str, now: DateTime<Utc>) -> Option<Lease> {
        let mut inner = self.inner.lock().await;
        let expired = inner.leases.get(resource_path).map(|lease| lease.is_expired_at(now));
        match expired {
            Some(true) => {
                inner.leases.remove(resource_path);
                None
            }
            Some(false) => inner.leases.get(resource_path).cloned(),
            None => None,
        }
    }

    /// Snapshot of all unexpired leases, sorted by path.
    pub async fn list_all(&self, now: DateTime<Utc>) -> Vec<Lease> {
        let mut inner = self.inner.lock().await;
        purge_expired(&mut inner.leases, now);
        let mut leases: Vec<Lease> = inner.leases.values().cloned().collect();
        leases.sort_by(|a, b| a.resource_path.cmp(&b.resource_path));
        leases
    }

    /// Snapshot of one agent's unexpired leases, sorted by path.
    pub async fn list_by_holder(&self, agent_id: &str, now: DateTime<Utc>) -> Vec<Lease> {
        let mut inner = self.inner.lock().await;
        purge_expired(&mut inner.leases, now);
        let mut leases: Vec<Lease> = inner
            .leases
            .values()
            .filter(|lease| lease.agent_id == agent_id)
            .cloned()
            .collect();
        leases.sort_by(|a, b| a.resource_path.cmp(&b.resource_path));
        leases
    }

    /// Best-effort bulk release for session teardown. Returns how many
    /// entries were dropped from the table.
    pub async fn release_all_for(&self, agent_id: &str, now: DateTime<Utc>) -> usize {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;

        let held: Vec<String> = inner
            .leases
            .iter()
            .filter(|(_, lease)| lease.agent_id == agent_id)
            .map(|(path, _)| path.clone())
            .collect();

        for path in &held {
            if let Err(error) =
                LeaseStore::mark_released(inner.db.connection(), path, agent_id, now)
            {
                warn!(?error, path, "best-effort release failed in store");
            }
            inner.leases.remove(path);
        }

        info!(agent = agent_id, count = held.len(), "released all leases for agent");
        held.len()
    }

    /// Number of unexpired leases.
    pub async fn active_count(&self, now: DateTime<Utc>) -> usize {
        let mut inner = self.inner.lock().await;
        purge_expired(&mut inner.leases, now);
        inner.leases.len()
    }

    /// One sweep pass: purge expired entries from memory and flip matching
    /// store rows to `expired`. Returns the store-side count.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        purge_expired(&mut inner.leases, now);
        LeaseStore::sweep_expired(inner.db.connection(), now)
    }

    /// Start the periodic sweep task. Liveness only — the lazy-expiry
    /// checks above keep the invariants even if this never runs.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: StdDuration) -> SweeperHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let coordinator = Arc::clone(self);

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        match coordinator.sweep_once(Utc::now()).await {
                            Ok(0) => {}
                            Ok(count) => info!(count, "swept expired leases"),
                            Err(error) => warn!(?error, "lease sweep failed"),
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        });

        SweeperHandle { shutdown_tx, task }
    }
}

/// Handle for the background sweep task.
pub struct SweeperHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Stop the sweeper, waiting out any in-flight iteration.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.task.await;
    }
}

fn purge_expired(leases: &mut HashMap<String, Lease>, now: DateTime<Utc>) {
    leases.retain(|_, lease| !lease.is_expired_at(now));
}
