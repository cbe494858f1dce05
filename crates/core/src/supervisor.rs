// Process supervision with automatic lease management.
//
// The supervisor wraps an agent process: it snapshots the dirty set before
// the child starts, then polls the working tree while the child runs. Paths
// that become dirty during the session get leases acquired on the child's
// behalf; paths that go clean again get released. Leases are renewed while
// held and everything is torn down when the child exits, however it exits.

use std::collections::{BTreeSet, HashMap};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use serde_json::json;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::coordinator::{AcquireOutcome, LockCoordinator};
use crate::identity::{detect_identity, AgentIdentity};
use crate::observer::{resolve_repo_root, DiffSource, GitDiffObserver, SystemCommandRunner};
use crate::store::agents::{AgentStatus, AgentStore};
use crate::store::events::EventLog;
use crate::store::LeaseDb;

/// Knobs for one supervised session.
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// Client override for identity detection (`--client` flag).
    pub client: Option<String>,
    /// The command to supervise, argv style.
    pub command: Vec<String>,
    /// Coordination database path.
    pub db_path: PathBuf,
    /// Working-tree poll cadence.
    pub poll_interval: Duration,
    /// Lease lifetime granted on each acquire and renewal.
    pub ttl: Duration,
    /// Lease description override; defaults to one derived from the client.
    pub description: Option<String>,
    /// Configured background sweep cadence; the effective cadence is never
    /// faster than ten poll periods or 30s.
    pub cleanup_interval: Duration,
    /// Agent heartbeat cadence.
    pub heartbeat_interval: Duration,
    /// Heartbeat silence after which an agent is demoted.
    pub stale_after: Duration,
}

/// Supervises one child process, keeping leases in step with its edits.
pub struct ProcessSupervisor<D: DiffSource> {
    options: SupervisorOptions,
    repo_root: PathBuf,
    diff: D,
}

impl ProcessSupervisor<GitDiffObserver> {
    /// Build a supervisor rooted at the enclosing git work tree (or the
    /// current directory when there is none).
    pub fn new(options: SupervisorOptions) -> Result<Self> {
        let cwd = std::env::current_dir().context("failed to resolve current directory")?;
        let repo_root = resolve_repo_root(&SystemCommandRunner, &cwd);
        let diff = GitDiffObserver::new(repo_root.clone());
        Ok(Self { options, repo_root, diff })
    }
}

impl<D: DiffSource> ProcessSupervisor<D> {
    /// Build a supervisor over an explicit diff source. Used by tests and
    /// by embedders with their own change detection.
    pub fn with_diff_source(options: SupervisorOptions, repo_root: PathBuf, diff: D) -> Self {
        Self { options, repo_root, diff }
    }

    /// Run the supervised command to completion. Returns the exit code the
    /// supervisor itself should exit with.
    pub async fn run(self) -> Result<i32> {
        if self.options.command.is_empty() {
            bail!("no command given to supervise");
        }

        // Pre-session dirty files belong to the human, not this session.
        let baseline = self.diff.dirty_paths();
        debug!(count = baseline.len(), "captured pre-session dirty baseline");

        let env: HashMap<String, String> = std::env::vars().collect();
        let repo_name = self
            .repo_root
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "repo".to_string());
        let identity = detect_identity(
            &env,
            self.options.client.as_deref(),
            &repo_name,
            std::process::id(),
        );
        info!(
            agent = %identity.agent_id,
            client = %identity.client_name,
            root = %self.repo_root.display(),
            "starting supervised session"
        );

        let db = LeaseDb::open(&self.options.db_path)
            .with_context(|| {
                format!("failed to open lease database at `{}`", self.options.db_path.display())
            })?;
        let coordinator = Arc::new(LockCoordinator::recover(db, Utc::now())?);

        // Separate connection for agent presence and events, so heartbeats
        // never contend with the coordinator's critical section.
        let presence = LeaseDb::open(&self.options.db_path)
            .context("failed to open presence connection")?;
        AgentStore::register(
            presence.connection(),
            &identity.agent_id,
            &identity.agent_type,
            Some(&identity.session_label),
            Utc::now(),
        )?;

        let sweeper = coordinator.spawn_sweeper(cleanup_period(
            self.options.poll_interval,
            self.options.cleanup_interval,
        ));

        let mut command = tokio::process::Command::new(&self.options.command[0]);
        command.args(&self.options.command[1..]).current_dir(&self.repo_root);
        for (key, value) in identity.child_env() {
            command.env(key, value);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(error) => {
                let _ = AgentStore::set_status(
                    presence.connection(),
                    &identity.agent_id,
                    AgentStatus::Inactive,
                );
                sweeper.shutdown().await;
                return Err(error).with_context(|| {
                    format!("failed to spawn supervised command `{}`", self.options.command[0])
                });
            }
        };
        let child_pid = child.id();

        let mut auto_locked: BTreeSet<String> = BTreeSet::new();
        let mut signals = TerminationSignals::new()?;

        let mut poll_tick = tokio::time::interval(self.options.poll_interval);
        poll_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut renew_tick = tokio::time::interval(renew_period(self.options.ttl));
        renew_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut heartbeat_tick =
            tokio::time::interval(heartbeat_period(self.options.heartbeat_interval));
        heartbeat_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let status = loop {
            tokio::select! {
                status = child.wait() => {
                    break status.context("failed waiting for supervised process")?;
                }
                _ = poll_tick.tick() => {
                    self.sync_auto_locks(&coordinator, &presence, &identity, &baseline, &mut auto_locked)
                        .await;
                }
                _ = renew_tick.tick() => {
                    renew_held(&coordinator, &identity, &self.options, &mut auto_locked).await;
                }
                _ = heartbeat_tick.tick() => {
                    heartbeat(&presence, &identity, self.options.stale_after);
                }
                sig = signals.recv() => {
                    if let Some(pid) = child_pid {
                        forward_signal(pid, sig);
                    }
                }
            }
        };

        let exit_code = exit_code_from(&status);
        info!(exit_code, "supervised process exited");

        let released = coordinator.release_all_for(&identity.agent_id, Utc::now()).await;
        if let Err(error) = EventLog::append(
            presence.connection(),
            "auto_lock_released_exit",
            Some(&identity.agent_id),
            Some(json!({ "released": released, "exit_code": exit_code })),
            Utc::now(),
        ) {
            warn!(?error, "failed to append session-exit event");
        }
        if let Err(error) = AgentStore::set_status(
            presence.connection(),
            &identity.agent_id,
            AgentStatus::Inactive,
        ) {
            warn!(?error, "failed to demote agent on exit");
        }
        sweeper.shutdown().await;

        Ok(exit_code)
    }

    /// Bring the auto-lease set in line with the current dirty set:
    /// acquire leases for newly dirty session paths, release leases on
    /// paths that have gone clean again.
    async fn sync_auto_locks(
        &self,
        coordinator: &LockCoordinator,
        presence: &LeaseDb,
        identity: &AgentIdentity,
        baseline: &BTreeSet<String>,
        auto_locked: &mut BTreeSet<String>,
    ) {
        let session = session_delta(baseline, &self.diff.dirty_paths());

        let to_acquire: Vec<String> = session.difference(auto_locked).cloned().collect();
        let to_release: Vec<String> = auto_locked.difference(&session).cloned().collect();

        let description = lock_description(&identity.client_name, self.options.description.as_deref());
        let ttl = chrono::Duration::from_std(self.options.ttl)
            .unwrap_or_else(|_| chrono::Duration::seconds(1800));

        for path in to_acquire {
            let now = Utc::now();
            match coordinator.acquire(&path, &identity.agent_id, &description, ttl, now).await {
                Ok(AcquireOutcome::Granted) => {
                    auto_locked.insert(path.clone());
                    info!(path, "auto-acquired lease for session edit");
                    if let Err(error) = EventLog::append(
                        presence.connection(),
                        "auto_lock_acquired",
                        Some(&identity.agent_id),
                        Some(json!({ "file": path })),
                        now,
                    ) {
                        warn!(?error, "failed to append auto-acquire event");
                    }
                }
                Ok(AcquireOutcome::Renewed) => {
                    auto_locked.insert(path);
                }
                Ok(AcquireOutcome::Denied { holder, .. }) => {
                    warn!(path, holder, "edit conflicts with another agent's lease");
                    if let Err(error) = EventLog::append(
                        presence.connection(),
                        "auto_lock_conflict",
                        Some(&identity.agent_id),
                        Some(json!({ "file": path, "holder": holder })),
                        Utc::now(),
                    ) {
                        warn!(?error, "failed to append conflict event");
                    }
                }
                Err(error) => {
                    warn!(?error, path, "auto-acquire failed");
                }
            }
        }

        for path in to_release {
            let now = Utc::now();
            // Whatever the store says, this path is no longer ours to track.
            auto_locked.remove(&path);
            match coordinator.release(&path, &identity.agent_id, now).await {
                Ok(true) => {
                    info!(path, "released lease after path went clean");
                    if let Err(error) = EventLog::append(
                        presence.connection(),
                        "auto_lock_released_clean",
                        Some(&identity.agent_id),
                        Some(json!({ "file": path })),
                        now,
                    ) {
                        warn!(?error, "failed to append clean-release event");
                    }
                }
                Ok(false) => {
                    debug!(path, "lease already gone at clean-release time");
                }
                Err(error) => {
                    warn!(?error, path, "clean-release failed");
                }
            }
        }
    }
}

async fn renew_held(
    coordinator: &LockCoordinator,
    identity: &AgentIdentity,
    options: &SupervisorOptions,
    auto_locked: &mut BTreeSet<String>,
) {
    let description = lock_description(&identity.client_name, options.description.as_deref());
    let ttl = chrono::Duration::from_std(options.ttl)
        .unwrap_or_else(|_| chrono::Duration::seconds(1800));

    let held: Vec<String> = auto_locked.iter().cloned().collect();
    for path in held {
        match coordinator.acquire(&path, &identity.agent_id, &description, ttl, Utc::now()).await {
            Ok(AcquireOutcome::Renewed) | Ok(AcquireOutcome::Granted) => {}
            Ok(AcquireOutcome::Denied { holder, .. }) => {
                warn!(path, holder, "lease lost to another agent during renewal");
                auto_locked.remove(&path);
            }
            Err(error) => {
                warn!(?error, path, "lease renewal failed");
            }
        }
    }
}

fn heartbeat(presence: &LeaseDb, identity: &AgentIdentity, stale_after: Duration) {
    let now = Utc::now();
    if let Err(error) = AgentStore::touch(presence.connection(), &identity.agent_id, now) {
        warn!(?error, "agent heartbeat failed");
    }
    let cutoff = now
        - chrono::Duration::from_std(stale_after).unwrap_or_else(|_| chrono::Duration::seconds(90));
    match AgentStore::mark_stale_inactive(presence.connection(), cutoff) {
        Ok(0) | Err(_) => {}
        Ok(demoted) => debug!(demoted, "demoted stale agents"),
    }
}

/// Paths dirty now that were not dirty before the session started.
fn session_delta(baseline: &BTreeSet<String>, dirty: &BTreeSet<String>) -> BTreeSet<String> {
    dirty.difference(baseline).cloned().collect()
}

/// Renewal cadence: half the TTL, clamped to [3s, 60s].
fn renew_period(ttl: Duration) -> Duration {
    Duration::from_secs((ttl.as_secs() / 2).clamp(3, 60))
}

/// Heartbeat cadence floor of 2s keeps a misconfigured zero from spinning.
fn heartbeat_period(interval: Duration) -> Duration {
    interval.max(Duration::from_secs(2))
}

/// Sweep cadence: the configured interval, but never faster than ten poll
/// periods and never under 30s.
fn cleanup_period(poll_interval: Duration, configured: Duration) -> Duration {
    configured.max(poll_interval * 10).max(Duration::from_secs(30))
}

fn lock_description(client_name: &str, override_text: Option<&str>) -> String {
    match override_text {
        Some(text) if !text.trim().is_empty() => text.trim().to_string(),
        _ => format!("{client_name} session edit"),
    }
}

fn exit_code_from(status: &std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ForwardSignal {
    Interrupt,
    Terminate,
}

#[cfg(unix)]
struct TerminationSignals {
    interrupt: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl TerminationSignals {
    fn new() -> io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    async fn recv(&mut self) -> ForwardSignal {
        tokio::select! {
            _ = self.interrupt.recv() => ForwardSignal::Interrupt,
            _ = self.terminate.recv() => ForwardSignal::Terminate,
        }
    }
}

#[cfg(not(unix))]
struct TerminationSignals;

#[cfg(not(unix))]
impl TerminationSignals {
    fn new() -> io::Result<Self> {
        Ok(Self)
    }

    async fn recv(&mut self) -> ForwardSignal {
        std::future::pending().await
    }
}

#[cfg(unix)]
fn forward_signal(pid: u32, sig: ForwardSignal) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let signal = match sig {
        ForwardSignal::Interrupt => Signal::SIGINT,
        ForwardSignal::Terminate => Signal::SIGTERM,
    };
    info!(pid, signal = %signal, "forwarding termination signal to supervised process");
    if let Err(error) = kill(Pid::from_raw(pid as i32), signal) {
        warn!(?error, pid, "failed to forward signal");
    }
}

#[cfg(not(unix))]
fn forward_signal(_pid: u32, _sig: ForwardSignal) {}
