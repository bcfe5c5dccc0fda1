// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Master/slave lifecycle.
//!
//! One MGM is the read/write master; peers follow the namespace
//! change-log read-only. A 1 Hz supervisor watches the peer and derives
//! the global access policy (write redirects to the master, write stalls
//! while no master is reachable, a hard stall on the dual-master
//! situation and on metadata-disk exhaustion). Operator-driven
//! transitions move a process between `slave-ro`, `master-rw` and the
//! intermediate `master-ro`; online compaction of the change-log runs
//! only on the master and is gated by peers mid-transition.
//!
//! The presence of the master lock file on disk is authoritative for the
//! boot-time role.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::application::access::{AccessControl, RuleKind};
use crate::infrastructure::changelog::{ChangelogError, ChangelogKind, ChangelogStore};
use crate::infrastructure::namespace::Namespace;

const MASTER_LOCK_FILE: &str = "master.mgm.lock";
const MQ_REMOTE_LOCK_FILE: &str = "mq.remote.lock";

/// Write stall installed while no master serves or during transitions.
const WRITE_STALL_SECS: u32 = 60;

/// Catch-all stall while a former master re-boots as follower.
const TRANSITION_STALL_SECS: u32 = 100;

#[derive(Debug, Error)]
pub enum MasterError {
    #[error("not a slave")]
    NotSlave,

    #[error("not a master")]
    NotMaster,

    #[error("changelog sizes diverge (local {local:?}, remote {remote:?})")]
    ChangelogMismatch {
        local: (u64, u64),
        remote: (u64, u64),
    },

    #[error("compaction already running")]
    CompactionBusy,

    #[error("compaction blocked by peer transition")]
    CompactionBlocked,

    #[error(transparent)]
    Changelog(#[from] ChangelogError),

    #[error("master io: {0}")]
    Io(#[from] std::io::Error),

    #[error("fatal: on-disk state diverged from memory after commit: {0}")]
    FatalCompaction(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterRole {
    MasterRw,
    MasterRo,
    SlaveRo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunningState {
    Nothing,
    Transition,
    MasterRw,
    MasterRo,
    SlaveRo,
}

/// What the supervisor and the transitions need from the peer MGM. The
/// production endpoint talks over the admin channel; tests use
/// [`StaticPeer`].
#[async_trait]
pub trait PeerEndpoint: Send + Sync {
    /// 1-second ping of the peer MGM.
    async fn ping_mgm(&self) -> bool;

    /// 1-second ping of the peer message broker.
    async fn ping_mq(&self) -> bool;

    /// Stat probe deciding whether the peer claims master-rw.
    async fn is_master_rw(&self) -> Option<bool>;

    /// Sizes of the peer's (files, directories) change-logs.
    async fn changelog_sizes(&self) -> Option<(u64, u64)>;

    /// Ask the remote master to redirect traffic to us.
    async fn signal_bounce(&self) -> bool;

    /// Ask the remote to re-open the new changelog files.
    async fn signal_reload(&self) -> bool;
}

/// Shared gate refusing drain/balance admission during the post-promotion
/// barrier. The balancer and the transfer scheduler hold clones.
#[derive(Debug, Clone, Default)]
pub struct AdmissionGate {
    blocked_until: Arc<Mutex<Option<Instant>>>,
}

impl AdmissionGate {
    pub fn block_for(&self, duration: Duration) {
        *self.blocked_until.lock() = Some(Instant::now() + duration);
    }

    pub fn clear(&self) {
        *self.blocked_until.lock() = None;
    }

    pub fn allowed(&self) -> bool {
        self.blocked_until
            .lock()
            .map_or(true, |until| Instant::now() >= until)
    }
}

/// Scriptable peer used in tests and single-node deployments.
#[derive(Debug, Default)]
pub struct StaticPeer {
    pub reachable: std::sync::atomic::AtomicBool,
    pub mq_reachable: std::sync::atomic::AtomicBool,
    pub master_rw: std::sync::atomic::AtomicBool,
    pub sizes: Mutex<Option<(u64, u64)>>,
    pub bounces: std::sync::atomic::AtomicU64,
    pub reloads: std::sync::atomic::AtomicU64,
}

#[async_trait]
impl PeerEndpoint for StaticPeer {
    async fn ping_mgm(&self) -> bool {
        self.reachable.load(std::sync::atomic::Ordering::SeqCst)
    }

    async fn ping_mq(&self) -> bool {
        self.mq_reachable.load(std::sync::atomic::Ordering::SeqCst)
    }

    async fn is_master_rw(&self) -> Option<bool> {
        self.reachable
            .load(std::sync::atomic::Ordering::SeqCst)
            .then(|| self.master_rw.load(std::sync::atomic::Ordering::SeqCst))
    }

    async fn changelog_sizes(&self) -> Option<(u64, u64)> {
        *self.sizes.lock()
    }

    async fn signal_bounce(&self) -> bool {
        self.bounces
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        true
    }

    async fn signal_reload(&self) -> bool {
        self.reloads
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        true
    }
}

/// Managed auxiliary services the role transitions start and stop: the
/// namespace remote-sync daemon feeding followers and the recycler that
/// only runs on the writing master. Both live outside the core; the
/// production implementation drives the service manager.
#[async_trait]
pub trait AuxiliaryServices: Send + Sync {
    async fn start_sync(&self) -> bool;
    async fn stop_sync(&self) -> bool;
    async fn start_recycler(&self) -> bool;
    async fn stop_recycler(&self) -> bool;
}

/// Default implementation logging the requested service actions.
pub struct LoggingServices;

#[async_trait]
impl AuxiliaryServices for LoggingServices {
    async fn start_sync(&self) -> bool {
        info!("starting namespace sync daemon");
        true
    }

    async fn stop_sync(&self) -> bool {
        info!("stopping namespace sync daemon");
        true
    }

    async fn start_recycler(&self) -> bool {
        info!("starting recycler");
        true
    }

    async fn stop_recycler(&self) -> bool {
        info!("stopping recycler");
        true
    }
}

/// Recording implementation for tests.
#[derive(Debug, Default)]
pub struct StaticServices {
    pub sync_running: std::sync::atomic::AtomicBool,
    pub recycler_running: std::sync::atomic::AtomicBool,
    pub sync_restarts: std::sync::atomic::AtomicU64,
}

#[async_trait]
impl AuxiliaryServices for StaticServices {
    async fn start_sync(&self) -> bool {
        self.sync_running
            .store(true, std::sync::atomic::Ordering::SeqCst);
        self.sync_restarts
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        true
    }

    async fn stop_sync(&self) -> bool {
        self.sync_running
            .store(false, std::sync::atomic::Ordering::SeqCst);
        true
    }

    async fn start_recycler(&self) -> bool {
        self.recycler_running
            .store(true, std::sync::atomic::Ordering::SeqCst);
        true
    }

    async fn stop_recycler(&self) -> bool {
        self.recycler_running
            .store(false, std::sync::atomic::Ordering::SeqCst);
        true
    }
}

#[derive(Debug, Clone)]
pub struct MasterConfig {
    pub this_host: String,
    pub remote_host: Option<String>,
    pub remote_port: u16,

    /// Directory holding change-logs and the lock files.
    pub metadata_dir: PathBuf,

    pub supervisor_interval: Duration,

    /// Free-space floor on the metadata partition.
    pub disk_full_threshold: u64,

    /// Draining/balancing admission block after a promotion.
    pub promotion_block: Duration,
}

impl MasterConfig {
    pub fn new(this_host: impl Into<String>, metadata_dir: impl Into<PathBuf>) -> Self {
        Self {
            this_host: this_host.into(),
            remote_host: None,
            remote_port: 1094,
            metadata_dir: metadata_dir.into(),
            supervisor_interval: Duration::from_secs(1),
            disk_full_threshold: 100 * 1024 * 1024,
            promotion_block: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug)]
struct MasterState {
    role: MasterRole,
    running: RunningState,
    remote_ok: bool,
    remote_rw: bool,
    disk_full: bool,
    /// Previous `w:*` stall, stashed while the disk-full stall is active.
    stashed_write_stall: Option<Option<u32>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompactPhase {
    NotCompacting,
    Compacting,
    Blocked,
}

#[derive(Debug)]
struct CompactSchedule {
    phase: CompactPhase,
    next_start: Option<Instant>,
    interval: Option<Duration>,
    files: bool,
    directories: bool,
    last_ratio: f64,
}

pub struct MasterController {
    cfg: MasterConfig,
    access: Arc<AccessControl>,
    namespace: Arc<Namespace>,
    changelog: Arc<ChangelogStore>,
    peer: Arc<dyn PeerEndpoint>,

    state: Mutex<MasterState>,
    compact: Mutex<CompactSchedule>,
    admission: AdmissionGate,
    services: Arc<dyn AuxiliaryServices>,

    /// Fired on unrecoverable divergence; the daemon exits on it.
    fatal: CancellationToken,
}

impl MasterController {
    pub fn new(
        cfg: MasterConfig,
        access: Arc<AccessControl>,
        namespace: Arc<Namespace>,
        peer: Arc<dyn PeerEndpoint>,
    ) -> Result<Arc<Self>, MasterError> {
        Self::with_admission_gate(cfg, access, namespace, peer, AdmissionGate::default())
    }

    pub fn with_admission_gate(
        cfg: MasterConfig,
        access: Arc<AccessControl>,
        namespace: Arc<Namespace>,
        peer: Arc<dyn PeerEndpoint>,
        admission: AdmissionGate,
    ) -> Result<Arc<Self>, MasterError> {
        Self::with_collaborators(
            cfg,
            access,
            namespace,
            peer,
            admission,
            Arc::new(LoggingServices),
        )
    }

    pub fn with_collaborators(
        cfg: MasterConfig,
        access: Arc<AccessControl>,
        namespace: Arc<Namespace>,
        peer: Arc<dyn PeerEndpoint>,
        admission: AdmissionGate,
        services: Arc<dyn AuxiliaryServices>,
    ) -> Result<Arc<Self>, MasterError> {
        let changelog = Arc::new(ChangelogStore::open(&cfg.metadata_dir, &cfg.this_host)?);

        // the lock file on disk elects the local role
        let is_master = cfg.metadata_dir.join(MASTER_LOCK_FILE).exists();
        let role = if is_master {
            MasterRole::MasterRw
        } else {
            MasterRole::SlaveRo
        };
        namespace.set_writable(is_master);
        info!(host = %cfg.this_host, ?role, "master controller booting");

        Ok(Arc::new(Self {
            cfg,
            access,
            namespace,
            changelog,
            peer,
            state: Mutex::new(MasterState {
                role,
                running: if is_master {
                    RunningState::MasterRw
                } else {
                    RunningState::SlaveRo
                },
                remote_ok: true,
                remote_rw: false,
                disk_full: false,
                stashed_write_stall: None,
            }),
            compact: Mutex::new(CompactSchedule {
                phase: CompactPhase::NotCompacting,
                next_start: None,
                interval: None,
                files: true,
                directories: false,
                last_ratio: 0.0,
            }),
            admission,
            services,
            fatal: CancellationToken::new(),
        }))
    }

    pub fn role(&self) -> MasterRole {
        self.state.lock().role
    }

    pub fn running_state(&self) -> RunningState {
        self.state.lock().running
    }

    pub fn is_master(&self) -> bool {
        self.state.lock().role == MasterRole::MasterRw
    }

    pub fn changelog(&self) -> &Arc<ChangelogStore> {
        &self.changelog
    }

    /// Fired when on-disk state diverged fatally; the daemon must exit.
    pub fn fatal_signal(&self) -> CancellationToken {
        self.fatal.clone()
    }

    /// Drain/balance admission, refused during the post-promotion barrier.
    pub fn background_admission_allowed(&self) -> bool {
        self.admission.allowed()
    }

    pub fn last_compaction_ratio(&self) -> f64 {
        self.compact.lock().last_ratio
    }

    // ------------------------------------------------------------------
    // Supervisor
    // ------------------------------------------------------------------

    pub fn spawn_supervisor(self: &Arc<Self>, token: CancellationToken) {
        let controller = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(controller.cfg.supervisor_interval) => {}
                }
                controller.supervise_once().await;
            }
        });
    }

    /// One supervisor tick: probe the peer, derive the access policy,
    /// watch the metadata disk and fire due compactions.
    pub async fn supervise_once(&self) {
        let peer_configured = self.cfg.remote_host.is_some();

        let (remote_ok, remote_rw) = if peer_configured {
            let mgm_ok = self.peer.ping_mgm().await;
            let mq_ok = self.peer.ping_mq().await;
            let rw = self.peer.is_master_rw().await.unwrap_or(false);
            (mgm_ok && mq_ok, rw)
        } else {
            (false, false)
        };

        self.apply_peer_state(remote_ok, remote_rw);

        let disk_full = match free_disk_bytes(&self.cfg.metadata_dir) {
            Ok(free) => free < self.cfg.disk_full_threshold,
            Err(err) => {
                warn!(error = %err, "cannot probe metadata partition");
                false
            }
        };
        self.apply_disk_state(disk_full);

        self.run_due_compaction().await;
    }

    /// Derive the access policy from the observed peer state.
    pub fn apply_peer_state(&self, remote_ok: bool, remote_rw: bool) {
        let mut state = self.state.lock();
        state.remote_ok = remote_ok;
        state.remote_rw = remote_rw;

        let remote = self
            .cfg
            .remote_host
            .clone()
            .unwrap_or_default();

        match state.role {
            MasterRole::SlaveRo | MasterRole::MasterRo => {
                if remote_ok && remote_rw {
                    // writes and missing entries bounce to the master
                    self.access
                        .set_redirect(RuleKind::Write.key(), &remote, self.cfg.remote_port);
                    self.access
                        .set_redirect(RuleKind::Enoent.key(), &remote, self.cfg.remote_port);
                    self.access.drop_stall(RuleKind::Write.key());
                } else {
                    self.access.set_stall(RuleKind::Write.key(), WRITE_STALL_SECS);
                    self.access.drop_redirect(RuleKind::Write.key());
                }
            }
            MasterRole::MasterRw => {
                if remote_ok && remote_rw && remote != self.cfg.this_host {
                    error!(
                        peer = %remote,
                        "dual master-rw situation detected, stalling writes"
                    );
                    self.access.set_stall(RuleKind::Write.key(), WRITE_STALL_SECS);
                } else if !state.disk_full {
                    self.access.drop_stall(RuleKind::Write.key());
                }
            }
        }
    }

    /// Stash/restore the write stall around metadata-disk exhaustion.
    pub fn apply_disk_state(&self, disk_full: bool) {
        let mut state = self.state.lock();
        if disk_full == state.disk_full {
            return;
        }
        state.disk_full = disk_full;

        if state.role != MasterRole::MasterRw {
            return;
        }

        if disk_full {
            warn!("metadata partition below free-space floor, stalling writes");
            state.stashed_write_stall =
                Some(self.access.stall_seconds(RuleKind::Write.key()));
            self.access.set_stall(RuleKind::Write.key(), WRITE_STALL_SECS);
        } else if let Some(previous) = state.stashed_write_stall.take() {
            info!("metadata partition recovered, restoring write policy");
            match previous {
                Some(seconds) => self.access.set_stall(RuleKind::Write.key(), seconds),
                None => {
                    self.access.drop_stall(RuleKind::Write.key());
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Transitions
    // ------------------------------------------------------------------

    /// Promote this slave to master-rw.
    ///
    /// Refused when the remote change-log sizes differ from the local
    /// ones; divergent namespaces must not be promoted over.
    pub async fn slave_to_master(&self) -> Result<(), MasterError> {
        {
            let mut state = self.state.lock();
            if state.role != MasterRole::SlaveRo {
                return Err(MasterError::NotSlave);
            }
            state.running = RunningState::Transition;
        }

        // block drain/balance admission while the namespace replays
        self.admission.block_for(self.cfg.promotion_block);
        info!("promotion: blocked background admission");

        // the writer must not race the sync daemon on its own changelogs
        self.services.stop_sync().await;

        let local = match (
            self.changelog.size(ChangelogKind::Files),
            self.changelog.size(ChangelogKind::Directories),
        ) {
            (Ok(files), Ok(dirs)) => (files, dirs),
            (Err(err), _) | (_, Err(err)) => {
                self.revert_promotion().await;
                return Err(err.into());
            }
        };
        if let Some(remote) = self.peer.changelog_sizes().await {
            if remote != local {
                warn!(?local, ?remote, "promotion refused, changelogs diverge");
                self.revert_promotion().await;
                return Err(MasterError::ChangelogMismatch { local, remote });
            }
        } else {
            warn!("peer unreachable, promoting without changelog comparison");
        }

        let epoch = chrono::Utc::now().timestamp();
        if let Err(err) = self.changelog.rename_aside(epoch) {
            self.revert_promotion().await;
            return Err(err.into());
        }

        if let Err(err) = std::fs::File::create(self.cfg.metadata_dir.join(MASTER_LOCK_FILE)) {
            self.revert_promotion().await;
            return Err(err.into());
        }
        // the local broker stops deferring to the remote one
        let _ = std::fs::remove_file(self.cfg.metadata_dir.join(MQ_REMOTE_LOCK_FILE));
        self.namespace.set_writable(true);
        self.services.start_recycler().await;
        {
            let mut state = self.state.lock();
            state.role = MasterRole::MasterRw;
            state.running = RunningState::MasterRw;
        }
        metrics::gauge!("mgm_master_is_rw").set(1.0);

        // the former master should bounce its clients over to us
        self.peer.signal_bounce().await;
        info!("promotion complete, serving read-write");
        Ok(())
    }

    /// Undo a failed promotion: the process stays a follower and the sync
    /// daemon resumes feeding it.
    async fn revert_promotion(&self) {
        self.admission.clear();
        self.services.start_sync().await;
        self.state.lock().running = RunningState::SlaveRo;
    }

    /// Demote a running master to read-only.
    pub async fn master_to_master_ro(&self) -> Result<(), MasterError> {
        if self.state.lock().role != MasterRole::MasterRw {
            return Err(MasterError::NotMaster);
        }

        self.wait_compacting_finished().await;
        self.namespace.set_writable(false);
        self.services.stop_recycler().await;

        let mut state = self.state.lock();
        state.role = MasterRole::MasterRo;
        state.running = RunningState::MasterRo;
        metrics::gauge!("mgm_master_is_rw").set(0.0);
        info!("demoted to master-ro");
        Ok(())
    }

    /// Re-join as follower after a master-ro demotion.
    pub async fn master_ro_to_slave(&self) -> Result<(), MasterError> {
        {
            let mut state = self.state.lock();
            if state.role != MasterRole::MasterRo {
                return Err(MasterError::NotMaster);
            }
            state.running = RunningState::Transition;
        }

        // stall everything while the namespace re-boots as follower
        self.access.set_stall(RuleKind::Write.key(), WRITE_STALL_SECS);
        let catch_all = if self.state.lock().remote_ok {
            TRANSITION_STALL_SECS
        } else {
            WRITE_STALL_SECS
        };
        self.access.set_stall("*", catch_all);

        // the local broker defers to the remote master's broker from here
        std::fs::File::create(self.cfg.metadata_dir.join(MQ_REMOTE_LOCK_FILE))?;
        std::fs::remove_file(self.cfg.metadata_dir.join(MASTER_LOCK_FILE)).ok();
        self.namespace.set_writable(false);

        // followers are fed by the sync daemon again
        self.services.start_sync().await;

        // follow the remote change-log up to its current offset before
        // lifting the stalls
        if let Some(remote) = self.peer.changelog_sizes().await {
            info!(?remote, "armed follower at remote changelog offset");
        }

        {
            let mut state = self.state.lock();
            state.role = MasterRole::SlaveRo;
            state.running = RunningState::SlaveRo;
        }
        self.access.drop_stall("*");
        info!("re-joined as slave-ro");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Compaction
    // ------------------------------------------------------------------

    pub fn schedule_compaction(
        &self,
        start_in: Duration,
        interval: Option<Duration>,
        files: bool,
        directories: bool,
    ) {
        let mut compact = self.compact.lock();
        compact.next_start = Some(Instant::now() + start_in);
        compact.interval = interval;
        compact.files = files;
        compact.directories = directories;
        info!(
            start_secs = start_in.as_secs(),
            repeat_secs = interval.map(|i| i.as_secs()),
            files,
            directories,
            "compaction scheduled"
        );
    }

    /// Peers block compaction while they transition.
    pub fn block_compacting(&self) {
        self.compact.lock().phase = CompactPhase::Blocked;
    }

    pub fn unblock_compacting(&self) {
        let mut compact = self.compact.lock();
        if compact.phase == CompactPhase::Blocked {
            compact.phase = CompactPhase::NotCompacting;
        }
    }

    pub async fn wait_compacting_finished(&self) {
        loop {
            if self.compact.lock().phase != CompactPhase::Compacting {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    async fn run_due_compaction(&self) {
        let due = {
            let compact = self.compact.lock();
            compact.phase == CompactPhase::NotCompacting
                && compact
                    .next_start
                    .is_some_and(|start| Instant::now() >= start)
        };
        if !due || !self.is_master() {
            return;
        }

        match self.compact_now().await {
            Ok(ratio) => info!(ratio, "online compaction finished"),
            Err(MasterError::FatalCompaction(msg)) => {
                error!(%msg, "fatal compaction failure, shutting down");
                self.fatal.cancel();
            }
            Err(err) => warn!(error = %err, "compaction cycle aborted"),
        }

        let mut compact = self.compact.lock();
        compact.next_start = compact.interval.map(|i| Instant::now() + i);
    }

    /// One compaction cycle: prepare under the namespace read lock,
    /// rewrite unlocked, commit under the write lock. An abort before
    /// commit leaves the running namespace untouched; a failure after the
    /// first committed kind is fatal.
    pub async fn compact_now(&self) -> Result<f64, MasterError> {
        if !self.is_master() {
            return Err(MasterError::NotMaster);
        }

        let (files, directories) = {
            let mut compact = self.compact.lock();
            match compact.phase {
                CompactPhase::Blocked => return Err(MasterError::CompactionBlocked),
                CompactPhase::Compacting => return Err(MasterError::CompactionBusy),
                CompactPhase::NotCompacting => {}
            }
            compact.phase = CompactPhase::Compacting;
            (compact.files, compact.directories)
        };

        let mut kinds = Vec::new();
        if files {
            kinds.push(ChangelogKind::Files);
        }
        if directories {
            kinds.push(ChangelogKind::Directories);
        }

        let finish = |phase_ratio: Result<f64, MasterError>| {
            let mut compact = self.compact.lock();
            compact.phase = CompactPhase::NotCompacting;
            if let Ok(ratio) = &phase_ratio {
                compact.last_ratio = *ratio;
            }
            phase_ratio
        };

        // phase 1: snapshot work files (namespace read-locked)
        for kind in &kinds {
            if let Err(err) = self.changelog.compact_prepare(*kind) {
                return finish(Err(err.into()));
            }
        }

        // phase 2: rewrite, no lock held
        let mut total_before = 0u64;
        let mut total_after = 0u64;
        for kind in &kinds {
            match self.changelog.compact(*kind) {
                Ok(stats) => {
                    total_before += stats.records_before;
                    total_after += stats.records_after;
                }
                Err(err) => return finish(Err(err.into())),
            }
        }

        // phase 3: commit (namespace write-locked); failure after the
        // first rename leaves disk and memory inconsistent
        let epoch = chrono::Utc::now().timestamp();
        for (i, kind) in kinds.iter().enumerate() {
            if let Err(err) = self.changelog.compact_commit(*kind, epoch) {
                if i > 0 {
                    self.compact.lock().phase = CompactPhase::NotCompacting;
                    return Err(MasterError::FatalCompaction(err.to_string()));
                }
                return finish(Err(err.into()));
            }
        }

        self.peer.signal_reload().await;

        let ratio = if total_before == 0 {
            0.0
        } else {
            1.0 - total_after as f64 / total_before as f64
        };
        metrics::gauge!("mgm_compaction_ratio").set(ratio);
        finish(Ok(ratio))
    }

    // ------------------------------------------------------------------
    // Peer signals
    // ------------------------------------------------------------------

    /// `mastersignalbounce`: the remote asks us to redirect to it.
    pub fn handle_signal_bounce(&self) {
        let Some(remote) = self.cfg.remote_host.clone() else {
            return;
        };
        info!(peer = %remote, "bounce requested, redirecting writes");
        self.access
            .set_redirect(RuleKind::Write.key(), &remote, self.cfg.remote_port);
        self.access
            .set_redirect(RuleKind::Enoent.key(), &remote, self.cfg.remote_port);
    }

    /// `mastersignalreload`: the remote rewrote its changelogs.
    pub fn handle_signal_reload(&self) {
        match (
            self.changelog.size(ChangelogKind::Files),
            self.changelog.size(ChangelogKind::Directories),
        ) {
            (Ok(files), Ok(dirs)) => {
                info!(files, dirs, "re-opened changelog files after remote compaction")
            }
            _ => warn!("cannot re-open changelog files"),
        }
    }
}

fn free_disk_bytes(path: &std::path::Path) -> std::io::Result<u64> {
    use std::os::unix::ffi::OsStrExt;

    let c_path = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(stat.f_bavail as u64 * stat.f_frsize as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::changelog::ChangelogRecord;
    use std::sync::atomic::Ordering;

    fn setup(
        master_lock: bool,
        peer: Arc<StaticPeer>,
    ) -> (Arc<MasterController>, Arc<Namespace>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        if master_lock {
            std::fs::File::create(dir.path().join(MASTER_LOCK_FILE)).unwrap();
        }

        let mut cfg = MasterConfig::new("mgm1", dir.path());
        cfg.remote_host = Some("mgm2".to_string());

        let namespace = Arc::new(Namespace::new());
        let controller = MasterController::new(
            cfg,
            Arc::new(AccessControl::new()),
            namespace.clone(),
            peer,
        )
        .unwrap();
        (controller, namespace, dir)
    }

    #[tokio::test]
    async fn test_lock_file_elects_boot_role() {
        let peer = Arc::new(StaticPeer::default());
        let (master, ns, _dir) = setup(true, peer.clone());
        assert_eq!(master.role(), MasterRole::MasterRw);
        assert!(ns.is_writable());

        let (slave, ns2, _dir2) = setup(false, peer);
        assert_eq!(slave.role(), MasterRole::SlaveRo);
        assert!(!ns2.is_writable());
    }

    #[tokio::test]
    async fn test_promotion_refused_on_changelog_mismatch() {
        let peer = Arc::new(StaticPeer::default());
        *peer.sizes.lock() = Some((999, 0));
        let (controller, ns, _dir) = setup(false, peer);

        let err = controller.slave_to_master().await.unwrap_err();
        assert!(matches!(err, MasterError::ChangelogMismatch { .. }));
        assert_eq!(controller.role(), MasterRole::SlaveRo);
        assert_eq!(controller.running_state(), RunningState::SlaveRo);
        assert!(!ns.is_writable());
        assert!(controller.background_admission_allowed());
    }

    #[tokio::test]
    async fn test_promotion_succeeds_and_blocks_background_work() {
        let peer = Arc::new(StaticPeer::default());
        *peer.sizes.lock() = Some((0, 0));
        let (controller, ns, dir) = setup(false, peer.clone());

        controller.slave_to_master().await.unwrap();
        assert_eq!(controller.role(), MasterRole::MasterRw);
        assert!(ns.is_writable());
        assert!(dir.path().join(MASTER_LOCK_FILE).exists());
        assert_eq!(peer.bounces.load(Ordering::SeqCst), 1);

        // the 1 hour barrier holds
        assert!(!controller.background_admission_allowed());
    }

    fn setup_with_services(
        master_lock: bool,
        peer: Arc<StaticPeer>,
        services: Arc<StaticServices>,
    ) -> (Arc<MasterController>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        if master_lock {
            std::fs::File::create(dir.path().join(MASTER_LOCK_FILE)).unwrap();
        }

        let mut cfg = MasterConfig::new("mgm1", dir.path());
        cfg.remote_host = Some("mgm2".to_string());

        let controller = MasterController::with_collaborators(
            cfg,
            Arc::new(AccessControl::new()),
            Arc::new(Namespace::new()),
            peer,
            AdmissionGate::default(),
            services,
        )
        .unwrap();
        (controller, dir)
    }

    #[tokio::test]
    async fn test_role_cycle_manages_sync_and_recycler() {
        let peer = Arc::new(StaticPeer::default());
        *peer.sizes.lock() = Some((0, 0));
        let services = Arc::new(StaticServices::default());
        services.sync_running.store(true, Ordering::SeqCst);
        let (controller, _dir) = setup_with_services(false, peer, services.clone());

        controller.slave_to_master().await.unwrap();
        assert!(!services.sync_running.load(Ordering::SeqCst));
        assert!(services.recycler_running.load(Ordering::SeqCst));

        controller.master_to_master_ro().await.unwrap();
        assert!(!services.recycler_running.load(Ordering::SeqCst));

        controller.master_ro_to_slave().await.unwrap();
        assert!(services.sync_running.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_failed_promotion_restarts_sync_daemon() {
        let peer = Arc::new(StaticPeer::default());
        *peer.sizes.lock() = Some((999, 0));
        let services = Arc::new(StaticServices::default());
        services.sync_running.store(true, Ordering::SeqCst);
        let (controller, _dir) = setup_with_services(false, peer, services.clone());

        assert!(controller.slave_to_master().await.is_err());
        assert!(services.sync_running.load(Ordering::SeqCst));
        assert_eq!(services.sync_restarts.load(Ordering::SeqCst), 1);
        assert!(!services.recycler_running.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_dual_master_installs_write_stall() {
        let peer = Arc::new(StaticPeer::default());
        peer.reachable.store(true, Ordering::SeqCst);
        peer.master_rw.store(true, Ordering::SeqCst);
        let (controller, _ns, _dir) = setup(true, peer);

        controller.apply_peer_state(true, true);
        assert_eq!(
            controller.access.stall_for(RuleKind::Write),
            Some(WRITE_STALL_SECS)
        );
        assert!(controller.access.stall_for(RuleKind::Read).is_none());
    }

    #[tokio::test]
    async fn test_slave_redirects_writes_to_live_master() {
        let peer = Arc::new(StaticPeer::default());
        let (controller, _ns, _dir) = setup(false, peer);

        controller.apply_peer_state(true, true);
        assert_eq!(
            controller.access.redirect_for(RuleKind::Write),
            Some(("mgm2".to_string(), 1094))
        );
        assert!(controller.access.stall_for(RuleKind::Write).is_none());

        // peer dies: stall replaces the redirect
        controller.apply_peer_state(false, false);
        assert_eq!(
            controller.access.stall_for(RuleKind::Write),
            Some(WRITE_STALL_SECS)
        );
        assert!(controller.access.redirect_for(RuleKind::Write).is_none());
    }

    #[tokio::test]
    async fn test_disk_full_stashes_and_restores_stall() {
        let peer = Arc::new(StaticPeer::default());
        let (controller, _ns, _dir) = setup(true, peer);

        controller.apply_disk_state(true);
        assert_eq!(
            controller.access.stall_for(RuleKind::Write),
            Some(WRITE_STALL_SECS)
        );

        controller.apply_disk_state(false);
        assert!(controller.access.stall_for(RuleKind::Write).is_none());
    }

    #[tokio::test]
    async fn test_compaction_cycle_and_gating() {
        let peer = Arc::new(StaticPeer::default());
        let (controller, _ns, _dir) = setup(true, peer.clone());

        for i in 0..10 {
            controller
                .changelog()
                .append(
                    ChangelogKind::Files,
                    &ChangelogRecord {
                        id: i % 3,
                        op: "set".to_string(),
                        data: serde_json::json!({}),
                    },
                )
                .unwrap();
        }

        controller.block_compacting();
        assert!(matches!(
            controller.compact_now().await,
            Err(MasterError::CompactionBlocked)
        ));

        controller.unblock_compacting();
        let ratio = controller.compact_now().await.unwrap();
        assert!(ratio > 0.5);
        assert_eq!(peer.reloads.load(Ordering::SeqCst), 1);
        assert_eq!(controller.last_compaction_ratio(), ratio);
    }

    #[tokio::test]
    async fn test_full_role_cycle() {
        let peer = Arc::new(StaticPeer::default());
        *peer.sizes.lock() = Some((0, 0));
        let (controller, ns, _dir) = setup(true, peer);

        controller.master_to_master_ro().await.unwrap();
        assert_eq!(controller.role(), MasterRole::MasterRo);
        assert!(!ns.is_writable());

        controller.master_ro_to_slave().await.unwrap();
        assert_eq!(controller.role(), MasterRole::SlaveRo);
        assert_eq!(controller.running_state(), RunningState::SlaveRo);
        // the catch-all transition stall is lifted once following
        assert!(controller.access.stall_seconds("*").is_none());
    }
}
