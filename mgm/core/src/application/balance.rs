// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Balance jobs.
//!
//! One job per scheduling group periodically equalizes fill: members
//! above the group average become sources, members below become targets,
//! and source stripes are matched to targets as signed transfer-job pairs
//! appended to the targets' balance queues inside one transaction per
//! target. A process-wide mutex serializes the scheduling critical
//! section across groups.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::application::master::AdmissionGate;
use crate::domain::filesystem::{BootStatus, FsId};
use crate::domain::fsview::{BalancingStatus, FsView};
use crate::domain::namespace::Fid;
use crate::infrastructure::capability::{build_transfer_job, CapabilityEngine};
use crate::infrastructure::namespace::Namespace;

/// Total jobs one balancing round may submit across a group.
const ROUND_CAP: usize = 5000;

#[derive(Debug, Clone)]
pub struct BalanceTuning {
    /// Base initial delay; a jitter of up to `initial_jitter` is added so
    /// rounds desynchronize across groups.
    pub initial_delay: Duration,
    pub initial_jitter: Duration,
    pub poll: Duration,
    pub stall_after: Duration,
    pub abort_after: Duration,
    pub cooldown: Duration,
    /// Pause between rounds when there is nothing to move.
    pub idle_delay: Duration,
}

impl Default for BalanceTuning {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(100),
            initial_jitter: Duration::from_secs(20),
            poll: Duration::from_secs(10),
            stall_after: Duration::from_secs(300),
            abort_after: Duration::from_secs(3600),
            cooldown: Duration::from_secs(120),
            idle_delay: Duration::from_secs(10),
        }
    }
}

pub struct BalanceEngine {
    fsview: Arc<FsView>,
    namespace: Arc<Namespace>,
    capability: Arc<CapabilityEngine>,
    manager: String,
    tuning: BalanceTuning,

    /// Refused while the post-promotion barrier holds.
    admission: AdmissionGate,

    /// Serializes the scheduling critical section across all groups.
    scheduling_mutex: Arc<tokio::sync::Mutex<()>>,

    jobs: Mutex<Vec<CancellationToken>>,
}

impl BalanceEngine {
    pub fn new(
        fsview: Arc<FsView>,
        namespace: Arc<Namespace>,
        capability: Arc<CapabilityEngine>,
        manager: impl Into<String>,
        tuning: BalanceTuning,
        admission: AdmissionGate,
    ) -> Arc<Self> {
        Arc::new(Self {
            fsview,
            namespace,
            capability,
            manager: manager.into(),
            tuning,
            admission,
            scheduling_mutex: Arc::new(tokio::sync::Mutex::new(())),
            jobs: Mutex::new(Vec::new()),
        })
    }

    /// Spawn one balance job per scheduling group of `space`.
    pub fn spawn_for_space(self: &Arc<Self>, space: &str) {
        for group in self.fsview.group_handles(space) {
            let token = CancellationToken::new();
            self.jobs.lock().push(token.clone());
            tokio::spawn(run_balance(
                self.clone(),
                space.to_string(),
                group.index,
                token,
            ));
        }
    }

    /// Cancel every job and clear the groups' balance queues.
    pub fn shutdown(&self) {
        for token in self.jobs.lock().drain(..) {
            token.cancel();
        }
        for fs in self.fsview.all_filesystems() {
            fs.balance_queue().clear();
        }
    }

    /// One balancing round over a single group. Returns the number of
    /// submitted jobs.
    pub fn run_round(&self, space: &str, group_index: u32) -> usize {
        #[derive(Debug)]
        struct Source {
            fsid: FsId,
            surplus: u64,
            candidates: Vec<(Fid, u64)>,
            next: usize,
        }

        let view = self.fsview.view();
        let Some(group) = view.group(space, group_index) else {
            return 0;
        };
        let group_size = group.members.len();
        if group_size < 2 {
            return 0;
        }

        let average = view.group_average_used_bytes(space, group_index);
        let mut sources = Vec::new();
        let mut targets: Vec<(FsId, u64)> = Vec::new();
        let mut snapshots = HashMap::new();

        for fsid in &group.members {
            let Some(fs) = view.fs(*fsid) else {
                continue;
            };
            let snap = fs.snapshot();
            let now = chrono::Utc::now().timestamp();
            if snap.regs.boot_status != BootStatus::Booted || !snap.is_active(now) {
                continue;
            }

            let used = snap.regs.used_bytes;
            if used <= average {
                targets.push((*fsid, average - used));
            } else {
                sources.push(Source {
                    fsid: *fsid,
                    surplus: used - average,
                    candidates: Vec::new(),
                    next: 0,
                });
            }
            snapshots.insert(*fsid, snap);
        }

        if sources.is_empty() || targets.is_empty() {
            return 0;
        }

        // Sample candidate files per source, bounded so one round stays
        // within the global cap, and never pick the same file twice.
        let cap = (ROUND_CAP / group_size).max(1);
        let mut rng = rand::rngs::StdRng::from_entropy();
        let mut seen_fids: HashSet<Fid> = HashSet::new();

        for source in sources.iter_mut() {
            let mut fids = self.namespace.fs_files(source.fsid);
            fids.shuffle(&mut rng);

            let mut budget = source.surplus;
            for fid in fids {
                if source.candidates.len() >= cap {
                    break;
                }
                if seen_fids.contains(&fid) {
                    continue;
                }
                let Ok(fmd) = self.namespace.file_by_id(fid) else {
                    continue;
                };
                if fmd.size > budget {
                    debug!(fid, size = fmd.size, budget, "candidate exceeds surplus");
                    continue;
                }
                budget -= fmd.size;
                seen_fids.insert(fid);
                source.candidates.push((fid, fmd.size));
            }
        }

        // Scheduling critical section: one balancer at a time.
        let _serialized = self.scheduling_mutex.blocking_lock();

        for (target, _) in &targets {
            if let Some(fs) = view.fs(*target) {
                fs.balance_queue().open_transaction();
            }
        }

        let mut scheduled_on_target: HashMap<FsId, HashSet<Fid>> = HashMap::new();
        let mut submitted = 0usize;

        // Round-robin over sources, matching each candidate to the first
        // target with remaining capacity. The budget bound is explicit so
        // an empty first pass terminates correctly.
        let mut progress = true;
        while progress && submitted < ROUND_CAP {
            progress = false;

            for source in sources.iter_mut() {
                if submitted >= ROUND_CAP {
                    break;
                }
                let Some(&(fid, size)) = source.candidates.get(source.next) else {
                    continue;
                };
                source.next += 1;
                progress = true;

                let Ok(fmd) = self.namespace.file_by_id(fid) else {
                    continue;
                };

                let slot = targets.iter_mut().find(|(target, capacity)| {
                    *target != source.fsid
                        && *capacity >= size
                        && !fmd.locations.contains(target)
                        && !scheduled_on_target
                            .get(target)
                            .is_some_and(|set| set.contains(&fid))
                });
                let Some((target, capacity)) = slot else {
                    continue;
                };

                let (Some(source_snap), Some(target_snap)) =
                    (snapshots.get(&source.fsid), snapshots.get(target))
                else {
                    continue;
                };

                match build_transfer_job(
                    &self.capability,
                    fid,
                    fmd.layout,
                    fmd.size,
                    &self.manager,
                    source_snap,
                    target_snap,
                ) {
                    Ok(job) => {
                        if let Some(fs) = view.fs(*target) {
                            fs.balance_queue().add(job);
                        }
                        scheduled_on_target.entry(*target).or_default().insert(fid);
                        *capacity -= size;
                        source.surplus = source.surplus.saturating_sub(size);
                        submitted += 1;
                    }
                    Err(err) => {
                        warn!(fid, error = %err, "cannot build balance job");
                    }
                }
            }
        }

        for (target, _) in &targets {
            if let Some(fs) = view.fs(*target) {
                fs.balance_queue().close_transaction();
            }
        }

        submitted
    }

    fn queued_in_group(&self, space: &str, group_index: u32) -> usize {
        let view = self.fsview.view();
        let Some(group) = view.group(space, group_index) else {
            return 0;
        };
        group
            .members
            .iter()
            .filter_map(|fsid| view.fs(*fsid))
            .map(|fs| fs.balance_queue().len())
            .sum()
    }

    fn clear_group_queues(&self, space: &str, group_index: u32) {
        let view = self.fsview.view();
        let Some(group) = view.group(space, group_index) else {
            return;
        };
        for fsid in &group.members {
            if let Some(fs) = view.fs(*fsid) {
                fs.balance_queue().clear();
            }
        }
    }
}

async fn run_balance(
    engine: Arc<BalanceEngine>,
    space: String,
    group_index: u32,
    token: CancellationToken,
) {
    let tuning = engine.tuning.clone();

    // jittered start desynchronizes the rounds across groups
    let jitter = Duration::from_millis(
        (rand::random::<f64>() * tuning.initial_jitter.as_millis() as f64) as u64,
    );
    if sleep_cancellable(&token, tuning.initial_delay + jitter).await {
        return;
    }

    let group_state = || {
        engine
            .fsview
            .view()
            .group(&space, group_index)
            .map(|g| g.state.clone())
    };

    loop {
        if !engine.admission.allowed()
            || !engine
                .fsview
                .space_options(&space)
                .map(|o| o.balance_enabled)
                .unwrap_or(false)
        {
            if sleep_cancellable(&token, tuning.idle_delay).await {
                return;
            }
            continue;
        }

        let engine_round = engine.clone();
        let space_round = space.clone();
        let submitted = tokio::task::spawn_blocking(move || {
            engine_round.run_round(&space_round, group_index)
        })
        .await
        .unwrap_or(0);

        let Some(state) = group_state() else {
            return;
        };

        if submitted == 0 {
            state.set_balancing(BalancingStatus::Idle);
            if sleep_cancellable(&token, tuning.idle_delay).await {
                return;
            }
            continue;
        }

        info!(space = %space, group = group_index, submitted, "balancing round submitted");
        state.set_balancing(BalancingStatus::Balancing);
        metrics::gauge!("mgm_balance_queued", "group" => group_index.to_string())
            .set(submitted as f64);

        let round_start = Instant::now();
        let mut last_queued = usize::MAX;
        let mut last_change = Instant::now();

        loop {
            if sleep_cancellable(&token, tuning.poll).await {
                return;
            }

            let queued = engine.queued_in_group(&space, group_index);
            metrics::gauge!("mgm_balance_queued", "group" => group_index.to_string())
                .set(queued as f64);

            if queued == 0 {
                break;
            }

            if queued != last_queued {
                last_queued = queued;
                last_change = Instant::now();
                state.set_balancing(BalancingStatus::Balancing);
            } else if last_change.elapsed() > tuning.abort_after {
                warn!(space = %space, group = group_index, "balance round aborted, clearing queues");
                engine.clear_group_queues(&space, group_index);
                state.set_balancing(BalancingStatus::Incomplete);
                break;
            } else if last_change.elapsed() > tuning.stall_after {
                state.set_balancing(BalancingStatus::Stalled);
            }

            debug!(
                space = %space,
                group = group_index,
                queued,
                elapsed_secs = round_start.elapsed().as_secs(),
                "balance round polling"
            );
        }

        if group_state().map(|s| s.balancing()) != Some(BalancingStatus::Incomplete) {
            state.set_balancing(BalancingStatus::Cooldown);
            if sleep_cancellable(&token, tuning.cooldown).await {
                return;
            }
        }
        state.set_balancing(BalancingStatus::Idle);
    }
}

async fn sleep_cancellable(token: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = token.cancelled() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}
