// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Drain jobs.
//!
//! One supervised job exists per file system whose configured status is
//! `drain` or `draindead`. The job walks
//! `prepare → wait → draining → (drainstalling | drained | drainexpired)`
//! and exports its progress on the owning file system. Peers of the group
//! get drain-pull enabled so their nodes fetch the stripes; the actual
//! data movement is the storage nodes' business.
//!
//! Every sleep is a cancellation point; destruction cancels the
//! supervisor, resets the exported counters and disables drain-pull.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::domain::filesystem::{ConfigStatus, DrainStatus, FsId, OnConfigStatusChanged};
use crate::domain::fsview::FsView;
use crate::infrastructure::namespace::Namespace;

#[derive(Debug, Clone)]
pub struct DrainTuning {
    /// Settle delay before sampling the file list.
    pub service_delay: Duration,
    /// Supervisor re-sample interval.
    pub poll: Duration,
    /// No-progress window after which the drain counts as stalling.
    pub stall_after: Duration,
    /// Retries after an expired attempt.
    pub max_retries: u32,
}

impl Default for DrainTuning {
    fn default() -> Self {
        Self {
            service_delay: Duration::from_secs(60),
            poll: Duration::from_secs(1),
            stall_after: Duration::from_secs(600),
            max_retries: 1,
        }
    }
}

pub struct DrainJob {
    token: CancellationToken,
}

impl DrainJob {
    fn spawn(
        fsid: FsId,
        fsview: Arc<FsView>,
        namespace: Arc<Namespace>,
        tuning: DrainTuning,
        on_ops_error: bool,
    ) -> Arc<Self> {
        let token = CancellationToken::new();
        let job = Arc::new(Self {
            token: token.clone(),
        });

        tokio::spawn(run_drain(
            fsid, fsview, namespace, tuning, on_ops_error, token,
        ));
        job
    }

    fn cancel(&self) {
        self.token.cancel();
    }
}

/// Hook implementation starting/stopping drain jobs on configured-status
/// changes; wired into every registered file system.
pub struct DrainEngine {
    fsview: Arc<FsView>,
    namespace: Arc<Namespace>,
    tuning: DrainTuning,
    jobs: Mutex<HashMap<FsId, Arc<DrainJob>>>,
}

impl DrainEngine {
    pub fn new(fsview: Arc<FsView>, namespace: Arc<Namespace>, tuning: DrainTuning) -> Arc<Self> {
        Arc::new(Self {
            fsview,
            namespace,
            tuning,
            jobs: Mutex::new(HashMap::new()),
        })
    }

    pub fn start_drain(&self, fsid: FsId, on_ops_error: bool) {
        let mut jobs = self.jobs.lock();
        if jobs.contains_key(&fsid) {
            return;
        }
        info!(%fsid, on_ops_error, "starting drain job");
        jobs.insert(
            fsid,
            DrainJob::spawn(
                fsid,
                self.fsview.clone(),
                self.namespace.clone(),
                self.tuning.clone(),
                on_ops_error,
            ),
        );
    }

    pub fn stop_drain(&self, fsid: FsId) {
        let job = self.jobs.lock().remove(&fsid);
        let Some(job) = job else {
            return;
        };
        info!(%fsid, "stopping drain job");
        job.cancel();

        if let Some(fs) = self.fsview.fs(fsid) {
            // a finished drain keeps its terminal export state
            if !matches!(
                fs.drain_status(),
                DrainStatus::Drained | DrainStatus::DrainExpired
            ) {
                fs.set_drain_status(DrainStatus::NoDrain);
                fs.drain_stats().reset();
            }
        }
        set_peer_drain_pull(&self.fsview, fsid, false);
    }

    pub fn active_drains(&self) -> Vec<FsId> {
        self.jobs.lock().keys().copied().collect()
    }

    pub fn shutdown(&self) {
        let jobs: Vec<FsId> = self.jobs.lock().keys().copied().collect();
        for fsid in jobs {
            self.stop_drain(fsid);
        }
    }
}

impl OnConfigStatusChanged for DrainEngine {
    fn on_config_status_changed(&self, fsid: FsId, _old: ConfigStatus, new: ConfigStatus) {
        if new.is_drain() {
            self.start_drain(fsid, false);
        } else {
            self.stop_drain(fsid);
        }
    }
}

fn set_peer_drain_pull(fsview: &FsView, fsid: FsId, enabled: bool) {
    let Some(snap) = fsview.snapshot(fsid) else {
        return;
    };
    let view = fsview.view();
    let Some(group) = view.group(&snap.regs.space, snap.regs.group_index) else {
        return;
    };
    for member in &group.members {
        if *member == fsid {
            continue;
        }
        if let Some(peer) = view.fs(*member) {
            peer.set_drain_pull(enabled);
        }
    }
}

async fn run_drain(
    fsid: FsId,
    fsview: Arc<FsView>,
    namespace: Arc<Namespace>,
    tuning: DrainTuning,
    on_ops_error: bool,
    token: CancellationToken,
) {
    let mut attempt = 0u32;

    'retry: loop {
        attempt += 1;

        let Some(fs) = fsview.fs(fsid) else {
            return;
        };
        let regs = fs.snapshot().regs;
        let drain_period = regs.drain_period;
        let grace_period = regs.grace_period;

        fs.set_drain_status(DrainStatus::DrainPrepare);
        fs.drain_stats()
            .retries
            .store((attempt - 1) as u64, Ordering::Relaxed);

        let drain_start = Instant::now();

        // settle delay so peer state converges before we sample
        if sleep_cancellable(&token, tuning.service_delay).await {
            return;
        }

        fs.set_drain_status(DrainStatus::DrainWait);

        // error-triggered drains honor an operator grace period before the
        // drain clock starts ticking
        if on_ops_error && !grace_period.is_zero() {
            if sleep_cancellable(&token, grace_period).await {
                return;
            }
        }

        let total_files = namespace.fs_file_count(fsid) as u64;
        let total_bytes = namespace.fs_bytes(fsid);

        if total_files == 0 {
            finish_drained(&fsview, fsid);
            return;
        }

        fs.drain_stats().files.store(total_files, Ordering::Relaxed);
        fs.drain_stats()
            .bytes_left
            .store(total_bytes, Ordering::Relaxed);
        set_peer_drain_pull(&fsview, fsid, true);
        fs.set_drain_status(DrainStatus::Draining);

        let mut last_count = total_files;
        let mut last_progress = Instant::now();

        loop {
            if sleep_cancellable(&token, tuning.poll).await {
                return;
            }

            let remaining = namespace.fs_file_count(fsid) as u64;
            let bytes_left = namespace.fs_bytes(fsid);
            let progress = (total_files - remaining) * 100 / total_files;

            fs.drain_stats().files.store(remaining, Ordering::Relaxed);
            fs.drain_stats()
                .bytes_left
                .store(bytes_left, Ordering::Relaxed);
            fs.drain_stats().progress.store(progress, Ordering::Relaxed);
            metrics::gauge!("mgm_drain_progress", "fsid" => fsid.to_string())
                .set(progress as f64);

            if remaining == 0 {
                set_peer_drain_pull(&fsview, fsid, false);
                finish_drained(&fsview, fsid);
                return;
            }

            if remaining != last_count {
                last_count = remaining;
                last_progress = Instant::now();
                fs.set_drain_status(DrainStatus::Draining);
            } else if last_progress.elapsed() > tuning.stall_after {
                fs.set_drain_status(DrainStatus::DrainStalling);
            }

            if !drain_period.is_zero() && drain_start.elapsed() > drain_period {
                warn!(
                    %fsid,
                    period_secs = drain_period.as_secs(),
                    remaining,
                    "drain period exhausted"
                );
                fs.set_drain_status(DrainStatus::DrainExpired);
                set_peer_drain_pull(&fsview, fsid, false);

                if attempt <= tuning.max_retries {
                    continue 'retry;
                }
                return;
            }
        }
    }
}

fn finish_drained(fsview: &FsView, fsid: FsId) {
    let Some(fs) = fsview.fs(fsid) else {
        return;
    };

    fs.drain_stats().files.store(0, Ordering::Relaxed);
    fs.drain_stats().bytes_left.store(0, Ordering::Relaxed);
    fs.drain_stats().progress.store(100, Ordering::Relaxed);
    fs.set_drain_status(DrainStatus::Drained);
    info!(%fsid, "drain complete");

    // the emptied file system leaves the drain set
    fs.set_config_status(ConfigStatus::Empty);
}

/// Returns true when the token fired.
async fn sleep_cancellable(token: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = token.cancelled() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}
