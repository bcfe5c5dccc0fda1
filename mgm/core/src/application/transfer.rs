// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Pull-style transfer scheduling.
//!
//! Storage nodes periodically ask the MGM for balance or drain work for
//! one of their file systems. The handler picks a source inside the
//! requesting target's group, samples a file not yet on the target,
//! consults the recently-scheduled set (one hour TTL, size capped) and
//! answers with a signed source+target job, also appended to the target's
//! queue.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::{debug, info};

use crate::application::master::AdmissionGate;
use crate::domain::error::MgmError;
use crate::domain::filesystem::{BootStatus, ConfigStatus, DrainStatus, FsId, FsSnapshot};
use crate::domain::fsview::FsView;
use crate::domain::namespace::Fid;
use crate::domain::transfer_queue::TransferJob;
use crate::infrastructure::capability::{build_transfer_job, CapabilityEngine};
use crate::infrastructure::namespace::Namespace;

/// A file scheduled once is not rescheduled for this long.
const RECENTLY_SCHEDULED_TTL: Duration = Duration::from_secs(3600);

/// Size cap of the recently-scheduled set.
const RECENTLY_SCHEDULED_CAP: usize = 100_000;

/// Candidate samples tried per request before answering "no work".
const CANDIDATE_ATTEMPTS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Balance,
    Drain,
}

pub struct TransferScheduler {
    fsview: Arc<FsView>,
    namespace: Arc<Namespace>,
    capability: Arc<CapabilityEngine>,
    manager: String,

    /// Refused while the post-promotion barrier holds.
    admission: AdmissionGate,

    /// fid -> time of last scheduling, shared across all requests.
    recently: Mutex<LruCache<Fid, Instant>>,

    /// (space, group) -> member cursor for source selection.
    cursor: Mutex<HashMap<(String, u32), usize>>,
}

impl TransferScheduler {
    pub fn new(
        fsview: Arc<FsView>,
        namespace: Arc<Namespace>,
        capability: Arc<CapabilityEngine>,
        manager: impl Into<String>,
        admission: AdmissionGate,
    ) -> Self {
        Self {
            fsview,
            namespace,
            capability,
            manager: manager.into(),
            admission,
            recently: Mutex::new(LruCache::new(
                NonZeroUsize::new(RECENTLY_SCHEDULED_CAP).expect("cap > 0"),
            )),
            cursor: Mutex::new(HashMap::new()),
        }
    }

    pub fn schedule2balance(&self, target: FsId) -> Result<Option<TransferJob>, MgmError> {
        self.schedule(target, TransferKind::Balance)
    }

    pub fn schedule2drain(&self, target: FsId) -> Result<Option<TransferJob>, MgmError> {
        self.schedule(target, TransferKind::Drain)
    }

    fn schedule(&self, target: FsId, kind: TransferKind) -> Result<Option<TransferJob>, MgmError> {
        if !self.admission.allowed() {
            return Ok(None);
        }

        let view = self.fsview.view();
        let target_fs = view
            .fs(target)
            .ok_or_else(|| MgmError::NoDevice(format!("fs {target}")))?;
        let target_snap = target_fs.snapshot();
        let space = target_snap.regs.space.clone();
        let group_index = target_snap.regs.group_index;

        let Some(group) = view.group(&space, group_index) else {
            return Ok(None);
        };
        let members = group.members.clone();
        if members.len() < 2 {
            return Ok(None);
        }

        // per-group cursor so successive polls rotate over the sources
        let start = {
            let mut cursors = self.cursor.lock();
            let cursor = cursors.entry((space.clone(), group_index)).or_insert(0);
            let start = *cursor % members.len();
            *cursor = (*cursor + 1) % members.len();
            start
        };

        let now = chrono::Utc::now().timestamp();
        let mut source_snap: Option<FsSnapshot> = None;

        for i in 0..members.len() {
            let fsid = members[(start + i) % members.len()];
            if fsid == target {
                continue;
            }
            let Some(snapshot) = view.snapshot(fsid) else {
                continue;
            };

            let wanted = match kind {
                TransferKind::Balance => {
                    snapshot.fill_ratio() > snapshot.regs.nominal_filled
                        && snapshot.regs.boot_status == BootStatus::Booted
                        && snapshot.is_active(now)
                        && snapshot.regs.config_status >= ConfigStatus::ReadOnly
                }
                TransferKind::Drain => matches!(
                    snapshot.regs.drain_status,
                    DrainStatus::Draining | DrainStatus::DrainStalling
                ),
            };

            if wanted {
                source_snap = Some(snapshot);
                break;
            }
        }

        let Some(source_snap) = source_snap else {
            debug!(%target, ?kind, "no eligible source in group");
            return Ok(None);
        };

        // candidate fids of the source under the namespace read lock
        let mut fids = self.namespace.fs_files(source_snap.id);
        if fids.is_empty() {
            return Ok(None);
        }
        match kind {
            // balance picks randomly, drain walks oldest-first
            TransferKind::Balance => {
                fids.shuffle(&mut rand::rngs::StdRng::from_entropy())
            }
            TransferKind::Drain => fids.sort_unstable(),
        }

        for fid in fids.into_iter().take(CANDIDATE_ATTEMPTS.max(1)) {
            if self.recently_scheduled(fid) {
                continue;
            }

            let Ok(fmd) = self.namespace.file_by_id(fid) else {
                continue;
            };
            if fmd.has_location(target) {
                continue;
            }
            if fmd.size > target_snap.regs.free_bytes {
                debug!(fid, size = fmd.size, "candidate exceeds target free bytes");
                continue;
            }

            let job = build_transfer_job(
                &self.capability,
                fid,
                fmd.layout,
                fmd.size,
                &self.manager,
                &source_snap,
                &target_snap,
            )
            .map_err(MgmError::from)?;

            match kind {
                TransferKind::Balance => target_fs.balance_queue().add(job.clone()),
                TransferKind::Drain => target_fs.drain_queue().add(job.clone()),
            }

            self.mark_scheduled(fid);
            info!(fid, source = %source_snap.id, %target, ?kind, "scheduled transfer");
            return Ok(Some(job));
        }

        Ok(None)
    }

    fn recently_scheduled(&self, fid: Fid) -> bool {
        let mut recently = self.recently.lock();

        // opportunistic trim of expired entries
        while let Some((_, stamp)) = recently.peek_lru() {
            if stamp.elapsed() > RECENTLY_SCHEDULED_TTL {
                recently.pop_lru();
            } else {
                break;
            }
        }

        recently
            .peek(&fid)
            .is_some_and(|stamp| stamp.elapsed() < RECENTLY_SCHEDULED_TTL)
    }

    fn mark_scheduled(&self, fid: Fid) {
        self.recently.lock().put(fid, Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::filesystem::{ActiveStatus, FsRegisters};
    use crate::domain::layout::LayoutId;

    fn regs(group: u32, filled: f64) -> FsRegisters {
        FsRegisters {
            group_index: group,
            boot_status: BootStatus::Booted,
            config_status: ConfigStatus::ReadWrite,
            active: ActiveStatus::Online,
            heartbeat: chrono::Utc::now().timestamp(),
            capacity_bytes: 1000,
            used_bytes: (filled * 1000.0) as u64,
            free_bytes: 1000 - (filled * 1000.0) as u64,
            nominal_filled: 0.5,
            host: format!("fst{group}"),
            ..Default::default()
        }
    }

    fn setup() -> (Arc<FsView>, Arc<Namespace>, TransferScheduler) {
        let fsview = Arc::new(FsView::new());
        let namespace = Arc::new(Namespace::new());
        namespace
            .create_container("/t", 0, 0, 0o755, false, (0, 0))
            .unwrap();
        let scheduler = TransferScheduler::new(
            fsview.clone(),
            namespace.clone(),
            Arc::new(CapabilityEngine::with_key("t", b"transfer-secret")),
            "mgm1:1094",
            AdmissionGate::default(),
        );
        (fsview, namespace, scheduler)
    }

    fn file_on(namespace: &Namespace, name: &str, fsid: FsId, size: u64) -> Fid {
        let mut fmd = namespace
            .create_file(&format!("/t/{name}"), 0, 0, 0o644, LayoutId::plain(), (0, 0))
            .unwrap();
        fmd.add_location(fsid).unwrap();
        fmd.size = size;
        namespace.update_file(&fmd).unwrap();
        fmd.fid
    }

    #[test]
    fn test_schedule2balance_from_overfilled_source() {
        let (fsview, namespace, scheduler) = setup();
        fsview
            .register_filesystem(FsId(1), regs(0, 0.9), None)
            .unwrap();
        fsview
            .register_filesystem(FsId(2), regs(0, 0.1), None)
            .unwrap();
        file_on(&namespace, "a", FsId(1), 10);

        let job = scheduler.schedule2balance(FsId(2)).unwrap().unwrap();
        assert!(job.body().contains("source.url=root://fst0"));
        assert_eq!(fsview.fs(FsId(2)).unwrap().balance_queue().len(), 1);
    }

    #[test]
    fn test_recently_scheduled_fid_not_repeated() {
        let (fsview, namespace, scheduler) = setup();
        fsview
            .register_filesystem(FsId(1), regs(0, 0.9), None)
            .unwrap();
        fsview
            .register_filesystem(FsId(2), regs(0, 0.1), None)
            .unwrap();
        file_on(&namespace, "a", FsId(1), 10);

        assert!(scheduler.schedule2balance(FsId(2)).unwrap().is_some());
        // the same single candidate is suppressed for the TTL
        assert!(scheduler.schedule2balance(FsId(2)).unwrap().is_none());
    }

    #[test]
    fn test_schedule2drain_requires_draining_source() {
        let (fsview, namespace, scheduler) = setup();
        fsview
            .register_filesystem(FsId(1), regs(0, 0.9), None)
            .unwrap();
        fsview
            .register_filesystem(FsId(2), regs(0, 0.1), None)
            .unwrap();
        let fid_old = file_on(&namespace, "old", FsId(1), 10);
        file_on(&namespace, "new", FsId(1), 10);

        assert!(scheduler.schedule2drain(FsId(2)).unwrap().is_none());

        fsview
            .fs(FsId(1))
            .unwrap()
            .set_drain_status(DrainStatus::Draining);
        let job = scheduler.schedule2drain(FsId(2)).unwrap().unwrap();
        // drain walks oldest-first
        assert!(job.body().contains(&format!("replicate:{fid_old:x}")));
        assert_eq!(fsview.fs(FsId(2)).unwrap().drain_queue().len(), 1);
    }

    #[test]
    fn test_promotion_barrier_suppresses_work() {
        let fsview = Arc::new(FsView::new());
        let namespace = Arc::new(Namespace::new());
        namespace
            .create_container("/t", 0, 0, 0o755, false, (0, 0))
            .unwrap();
        fsview
            .register_filesystem(FsId(1), regs(0, 0.9), None)
            .unwrap();
        fsview
            .register_filesystem(FsId(2), regs(0, 0.1), None)
            .unwrap();

        let gate = AdmissionGate::default();
        let scheduler = TransferScheduler::new(
            fsview,
            namespace.clone(),
            Arc::new(CapabilityEngine::with_key("t", b"transfer-secret")),
            "mgm1:1094",
            gate.clone(),
        );
        file_on(&namespace, "a", FsId(1), 10);

        gate.block_for(Duration::from_secs(3600));
        assert!(scheduler.schedule2balance(FsId(2)).unwrap().is_none());

        gate.clear();
        assert!(scheduler.schedule2balance(FsId(2)).unwrap().is_some());
    }

    #[test]
    fn test_oversized_candidate_is_skipped() {
        let (fsview, namespace, scheduler) = setup();
        fsview
            .register_filesystem(FsId(1), regs(0, 0.9), None)
            .unwrap();
        fsview
            .register_filesystem(FsId(2), regs(0, 0.1), None)
            .unwrap();
        // larger than the target's 900 free bytes
        file_on(&namespace, "big", FsId(1), 5000);

        assert!(scheduler.schedule2balance(FsId(2)).unwrap().is_none());
    }
}
