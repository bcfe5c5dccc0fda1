// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Fleet topology: file systems grouped into scheduling groups and spaces.
//!
//! `FileSystem ↔ FsGroup ↔ FsSpace` is represented as an arena keyed by
//! stable ids (`FsId`, group index, space name) so views can be shared
//! without ownership cycles. All topology mutations happen under the view
//! lock; per-FS register updates go through the `FileSystem` aggregate and
//! need only a read lock here.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::filesystem::{FileSystem, FsId, FsRegisters, FsSnapshot, OnConfigStatusChanged};

#[derive(Debug, Error)]
pub enum FsViewError {
    #[error("filesystem {0} already registered")]
    DuplicateFs(FsId),

    #[error("filesystem {0} not registered")]
    UnknownFs(FsId),

    #[error("space {0} not registered")]
    UnknownSpace(String),

    #[error("fsid 0 is reserved")]
    ReservedFsId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlacementPolicy {
    /// Prefer the client's geo site.
    Local,
    /// Spread replicas across geo sites.
    Spread,
    /// Spread, but keep the head replica local.
    Hybrid,
}

impl Default for PlacementPolicy {
    fn default() -> Self {
        Self::Spread
    }
}

/// Per-space configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpaceOptions {
    #[serde(default)]
    pub placement_policy: PlacementPolicy,

    #[serde(default = "default_true")]
    pub quota_enabled: bool,

    /// Reserved gid accounting project quota.
    #[serde(default = "default_project_gid")]
    pub project_gid: u32,

    /// Weight multiplier applied to a candidate in an already-chosen geo
    /// site until a second site is placed.
    #[serde(default = "default_geo_penalty")]
    pub geo_penalty: f64,

    #[serde(default = "default_true")]
    pub balance_enabled: bool,

    /// Master-supplied settle delay before a drain starts moving files.
    #[serde(default = "default_drain_delay", with = "humantime_serde")]
    pub drain_service_delay: Duration,
}

fn default_true() -> bool {
    true
}

fn default_project_gid() -> u32 {
    99
}

fn default_geo_penalty() -> f64 {
    0.05
}

fn default_drain_delay() -> Duration {
    Duration::from_secs(60)
}

impl Default for SpaceOptions {
    fn default() -> Self {
        Self {
            placement_policy: PlacementPolicy::default(),
            quota_enabled: true,
            project_gid: default_project_gid(),
            geo_penalty: default_geo_penalty(),
            balance_enabled: true,
            drain_service_delay: default_drain_delay(),
        }
    }
}

/// Exported balancing state of one scheduling group (`stat.balancing`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BalancingStatus {
    Idle,
    Balancing,
    Stalled,
    Incomplete,
    Cooldown,
}

impl BalancingStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Balancing => "balancing",
            Self::Stalled => "stalled",
            Self::Incomplete => "incomplete",
            Self::Cooldown => "cooldown",
        }
    }
}

#[derive(Debug)]
pub struct GroupState {
    balancing: Mutex<BalancingStatus>,
}

impl GroupState {
    fn new() -> Self {
        Self {
            balancing: Mutex::new(BalancingStatus::Idle),
        }
    }

    pub fn balancing(&self) -> BalancingStatus {
        *self.balancing.lock()
    }

    pub fn set_balancing(&self, status: BalancingStatus) {
        *self.balancing.lock() = status;
    }
}

/// Ordered set of file systems with a stable index inside its space.
#[derive(Debug, Clone)]
pub struct FsGroup {
    pub index: u32,
    pub members: Vec<FsId>,
    pub state: Arc<GroupState>,
}

impl FsGroup {
    fn new(index: u32) -> Self {
        Self {
            index,
            members: Vec::new(),
            state: Arc::new(GroupState::new()),
        }
    }

    pub fn size(&self) -> usize {
        self.members.len()
    }
}

#[derive(Debug, Clone)]
pub struct FsSpace {
    pub name: String,
    pub options: SpaceOptions,
    pub groups: BTreeMap<u32, FsGroup>,
}

impl FsSpace {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            options: SpaceOptions::default(),
            groups: BTreeMap::new(),
        }
    }
}

/// Topology data guarded by the view lock.
#[derive(Debug, Default)]
pub struct FsViewData {
    pub filesystems: HashMap<FsId, Arc<FileSystem>>,
    pub spaces: BTreeMap<String, FsSpace>,
}

impl FsViewData {
    pub fn fs(&self, fsid: FsId) -> Option<&Arc<FileSystem>> {
        self.filesystems.get(&fsid)
    }

    pub fn snapshot(&self, fsid: FsId) -> Option<FsSnapshot> {
        self.filesystems.get(&fsid).map(|fs| fs.snapshot())
    }

    pub fn space(&self, name: &str) -> Option<&FsSpace> {
        self.spaces.get(name)
    }

    pub fn group(&self, space: &str, index: u32) -> Option<&FsGroup> {
        self.spaces.get(space).and_then(|s| s.groups.get(&index))
    }

    /// Average used bytes over the booted members of one group.
    pub fn group_average_used_bytes(&self, space: &str, index: u32) -> u64 {
        let Some(group) = self.group(space, index) else {
            return 0;
        };

        let mut total = 0u64;
        let mut count = 0u64;
        for fsid in &group.members {
            if let Some(fs) = self.filesystems.get(fsid) {
                total += fs.snapshot().regs.used_bytes;
                count += 1;
            }
        }

        if count == 0 {
            0
        } else {
            total / count
        }
    }

    /// Average used bytes across all members of a space, the aggregate
    /// used to identify balance sources and targets.
    pub fn space_average_used_bytes(&self, space: &str) -> u64 {
        let Some(sp) = self.spaces.get(space) else {
            return 0;
        };

        let mut total = 0u64;
        let mut count = 0u64;
        for group in sp.groups.values() {
            for fsid in &group.members {
                if let Some(fs) = self.filesystems.get(fsid) {
                    total += fs.snapshot().regs.used_bytes;
                    count += 1;
                }
            }
        }

        if count == 0 {
            0
        } else {
            total / count
        }
    }
}

/// The authoritative fleet view, a process-wide service initialised before
/// any request-serving task starts.
#[derive(Debug, Default)]
pub struct FsView {
    inner: RwLock<FsViewData>,
}

impl FsView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read access under the view lock. Callers must not hold the guard
    /// across suspension points.
    pub fn view(&self) -> RwLockReadGuard<'_, FsViewData> {
        self.inner.read()
    }

    pub fn register_space(&self, name: &str, options: SpaceOptions) {
        let mut data = self.inner.write();
        let space = data
            .spaces
            .entry(name.to_string())
            .or_insert_with(|| FsSpace::new(name));
        space.options = options;
    }

    pub fn space_options(&self, name: &str) -> Option<SpaceOptions> {
        self.inner.read().spaces.get(name).map(|s| s.options.clone())
    }

    /// Register a file system into its space and scheduling group.
    pub fn register_filesystem(
        &self,
        fsid: FsId,
        regs: FsRegisters,
        hook: Option<Arc<dyn OnConfigStatusChanged>>,
    ) -> Result<Arc<FileSystem>, FsViewError> {
        if fsid.is_none() {
            return Err(FsViewError::ReservedFsId);
        }

        let mut data = self.inner.write();
        if data.filesystems.contains_key(&fsid) {
            return Err(FsViewError::DuplicateFs(fsid));
        }

        let space_name = regs.space.clone();
        let group_index = regs.group_index;

        let fs = Arc::new(FileSystem::new(fsid, regs));
        if let Some(hook) = hook {
            fs.set_hook(hook);
        }

        let space = data
            .spaces
            .entry(space_name.clone())
            .or_insert_with(|| FsSpace::new(&space_name));
        let group = space
            .groups
            .entry(group_index)
            .or_insert_with(|| FsGroup::new(group_index));
        group.members.push(fsid);

        data.filesystems.insert(fsid, fs.clone());
        Ok(fs)
    }

    pub fn unregister_filesystem(&self, fsid: FsId) -> Result<(), FsViewError> {
        let mut data = self.inner.write();
        let fs = data
            .filesystems
            .remove(&fsid)
            .ok_or(FsViewError::UnknownFs(fsid))?;

        let snap = fs.snapshot();
        if let Some(space) = data.spaces.get_mut(&snap.regs.space) {
            if let Some(group) = space.groups.get_mut(&snap.regs.group_index) {
                group.members.retain(|m| *m != fsid);
            }
        }
        Ok(())
    }

    pub fn fs(&self, fsid: FsId) -> Option<Arc<FileSystem>> {
        self.inner.read().filesystems.get(&fsid).cloned()
    }

    pub fn snapshot(&self, fsid: FsId) -> Option<FsSnapshot> {
        self.fs(fsid).map(|fs| fs.snapshot())
    }

    /// All file systems, for fleet-wide sweeps like the deletion round.
    pub fn all_filesystems(&self) -> Vec<Arc<FileSystem>> {
        self.inner.read().filesystems.values().cloned().collect()
    }

    pub fn group_handles(&self, space: &str) -> Vec<FsGroup> {
        self.inner
            .read()
            .spaces
            .get(space)
            .map(|s| s.groups.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn space_names(&self) -> Vec<String> {
        self.inner.read().spaces.keys().cloned().collect()
    }
}
