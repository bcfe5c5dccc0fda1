// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! File system aggregate.
//!
//! A file system is one logical disk owned by a storage node. The live
//! object carries mutable registers updated from node heartbeats and
//! operator commands; consumers on the scheduling path always work on an
//! immutable [`FsSnapshot`] so they never race against register updates.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::domain::transfer_queue::TransferQueue;

/// Stable file system identifier; 0 is reserved as "no filesystem".
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct FsId(pub u32);

impl FsId {
    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for FsId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Operator-configured status. Ordering matters: scheduling uses floors
/// like "at least write-once" to admit a file system.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ConfigStatus {
    Off,
    Empty,
    DrainDead,
    Drain,
    #[serde(rename = "ro")]
    ReadOnly,
    #[serde(rename = "wo")]
    WriteOnce,
    #[serde(rename = "rw")]
    ReadWrite,
}

impl ConfigStatus {
    pub fn is_drain(self) -> bool {
        matches!(self, Self::Drain | Self::DrainDead)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Empty => "empty",
            Self::DrainDead => "draindead",
            Self::Drain => "drain",
            Self::ReadOnly => "ro",
            Self::WriteOnce => "wo",
            Self::ReadWrite => "rw",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BootStatus {
    Down,
    BootFailure,
    Booting,
    Booted,
    OpsError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DrainStatus {
    NoDrain,
    DrainPrepare,
    DrainWait,
    Draining,
    DrainStalling,
    Drained,
    DrainExpired,
}

impl DrainStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoDrain => "nodrain",
            Self::DrainPrepare => "drainprepare",
            Self::DrainWait => "drainwait",
            Self::Draining => "draining",
            Self::DrainStalling => "drainstalling",
            Self::Drained => "drained",
            Self::DrainExpired => "drainexpired",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActiveStatus {
    Offline,
    Online,
}

/// Heartbeats older than this mark the file system inactive.
pub const HEARTBEAT_WINDOW_SECS: i64 = 60;

/// Mutable registers of one file system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FsRegisters {
    pub host: String,
    pub port: u16,

    /// Mount prefix on the owning storage node.
    pub local_prefix: String,

    pub space: String,
    pub group_index: u32,
    pub geo_tag: String,

    pub config_status: ConfigStatus,
    pub boot_status: BootStatus,
    pub drain_status: DrainStatus,
    pub active: ActiveStatus,

    /// Weighted-errors code reported by the node; non-zero excludes the FS
    /// from scheduling.
    pub err_code: u32,

    /// Unix seconds of the last node heartbeat.
    pub heartbeat: i64,

    pub capacity_bytes: u64,
    pub used_bytes: u64,
    pub free_bytes: u64,
    pub files: u64,

    pub disk_utilization: f64,
    pub net_in_rate_mib: f64,
    pub net_out_rate_mib: f64,
    pub net_eth_rate_mib: f64,

    /// Fill ratio above which the FS becomes a balance source.
    pub nominal_filled: f64,

    #[serde(with = "humantime_serde")]
    pub drain_period: Duration,

    #[serde(with = "humantime_serde")]
    pub grace_period: Duration,

    /// Set while a peer in the group drains; lets the node pull stripes.
    #[serde(default)]
    pub drain_pull: bool,
}

impl Default for FsRegisters {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 1094,
            local_prefix: "/data".to_string(),
            space: "default".to_string(),
            group_index: 0,
            geo_tag: String::new(),
            config_status: ConfigStatus::Off,
            boot_status: BootStatus::Down,
            drain_status: DrainStatus::NoDrain,
            active: ActiveStatus::Offline,
            err_code: 0,
            heartbeat: 0,
            capacity_bytes: 0,
            used_bytes: 0,
            free_bytes: 0,
            files: 0,
            disk_utilization: 0.0,
            net_in_rate_mib: 0.0,
            net_out_rate_mib: 0.0,
            net_eth_rate_mib: 0.0,
            nominal_filled: 0.95,
            drain_period: Duration::from_secs(86400),
            grace_period: Duration::from_secs(0),
            drain_pull: false,
        }
    }
}

/// Immutable point-in-time view of one file system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FsSnapshot {
    pub id: FsId,
    #[serde(flatten)]
    pub regs: FsRegisters,
}

impl FsSnapshot {
    pub fn host_port(&self) -> String {
        format!("{}:{}", self.regs.host, self.regs.port)
    }

    /// Node queue path used to address messages to the owning storage node.
    pub fn node_queue(&self) -> String {
        format!("/fst/{}:{}", self.regs.host, self.regs.port)
    }

    pub fn has_heartbeat(&self, now_unix: i64) -> bool {
        now_unix - self.regs.heartbeat < HEARTBEAT_WINDOW_SECS
    }

    pub fn is_active(&self, now_unix: i64) -> bool {
        self.regs.active == ActiveStatus::Online && self.has_heartbeat(now_unix)
    }

    pub fn fill_ratio(&self) -> f64 {
        if self.regs.capacity_bytes == 0 {
            return 0.0;
        }
        self.regs.used_bytes as f64 / self.regs.capacity_bytes as f64
    }
}

/// Exported drain progress registers (`stat.drain*`).
#[derive(Debug, Default)]
pub struct DrainStats {
    pub files: AtomicU64,
    pub bytes_left: AtomicU64,
    pub progress: AtomicU64,
    pub retries: AtomicU64,
}

impl DrainStats {
    pub fn reset(&self) {
        self.files.store(0, Ordering::Relaxed);
        self.bytes_left.store(0, Ordering::Relaxed);
        self.progress.store(0, Ordering::Relaxed);
        self.retries.store(0, Ordering::Relaxed);
    }
}

/// Typed hook invoked after every configured-status change.
///
/// The drain engine registers itself here so a flip to `drain`/`draindead`
/// starts an evacuation without the fleet layer knowing about drain jobs.
pub trait OnConfigStatusChanged: Send + Sync {
    fn on_config_status_changed(&self, fsid: FsId, old: ConfigStatus, new: ConfigStatus);
}

const RESERVATION_WINDOW: Duration = Duration::from_secs(60);

pub struct FileSystem {
    id: FsId,
    regs: RwLock<FsRegisters>,
    drain_stats: DrainStats,

    /// Bytes prebooked by placement decisions inside the current window.
    booked: Mutex<(Instant, u64)>,

    hook: Mutex<Option<Arc<dyn OnConfigStatusChanged>>>,

    balance_queue: TransferQueue,
    drain_queue: TransferQueue,
    external_queue: TransferQueue,
}

impl FileSystem {
    pub fn new(id: FsId, regs: FsRegisters) -> Self {
        Self {
            id,
            regs: RwLock::new(regs),
            drain_stats: DrainStats::default(),
            booked: Mutex::new((Instant::now(), 0)),
            hook: Mutex::new(None),
            balance_queue: TransferQueue::new(),
            drain_queue: TransferQueue::new(),
            external_queue: TransferQueue::new(),
        }
    }

    pub fn id(&self) -> FsId {
        self.id
    }

    pub fn snapshot(&self) -> FsSnapshot {
        FsSnapshot {
            id: self.id,
            regs: self.regs.read().clone(),
        }
    }

    pub fn update<F: FnOnce(&mut FsRegisters)>(&self, f: F) {
        f(&mut self.regs.write());
    }

    pub fn set_hook(&self, hook: Arc<dyn OnConfigStatusChanged>) {
        *self.hook.lock() = Some(hook);
    }

    pub fn config_status(&self) -> ConfigStatus {
        self.regs.read().config_status
    }

    pub fn set_config_status(&self, status: ConfigStatus) {
        let old = {
            let mut regs = self.regs.write();
            let old = regs.config_status;
            regs.config_status = status;
            old
        };

        if old != status {
            let hook = self.hook.lock().clone();
            if let Some(hook) = hook {
                hook.on_config_status_changed(self.id, old, status);
            }
        }
    }

    pub fn drain_status(&self) -> DrainStatus {
        self.regs.read().drain_status
    }

    pub fn set_drain_status(&self, status: DrainStatus) {
        self.regs.write().drain_status = status;
    }

    pub fn set_drain_pull(&self, enabled: bool) {
        self.regs.write().drain_pull = enabled;
    }

    pub fn drain_stats(&self) -> &DrainStats {
        &self.drain_stats
    }

    /// Prebook space for a placement decision.
    ///
    /// Bookings accumulate inside a short window so concurrent placements
    /// do not all see the same free bytes; the window resets once the node
    /// has had time to report fresh counters.
    pub fn try_reserve(&self, snapshot: &FsSnapshot, booking: u64) -> bool {
        let mut booked = self.booked.lock();
        if booked.0.elapsed() > RESERVATION_WINDOW {
            *booked = (Instant::now(), 0);
        }

        if snapshot.regs.free_bytes < booked.1.saturating_add(booking) {
            return false;
        }
        booked.1 += booking;
        true
    }

    pub fn balance_queue(&self) -> &TransferQueue {
        &self.balance_queue
    }

    pub fn drain_queue(&self) -> &TransferQueue {
        &self.drain_queue
    }

    pub fn external_queue(&self) -> &TransferQueue {
        &self.external_queue
    }
}

impl std::fmt::Debug for FileSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSystem")
            .field("id", &self.id)
            .field("regs", &*self.regs.read())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn booted_fs(id: u32, free: u64) -> FileSystem {
        let fs = FileSystem::new(
            FsId(id),
            FsRegisters {
                boot_status: BootStatus::Booted,
                config_status: ConfigStatus::ReadWrite,
                active: ActiveStatus::Online,
                free_bytes: free,
                capacity_bytes: free * 2,
                used_bytes: free,
                ..Default::default()
            },
        );
        fs
    }

    #[test]
    fn test_config_status_ordering() {
        assert!(ConfigStatus::ReadWrite > ConfigStatus::WriteOnce);
        assert!(ConfigStatus::WriteOnce > ConfigStatus::ReadOnly);
        assert!(ConfigStatus::ReadOnly > ConfigStatus::Drain);
        assert!(ConfigStatus::Drain > ConfigStatus::DrainDead);
        assert!(ConfigStatus::Off < ConfigStatus::Empty);
    }

    #[test]
    fn test_reserve_space_accumulates() {
        let fs = booted_fs(1, 1000);
        let snap = fs.snapshot();

        assert!(fs.try_reserve(&snap, 400));
        assert!(fs.try_reserve(&snap, 400));
        assert!(!fs.try_reserve(&snap, 400));
    }

    #[test]
    fn test_config_status_hook_fires_on_change_only() {
        struct Recorder(Mutex<Vec<(ConfigStatus, ConfigStatus)>>);
        impl OnConfigStatusChanged for Recorder {
            fn on_config_status_changed(&self, _: FsId, old: ConfigStatus, new: ConfigStatus) {
                self.0.lock().push((old, new));
            }
        }

        let fs = booted_fs(2, 0);
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        fs.set_hook(recorder.clone());

        fs.set_config_status(ConfigStatus::Drain);
        fs.set_config_status(ConfigStatus::Drain);
        fs.set_config_status(ConfigStatus::Empty);

        let calls = recorder.0.lock();
        assert_eq!(
            *calls,
            vec![
                (ConfigStatus::ReadWrite, ConfigStatus::Drain),
                (ConfigStatus::Drain, ConfigStatus::Empty),
            ]
        );
    }

    #[test]
    fn test_heartbeat_window() {
        let fs = booted_fs(3, 0);
        fs.update(|r| r.heartbeat = 1000);
        let snap = fs.snapshot();
        assert!(snap.is_active(1030));
        assert!(!snap.is_active(1100));
    }
}
