// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Namespace metadata types.
//!
//! `FileMd` and `ContainerMd` are the value objects the in-memory
//! namespace service stores. Namespace failures carry an errno
//! (`MdError`) and are translated into the client taxonomy at the
//! application boundary; no `MdError` crosses into the wire layer.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::error::MgmError;
use crate::domain::filesystem::FsId;
use crate::domain::layout::LayoutId;

pub type Fid = u64;
pub type Cid = u64;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("md error (errno {errno}): {message}")]
pub struct MdError {
    pub errno: i32,
    pub message: String,
}

impl MdError {
    pub fn new(errno: i32, message: impl Into<String>) -> Self {
        Self {
            errno,
            message: message.into(),
        }
    }

    pub fn enoent(what: impl Into<String>) -> Self {
        Self::new(libc::ENOENT, what)
    }

    pub fn eexist(what: impl Into<String>) -> Self {
        Self::new(libc::EEXIST, what)
    }
}

impl From<MdError> for MgmError {
    fn from(err: MdError) -> Self {
        match err.errno {
            libc::ENOENT => MgmError::NotFound(err.message),
            libc::EEXIST => MgmError::Exists(err.message),
            libc::EISDIR => MgmError::IsDirectory(err.message),
            libc::ENOTDIR => MgmError::NotDirectory(err.message),
            libc::ENOTEMPTY => MgmError::NotEmpty(err.message),
            libc::EPERM => MgmError::Permission(err.message),
            libc::EACCES => MgmError::Access(err.message),
            libc::EINVAL => MgmError::Invalid(err.message),
            libc::EIDRM => MgmError::Removed(err.message),
            _ => MgmError::Internal(err.message),
        }
    }
}

/// Seconds/nanoseconds timestamp pair as stored on metadata records.
pub type MdTime = (i64, u32);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileMd {
    pub fid: Fid,
    pub cid: Cid,
    pub name: String,
    pub layout: LayoutId,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub size: u64,
    pub ctime: MdTime,
    pub mtime: MdTime,
    #[serde(default)]
    pub checksum: Vec<u8>,

    /// Current stripe locations; a set, `fsid=0` never appears.
    pub locations: Vec<FsId>,

    /// Locations awaiting physical deletion by the owning node.
    #[serde(default)]
    pub unlinked: Vec<FsId>,
}

impl FileMd {
    pub fn new(fid: Fid, cid: Cid, name: &str, layout: LayoutId, uid: u32, gid: u32) -> Self {
        Self {
            fid,
            cid,
            name: name.to_string(),
            layout,
            uid,
            gid,
            mode: 0o644,
            size: 0,
            ctime: (0, 0),
            mtime: (0, 0),
            checksum: Vec::new(),
            locations: Vec::new(),
            unlinked: Vec::new(),
        }
    }

    pub fn add_location(&mut self, fsid: FsId) -> Result<(), MdError> {
        if fsid.is_none() {
            return Err(MdError::new(libc::EINVAL, "fsid 0 is reserved"));
        }
        if !self.locations.contains(&fsid) {
            self.locations.push(fsid);
        }
        Ok(())
    }

    pub fn has_location(&self, fsid: FsId) -> bool {
        self.locations.contains(&fsid)
    }

    /// Move one location to the unlinked list.
    pub fn unlink_location(&mut self, fsid: FsId) -> bool {
        let before = self.locations.len();
        self.locations.retain(|l| *l != fsid);
        if self.locations.len() != before {
            if !self.unlinked.contains(&fsid) {
                self.unlinked.push(fsid);
            }
            true
        } else {
            false
        }
    }

    pub fn unlink_all_locations(&mut self) {
        let locations = std::mem::take(&mut self.locations);
        for fsid in locations {
            if !self.unlinked.contains(&fsid) {
                self.unlinked.push(fsid);
            }
        }
    }

    /// Acknowledge physical deletion on one node.
    pub fn remove_unlinked(&mut self, fsid: FsId) -> bool {
        let before = self.unlinked.len();
        self.unlinked.retain(|l| *l != fsid);
        self.unlinked.len() != before
    }

    /// True once both lists are empty; the record must then be destroyed.
    pub fn is_removable(&self) -> bool {
        self.locations.is_empty() && self.unlinked.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerMd {
    pub cid: Cid,
    pub parent: Cid,
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub ctime: MdTime,
    pub mtime: MdTime,

    #[serde(default)]
    pub xattrs: BTreeMap<String, String>,

    /// Child containers by name.
    #[serde(default)]
    pub children: BTreeMap<String, Cid>,

    /// Child files by name.
    #[serde(default)]
    pub files: BTreeMap<String, Fid>,

    /// Marks this container as a quota accounting boundary.
    #[serde(default)]
    pub quota_node: bool,
}

impl ContainerMd {
    pub fn new(cid: Cid, parent: Cid, name: &str, uid: u32, gid: u32, mode: u32) -> Self {
        Self {
            cid,
            parent,
            name: name.to_string(),
            uid,
            gid,
            mode,
            ctime: (0, 0),
            mtime: (0, 0),
            xattrs: BTreeMap::new(),
            children: BTreeMap::new(),
            files: BTreeMap::new(),
            quota_node: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty() && self.files.is_empty()
    }
}

/// POSIX permission probe against mode bits.
pub fn posix_allows(
    mode: u32,
    owner_uid: u32,
    owner_gid: u32,
    vid: &crate::domain::identity::VirtualIdentity,
    want_r: bool,
    want_w: bool,
    want_x: bool,
) -> bool {
    if vid.is_root() {
        return true;
    }

    let shift = if vid.has_uid(owner_uid) {
        6
    } else if vid.has_gid(owner_gid) {
        3
    } else {
        0
    };

    let bits = (mode >> shift) & 0o7;
    (!want_r || bits & 0o4 != 0) && (!want_w || bits & 0o2 != 0) && (!want_x || bits & 0o1 != 0)
}

/// Per-id accounting entry on a quota node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageEntry {
    /// Bytes on disk including layout redundancy.
    pub physical_space: u64,
    /// Logical bytes.
    pub space: u64,
    pub files: u64,
}

/// Authoritative per-uid/per-gid usage tables of one quota node.
#[derive(Debug, Clone, Default)]
pub struct QuotaNodeUsage {
    pub per_uid: HashMap<u32, UsageEntry>,
    pub per_gid: HashMap<u32, UsageEntry>,
}

impl QuotaNodeUsage {
    pub fn add_file(&mut self, fmd: &FileMd) {
        let physical = (fmd.size as f64 * fmd.layout.size_factor()) as u64;

        let uid = self.per_uid.entry(fmd.uid).or_default();
        uid.physical_space += physical;
        uid.space += fmd.size;
        uid.files += 1;

        let gid = self.per_gid.entry(fmd.gid).or_default();
        gid.physical_space += physical;
        gid.space += fmd.size;
        gid.files += 1;
    }

    pub fn remove_file(&mut self, fmd: &FileMd) {
        let physical = (fmd.size as f64 * fmd.layout.size_factor()) as u64;

        if let Some(uid) = self.per_uid.get_mut(&fmd.uid) {
            uid.physical_space = uid.physical_space.saturating_sub(physical);
            uid.space = uid.space.saturating_sub(fmd.size);
            uid.files = uid.files.saturating_sub(1);
        }
        if let Some(gid) = self.per_gid.get_mut(&fmd.gid) {
            gid.physical_space = gid.physical_space.saturating_sub(physical);
            gid.space = gid.space.saturating_sub(fmd.size);
            gid.files = gid.files.saturating_sub(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_list_is_a_set_rejecting_zero() {
        let mut fmd = FileMd::new(1, 1, "f", LayoutId::plain(), 0, 0);
        assert!(fmd.add_location(FsId(0)).is_err());
        fmd.add_location(FsId(3)).unwrap();
        fmd.add_location(FsId(3)).unwrap();
        assert_eq!(fmd.locations, vec![FsId(3)]);
    }

    #[test]
    fn test_unlink_then_drop_lifecycle() {
        let mut fmd = FileMd::new(1, 1, "f", LayoutId::plain(), 0, 0);
        fmd.add_location(FsId(3)).unwrap();
        fmd.add_location(FsId(4)).unwrap();

        assert!(fmd.unlink_location(FsId(3)));
        assert_eq!(fmd.locations, vec![FsId(4)]);
        assert_eq!(fmd.unlinked, vec![FsId(3)]);
        assert!(!fmd.is_removable());

        fmd.unlink_all_locations();
        assert!(fmd.remove_unlinked(FsId(3)));
        assert!(fmd.remove_unlinked(FsId(4)));
        assert!(fmd.is_removable());
    }

    #[test]
    fn test_quota_usage_add_remove_roundtrip() {
        let mut usage = QuotaNodeUsage::default();
        let mut fmd = FileMd::new(1, 1, "f", LayoutId::replica(2).unwrap(), 10, 20);
        fmd.size = 1000;

        usage.add_file(&fmd);
        assert_eq!(usage.per_uid[&10].space, 1000);
        assert_eq!(usage.per_uid[&10].physical_space, 2000);
        assert_eq!(usage.per_gid[&20].files, 1);

        usage.remove_file(&fmd);
        assert_eq!(usage.per_uid[&10], UsageEntry::default());
        assert_eq!(usage.per_gid[&20], UsageEntry::default());
    }

    #[test]
    fn test_posix_allows() {
        use crate::domain::identity::VirtualIdentity;

        let owner = VirtualIdentity::new(10, 20);
        let group = VirtualIdentity::new(11, 20);
        let other = VirtualIdentity::new(12, 21);

        assert!(posix_allows(0o750, 10, 20, &owner, true, true, true));
        assert!(posix_allows(0o750, 10, 20, &group, true, false, true));
        assert!(!posix_allows(0o750, 10, 20, &group, false, true, false));
        assert!(!posix_allows(0o750, 10, 20, &other, true, false, false));
        assert!(posix_allows(0o750, 10, 20, &VirtualIdentity::root(), true, true, true));
    }
}
