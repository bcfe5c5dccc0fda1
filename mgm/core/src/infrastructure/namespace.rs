// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! In-memory namespace service.
//!
//! Holds the authoritative container/file tree, the per-FS file and
//! unlinked-file indexes, and the per-quota-node accounting tables. All
//! mutations happen under one write lock (the namespace RW mutex of the
//! locking order) and bump a mutation counter which stands in for the
//! change-log offset followers replay to.
//!
//! Quota consistency contract: every file mutation updates the owning
//! quota node by removing the old record before the change and adding the
//! new one after, inside the same critical section.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;

use crate::domain::filesystem::FsId;
use crate::domain::layout::LayoutId;
use crate::domain::namespace::{
    Cid, ContainerMd, Fid, FileMd, MdError, MdTime, QuotaNodeUsage,
};

pub const ROOT_CID: Cid = 1;

const S_ISGID: u32 = 0o2000;

#[derive(Debug, Clone)]
pub enum Entry {
    File(FileMd),
    Container(ContainerMd),
}

#[derive(Debug, Default)]
struct NsInner {
    containers: HashMap<Cid, ContainerMd>,
    files: HashMap<Fid, FileMd>,
    next_cid: Cid,
    next_fid: Fid,

    fs_files: HashMap<FsId, BTreeSet<Fid>>,
    fs_unlinked: HashMap<FsId, BTreeSet<Fid>>,

    quota_usage: HashMap<Cid, QuotaNodeUsage>,

    mutations: u64,
}

impl NsInner {
    fn bump(&mut self) {
        self.mutations += 1;
    }

    fn resolve_container_id(&self, path: &str) -> Result<Cid, MdError> {
        let mut cid = ROOT_CID;
        for part in split_path(path) {
            let container = self
                .containers
                .get(&cid)
                .ok_or_else(|| MdError::enoent(path))?;
            match container.children.get(part) {
                Some(child) => cid = *child,
                None => {
                    if container.files.contains_key(part) {
                        return Err(MdError::new(libc::ENOTDIR, path));
                    }
                    return Err(MdError::enoent(path));
                }
            }
        }
        Ok(cid)
    }

    fn resolve_fid(&self, path: &str) -> Result<Fid, MdError> {
        let (dir, name) = split_parent(path)?;
        let cid = self.resolve_container_id(dir)?;
        let container = self
            .containers
            .get(&cid)
            .ok_or_else(|| MdError::enoent(path))?;
        container
            .files
            .get(name)
            .copied()
            .ok_or_else(|| MdError::enoent(path))
    }

    /// Nearest quota boundary at or above `cid`.
    fn quota_node_for(&self, mut cid: Cid) -> Option<Cid> {
        loop {
            let container = self.containers.get(&cid)?;
            if container.quota_node {
                return Some(cid);
            }
            if container.parent == 0 {
                return None;
            }
            cid = container.parent;
        }
    }

    fn quota_remove(&mut self, fmd: &FileMd) {
        if let Some(node) = self.quota_node_for(fmd.cid) {
            if let Some(usage) = self.quota_usage.get_mut(&node) {
                usage.remove_file(fmd);
            }
        }
    }

    fn quota_add(&mut self, fmd: &FileMd) {
        if let Some(node) = self.quota_node_for(fmd.cid) {
            self.quota_usage
                .entry(node)
                .or_default()
                .add_file(fmd);
        }
    }

    fn index_locations(&mut self, fmd: &FileMd) {
        for fsid in &fmd.locations {
            self.fs_files.entry(*fsid).or_default().insert(fmd.fid);
        }
        for fsid in &fmd.unlinked {
            self.fs_unlinked.entry(*fsid).or_default().insert(fmd.fid);
        }
    }

    fn unindex_locations(&mut self, fmd: &FileMd) {
        for fsid in &fmd.locations {
            if let Some(set) = self.fs_files.get_mut(fsid) {
                set.remove(&fmd.fid);
            }
        }
        for fsid in &fmd.unlinked {
            if let Some(set) = self.fs_unlinked.get_mut(fsid) {
                set.remove(&fmd.fid);
            }
        }
    }

    fn destroy_file(&mut self, fid: Fid) {
        if let Some(fmd) = self.files.remove(&fid) {
            self.unindex_locations(&fmd);
        }
    }

    fn container_path(&self, mut cid: Cid) -> String {
        let mut parts = Vec::new();
        while cid != ROOT_CID {
            let Some(container) = self.containers.get(&cid) else {
                break;
            };
            parts.push(container.name.clone());
            cid = container.parent;
        }
        parts.reverse();
        format!("/{}", parts.join("/"))
    }
}

fn split_path(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|p| !p.is_empty())
}

fn split_parent(path: &str) -> Result<(&str, &str), MdError> {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rsplit_once('/') {
        Some((dir, name)) if !name.is_empty() => {
            Ok((if dir.is_empty() { "/" } else { dir }, name))
        }
        _ => Err(MdError::new(libc::EINVAL, path)),
    }
}

pub struct Namespace {
    inner: RwLock<NsInner>,
    writable: AtomicBool,
}

impl Namespace {
    pub fn new() -> Self {
        let mut inner = NsInner {
            next_cid: ROOT_CID + 1,
            next_fid: 1,
            ..Default::default()
        };
        inner
            .containers
            .insert(ROOT_CID, ContainerMd::new(ROOT_CID, 0, "/", 0, 0, 0o755));

        Self {
            inner: RwLock::new(inner),
            writable: AtomicBool::new(true),
        }
    }

    /// Follower mode rejects every mutation.
    pub fn set_writable(&self, writable: bool) {
        self.writable.store(writable, Ordering::SeqCst);
    }

    pub fn is_writable(&self) -> bool {
        self.writable.load(Ordering::SeqCst)
    }

    fn ensure_writable(&self) -> Result<(), MdError> {
        if self.is_writable() {
            Ok(())
        } else {
            Err(MdError::new(libc::EROFS, "namespace is read-only"))
        }
    }

    /// Change-log offset stand-in.
    pub fn mutations(&self) -> u64 {
        self.inner.read().mutations
    }

    pub fn counts(&self) -> (u64, u64) {
        let inner = self.inner.read();
        (inner.containers.len() as u64, inner.files.len() as u64)
    }

    // ------------------------------------------------------------------
    // Lookups
    // ------------------------------------------------------------------

    pub fn lookup(&self, path: &str) -> Option<Entry> {
        let inner = self.inner.read();
        if let Ok(cid) = inner.resolve_container_id(path) {
            return inner.containers.get(&cid).cloned().map(Entry::Container);
        }
        inner
            .resolve_fid(path)
            .ok()
            .and_then(|fid| inner.files.get(&fid).cloned())
            .map(Entry::File)
    }

    pub fn resolve_container(&self, path: &str) -> Result<ContainerMd, MdError> {
        let inner = self.inner.read();
        let cid = inner.resolve_container_id(path)?;
        inner
            .containers
            .get(&cid)
            .cloned()
            .ok_or_else(|| MdError::enoent(path))
    }

    pub fn resolve_file(&self, path: &str) -> Result<FileMd, MdError> {
        let inner = self.inner.read();
        let fid = inner.resolve_fid(path)?;
        inner
            .files
            .get(&fid)
            .cloned()
            .ok_or_else(|| MdError::enoent(path))
    }

    pub fn container_by_id(&self, cid: Cid) -> Result<ContainerMd, MdError> {
        self.inner
            .read()
            .containers
            .get(&cid)
            .cloned()
            .ok_or_else(|| MdError::enoent(format!("cid {cid}")))
    }

    pub fn file_by_id(&self, fid: Fid) -> Result<FileMd, MdError> {
        self.inner
            .read()
            .files
            .get(&fid)
            .cloned()
            .ok_or_else(|| MdError::enoent(format!("fid {fid}")))
    }

    pub fn container_path(&self, cid: Cid) -> String {
        self.inner.read().container_path(cid)
    }

    /// Attributes of the deepest existing container on `path`.
    pub fn deepest_attrs(&self, path: &str) -> (Cid, crate::domain::attrs::AttrMap) {
        let inner = self.inner.read();
        let mut cid = ROOT_CID;
        for part in split_path(path) {
            let Some(container) = inner.containers.get(&cid) else {
                break;
            };
            match container.children.get(part) {
                Some(child) => cid = *child,
                None => break,
            }
        }
        let attrs = inner
            .containers
            .get(&cid)
            .map(|c| c.xattrs.clone())
            .unwrap_or_default();
        (cid, attrs)
    }

    // ------------------------------------------------------------------
    // Container mutations
    // ------------------------------------------------------------------

    /// Create a container; with `mkpath` missing ancestors are created and
    /// inherit S_ISGID group ownership and the `sys.acl` of the nearest
    /// existing parent.
    pub fn create_container(
        &self,
        path: &str,
        uid: u32,
        gid: u32,
        mode: u32,
        mkpath: bool,
        now: MdTime,
    ) -> Result<ContainerMd, MdError> {
        self.ensure_writable()?;
        let mut inner = self.inner.write();

        let mut cid = ROOT_CID;
        let parts: Vec<&str> = split_path(path).collect();
        if parts.is_empty() {
            return Err(MdError::eexist(path));
        }

        for (i, part) in parts.iter().enumerate() {
            let last = i + 1 == parts.len();
            let parent = inner
                .containers
                .get(&cid)
                .ok_or_else(|| MdError::enoent(path))?
                .clone();

            if let Some(child) = parent.children.get(*part) {
                if last {
                    return Err(MdError::eexist(path));
                }
                cid = *child;
                continue;
            }
            if parent.files.contains_key(*part) {
                return Err(MdError::new(libc::ENOTDIR, path));
            }
            if !last && !mkpath {
                return Err(MdError::enoent(path));
            }

            let new_cid = inner.next_cid;
            inner.next_cid += 1;

            let mut child = ContainerMd::new(new_cid, cid, part, uid, gid, mode);
            child.ctime = now;
            child.mtime = now;
            if parent.mode & S_ISGID != 0 {
                child.gid = parent.gid;
                child.mode |= S_ISGID;
            }
            if let Some(acl) = parent.xattrs.get(crate::domain::attrs::SYS_ACL) {
                child
                    .xattrs
                    .insert(crate::domain::attrs::SYS_ACL.to_string(), acl.clone());
            }

            inner
                .containers
                .get_mut(&cid)
                .expect("parent exists")
                .children
                .insert(part.to_string(), new_cid);
            inner.containers.insert(new_cid, child);
            inner.bump();
            cid = new_cid;
        }

        Ok(inner.containers.get(&cid).cloned().expect("just created"))
    }

    pub fn remove_container(&self, path: &str) -> Result<(), MdError> {
        self.ensure_writable()?;
        let mut inner = self.inner.write();

        let cid = inner.resolve_container_id(path)?;
        if cid == ROOT_CID {
            return Err(MdError::new(libc::EPERM, "cannot remove root"));
        }
        let container = inner.containers.get(&cid).expect("resolved").clone();
        if !container.is_empty() {
            return Err(MdError::new(libc::ENOTEMPTY, path));
        }

        if let Some(parent) = inner.containers.get_mut(&container.parent) {
            parent.children.remove(&container.name);
        }
        inner.quota_usage.remove(&cid);
        inner.containers.remove(&cid);
        inner.bump();
        Ok(())
    }

    pub fn update_container(&self, cmd: &ContainerMd) -> Result<(), MdError> {
        self.ensure_writable()?;
        let mut inner = self.inner.write();
        if !inner.containers.contains_key(&cmd.cid) {
            return Err(MdError::enoent(format!("cid {}", cmd.cid)));
        }
        inner.containers.insert(cmd.cid, cmd.clone());
        inner.bump();
        Ok(())
    }

    // ------------------------------------------------------------------
    // File mutations
    // ------------------------------------------------------------------

    pub fn create_file(
        &self,
        path: &str,
        uid: u32,
        gid: u32,
        mode: u32,
        layout: LayoutId,
        now: MdTime,
    ) -> Result<FileMd, MdError> {
        self.ensure_writable()?;
        let mut inner = self.inner.write();

        let (dir, name) = split_parent(path)?;
        let cid = inner.resolve_container_id(dir)?;
        let container = inner.containers.get(&cid).expect("resolved");
        if container.files.contains_key(name) || container.children.contains_key(name) {
            return Err(MdError::eexist(path));
        }

        let fid = inner.next_fid;
        inner.next_fid += 1;

        let mut fmd = FileMd::new(fid, cid, name, layout, uid, gid);
        fmd.mode = mode;
        fmd.ctime = now;
        fmd.mtime = now;

        inner
            .containers
            .get_mut(&cid)
            .expect("resolved")
            .files
            .insert(name.to_string(), fid);
        inner.quota_add(&fmd);
        inner.files.insert(fid, fmd.clone());
        inner.bump();
        Ok(fmd)
    }

    /// Replace a file record, keeping quota counters and per-FS indexes
    /// consistent in the same critical section.
    pub fn update_file(&self, fmd: &FileMd) -> Result<(), MdError> {
        self.ensure_writable()?;
        let mut inner = self.inner.write();

        let old = inner
            .files
            .get(&fmd.fid)
            .cloned()
            .ok_or_else(|| MdError::new(libc::EIDRM, format!("fid {}", fmd.fid)))?;

        inner.quota_remove(&old);
        inner.unindex_locations(&old);
        inner.quota_add(fmd);
        inner.index_locations(fmd);
        inner.files.insert(fmd.fid, fmd.clone());
        inner.bump();
        Ok(())
    }

    /// Unlink a file: detach it from its parent, move every location to
    /// the unlinked list and release its quota. The record survives until
    /// every node acknowledged physical deletion.
    pub fn unlink_file(&self, fid: Fid) -> Result<(), MdError> {
        self.ensure_writable()?;
        let mut inner = self.inner.write();

        let mut fmd = inner
            .files
            .get(&fid)
            .cloned()
            .ok_or_else(|| MdError::enoent(format!("fid {fid}")))?;

        inner.quota_remove(&fmd);
        if let Some(parent) = inner.containers.get_mut(&fmd.cid) {
            parent.files.remove(&fmd.name);
        }

        inner.unindex_locations(&fmd);
        fmd.unlink_all_locations();

        if fmd.is_removable() {
            inner.files.remove(&fid);
        } else {
            inner.index_locations(&fmd);
            inner.files.insert(fid, fmd);
        }
        inner.bump();
        Ok(())
    }

    /// Acknowledge physical deletion of one replica; destroys the record
    /// once both location lists are empty.
    pub fn drop_replica(&self, fid: Fid, fsid: FsId) -> Result<(), MdError> {
        self.ensure_writable()?;
        let mut inner = self.inner.write();

        let Some(mut fmd) = inner.files.get(&fid).cloned() else {
            // already gone, dropping is idempotent
            return Ok(());
        };

        inner.unindex_locations(&fmd);
        fmd.remove_unlinked(fsid);

        if fmd.is_removable() {
            inner.files.remove(&fid);
        } else {
            inner.index_locations(&fmd);
            inner.files.insert(fid, fmd);
        }
        inner.bump();
        Ok(())
    }

    pub fn rename(&self, old_path: &str, new_path: &str) -> Result<(), MdError> {
        self.ensure_writable()?;
        let mut inner = self.inner.write();

        let (old_dir, old_name) = split_parent(old_path)?;
        let (new_dir, new_name) = split_parent(new_path)?;
        let old_cid = inner.resolve_container_id(old_dir)?;
        let new_cid = inner.resolve_container_id(new_dir)?;

        let target = inner.containers.get(&new_cid).expect("resolved");
        if target.files.contains_key(new_name) || target.children.contains_key(new_name) {
            return Err(MdError::eexist(new_path));
        }

        let source = inner.containers.get(&old_cid).expect("resolved").clone();
        if let Some(fid) = source.files.get(old_name).copied() {
            let mut fmd = inner.files.get(&fid).cloned().expect("indexed");
            inner.quota_remove(&fmd);
            inner
                .containers
                .get_mut(&old_cid)
                .expect("resolved")
                .files
                .remove(old_name);
            fmd.cid = new_cid;
            fmd.name = new_name.to_string();
            inner
                .containers
                .get_mut(&new_cid)
                .expect("resolved")
                .files
                .insert(new_name.to_string(), fid);
            inner.quota_add(&fmd);
            inner.files.insert(fid, fmd);
        } else if let Some(ccid) = source.children.get(old_name).copied() {
            inner
                .containers
                .get_mut(&old_cid)
                .expect("resolved")
                .children
                .remove(old_name);
            inner
                .containers
                .get_mut(&new_cid)
                .expect("resolved")
                .children
                .insert(new_name.to_string(), ccid);
            let child = inner.containers.get_mut(&ccid).expect("indexed");
            child.parent = new_cid;
            child.name = new_name.to_string();
        } else {
            return Err(MdError::enoent(old_path));
        }

        inner.bump();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Quota nodes
    // ------------------------------------------------------------------

    pub fn register_quota_node(&self, cid: Cid) -> Result<(), MdError> {
        self.ensure_writable()?;
        let mut inner = self.inner.write();
        let container = inner
            .containers
            .get_mut(&cid)
            .ok_or_else(|| MdError::enoent(format!("cid {cid}")))?;
        container.quota_node = true;
        inner.quota_usage.entry(cid).or_default();
        inner.bump();
        Ok(())
    }

    pub fn remove_quota_node(&self, cid: Cid) -> Result<(), MdError> {
        self.ensure_writable()?;
        let mut inner = self.inner.write();
        let container = inner
            .containers
            .get_mut(&cid)
            .ok_or_else(|| MdError::enoent(format!("cid {cid}")))?;
        container.quota_node = false;
        inner.quota_usage.remove(&cid);
        inner.bump();
        Ok(())
    }

    pub fn quota_node_usage(&self, cid: Cid) -> Option<QuotaNodeUsage> {
        self.inner.read().quota_usage.get(&cid).cloned()
    }

    /// Nearest quota boundary at or above the container.
    pub fn quota_node_for(&self, cid: Cid) -> Option<Cid> {
        self.inner.read().quota_node_for(cid)
    }

    pub fn list_quota_nodes(&self) -> Vec<(Cid, String)> {
        let inner = self.inner.read();
        inner
            .containers
            .values()
            .filter(|c| c.quota_node)
            .map(|c| (c.cid, inner.container_path(c.cid)))
            .collect()
    }

    // ------------------------------------------------------------------
    // Per-FS indexes
    // ------------------------------------------------------------------

    pub fn fs_files(&self, fsid: FsId) -> Vec<Fid> {
        self.inner
            .read()
            .fs_files
            .get(&fsid)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn fs_file_count(&self, fsid: FsId) -> usize {
        self.inner
            .read()
            .fs_files
            .get(&fsid)
            .map_or(0, BTreeSet::len)
    }

    pub fn fs_unlinked(&self, fsid: FsId) -> Vec<Fid> {
        self.inner
            .read()
            .fs_unlinked
            .get(&fsid)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Total bytes still resident on one FS, the drain progress base.
    pub fn fs_bytes(&self, fsid: FsId) -> u64 {
        let inner = self.inner.read();
        inner
            .fs_files
            .get(&fsid)
            .map(|fids| {
                fids.iter()
                    .filter_map(|fid| inner.files.get(fid))
                    .map(|f| f.size)
                    .sum()
            })
            .unwrap_or(0)
    }
}

impl Default for Namespace {
    fn default() -> Self {
        Self::new()
    }
}
