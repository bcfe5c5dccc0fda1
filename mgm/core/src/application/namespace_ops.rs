// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Namespace verbs beside open.
//!
//! `chmod`, `chown`, `exists`, `mkdir`, `rem`, `rmdir`, `rename`, `stat`,
//! `access`, `utimes`, the attribute verbs and the stripe maintenance
//! verbs all follow the same shape: map the path, authorize against the
//! parent, mutate under the namespace lock, bump the directory mtime.

use std::sync::Arc;

use tracing::info;

use crate::application::open::OpenPipeline;
use crate::domain::error::MgmError;
use crate::domain::filesystem::FsId;
use crate::domain::fsview::FsView;
use crate::domain::identity::VirtualIdentity;
use crate::domain::namespace::{posix_allows, MdTime};
use crate::infrastructure::capability::{build_transfer_job, CapabilityEngine};
use crate::infrastructure::namespace::{Entry, Namespace};

#[derive(Debug, Clone, PartialEq)]
pub struct StatInfo {
    pub id: u64,
    pub is_dir: bool,
    pub size: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub ctime: MdTime,
    pub mtime: MdTime,
    pub nlink: u64,
    pub checksum: Vec<u8>,
}

pub struct NamespaceOps {
    namespace: Arc<Namespace>,
    fsview: Arc<FsView>,
    pipeline: Arc<OpenPipeline>,
    capability: Arc<CapabilityEngine>,
}

impl NamespaceOps {
    pub fn new(
        namespace: Arc<Namespace>,
        fsview: Arc<FsView>,
        pipeline: Arc<OpenPipeline>,
        capability: Arc<CapabilityEngine>,
    ) -> Self {
        Self {
            namespace,
            fsview,
            pipeline,
            capability,
        }
    }

    fn parent_of(&self, path: &str) -> Result<crate::domain::namespace::ContainerMd, MgmError> {
        let (dir, _) = split_dir(path)?;
        self.namespace.resolve_container(dir).map_err(MgmError::from)
    }

    fn authorize_parent(
        &self,
        path: &str,
        vid: &VirtualIdentity,
        want_write: bool,
    ) -> Result<crate::domain::acl::Acl, MgmError> {
        let parent = self.parent_of(path)?;
        self.pipeline
            .authorize(parent.uid, parent.gid, parent.mode, &parent.xattrs, vid, want_write)
    }

    // ------------------------------------------------------------------
    // Probes
    // ------------------------------------------------------------------

    pub fn exists(&self, raw_path: &str) -> bool {
        let path = self.pipeline.map_path(raw_path);
        self.namespace.lookup(&path).is_some()
    }

    pub fn stat(&self, raw_path: &str) -> Result<StatInfo, MgmError> {
        let path = self.pipeline.map_path(raw_path);
        match self.namespace.lookup(&path) {
            Some(Entry::Container(cmd)) => {
                // the sidecar carries mtimes bumped by open-for-write
                let mtime = self
                    .pipeline
                    .sidecar_mtime(cmd.cid)
                    .filter(|side| side.0 >= cmd.mtime.0)
                    .unwrap_or(cmd.mtime);
                Ok(StatInfo {
                    id: cmd.cid,
                    is_dir: true,
                    size: (cmd.children.len() + cmd.files.len()) as u64,
                    mode: cmd.mode | 0o040000,
                    uid: cmd.uid,
                    gid: cmd.gid,
                    ctime: cmd.ctime,
                    mtime,
                    nlink: 1 + cmd.children.len() as u64,
                    checksum: Vec::new(),
                })
            }
            Some(Entry::File(fmd)) => Ok(StatInfo {
                id: fmd.fid,
                is_dir: false,
                size: fmd.size,
                mode: fmd.mode | 0o100000,
                uid: fmd.uid,
                gid: fmd.gid,
                ctime: fmd.ctime,
                mtime: fmd.mtime,
                nlink: fmd.locations.len().max(1) as u64,
                checksum: fmd.checksum.clone(),
            }),
            None => Err(MgmError::NotFound(path)),
        }
    }

    /// POSIX-style permission probe.
    pub fn access(
        &self,
        raw_path: &str,
        vid: &VirtualIdentity,
        want_r: bool,
        want_w: bool,
        want_x: bool,
    ) -> Result<(), MgmError> {
        let path = self.pipeline.map_path(raw_path);
        let (uid, gid, mode) = match self.namespace.lookup(&path) {
            Some(Entry::Container(c)) => (c.uid, c.gid, c.mode),
            Some(Entry::File(f)) => (f.uid, f.gid, f.mode),
            None => return Err(MgmError::NotFound(path)),
        };

        if posix_allows(mode, uid, gid, vid, want_r, want_w, want_x) {
            Ok(())
        } else {
            Err(MgmError::Access(path))
        }
    }

    // ------------------------------------------------------------------
    // Tree mutations
    // ------------------------------------------------------------------

    pub fn mkdir(
        &self,
        raw_path: &str,
        mode: u32,
        vid: &VirtualIdentity,
        mkpath: bool,
    ) -> Result<(), MgmError> {
        let path = self.pipeline.map_path(raw_path);

        let (deep_cid, deep_attrs) = self.namespace.deepest_attrs(&path);
        let deep = self.namespace.container_by_id(deep_cid).map_err(MgmError::from)?;
        self.pipeline
            .authorize(deep.uid, deep.gid, deep.mode, &deep_attrs, vid, true)?;

        let created = self
            .namespace
            .create_container(&path, vid.uid, vid.gid, mode, mkpath, now())
            .map_err(MgmError::from)?;
        self.pipeline.bump_mtime(created.parent);
        Ok(())
    }

    pub fn rmdir(&self, raw_path: &str, vid: &VirtualIdentity) -> Result<(), MgmError> {
        let path = self.pipeline.map_path(raw_path);
        let acl = self.authorize_parent(&path, vid, true)?;
        if acl.has_acl && acl.rights.not_delete && !vid.is_root() {
            return Err(MgmError::Permission(format!("{path}: deletion disabled")));
        }

        let parent = self.parent_of(&path)?;
        self.namespace.remove_container(&path).map_err(MgmError::from)?;
        self.pipeline.bump_mtime(parent.cid);
        Ok(())
    }

    /// Unlink a file; replicas move to the unlinked list and are dropped
    /// asynchronously by the deletion dispatcher.
    pub fn rem(&self, raw_path: &str, vid: &VirtualIdentity) -> Result<(), MgmError> {
        let path = self.pipeline.map_path(raw_path);
        let acl = self.authorize_parent(&path, vid, true)?;
        if acl.has_acl && acl.rights.not_delete && !vid.is_root() {
            return Err(MgmError::Permission(format!("{path}: deletion disabled")));
        }

        let fmd = self.namespace.resolve_file(&path).map_err(MgmError::from)?;
        self.namespace.unlink_file(fmd.fid).map_err(MgmError::from)?;
        self.pipeline.bump_mtime(fmd.cid);
        info!(path, fid = fmd.fid, "unlinked file");
        Ok(())
    }

    pub fn rename(
        &self,
        raw_old: &str,
        raw_new: &str,
        vid: &VirtualIdentity,
    ) -> Result<(), MgmError> {
        let old_path = self.pipeline.map_path(raw_old);
        let new_path = self.pipeline.map_path(raw_new);

        self.authorize_parent(&old_path, vid, true)?;
        self.authorize_parent(&new_path, vid, true)?;

        let old_parent = self.parent_of(&old_path)?;
        let new_parent = self.parent_of(&new_path)?;

        self.namespace
            .rename(&old_path, &new_path)
            .map_err(MgmError::from)?;
        self.pipeline.bump_mtime(old_parent.cid);
        self.pipeline.bump_mtime(new_parent.cid);
        Ok(())
    }

    pub fn chmod(&self, raw_path: &str, mode: u32, vid: &VirtualIdentity) -> Result<(), MgmError> {
        let path = self.pipeline.map_path(raw_path);

        match self.namespace.lookup(&path) {
            Some(Entry::Container(mut cmd)) => {
                let acl = self.authorize_parent(&path, vid, false).unwrap_or_default();
                let allowed = vid.is_root() || vid.has_uid(cmd.uid) || acl.rights.chmod;
                if !allowed {
                    return Err(MgmError::Permission(path));
                }
                cmd.mode = (cmd.mode & !0o7777) | (mode & 0o7777);
                self.namespace.update_container(&cmd).map_err(MgmError::from)
            }
            Some(Entry::File(mut fmd)) => {
                if !vid.is_root() && !vid.has_uid(fmd.uid) {
                    return Err(MgmError::Permission(path));
                }
                fmd.mode = (fmd.mode & !0o7777) | (mode & 0o7777);
                self.namespace.update_file(&fmd).map_err(MgmError::from)
            }
            None => Err(MgmError::NotFound(path)),
        }
    }

    pub fn chown(
        &self,
        raw_path: &str,
        uid: u32,
        gid: u32,
        vid: &VirtualIdentity,
    ) -> Result<(), MgmError> {
        if !vid.is_root() && !vid.sudoer {
            return Err(MgmError::Permission("chown requires privileges".to_string()));
        }

        let path = self.pipeline.map_path(raw_path);
        match self.namespace.lookup(&path) {
            Some(Entry::Container(mut cmd)) => {
                cmd.uid = uid;
                cmd.gid = gid;
                self.namespace.update_container(&cmd).map_err(MgmError::from)
            }
            Some(Entry::File(mut fmd)) => {
                fmd.uid = uid;
                fmd.gid = gid;
                self.namespace.update_file(&fmd).map_err(MgmError::from)
            }
            None => Err(MgmError::NotFound(path)),
        }
    }

    pub fn utimes(
        &self,
        raw_path: &str,
        mtime: MdTime,
        vid: &VirtualIdentity,
    ) -> Result<(), MgmError> {
        let path = self.pipeline.map_path(raw_path);
        match self.namespace.lookup(&path) {
            Some(Entry::Container(mut cmd)) => {
                if !vid.is_root() && !vid.has_uid(cmd.uid) {
                    return Err(MgmError::Permission(path));
                }
                cmd.mtime = mtime;
                self.namespace.update_container(&cmd).map_err(MgmError::from)
            }
            Some(Entry::File(mut fmd)) => {
                if !vid.is_root() && !vid.has_uid(fmd.uid) {
                    return Err(MgmError::Permission(path));
                }
                fmd.mtime = mtime;
                self.namespace.update_file(&fmd).map_err(MgmError::from)
            }
            None => Err(MgmError::NotFound(path)),
        }
    }

    // ------------------------------------------------------------------
    // Attributes
    // ------------------------------------------------------------------

    pub fn attr_ls(&self, raw_path: &str) -> Result<Vec<(String, String)>, MgmError> {
        let path = self.pipeline.map_path(raw_path);
        let cmd = self.namespace.resolve_container(&path).map_err(MgmError::from)?;
        Ok(cmd.xattrs.into_iter().collect())
    }

    pub fn attr_get(&self, raw_path: &str, key: &str) -> Result<String, MgmError> {
        let path = self.pipeline.map_path(raw_path);
        let cmd = self.namespace.resolve_container(&path).map_err(MgmError::from)?;
        cmd.xattrs
            .get(key)
            .cloned()
            .ok_or_else(|| MgmError::NotFound(format!("{path}#{key}")))
    }

    pub fn attr_set(
        &self,
        raw_path: &str,
        key: &str,
        value: &str,
        vid: &VirtualIdentity,
    ) -> Result<(), MgmError> {
        if key.starts_with("sys.") && !vid.is_root() && !vid.sudoer {
            return Err(MgmError::Permission(format!("{key} is privileged")));
        }

        let path = self.pipeline.map_path(raw_path);
        let mut cmd = self.namespace.resolve_container(&path).map_err(MgmError::from)?;
        if !vid.is_root() && !vid.sudoer && !vid.has_uid(cmd.uid) {
            return Err(MgmError::Permission(path));
        }
        cmd.xattrs.insert(key.to_string(), value.to_string());
        self.namespace.update_container(&cmd).map_err(MgmError::from)
    }

    pub fn attr_rm(
        &self,
        raw_path: &str,
        key: &str,
        vid: &VirtualIdentity,
    ) -> Result<(), MgmError> {
        if key.starts_with("sys.") && !vid.is_root() && !vid.sudoer {
            return Err(MgmError::Permission(format!("{key} is privileged")));
        }

        let path = self.pipeline.map_path(raw_path);
        let mut cmd = self.namespace.resolve_container(&path).map_err(MgmError::from)?;
        if cmd.xattrs.remove(key).is_none() {
            return Err(MgmError::NotFound(format!("{path}#{key}")));
        }
        self.namespace.update_container(&cmd).map_err(MgmError::from)
    }

    // ------------------------------------------------------------------
    // Find
    // ------------------------------------------------------------------

    /// Depth-first listing of every container and file below `path`.
    pub fn find(&self, raw_path: &str, vid: &VirtualIdentity) -> Result<Vec<String>, MgmError> {
        let path = self.pipeline.map_path(raw_path);
        let root = self.namespace.resolve_container(&path).map_err(MgmError::from)?;
        self.pipeline
            .authorize(root.uid, root.gid, root.mode, &root.xattrs, vid, false)?;

        let mut out = Vec::new();
        let mut stack = vec![root.cid];
        while let Some(cid) = stack.pop() {
            let Ok(cmd) = self.namespace.container_by_id(cid) else {
                continue;
            };
            let base = self.namespace.container_path(cid);
            out.push(if base.ends_with('/') {
                base.clone()
            } else {
                format!("{base}/")
            });

            for fname in cmd.files.keys() {
                out.push(if base.ends_with('/') {
                    format!("{base}{fname}")
                } else {
                    format!("{base}/{fname}")
                });
            }
            stack.extend(cmd.children.values().copied());
        }
        out.sort();
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Stripe maintenance
    // ------------------------------------------------------------------

    /// Drop one stripe from the location list (admin verb).
    pub fn drop_stripe(
        &self,
        raw_path: &str,
        fsid: FsId,
        vid: &VirtualIdentity,
    ) -> Result<(), MgmError> {
        if !vid.is_root() && !vid.sudoer {
            return Err(MgmError::Permission("dropstripe requires privileges".to_string()));
        }

        let path = self.pipeline.map_path(raw_path);
        let mut fmd = self.namespace.resolve_file(&path).map_err(MgmError::from)?;
        if !fmd.unlink_location(fsid) {
            return Err(MgmError::NotFound(format!("{path} has no stripe on {fsid}")));
        }
        self.namespace.update_file(&fmd).map_err(MgmError::from)
    }

    /// Ask the owning node to verify one stripe's checksum and size.
    pub fn verify_stripe(
        &self,
        raw_path: &str,
        fsid: FsId,
        vid: &VirtualIdentity,
    ) -> Result<String, MgmError> {
        if !vid.is_root() && !vid.sudoer {
            return Err(MgmError::Permission("verifystripe requires privileges".to_string()));
        }

        let path = self.pipeline.map_path(raw_path);
        let fmd = self.namespace.resolve_file(&path).map_err(MgmError::from)?;
        if !fmd.has_location(fsid) {
            return Err(MgmError::NotFound(format!("{path} has no stripe on {fsid}")));
        }

        let snap = self
            .fsview
            .snapshot(fsid)
            .ok_or_else(|| MgmError::NoDevice(format!("fs {fsid}")))?;

        let fields = vec![
            ("mgm.access".to_string(), "verify".to_string()),
            ("mgm.fid".to_string(), format!("{:x}", fmd.fid)),
            ("mgm.lid".to_string(), fmd.layout.0.to_string()),
            ("mgm.fsid".to_string(), fsid.to_string()),
            ("mgm.localprefix".to_string(), snap.regs.local_prefix.clone()),
            ("mgm.manager".to_string(), self.pipeline.manager().to_string()),
            ("mgm.path".to_string(), path),
        ];
        self.capability.sign(&fields).map_err(MgmError::from)
    }

    /// Schedule a stripe copy onto a new file system through the external
    /// transfer queue of the target.
    pub fn replicate_stripe(
        &self,
        raw_path: &str,
        source: FsId,
        target: FsId,
        vid: &VirtualIdentity,
    ) -> Result<(), MgmError> {
        if !vid.is_root() && !vid.sudoer {
            return Err(MgmError::Permission("replicatestripe requires privileges".to_string()));
        }

        let path = self.pipeline.map_path(raw_path);
        let fmd = self.namespace.resolve_file(&path).map_err(MgmError::from)?;
        if !fmd.has_location(source) {
            return Err(MgmError::NotFound(format!("{path} has no stripe on {source}")));
        }
        if fmd.has_location(target) {
            return Err(MgmError::Exists(format!("{path} already has a stripe on {target}")));
        }

        let view = self.fsview.view();
        let source_snap = view
            .snapshot(source)
            .ok_or_else(|| MgmError::NoDevice(format!("fs {source}")))?;
        let target_snap = view
            .snapshot(target)
            .ok_or_else(|| MgmError::NoDevice(format!("fs {target}")))?;
        let target_fs = view
            .fs(target)
            .ok_or_else(|| MgmError::NoDevice(format!("fs {target}")))?;

        let job = build_transfer_job(
            &self.capability,
            fmd.fid,
            fmd.layout,
            fmd.size,
            self.pipeline.manager(),
            &source_snap,
            &target_snap,
        )
        .map_err(MgmError::from)?;

        target_fs.external_queue().add(job);
        Ok(())
    }
}

fn split_dir(path: &str) -> Result<(&str, &str), MgmError> {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rsplit_once('/') {
        Some((dir, name)) if !name.is_empty() => {
            Ok((if dir.is_empty() { "/" } else { dir }, name))
        }
        _ => Err(MgmError::Invalid(path.to_string())),
    }
}

fn now() -> MdTime {
    let t = chrono::Utc::now();
    (t.timestamp(), t.timestamp_subsec_nanos())
}
