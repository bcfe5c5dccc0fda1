// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! The file-open pipeline.
//!
//! For every open the pipeline resolves the namespace entry, checks the
//! global access rules and the directory ACL, admits against quota,
//! selects file systems, signs a capability and answers with a redirect
//! to the head replica (or a stall / error). Other namespace verbs share
//! the same map → authorize → lock → mutate → bump-mtime shape and live
//! in `namespace_ops`.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{info, warn};

use crate::application::access::{AccessControl, RuleKind, BANNED_STALL_SECS};
use crate::application::policy;
use crate::application::quota::{FilePlacementArgs, Quota};
use crate::application::scheduler::AccessRequest;
use crate::domain::acl::{owner_auth_matches, Acl, EgroupResolver, NoEgroups};
use crate::domain::attrs::{self, AttrMap};
use crate::domain::error::MgmError;
use crate::domain::filesystem::{ConfigStatus, FsId};
use crate::domain::identity::VirtualIdentity;
use crate::domain::namespace::{posix_allows, Cid, Fid, MdTime};
use crate::infrastructure::capability::{
    parse_pairs, AccessKind, CapabilityEngine, ReplicaCapability, ReplicaTarget,
};
use crate::infrastructure::namespace::Namespace;

/// Default stall handed to clients waiting for replica healing.
const UNAVAILABLE_STALL_SECS: u32 = 60;

#[derive(Debug, Clone, Copy, Default)]
pub struct OpenFlags {
    pub read: bool,
    pub write: bool,
    pub create: bool,
    pub truncate: bool,
    pub exclusive: bool,
    pub mkpath: bool,
}

impl OpenFlags {
    pub fn read_only() -> Self {
        Self {
            read: true,
            ..Default::default()
        }
    }

    pub fn create() -> Self {
        Self {
            write: true,
            create: true,
            ..Default::default()
        }
    }

    pub fn is_write(&self) -> bool {
        self.write || self.create || self.truncate
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirect {
    pub host: String,
    pub port: u16,
    pub query: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenOutcome {
    Redirect(Redirect),
    Stall { seconds: u32, message: String },
    /// Parallel-IO response listing every replica endpoint.
    Composite(String),
}

/// Hook kicking an asynchronous replica repair; the production dispatcher
/// enqueues an adjust-replica command on the admin interface.
pub trait HealDispatcher: Send + Sync {
    fn heal(&self, path: &str, fid: Fid, unavailable: &[FsId]);
}

pub struct LoggingHeal;

impl HealDispatcher for LoggingHeal {
    fn heal(&self, path: &str, fid: Fid, unavailable: &[FsId]) {
        info!(path, fid, ?unavailable, "scheduling replica adjustment");
    }
}

pub struct OpenPipeline {
    namespace: Arc<Namespace>,
    fsview: Arc<crate::domain::fsview::FsView>,
    quota: Arc<Quota>,
    capability: Arc<CapabilityEngine>,
    access: Arc<AccessControl>,
    egroups: Arc<dyn EgroupResolver>,
    heal: Arc<dyn HealDispatcher>,

    /// Longest-prefix path rewrites applied before any lookup.
    path_rewrites: parking_lot::RwLock<Vec<(String, String)>>,

    /// In-memory directory mtimes bumped by write-path mutations.
    mtime_sidecar: DashMap<Cid, MdTime>,

    heal_attempts: DashMap<Fid, u32>,

    manager: String,
    default_space: String,
}

impl OpenPipeline {
    pub fn new(
        namespace: Arc<Namespace>,
        fsview: Arc<crate::domain::fsview::FsView>,
        quota: Arc<Quota>,
        capability: Arc<CapabilityEngine>,
        access: Arc<AccessControl>,
        manager: impl Into<String>,
        default_space: impl Into<String>,
    ) -> Self {
        Self {
            namespace,
            fsview,
            quota,
            capability,
            access,
            egroups: Arc::new(NoEgroups),
            heal: Arc::new(LoggingHeal),
            path_rewrites: parking_lot::RwLock::new(Vec::new()),
            mtime_sidecar: DashMap::new(),
            heal_attempts: DashMap::new(),
            manager: manager.into(),
            default_space: default_space.into(),
        }
    }

    pub fn with_egroups(mut self, egroups: Arc<dyn EgroupResolver>) -> Self {
        self.egroups = egroups;
        self
    }

    pub fn with_heal(mut self, heal: Arc<dyn HealDispatcher>) -> Self {
        self.heal = heal;
        self
    }

    pub fn add_path_rewrite(&self, from: &str, to: &str) {
        let mut rewrites = self.path_rewrites.write();
        rewrites.push((from.to_string(), to.to_string()));
        rewrites.sort_by_key(|(f, _)| std::cmp::Reverse(f.len()));
    }

    /// Apply the longest matching prefix rewrite.
    pub fn map_path(&self, path: &str) -> String {
        let rewrites = self.path_rewrites.read();
        for (from, to) in rewrites.iter() {
            if let Some(rest) = path.strip_prefix(from.as_str()) {
                return format!("{to}{rest}");
            }
        }
        path.to_string()
    }

    pub fn bump_mtime(&self, cid: Cid) {
        let now = chrono::Utc::now();
        self.mtime_sidecar
            .insert(cid, (now.timestamp(), now.timestamp_subsec_nanos()));
    }

    pub fn sidecar_mtime(&self, cid: Cid) -> Option<MdTime> {
        self.mtime_sidecar.get(&cid).map(|e| *e)
    }

    pub fn namespace(&self) -> &Arc<Namespace> {
        &self.namespace
    }

    pub fn access_control(&self) -> &Arc<AccessControl> {
        &self.access
    }

    pub fn quota(&self) -> &Arc<Quota> {
        &self.quota
    }

    pub fn manager(&self) -> &str {
        &self.manager
    }

    /// Evaluate ACL and POSIX bits for one identity below a parent
    /// container, honoring the owner-auth escalation list.
    pub fn authorize(
        &self,
        parent_uid: u32,
        parent_gid: u32,
        parent_mode: u32,
        parent_attrs: &AttrMap,
        vid: &VirtualIdentity,
        want_write: bool,
    ) -> Result<Acl, MgmError> {
        let mut effective = vid.clone();
        if let Some(list) = attrs::get_str(parent_attrs, attrs::SYS_OWNER_AUTH) {
            if owner_auth_matches(list, vid) {
                effective.uid = parent_uid;
                effective.gid = parent_gid;
                effective.uid_list = vec![parent_uid];
                effective.gid_list = vec![parent_gid];
            }
        }

        let acl = Acl::evaluate(
            attrs::get_str(parent_attrs, attrs::SYS_ACL),
            attrs::get_str(parent_attrs, attrs::USER_ACL),
            attrs::get_bool(parent_attrs, attrs::SYS_EVAL_USERACL),
            &effective,
            self.egroups.as_ref(),
        );

        let allowed = if acl.has_acl {
            if want_write {
                acl.rights.can_write()
            } else {
                acl.rights.read || acl.rights.browse
            }
        } else {
            posix_allows(
                parent_mode,
                parent_uid,
                parent_gid,
                &effective,
                !want_write,
                want_write,
                true,
            )
        };

        if !allowed {
            return Err(MgmError::Access(format!(
                "uid {} has no {} permission",
                vid.uid,
                if want_write { "write" } else { "read" }
            )));
        }
        Ok(acl)
    }

    /// The open entry point.
    pub async fn open(
        &self,
        raw_path: &str,
        flags: OpenFlags,
        mode: u32,
        cgi: &str,
        vid: &VirtualIdentity,
    ) -> Result<OpenOutcome, MgmError> {
        let path = self.map_path(raw_path);
        let is_write = flags.is_write();

        // banned / not-allowed identities get a stall with a banner
        if let Some(banner) = self.access.refusal(vid) {
            return Ok(OpenOutcome::Stall {
                seconds: BANNED_STALL_SECS,
                message: banner,
            });
        }

        // global stall / redirect rules
        let kind = if is_write {
            RuleKind::Write
        } else {
            RuleKind::Read
        };
        if let Some(seconds) = self.access.stall_for(kind) {
            return Ok(OpenOutcome::Stall {
                seconds,
                message: "instance is temporarily unavailable".to_string(),
            });
        }
        if let Some((host, port)) = self.access.redirect_for(kind) {
            return Ok(OpenOutcome::Redirect(Redirect {
                host,
                port,
                query: String::new(),
            }));
        }

        // the proc subtree goes to the admin command handler
        if path.starts_with("/proc/") {
            return Err(MgmError::Unsupported("proc command via open".to_string()));
        }

        let opts = parse_pairs(cgi);
        let get_opt = |key: &str| {
            opts.iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str())
        };
        let booking_request = get_opt("eos.bookingsize").and_then(|v| v.parse::<u64>().ok());
        let pio = get_opt("eos.cli.access") == Some("pio");
        let group_tag = get_opt("eos.schedgroup");

        // parent resolution, creating ancestors when asked to
        let (dir, _name) = split_dir(&path)?;
        let parent = match self.namespace.resolve_container(dir) {
            Ok(parent) => parent,
            Err(err) if err.errno == libc::ENOENT && flags.create && flags.mkpath => {
                let (deep_cid, deep_attrs) = self.namespace.deepest_attrs(dir);
                let deep = self.namespace.container_by_id(deep_cid).map_err(MgmError::from)?;
                self.authorize(deep.uid, deep.gid, deep.mode, &deep_attrs, vid, true)?;
                self.namespace
                    .create_container(dir, vid.uid, vid.gid, 0o755 | (mode & 0o7777), true, now())
                    .map_err(MgmError::from)?
            }
            Err(err) if err.errno == libc::ENOENT => {
                let (_, deep_attrs) = self.namespace.deepest_attrs(dir);
                if let Some(target) = attrs::get_str(&deep_attrs, attrs::SYS_REDIRECT_ENOENT) {
                    return Ok(redirect_to(target));
                }
                if let Some(seconds) = self.access.stall_for(RuleKind::Enoent) {
                    return Ok(OpenOutcome::Stall {
                        seconds,
                        message: format!("{path} is not yet available"),
                    });
                }
                return Err(MgmError::from(err));
            }
            Err(err) => return Err(MgmError::from(err)),
        };

        let acl = self.authorize(parent.uid, parent.gid, parent.mode, &parent.xattrs, vid, is_write)?;

        let existing = self.namespace.resolve_file(&path).ok();

        if let Some(ref fmd) = existing {
            if flags.create && flags.exclusive {
                return Err(MgmError::Exists(path));
            }
            // an overwrite of a write-once file needs the update grant
            if is_write && acl.has_acl && acl.rights.write_once && !acl.rights.update && fmd.size > 0
            {
                return Err(MgmError::Permission(format!(
                    "{path} is write-once"
                )));
            }
        } else if !flags.create {
            if let Some(target) = attrs::get_str(&parent.xattrs, attrs::SYS_REDIRECT_ENOENT) {
                return Ok(redirect_to(target));
            }
            if let Some(seconds) = self.access.stall_for(RuleKind::Enoent) {
                return Ok(OpenOutcome::Stall {
                    seconds,
                    message: format!("{path} is not yet available"),
                });
            }
            return Err(MgmError::NotFound(path));
        }

        let file_policy =
            policy::get_layout_and_space(&self.default_space, &parent.xattrs, vid, booking_request);

        let create_new = existing.is_none() || (flags.truncate && existing.is_some());

        if create_new {
            // truncate replaces the file wholesale
            if let Some(ref fmd) = existing {
                self.namespace.unlink_file(fmd.fid).map_err(MgmError::from)?;
            }

            let fmd = self
                .namespace
                .create_file(&path, vid.uid, vid.gid, mode, file_policy.layout, now())
                .map_err(MgmError::from)?;

            let placement = self.quota.file_placement(&FilePlacementArgs {
                path: &path,
                vid,
                space: &file_policy.space,
                layout: file_policy.layout,
                avoid: &[],
                group_tag,
                forced_group: file_policy.forced_group,
                booking_size: file_policy.booking_size,
            });

            let selected = match placement {
                Ok(selected) => selected,
                Err(err) => {
                    // the half-created record must not survive the failure
                    if let Err(cleanup) = self.namespace.unlink_file(fmd.fid) {
                        warn!(fid = fmd.fid, error = %cleanup, "cleanup after failed placement");
                    }
                    return Err(err);
                }
            };

            let mut fmd = fmd;
            for fsid in &selected {
                fmd.add_location(*fsid).map_err(MgmError::from)?;
            }
            self.namespace.update_file(&fmd).map_err(MgmError::from)?;
            self.bump_mtime(parent.cid);

            metrics::counter!("mgm_open_create_total").increment(1);
            return self.reply(
                &fmd,
                &selected,
                0,
                AccessKind::Create,
                file_policy.booking_size,
                pio && !is_write,
            );
        }

        // access to an existing file
        let fmd = existing.expect("checked above");
        if fmd.locations.is_empty() {
            return Err(MgmError::NoDevice(path));
        }

        if is_write {
            let bytes = (file_policy.booking_size as f64 * fmd.layout.size_factor()) as i64;
            if !self.quota.check(&path, vid.uid, vid.gid, bytes, 0) {
                return Err(MgmError::Quota(format!(
                    "uid {} gid {} below {path}",
                    vid.uid, vid.gid
                )));
            }
        }

        let mut unavail = Vec::new();
        let outcome = self.quota.file_access(
            &AccessRequest {
                vid,
                forced_fsid: None,
                space: &file_policy.space,
                layout: fmd.layout,
                locations: &fmd.locations,
                is_rw: is_write,
                booking_size: file_policy.booking_size,
                min_config: ConfigStatus::Drain,
            },
            &mut unavail,
        );

        let access_outcome = match outcome {
            Ok(outcome) => outcome,
            Err(MgmError::Offline(_)) => {
                return self.unavailable_outcome(&path, &fmd, &parent.xattrs, &unavail)
            }
            Err(err) => return Err(err),
        };

        if access_outcome.degraded {
            // short RAID stripe set: serve the read, reconstruction is the
            // client driver's business
            self.heal.heal(&path, fmd.fid, &unavail);
        }

        if is_write {
            self.bump_mtime(parent.cid);
        }

        metrics::counter!("mgm_open_total").increment(1);
        let kind = if is_write {
            AccessKind::Update
        } else {
            AccessKind::Read
        };
        self.reply(
            &fmd,
            &fmd.locations,
            access_outcome.index,
            kind,
            file_policy.booking_size,
            pio && !is_write,
        )
    }

    fn unavailable_outcome(
        &self,
        path: &str,
        fmd: &crate::domain::namespace::FileMd,
        parent_attrs: &AttrMap,
        unavail: &[FsId],
    ) -> Result<OpenOutcome, MgmError> {
        if let Some(max_heal) = attrs::get_u32(parent_attrs, attrs::SYS_HEAL_UNAVAILABLE) {
            let mut attempts = self.heal_attempts.entry(fmd.fid).or_insert(0);
            if *attempts < max_heal {
                *attempts += 1;
                self.heal.heal(path, fmd.fid, unavail);
                let seconds = attrs::get_u32(parent_attrs, attrs::SYS_STALL_UNAVAILABLE)
                    .unwrap_or(UNAVAILABLE_STALL_SECS);
                return Ok(OpenOutcome::Stall {
                    seconds,
                    message: format!("healing {path}, try again"),
                });
            }
        }

        if let Some(seconds) = attrs::get_u32(parent_attrs, attrs::SYS_STALL_UNAVAILABLE) {
            return Ok(OpenOutcome::Stall {
                seconds,
                message: format!("{path} is currently unavailable"),
            });
        }
        if let Some(target) = attrs::get_str(parent_attrs, attrs::SYS_REDIRECT_ENONET) {
            return Ok(redirect_to(target));
        }

        Err(MgmError::Offline(path.to_string()))
    }

    /// Build, sign and wrap the capability into the client answer.
    fn reply(
        &self,
        fmd: &crate::domain::namespace::FileMd,
        locations: &[FsId],
        head: usize,
        kind: AccessKind,
        booking_size: u64,
        pio: bool,
    ) -> Result<OpenOutcome, MgmError> {
        let view = self.fsview.view();
        let mut targets = Vec::with_capacity(locations.len());
        for fsid in locations {
            let snap = view
                .snapshot(*fsid)
                .ok_or_else(|| MgmError::Internal(format!("fs {fsid} vanished")))?;
            targets.push(ReplicaTarget::from_snapshot(&snap));
        }
        drop(view);

        let dir = self.namespace.container_path(fmd.cid);
        let full_path = if dir.ends_with('/') {
            format!("{dir}{}", fmd.name)
        } else {
            format!("{dir}/{}", fmd.name)
        };

        let capability = ReplicaCapability {
            access: kind,
            lid: fmd.layout,
            cid: fmd.cid,
            fid: fmd.fid,
            path: full_path,
            manager: self.manager.clone(),
            uid: fmd.uid,
            gid: fmd.gid,
            ruid: fmd.uid,
            rgid: fmd.gid,
            booking_size,
            targets: targets.clone(),
        };

        let envelope = self
            .capability
            .sign(&capability.fields(head))
            .map_err(MgmError::from)?;

        if pio && targets.len() > 1 {
            let mut composite = envelope;
            for (i, target) in targets.iter().enumerate() {
                composite.push_str(&format!("&pio.{i}={}:{}", target.host, target.port));
            }
            return Ok(OpenOutcome::Composite(composite));
        }

        let target = &targets[head];
        Ok(OpenOutcome::Redirect(Redirect {
            host: target.host.clone(),
            port: target.port,
            query: format!("{envelope}&mgm.replicaindex={head}&mgm.replicahead={head}"),
        }))
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

fn redirect_to(target: &str) -> OpenOutcome {
    let (host, port) = match target.rsplit_once(':') {
        Some((host, port)) => (host.to_string(), port.parse().unwrap_or(1094)),
        None => (target.to_string(), 1094),
    };
    OpenOutcome::Redirect(Redirect {
        host,
        port,
        query: String::new(),
    })
}

fn now() -> MdTime {
    let now = chrono::Utc::now();
    (now.timestamp(), now.timestamp_subsec_nanos())
}
