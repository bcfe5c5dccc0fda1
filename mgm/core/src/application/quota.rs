// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Quota engine.
//!
//! Every quota node of the namespace is projected into a [`SpaceQuota`]
//! keyed by its path (with trailing `/`). A projection carries raw "is"
//! counters pulled from the authoritative namespace tables and
//! operator-configured "target" limits persisted through the config
//! engine. Admission combines user, group and project predicates; uid 0
//! bypasses the check.
//!
//! Lock order: the projection map lock nests outside each projection's own
//! mutex and inside nothing else of the global order.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::application::policy;
use crate::application::scheduler::{AccessOutcome, AccessRequest, PlacementRequest, Scheduler};
use crate::domain::error::MgmError;
use crate::domain::filesystem::FsId;
use crate::domain::identity::VirtualIdentity;
use crate::domain::namespace::Cid;
use crate::infrastructure::config_store::ConfigStore;
use crate::infrastructure::namespace::Namespace;

/// Project counters refresh at most this often.
const PROJECT_REFRESH_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum QuotaError {
    #[error("no quota node holds {0}")]
    NoNode(String),

    #[error("tag {0} is not an operator target")]
    NotATarget(String),
}

impl From<QuotaError> for MgmError {
    fn from(err: QuotaError) -> Self {
        MgmError::Invalid(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QuotaTag {
    UserBytesIs,
    UserLogicalBytesIs,
    UserLogicalBytesTarget,
    UserBytesTarget,
    UserFilesIs,
    UserFilesTarget,
    GroupBytesIs,
    GroupLogicalBytesIs,
    GroupLogicalBytesTarget,
    GroupBytesTarget,
    GroupFilesIs,
    GroupFilesTarget,
    AllUserBytesIs,
    AllUserLogicalBytesIs,
    AllUserLogicalBytesTarget,
    AllUserBytesTarget,
    AllGroupBytesIs,
    AllGroupLogicalBytesIs,
    AllGroupLogicalBytesTarget,
    AllGroupBytesTarget,
    AllUserFilesIs,
    AllUserFilesTarget,
    AllGroupFilesIs,
    AllGroupFilesTarget,
}

impl QuotaTag {
    /// Operator-settable targets and their config tag names.
    pub fn from_config_name(name: &str) -> Option<Self> {
        match name {
            "userbytes" => Some(Self::UserBytesTarget),
            "userfiles" => Some(Self::UserFilesTarget),
            "groupbytes" => Some(Self::GroupBytesTarget),
            "groupfiles" => Some(Self::GroupFilesTarget),
            _ => None,
        }
    }

    pub fn config_name(self) -> Option<&'static str> {
        match self {
            Self::UserBytesTarget => Some("userbytes"),
            Self::UserFilesTarget => Some("userfiles"),
            Self::GroupBytesTarget => Some("groupbytes"),
            Self::GroupFilesTarget => Some("groupfiles"),
            _ => None,
        }
    }

    pub fn is_user_tag(self) -> bool {
        matches!(
            self,
            Self::UserBytesTarget | Self::UserFilesTarget
        )
    }
}

#[derive(Debug, Default)]
struct SpaceQuotaInner {
    map: HashMap<(QuotaTag, u32), i64>,
    layout_factor: f64,
    last_project_refresh: Option<Instant>,
}

/// Projection of one namespace quota node.
pub struct SpaceQuota {
    path: String,
    node_cid: Cid,
    project_gid: u32,
    inner: Mutex<SpaceQuotaInner>,
}

impl SpaceQuota {
    fn new(path: String, node_cid: Cid, project_gid: u32) -> Self {
        Self {
            path,
            node_cid,
            project_gid,
            inner: Mutex::new(SpaceQuotaInner {
                layout_factor: 1.0,
                ..Default::default()
            }),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn node_cid(&self) -> Cid {
        self.node_cid
    }

    pub fn get(&self, tag: QuotaTag, id: u32) -> i64 {
        self.inner.lock().map.get(&(tag, id)).copied().unwrap_or(0)
    }

    pub fn set(&self, tag: QuotaTag, id: u32, value: i64) {
        self.inner.lock().map.insert((tag, id), value);
    }

    pub fn remove(&self, tag: QuotaTag, id: u32) {
        self.inner.lock().map.remove(&(tag, id));
    }

    /// Ids carrying any user entry (for reporting).
    pub fn user_ids(&self) -> Vec<u32> {
        let inner = self.inner.lock();
        let mut ids: Vec<u32> = inner
            .map
            .keys()
            .filter(|(tag, _)| {
                matches!(
                    tag,
                    QuotaTag::UserBytesIs
                        | QuotaTag::UserBytesTarget
                        | QuotaTag::UserFilesIs
                        | QuotaTag::UserFilesTarget
                )
            })
            .map(|(_, id)| *id)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    pub fn group_ids(&self) -> Vec<u32> {
        let inner = self.inner.lock();
        let mut ids: Vec<u32> = inner
            .map
            .keys()
            .filter(|(tag, _)| {
                matches!(
                    tag,
                    QuotaTag::GroupBytesIs
                        | QuotaTag::GroupBytesTarget
                        | QuotaTag::GroupFilesIs
                        | QuotaTag::GroupFilesTarget
                )
            })
            .map(|(_, id)| *id)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// Pull the authoritative "is" counters from the namespace and rebuild
    /// the derived entries: logical targets (target / layout factor),
    /// `All*` summaries and, when a project target is set, the folded
    /// project counters.
    pub fn refresh(&self, ns: &Namespace) {
        let usage = ns.quota_node_usage(self.node_cid).unwrap_or_default();

        let factor = {
            let container = ns.container_by_id(self.node_cid).ok();
            let attrs = container.map(|c| c.xattrs).unwrap_or_default();
            policy::get_layout_and_space("default", &attrs, &VirtualIdentity::root(), None)
                .layout
                .size_factor()
        };

        let mut inner = self.inner.lock();
        inner.layout_factor = factor;

        // drop stale is-entries, keep operator targets
        inner.map.retain(|(tag, _), _| {
            matches!(
                tag,
                QuotaTag::UserBytesTarget
                    | QuotaTag::UserFilesTarget
                    | QuotaTag::GroupBytesTarget
                    | QuotaTag::GroupFilesTarget
            )
        });

        for (uid, entry) in &usage.per_uid {
            inner
                .map
                .insert((QuotaTag::UserBytesIs, *uid), entry.physical_space as i64);
            inner
                .map
                .insert((QuotaTag::UserLogicalBytesIs, *uid), entry.space as i64);
            inner
                .map
                .insert((QuotaTag::UserFilesIs, *uid), entry.files as i64);
        }
        for (gid, entry) in &usage.per_gid {
            inner
                .map
                .insert((QuotaTag::GroupBytesIs, *gid), entry.physical_space as i64);
            inner
                .map
                .insert((QuotaTag::GroupLogicalBytesIs, *gid), entry.space as i64);
            inner
                .map
                .insert((QuotaTag::GroupFilesIs, *gid), entry.files as i64);
        }

        Self::rebuild_derived(&mut inner, self.project_gid);
        inner.last_project_refresh = Some(Instant::now());
    }

    /// Refresh counters for one (uid, gid) pair; the project fold piggybacks
    /// at most every few seconds.
    pub fn update_from_ns_quota(&self, ns: &Namespace, uid: u32, gid: u32) {
        let usage = ns.quota_node_usage(self.node_cid).unwrap_or_default();

        let mut inner = self.inner.lock();
        let uentry = usage.per_uid.get(&uid).copied().unwrap_or_default();
        inner
            .map
            .insert((QuotaTag::UserBytesIs, uid), uentry.physical_space as i64);
        inner
            .map
            .insert((QuotaTag::UserLogicalBytesIs, uid), uentry.space as i64);
        inner
            .map
            .insert((QuotaTag::UserFilesIs, uid), uentry.files as i64);

        let gentry = usage.per_gid.get(&gid).copied().unwrap_or_default();
        inner
            .map
            .insert((QuotaTag::GroupBytesIs, gid), gentry.physical_space as i64);
        inner
            .map
            .insert((QuotaTag::GroupLogicalBytesIs, gid), gentry.space as i64);
        inner
            .map
            .insert((QuotaTag::GroupFilesIs, gid), gentry.files as i64);

        let refresh_project = inner
            .last_project_refresh
            .map_or(true, |t| t.elapsed() >= PROJECT_REFRESH_INTERVAL);
        if refresh_project {
            drop(inner);
            self.refresh(ns);
        } else {
            Self::rebuild_derived(&mut inner, self.project_gid);
        }
    }

    fn rebuild_derived(inner: &mut SpaceQuotaInner, project_gid: u32) {
        let factor = inner.layout_factor.max(1.0);

        // logical targets derive from the byte targets
        let logical: Vec<((QuotaTag, u32), i64)> = inner
            .map
            .iter()
            .filter_map(|((tag, id), value)| match tag {
                QuotaTag::UserBytesTarget => Some((
                    (QuotaTag::UserLogicalBytesTarget, *id),
                    (*value as f64 / factor) as i64,
                )),
                QuotaTag::GroupBytesTarget => Some((
                    (QuotaTag::GroupLogicalBytesTarget, *id),
                    (*value as f64 / factor) as i64,
                )),
                _ => None,
            })
            .collect();
        inner.map.extend(logical);

        // project fold: total usage accounted against the project gid
        let project_defined = inner
            .map
            .get(&(QuotaTag::GroupBytesTarget, project_gid))
            .copied()
            .unwrap_or(0)
            > 0;
        if project_defined {
            let mut bytes = 0i64;
            let mut logical_bytes = 0i64;
            let mut files = 0i64;
            for ((tag, _), value) in inner.map.iter() {
                match tag {
                    QuotaTag::UserBytesIs => bytes += value,
                    QuotaTag::UserLogicalBytesIs => logical_bytes += value,
                    QuotaTag::UserFilesIs => files += value,
                    _ => {}
                }
            }
            inner.map.insert((QuotaTag::GroupBytesIs, project_gid), bytes);
            inner
                .map
                .insert((QuotaTag::GroupLogicalBytesIs, project_gid), logical_bytes);
            inner.map.insert((QuotaTag::GroupFilesIs, project_gid), files);
        }

        // "All*" summaries are derived, rebuilt from per-id entries
        let mut sums: HashMap<QuotaTag, i64> = HashMap::new();
        for ((tag, _), value) in inner.map.iter() {
            let all = match tag {
                QuotaTag::UserBytesIs => QuotaTag::AllUserBytesIs,
                QuotaTag::UserLogicalBytesIs => QuotaTag::AllUserLogicalBytesIs,
                QuotaTag::UserLogicalBytesTarget => QuotaTag::AllUserLogicalBytesTarget,
                QuotaTag::UserBytesTarget => QuotaTag::AllUserBytesTarget,
                QuotaTag::UserFilesIs => QuotaTag::AllUserFilesIs,
                QuotaTag::UserFilesTarget => QuotaTag::AllUserFilesTarget,
                QuotaTag::GroupBytesIs => QuotaTag::AllGroupBytesIs,
                QuotaTag::GroupLogicalBytesIs => QuotaTag::AllGroupLogicalBytesIs,
                QuotaTag::GroupLogicalBytesTarget => QuotaTag::AllGroupLogicalBytesTarget,
                QuotaTag::GroupBytesTarget => QuotaTag::AllGroupBytesTarget,
                QuotaTag::GroupFilesIs => QuotaTag::AllGroupFilesIs,
                QuotaTag::GroupFilesTarget => QuotaTag::AllGroupFilesTarget,
                _ => continue,
            };
            *sums.entry(all).or_insert(0) += value;
        }
        for (tag, value) in sums {
            inner.map.insert((tag, 0), value);
        }
    }

    /// User/group/project admission. If both user and group targets exist
    /// both must grant; a lone target decides alone; with neither defined
    /// the project quota (reserved gid) decides for bytes and inodes
    /// together. uid 0 always passes.
    pub fn check_write_quota(&self, uid: u32, gid: u32, bytes: i64, inodes: i64) -> bool {
        if uid == 0 {
            return true;
        }

        let inner = self.inner.lock();
        let get = |tag: QuotaTag, id: u32| inner.map.get(&(tag, id)).copied().unwrap_or(0);

        let user_vol = get(QuotaTag::UserBytesTarget, uid) > 0;
        let user_inode = get(QuotaTag::UserFilesTarget, uid) > 0;
        let group_vol = get(QuotaTag::GroupBytesTarget, gid) > 0;
        let group_inode = get(QuotaTag::GroupFilesTarget, gid) > 0;

        let user_defined = user_vol || user_inode;
        let group_defined = group_vol || group_inode;

        let mut has_user = false;
        if user_vol {
            has_user = get(QuotaTag::UserBytesTarget, uid) - get(QuotaTag::UserBytesIs, uid)
                > bytes;
        }
        if user_inode {
            if get(QuotaTag::UserFilesTarget, uid) - get(QuotaTag::UserFilesIs, uid) > inodes {
                if !user_vol {
                    has_user = true;
                }
            } else {
                has_user = false;
            }
        }

        let mut has_group = false;
        if group_vol {
            has_group = get(QuotaTag::GroupBytesTarget, gid) - get(QuotaTag::GroupBytesIs, gid)
                > bytes;
        }
        if group_inode {
            if get(QuotaTag::GroupFilesTarget, gid) - get(QuotaTag::GroupFilesIs, gid) > inodes {
                if !group_vol {
                    has_group = true;
                }
            } else {
                has_group = false;
            }
        }

        let has_project = (get(QuotaTag::GroupBytesTarget, self.project_gid)
            - get(QuotaTag::GroupBytesIs, self.project_gid)
            > bytes)
            && (get(QuotaTag::GroupFilesTarget, self.project_gid)
                - get(QuotaTag::GroupFilesIs, self.project_gid)
                > inodes);

        let mut has_quota = if user_defined && group_defined {
            has_user && has_group
        } else {
            has_user || has_group
        };

        if !user_defined && !group_defined && has_project {
            has_quota = true;
        }

        debug!(
            uid,
            gid,
            bytes,
            inodes,
            user_defined,
            group_defined,
            has_user,
            has_group,
            has_project,
            granted = has_quota,
            "quota admission"
        );
        has_quota
    }
}

/// Arguments of the admission-then-placement wrapper.
#[derive(Debug, Clone)]
pub struct FilePlacementArgs<'a> {
    pub path: &'a str,
    pub vid: &'a VirtualIdentity,
    pub space: &'a str,
    pub layout: crate::domain::layout::LayoutId,
    pub avoid: &'a [FsId],
    pub group_tag: Option<&'a str>,
    pub forced_group: Option<u32>,
    pub booking_size: u64,
}

pub struct Quota {
    namespace: Arc<Namespace>,
    scheduler: Arc<Scheduler>,
    config: Arc<ConfigStore>,
    map: RwLock<BTreeMap<String, Arc<SpaceQuota>>>,
    project_gid: u32,
}

impl Quota {
    pub fn new(
        namespace: Arc<Namespace>,
        scheduler: Arc<Scheduler>,
        config: Arc<ConfigStore>,
        project_gid: u32,
    ) -> Self {
        Self {
            namespace,
            scheduler,
            config,
            map: RwLock::new(BTreeMap::new()),
            project_gid,
        }
    }

    fn normalize(path: &str) -> String {
        let mut p = path.to_string();
        if !p.ends_with('/') {
            p.push('/');
        }
        p
    }

    /// Register a projection, creating the namespace quota node if absent.
    pub fn register_node(&self, path: &str) -> Result<Arc<SpaceQuota>, MgmError> {
        let normalized = Self::normalize(path);

        let container = self
            .namespace
            .resolve_container(path)
            .map_err(MgmError::from)?;
        if !container.quota_node {
            self.namespace
                .register_quota_node(container.cid)
                .map_err(MgmError::from)?;
        }

        let mut map = self.map.write();
        let quota = map
            .entry(normalized.clone())
            .or_insert_with(|| {
                info!(path = %normalized, "registering quota node");
                Arc::new(SpaceQuota::new(normalized.clone(), container.cid, self.project_gid))
            })
            .clone();
        Ok(quota)
    }

    /// Detach the projection and remove the namespace quota node in one
    /// critical section.
    pub fn remove_node(&self, path: &str) -> Result<(), MgmError> {
        let normalized = Self::normalize(path);
        let mut map = self.map.write();
        let quota = map
            .remove(&normalized)
            .ok_or_else(|| MgmError::from(QuotaError::NoNode(normalized.clone())))?;
        self.namespace
            .remove_quota_node(quota.node_cid())
            .map_err(MgmError::from)?;
        self.config.delete_matching(&normalized);
        Ok(())
    }

    /// Most specific projection responsible for `path`.
    pub fn responsible(&self, path: &str) -> Option<Arc<SpaceQuota>> {
        let probe = Self::normalize(path);
        let map = self.map.read();
        map.iter()
            .filter(|(node_path, _)| probe.starts_with(node_path.as_str()))
            .max_by_key(|(node_path, _)| node_path.len())
            .map(|(_, quota)| quota.clone())
    }

    pub fn set_quota(
        &self,
        path: &str,
        tag: QuotaTag,
        id: u32,
        value: i64,
    ) -> Result<(), MgmError> {
        let tag_name = tag
            .config_name()
            .ok_or_else(|| MgmError::from(QuotaError::NotATarget(format!("{tag:?}"))))?;

        let quota = self.register_node(path)?;
        quota.set(tag, id, value);

        let id_kind = if tag.is_user_tag() { "uid" } else { "gid" };
        self.config.set(
            &format!("{}:{id_kind}={id}:{tag_name}", quota.path()),
            &value.to_string(),
        );
        if let Err(err) = self.config.save() {
            warn!(error = %err, "failed to persist quota config");
        }
        Ok(())
    }

    pub fn rm_quota(&self, path: &str, tag: QuotaTag, id: u32) -> Result<(), MgmError> {
        let tag_name = tag
            .config_name()
            .ok_or_else(|| MgmError::from(QuotaError::NotATarget(format!("{tag:?}"))))?;
        let normalized = Self::normalize(path);

        let quota = self
            .responsible(&normalized)
            .filter(|q| q.path() == normalized)
            .ok_or_else(|| MgmError::from(QuotaError::NoNode(normalized.clone())))?;
        quota.remove(tag, id);

        let id_kind = if tag.is_user_tag() { "uid" } else { "gid" };
        self.config
            .delete(&format!("{normalized}:{id_kind}={id}:{tag_name}"));
        if let Err(err) = self.config.save() {
            warn!(error = %err, "failed to persist quota config");
        }
        Ok(())
    }

    pub fn get_quota(&self, path: &str, tag: QuotaTag, id: u32) -> i64 {
        self.responsible(path).map_or(0, |q| q.get(tag, id))
    }

    /// Admission oracle for `bytes`/`inodes` below `path`.
    pub fn check(&self, path: &str, uid: u32, gid: u32, bytes: i64, inodes: i64) -> bool {
        if uid == 0 {
            return true;
        }
        let Some(quota) = self.responsible(path) else {
            // no quota node governs this subtree
            return true;
        };

        quota.update_from_ns_quota(&self.namespace, uid, gid);
        quota.check_write_quota(uid, gid, bytes, inodes)
    }

    /// Ensure every namespace-declared quota node is projected and drop
    /// projections whose node vanished.
    pub fn load_nodes(&self) {
        let declared = self.namespace.list_quota_nodes();
        let mut map = self.map.write();

        for (cid, path) in &declared {
            let normalized = Self::normalize(path);
            map.entry(normalized.clone()).or_insert_with(|| {
                info!(path = %normalized, "projecting namespace quota node");
                Arc::new(SpaceQuota::new(normalized, *cid, self.project_gid))
            });
        }

        let live: Vec<String> = declared
            .iter()
            .map(|(_, p)| Self::normalize(p))
            .collect();
        map.retain(|path, _| live.contains(path));
    }

    /// Restore operator targets from persisted config entries
    /// (`<path>:uid=<id>:<tag>` / `<path>:gid=<id>:<tag>`).
    pub fn load_from_config(&self) {
        for (key, value) in self.config.entries_with_prefix("/") {
            let Some((node_path, rest)) = key
                .split_once(":uid=")
                .or_else(|| key.split_once(":gid="))
            else {
                continue;
            };
            let Some((id_str, tag_name)) = rest.split_once(':') else {
                continue;
            };
            let (Some(tag), Ok(id), Ok(parsed)) = (
                QuotaTag::from_config_name(tag_name),
                id_str.parse::<u32>(),
                value.parse::<i64>(),
            ) else {
                continue;
            };

            match self.register_node(node_path.trim_end_matches('/')) {
                Ok(quota) => quota.set(tag, id, parsed),
                Err(err) => warn!(path = %node_path, error = %err, "cannot restore quota target"),
            }
        }
    }

    /// Render the quota report; `monitoring` selects the key=value format.
    pub fn print_out(
        &self,
        path_filter: Option<&str>,
        uid_filter: Option<u32>,
        gid_filter: Option<u32>,
        monitoring: bool,
    ) -> String {
        let map = self.map.read();
        let mut out = String::new();

        for (node_path, quota) in map.iter() {
            if let Some(filter) = path_filter {
                if !node_path.starts_with(&Self::normalize(filter)) {
                    continue;
                }
            }
            quota.refresh(&self.namespace);

            for uid in quota.user_ids() {
                if uid_filter.is_some_and(|f| f != uid) {
                    continue;
                }
                let used = quota.get(QuotaTag::UserBytesIs, uid);
                let target = quota.get(QuotaTag::UserBytesTarget, uid);
                let files = quota.get(QuotaTag::UserFilesIs, uid);
                let files_target = quota.get(QuotaTag::UserFilesTarget, uid);
                let status = if target > 0 && used >= target { "exceeded" } else { "ok" };

                if monitoring {
                    out.push_str(&format!(
                        "quota=node space={node_path} uid={uid} usedbytes={used} usedlogicalbytes={} usedfiles={files} maxbytes={target} maxfiles={files_target} status={status}\n",
                        quota.get(QuotaTag::UserLogicalBytesIs, uid),
                    ));
                } else {
                    out.push_str(&format!(
                        "{node_path} uid={uid:<8} used={used:>14} target={target:>14} files={files:>10}/{files_target:<10} [{status}]\n"
                    ));
                }
            }

            for gid in quota.group_ids() {
                if gid_filter.is_some_and(|f| f != gid) {
                    continue;
                }
                let used = quota.get(QuotaTag::GroupBytesIs, gid);
                let target = quota.get(QuotaTag::GroupBytesTarget, gid);
                let files = quota.get(QuotaTag::GroupFilesIs, gid);
                let files_target = quota.get(QuotaTag::GroupFilesTarget, gid);
                let status = if target > 0 && used >= target { "exceeded" } else { "ok" };

                if monitoring {
                    out.push_str(&format!(
                        "quota=node space={node_path} gid={gid} usedbytes={used} usedfiles={files} maxbytes={target} maxfiles={files_target} status={status}\n"
                    ));
                } else {
                    out.push_str(&format!(
                        "{node_path} gid={gid:<8} used={used:>14} target={target:>14} files={files:>10}/{files_target:<10} [{status}]\n"
                    ));
                }
            }
        }
        out
    }

    /// Admit then place: the scheduling entry point of the open pipeline.
    pub fn file_placement(&self, args: &FilePlacementArgs<'_>) -> Result<Vec<FsId>, MgmError> {
        let bytes = (args.booking_size as f64 * args.layout.size_factor()) as i64;
        if !self.check(args.path, args.vid.uid, args.vid.gid, bytes, 1) {
            return Err(MgmError::Quota(format!(
                "uid {} gid {} below {}",
                args.vid.uid, args.vid.gid, args.path
            )));
        }

        let req = PlacementRequest {
            space: args.space,
            vid: args.vid,
            group_tag: args.group_tag,
            layout: args.layout,
            avoid: args.avoid,
            forced_group: args.forced_group,
            booking_size: args.booking_size,
            policy: None,
        };
        self.scheduler.file_placement(&req).map_err(MgmError::from)
    }

    /// Access needs no quota admission; delegated for symmetry.
    pub fn file_access(
        &self,
        req: &AccessRequest<'_>,
        unavail: &mut Vec<FsId>,
    ) -> Result<AccessOutcome, MgmError> {
        self.scheduler.file_access(req, unavail).map_err(MgmError::from)
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::fsview::FsView;
    use crate::domain::layout::LayoutId;

    fn engine() -> (Quota, Arc<Namespace>) {
        let ns = Arc::new(Namespace::new());
        ns.create_container("/data/proj", 0, 0, 0o755, true, (0, 0))
            .unwrap();
        let scheduler = Arc::new(Scheduler::new(Arc::new(FsView::new())));
        let config = Arc::new(ConfigStore::ephemeral());
        (Quota::new(ns.clone(), scheduler, config, 99), ns)
    }

    fn add_file(ns: &Namespace, path: &str, uid: u32, gid: u32, size: u64) {
        let mut fmd = ns
            .create_file(path, uid, gid, 0o644, LayoutId::plain(), (0, 0))
            .unwrap();
        fmd.size = size;
        ns.update_file(&fmd).unwrap();
    }

    #[test]
    fn test_set_get_rm_quota_roundtrip() {
        let (quota, _ns) = engine();
        quota
            .set_quota("/data", QuotaTag::UserBytesTarget, 7, 1 << 30)
            .unwrap();
        assert_eq!(quota.get_quota("/data", QuotaTag::UserBytesTarget, 7), 1 << 30);

        quota.rm_quota("/data", QuotaTag::UserBytesTarget, 7).unwrap();
        assert_eq!(quota.get_quota("/data", QuotaTag::UserBytesTarget, 7), 0);
    }

    #[test]
    fn test_admission_refuses_over_target() {
        let (quota, ns) = engine();
        quota
            .set_quota("/data", QuotaTag::UserBytesTarget, 7, 1 << 30)
            .unwrap();

        add_file(&ns, "/data/a", 7, 70, (1 << 30) - 1024);

        assert!(!quota.check("/data/x", 7, 70, 2048, 1));
        assert!(quota.check("/data/x", 7, 70, 512, 1));
        // root bypasses
        assert!(quota.check("/data/x", 0, 0, i64::MAX / 2, 1));
    }

    #[test]
    fn test_user_and_group_targets_must_both_grant() {
        let (quota, ns) = engine();
        quota
            .set_quota("/data", QuotaTag::UserBytesTarget, 7, 1 << 20)
            .unwrap();
        quota
            .set_quota("/data", QuotaTag::GroupBytesTarget, 70, 1 << 10)
            .unwrap();

        add_file(&ns, "/data/a", 7, 70, 512);

        // user target grants, group target (1 KiB) refuses
        assert!(!quota.check("/data/x", 7, 70, 1024, 1));
    }

    #[test]
    fn test_project_quota_applies_without_user_group_targets() {
        let (quota, ns) = engine();
        quota
            .set_quota("/data/proj", QuotaTag::GroupBytesTarget, 99, 1 << 20)
            .unwrap();
        quota
            .set_quota("/data/proj", QuotaTag::GroupFilesTarget, 99, 100)
            .unwrap();

        add_file(&ns, "/data/proj/a", 5, 50, 1 << 10);

        assert!(quota.check("/data/proj/b", 5, 50, 1 << 10, 1));
        assert!(!quota.check("/data/proj/b", 5, 50, 1 << 20, 1));
    }

    #[test]
    fn test_all_summaries_match_per_id_sums() {
        let (quota, ns) = engine();
        let node = quota.register_node("/data").unwrap();

        add_file(&ns, "/data/a", 1, 10, 100);
        add_file(&ns, "/data/b", 2, 10, 200);
        add_file(&ns, "/data/proj/c", 2, 20, 300);

        node.refresh(&ns);

        let per_id_sum: i64 = node
            .user_ids()
            .iter()
            .map(|uid| node.get(QuotaTag::UserBytesIs, *uid))
            .sum();
        assert_eq!(node.get(QuotaTag::AllUserBytesIs, 0), per_id_sum);
        assert_eq!(node.get(QuotaTag::AllUserFilesIs, 0), 3);
        assert_eq!(node.get(QuotaTag::AllGroupFilesIs, 0), 3);
    }

    #[test]
    fn test_most_specific_node_wins() {
        let (quota, _ns) = engine();
        quota.register_node("/data").unwrap();
        quota.register_node("/data/proj").unwrap();

        let q = quota.responsible("/data/proj/file").unwrap();
        assert_eq!(q.path(), "/data/proj/");
        let q = quota.responsible("/data/other").unwrap();
        assert_eq!(q.path(), "/data/");
    }

    #[test]
    fn test_load_nodes_projects_declared_nodes() {
        let (quota, ns) = engine();
        let c = ns.resolve_container("/data/proj").unwrap();
        ns.register_quota_node(c.cid).unwrap();

        quota.load_nodes();
        assert!(quota.responsible("/data/proj/x").is_some());
    }

    #[test]
    fn test_logical_target_uses_layout_factor() {
        let (quota, ns) = engine();
        let mut container = ns.resolve_container("/data").unwrap();
        container.xattrs.insert(
            crate::domain::attrs::SYS_FORCED_LAYOUT.to_string(),
            "replica".to_string(),
        );
        container.xattrs.insert(
            crate::domain::attrs::SYS_FORCED_NSTRIPES.to_string(),
            "2".to_string(),
        );
        ns.update_container(&container).unwrap();

        let node = quota.register_node("/data").unwrap();
        node.set(QuotaTag::UserBytesTarget, 7, 1 << 30);
        node.refresh(&ns);

        assert_eq!(node.get(QuotaTag::UserLogicalBytesTarget, 7), 1 << 29);
    }
}
