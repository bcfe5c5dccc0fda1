// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Opaque control-RPC dispatch (`mgm.pcmd=…`).
//!
//! Storage nodes and peer MGMs drive the core through `&`-separated
//! key=value commands: write commits, deletion acknowledgements, metadata
//! probes, transfer polling and master signalling. The wire layer parses
//! the verb envelope; this dispatcher owns the semantics.

use std::sync::Arc;

use tracing::debug;

use crate::application::master::MasterController;
use crate::application::namespace_ops::NamespaceOps;
use crate::application::transfer::TransferScheduler;
use crate::domain::error::MgmError;
use crate::domain::filesystem::FsId;
use crate::domain::identity::VirtualIdentity;
use crate::domain::namespace::Fid;
use crate::infrastructure::capability::parse_pairs;
use crate::infrastructure::namespace::Namespace;

/// Parsed command arguments.
struct Args(Vec<(String, String)>);

impl Args {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }
}

pub struct FsCtl {
    namespace: Arc<Namespace>,
    fsview: Arc<crate::domain::fsview::FsView>,
    ops: Arc<NamespaceOps>,
    transfers: Arc<TransferScheduler>,
    master: Arc<MasterController>,
}

impl FsCtl {
    pub fn new(
        namespace: Arc<Namespace>,
        fsview: Arc<crate::domain::fsview::FsView>,
        ops: Arc<NamespaceOps>,
        transfers: Arc<TransferScheduler>,
        master: Arc<MasterController>,
    ) -> Self {
        Self {
            namespace,
            fsview,
            ops,
            transfers,
            master,
        }
    }

    /// Dispatch one opaque command string.
    pub async fn dispatch(&self, query: &str, vid: &VirtualIdentity) -> Result<String, MgmError> {
        let args = Args(parse_pairs(query));

        let pcmd = args
            .get("mgm.pcmd")
            .ok_or_else(|| MgmError::Invalid("missing mgm.pcmd".to_string()))?
            .to_string();
        let pcmd = pcmd.as_str();
        debug!(pcmd, uid = vid.uid, "fsctl dispatch");
        metrics::counter!("mgm_fsctl_total", "pcmd" => pcmd.to_string()).increment(1);

        match pcmd {
            "commit" => self.commit(&args, vid),
            "drop" => self.drop_replica(&args, vid),
            "stat" => self.stat(&args),
            "chmod" => self.chmod(&args, vid),
            "chown" => self.chown(&args, vid),
            "access" => self.access(&args, vid),
            "utimes" => self.utimes(&args, vid),
            "checksum" => self.checksum(&args),
            "statvfs" => self.statvfs(&args),
            "xattr" => self.xattr(&args, vid),
            "schedule2balance" => self.schedule(&args, vid, true),
            "schedule2drain" => self.schedule(&args, vid, false),
            "mastersignalbounce" => {
                require_privileged(vid)?;
                self.master.handle_signal_bounce();
                Ok("bounced".to_string())
            }
            "mastersignalreload" => {
                require_privileged(vid)?;
                self.master.handle_signal_reload();
                Ok("reloaded".to_string())
            }
            other => Err(MgmError::Unsupported(format!("mgm.pcmd={other}"))),
        }
    }

    /// An FST reports a completed write.
    fn commit(
        &self,
        args: &Args,
        vid: &VirtualIdentity,
    ) -> Result<String, MgmError> {
        require_privileged(vid)?;

        let fid = parse_hex_fid(args.get("mgm.fid"))?;
        let fsid = parse_fsid(args.get("mgm.fsid"))?;

        let commit_size = args.get("mgm.commit.size") == Some("1");
        let commit_checksum = args.get("mgm.commit.checksum") == Some("1");
        let verify_size = args.get("mgm.commit.verify") == Some("1");

        let mut fmd = self
            .namespace
            .file_by_id(fid)
            .map_err(|_| MgmError::Removed(format!("fid {fid:x}")))?;

        // a commit for an already unlinked file is acknowledged with EIDRM
        // so the node drops its local replica
        let parent = self.namespace.container_by_id(fmd.cid).ok();
        let still_linked = parent
            .map(|c| c.files.get(&fmd.name) == Some(&fid))
            .unwrap_or(false);
        if !still_linked {
            return Err(MgmError::Removed(format!("fid {fid:x} is unlinked")));
        }

        if commit_size {
            let size: u64 = args.get("mgm.size")
                .and_then(|v| v.parse().ok())
                .ok_or_else(|| MgmError::Invalid("mgm.size".to_string()))?;
            if verify_size && !fmd.locations.is_empty() && fmd.size != 0 && fmd.size != size {
                return Err(MgmError::Internal(format!(
                    "size mismatch for fid {fid:x}: {} != {size}",
                    fmd.size
                )));
            }
            fmd.size = size;
        }

        if commit_checksum {
            if let Some(checksum) = args.get("mgm.checksum") {
                fmd.checksum = hex::decode(checksum)
                    .map_err(|_| MgmError::Invalid("mgm.checksum".to_string()))?;
            }
        }

        if let Some(mtime) = args.get("mgm.mtime").and_then(|v| v.parse::<i64>().ok()) {
            let nsec = args.get("mgm.mtime_ns")
                .and_then(|v| v.parse::<u32>().ok())
                .unwrap_or(0);
            fmd.mtime = (mtime, nsec);
        }

        fmd.add_location(fsid).map_err(MgmError::from)?;

        // a replica replacement piggybacks the drop of the old stripe
        if let Some(drop_fsid) = args.get("mgm.drop.fsid") {
            let drop_fsid = parse_fsid(Some(drop_fsid))?;
            fmd.unlink_location(drop_fsid);
        }

        self.namespace.update_file(&fmd).map_err(MgmError::from)?;
        Ok(format!("committed fid={fid:x} fsid={fsid}"))
    }

    /// An FST acknowledges physical deletion of one replica.
    fn drop_replica(
        &self,
        args: &Args,
        vid: &VirtualIdentity,
    ) -> Result<String, MgmError> {
        require_privileged(vid)?;
        let fid = parse_hex_fid(args.get("mgm.fid"))?;
        let fsid = parse_fsid(args.get("mgm.fsid"))?;

        self.namespace
            .drop_replica(fid, fsid)
            .map_err(MgmError::from)?;
        Ok(format!("dropped fid={fid:x} fsid={fsid}"))
    }

    fn stat(&self, args: &Args) -> Result<String, MgmError> {
        let path = require_path(args)?;
        let info = self.ops.stat(path)?;
        Ok(format!(
            "stat: id={} size={} mode={:o} uid={} gid={} mtime={}.{} ctime={}.{} nlink={} isdir={}",
            info.id,
            info.size,
            info.mode,
            info.uid,
            info.gid,
            info.mtime.0,
            info.mtime.1,
            info.ctime.0,
            info.ctime.1,
            info.nlink,
            u8::from(info.is_dir),
        ))
    }

    fn chmod(
        &self,
        args: &Args,
        vid: &VirtualIdentity,
    ) -> Result<String, MgmError> {
        let path = require_path(args)?;
        let mode = args.get("mgm.mode")
            .and_then(|v| u32::from_str_radix(v, 8).ok())
            .ok_or_else(|| MgmError::Invalid("mgm.mode".to_string()))?;
        self.ops.chmod(path, mode, vid)?;
        Ok("ok".to_string())
    }

    fn chown(
        &self,
        args: &Args,
        vid: &VirtualIdentity,
    ) -> Result<String, MgmError> {
        let path = require_path(args)?;
        let uid = args.get("mgm.owner.uid")
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| MgmError::Invalid("mgm.owner.uid".to_string()))?;
        let gid = args.get("mgm.owner.gid")
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| MgmError::Invalid("mgm.owner.gid".to_string()))?;
        self.ops.chown(path, uid, gid, vid)?;
        Ok("ok".to_string())
    }

    fn access(
        &self,
        args: &Args,
        vid: &VirtualIdentity,
    ) -> Result<String, MgmError> {
        let path = require_path(args)?;
        let mode = args.get("mgm.access.mode").unwrap_or("r");
        self.ops.access(
            path,
            vid,
            mode.contains('r'),
            mode.contains('w'),
            mode.contains('x'),
        )?;
        Ok("granted".to_string())
    }

    fn utimes(
        &self,
        args: &Args,
        vid: &VirtualIdentity,
    ) -> Result<String, MgmError> {
        let path = require_path(args)?;
        let sec = args.get("mgm.mtime")
            .and_then(|v| v.parse::<i64>().ok())
            .ok_or_else(|| MgmError::Invalid("mgm.mtime".to_string()))?;
        let nsec = args.get("mgm.mtime_ns")
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(0);
        self.ops.utimes(path, (sec, nsec), vid)?;
        Ok("ok".to_string())
    }

    fn checksum(&self, args: &Args) -> Result<String, MgmError> {
        let path = require_path(args)?;
        let info = self.ops.stat(path)?;
        if info.is_dir {
            return Err(MgmError::IsDirectory(path.to_string()));
        }
        Ok(format!("checksum: {}", hex::encode(info.checksum)))
    }

    /// Aggregate capacity of one space.
    fn statvfs(&self, args: &Args) -> Result<String, MgmError> {
        let space = args.get("mgm.space").unwrap_or("default");

        let view = self.fsview.view();
        let mut total = 0u64;
        let mut free = 0u64;
        let mut files = 0u64;
        if let Some(sp) = view.space(space) {
            for group in sp.groups.values() {
                for fsid in &group.members {
                    if let Some(snap) = view.snapshot(*fsid) {
                        total += snap.regs.capacity_bytes;
                        free += snap.regs.free_bytes;
                        files += snap.regs.files;
                    }
                }
            }
        }

        Ok(format!(
            "statvfs: f_total_bytes={total} f_free_bytes={free} f_files={files}"
        ))
    }

    fn xattr(
        &self,
        args: &Args,
        vid: &VirtualIdentity,
    ) -> Result<String, MgmError> {
        let path = require_path(args)?;
        let subcmd = args.get("mgm.subcmd")
            .ok_or_else(|| MgmError::Invalid("missing mgm.subcmd".to_string()))?;

        match subcmd {
            "ls" => {
                let attrs = self.ops.attr_ls(path)?;
                Ok(attrs
                    .into_iter()
                    .map(|(k, v)| format!("{k}={v}"))
                    .collect::<Vec<_>>()
                    .join("\n"))
            }
            "get" => {
                let key = args.get("mgm.xattrname")
                    .ok_or_else(|| MgmError::Invalid("mgm.xattrname".to_string()))?;
                let value = self.ops.attr_get(path, key)?;
                Ok(format!("{key}={value}"))
            }
            "set" => {
                let key = args.get("mgm.xattrname")
                    .ok_or_else(|| MgmError::Invalid("mgm.xattrname".to_string()))?;
                let value = args.get("mgm.xattrvalue").unwrap_or_default();
                self.ops.attr_set(path, key, value, vid)?;
                Ok("ok".to_string())
            }
            "rm" => {
                let key = args.get("mgm.xattrname")
                    .ok_or_else(|| MgmError::Invalid("mgm.xattrname".to_string()))?;
                self.ops.attr_rm(path, key, vid)?;
                Ok("ok".to_string())
            }
            other => Err(MgmError::Unsupported(format!("xattr subcmd {other}"))),
        }
    }

    fn schedule(
        &self,
        args: &Args,
        vid: &VirtualIdentity,
        balance: bool,
    ) -> Result<String, MgmError> {
        require_privileged(vid)?;
        let target = parse_fsid(args.get("mgm.target.fsid"))?;

        let job = if balance {
            self.transfers.schedule2balance(target)?
        } else {
            self.transfers.schedule2drain(target)?
        };

        Ok(match job {
            Some(job) => job.body().to_string(),
            None => "submitted=0".to_string(),
        })
    }
}

fn require_privileged(vid: &VirtualIdentity) -> Result<(), MgmError> {
    if vid.is_root() || vid.sudoer {
        Ok(())
    } else {
        Err(MgmError::Permission("fst command requires privileges".to_string()))
    }
}

fn require_path<'a>(args: &'a Args) -> Result<&'a str, MgmError> {
    args.get("mgm.path")
        .ok_or_else(|| MgmError::Invalid("missing mgm.path".to_string()))
}

fn parse_hex_fid(value: Option<&str>) -> Result<Fid, MgmError> {
    value
        .and_then(|v| Fid::from_str_radix(v, 16).ok())
        .ok_or_else(|| MgmError::Invalid("mgm.fid".to_string()))
}

fn parse_fsid(value: Option<&str>) -> Result<FsId, MgmError> {
    value
        .and_then(|v| v.parse().ok())
        .map(FsId)
        .filter(|f: &FsId| !f.is_none())
        .ok_or_else(|| MgmError::Invalid("mgm.fsid".to_string()))
}
