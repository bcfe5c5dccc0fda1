// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Control-RPC lifecycle tests: commit, drop, probes and transfer polling.

use std::sync::Arc;

use stratos_mgm_core::application::access::AccessControl;
use stratos_mgm_core::application::master::{
    AdmissionGate, MasterConfig, MasterController, StaticPeer,
};
use stratos_mgm_core::application::namespace_ops::NamespaceOps;
use stratos_mgm_core::application::open::OpenPipeline;
use stratos_mgm_core::application::quota::Quota;
use stratos_mgm_core::application::scheduler::Scheduler;
use stratos_mgm_core::application::transfer::TransferScheduler;
use stratos_mgm_core::domain::filesystem::{
    ActiveStatus, BootStatus, ConfigStatus, FsId, FsRegisters,
};
use stratos_mgm_core::domain::fsview::FsView;
use stratos_mgm_core::domain::identity::VirtualIdentity;
use stratos_mgm_core::domain::layout::LayoutId;
use stratos_mgm_core::infrastructure::capability::CapabilityEngine;
use stratos_mgm_core::infrastructure::config_store::ConfigStore;
use stratos_mgm_core::infrastructure::namespace::Namespace;
use stratos_mgm_core::presentation::fsctl::FsCtl;

struct Stack {
    namespace: Arc<Namespace>,
    fsctl: FsCtl,
    _metadata_dir: tempfile::TempDir,
}

fn regs(host: &str) -> FsRegisters {
    FsRegisters {
        host: host.to_string(),
        port: 1095,
        boot_status: BootStatus::Booted,
        config_status: ConfigStatus::ReadWrite,
        active: ActiveStatus::Online,
        heartbeat: chrono::Utc::now().timestamp(),
        capacity_bytes: 1 << 30,
        free_bytes: 1 << 30,
        files: 10,
        ..Default::default()
    }
}

fn stack() -> Stack {
    let fsview = Arc::new(FsView::new());
    fsview
        .register_filesystem(FsId(1), regs("fst1"), None)
        .unwrap();
    fsview
        .register_filesystem(FsId(2), regs("fst2"), None)
        .unwrap();

    let namespace = Arc::new(Namespace::new());
    namespace
        .create_container("/a", 0, 0, 0o777, true, (0, 0))
        .unwrap();

    let scheduler = Arc::new(Scheduler::new(fsview.clone()));
    let quota = Arc::new(Quota::new(
        namespace.clone(),
        scheduler,
        Arc::new(ConfigStore::ephemeral()),
        99,
    ));
    let access = Arc::new(AccessControl::new());
    let capability = Arc::new(CapabilityEngine::with_key("t", b"fsctl-test-key"));

    let pipeline = Arc::new(OpenPipeline::new(
        namespace.clone(),
        fsview.clone(),
        quota,
        capability.clone(),
        access.clone(),
        "mgm1:1094",
        "default",
    ));
    let ops = Arc::new(NamespaceOps::new(
        namespace.clone(),
        fsview.clone(),
        pipeline,
        capability.clone(),
    ));
    let transfers = Arc::new(TransferScheduler::new(
        fsview.clone(),
        namespace.clone(),
        capability,
        "mgm1:1094",
        AdmissionGate::default(),
    ));

    let metadata_dir = tempfile::tempdir().unwrap();
    std::fs::File::create(metadata_dir.path().join("master.mgm.lock")).unwrap();
    let master = MasterController::new(
        MasterConfig::new("mgm1", metadata_dir.path()),
        access,
        namespace.clone(),
        Arc::new(StaticPeer::default()),
    )
    .unwrap();

    let fsctl = FsCtl::new(namespace.clone(), fsview, ops, transfers, master);
    Stack {
        namespace,
        fsctl,
        _metadata_dir: metadata_dir,
    }
}

#[tokio::test]
async fn test_commit_then_unlink_then_drop_destroys_record() {
    let stack = stack();
    let fst = VirtualIdentity::root();

    let fmd = stack
        .namespace
        .create_file("/a/f", 100, 100, 0o644, LayoutId::plain(), (0, 0))
        .unwrap();

    // the node reports the finished write
    let reply = stack
        .fsctl
        .dispatch(
            &format!(
                "mgm.pcmd=commit&mgm.fid={:x}&mgm.fsid=1&mgm.size=4096&mgm.checksum=0badc0de&\
                 mgm.mtime=1700000000&mgm.commit.size=1&mgm.commit.checksum=1",
                fmd.fid
            ),
            &fst,
        )
        .await
        .unwrap();
    assert!(reply.contains("committed"));

    let committed = stack.namespace.file_by_id(fmd.fid).unwrap();
    assert_eq!(committed.size, 4096);
    assert_eq!(committed.checksum, vec![0x0b, 0xad, 0xc0, 0xde]);
    assert_eq!(committed.locations, vec![FsId(1)]);

    // unlink: the replica moves to the unlinked list
    stack.namespace.unlink_file(fmd.fid).unwrap();
    assert_eq!(stack.namespace.fs_unlinked(FsId(1)), vec![fmd.fid]);

    // late commit for the unlinked file answers EIDRM
    let err = stack
        .fsctl
        .dispatch(
            &format!(
                "mgm.pcmd=commit&mgm.fid={:x}&mgm.fsid=1&mgm.size=1&mgm.commit.size=1",
                fmd.fid
            ),
            &fst,
        )
        .await
        .unwrap_err();
    assert_eq!(err.errno(), libc::EIDRM);

    // the node acknowledges physical deletion; the record dies with it
    stack
        .fsctl
        .dispatch(
            &format!("mgm.pcmd=drop&mgm.fid={:x}&mgm.fsid=1", fmd.fid),
            &fst,
        )
        .await
        .unwrap();
    assert!(stack.namespace.file_by_id(fmd.fid).is_err());
    assert!(stack.namespace.fs_unlinked(FsId(1)).is_empty());
}

#[tokio::test]
async fn test_commit_with_drop_fsid_replaces_replica() {
    let stack = stack();
    let fst = VirtualIdentity::root();

    let mut fmd = stack
        .namespace
        .create_file("/a/f", 100, 100, 0o644, LayoutId::plain(), (0, 0))
        .unwrap();
    fmd.add_location(FsId(1)).unwrap();
    stack.namespace.update_file(&fmd).unwrap();

    stack
        .fsctl
        .dispatch(
            &format!(
                "mgm.pcmd=commit&mgm.fid={:x}&mgm.fsid=2&mgm.size=100&mgm.commit.size=1&mgm.drop.fsid=1",
                fmd.fid
            ),
            &fst,
        )
        .await
        .unwrap();

    let updated = stack.namespace.file_by_id(fmd.fid).unwrap();
    assert_eq!(updated.locations, vec![FsId(2)]);
    assert_eq!(updated.unlinked, vec![FsId(1)]);
}

#[tokio::test]
async fn test_commit_requires_privileges() {
    let stack = stack();
    let user = VirtualIdentity::new(100, 100);

    let err = stack
        .fsctl
        .dispatch("mgm.pcmd=commit&mgm.fid=1&mgm.fsid=1", &user)
        .await
        .unwrap_err();
    assert_eq!(err.errno(), libc::EPERM);
}

#[tokio::test]
async fn test_stat_and_checksum_probes() {
    let stack = stack();
    let fst = VirtualIdentity::root();

    let mut fmd = stack
        .namespace
        .create_file("/a/f", 100, 200, 0o640, LayoutId::plain(), (11, 22))
        .unwrap();
    fmd.size = 777;
    fmd.checksum = vec![0xde, 0xad];
    stack.namespace.update_file(&fmd).unwrap();

    let stat = stack
        .fsctl
        .dispatch("mgm.pcmd=stat&mgm.path=/a/f", &fst)
        .await
        .unwrap();
    assert!(stat.contains("size=777"));
    assert!(stat.contains("uid=100"));
    assert!(stat.contains("isdir=0"));

    let checksum = stack
        .fsctl
        .dispatch("mgm.pcmd=checksum&mgm.path=/a/f", &fst)
        .await
        .unwrap();
    assert_eq!(checksum, "checksum: dead");
}

#[tokio::test]
async fn test_statvfs_aggregates_space() {
    let stack = stack();
    let reply = stack
        .fsctl
        .dispatch("mgm.pcmd=statvfs&mgm.space=default", &VirtualIdentity::root())
        .await
        .unwrap();

    assert!(reply.contains(&format!("f_total_bytes={}", 2u64 << 30)));
    assert!(reply.contains("f_files=20"));
}

#[tokio::test]
async fn test_xattr_roundtrip() {
    let stack = stack();
    let root = VirtualIdentity::root();

    stack
        .fsctl
        .dispatch(
            "mgm.pcmd=xattr&mgm.subcmd=set&mgm.path=/a&mgm.xattrname=sys.forced.space&mgm.xattrvalue=ssd",
            &root,
        )
        .await
        .unwrap();

    let got = stack
        .fsctl
        .dispatch(
            "mgm.pcmd=xattr&mgm.subcmd=get&mgm.path=/a&mgm.xattrname=sys.forced.space",
            &root,
        )
        .await
        .unwrap();
    assert_eq!(got, "sys.forced.space=ssd");

    let ls = stack
        .fsctl
        .dispatch("mgm.pcmd=xattr&mgm.subcmd=ls&mgm.path=/a", &root)
        .await
        .unwrap();
    assert!(ls.contains("sys.forced.space=ssd"));

    stack
        .fsctl
        .dispatch(
            "mgm.pcmd=xattr&mgm.subcmd=rm&mgm.path=/a&mgm.xattrname=sys.forced.space",
            &root,
        )
        .await
        .unwrap();
    assert!(stack
        .fsctl
        .dispatch(
            "mgm.pcmd=xattr&mgm.subcmd=get&mgm.path=/a&mgm.xattrname=sys.forced.space",
            &root,
        )
        .await
        .is_err());
}

#[tokio::test]
async fn test_schedule2balance_round_trip() {
    let stack = stack();
    let fst = VirtualIdentity::root();

    // overfill fs1 so it becomes a source
    let mut fmd = stack
        .namespace
        .create_file("/a/big", 0, 0, 0o644, LayoutId::plain(), (0, 0))
        .unwrap();
    fmd.add_location(FsId(1)).unwrap();
    fmd.size = 100;
    stack.namespace.update_file(&fmd).unwrap();

    // make the source look over the nominal fill
    // (registers are updated from node heartbeats in production)
    let reply = stack
        .fsctl
        .dispatch("mgm.pcmd=schedule2balance&mgm.target.fsid=2", &fst)
        .await
        .unwrap();
    // fs1 is not above nominal fill in this fixture, so no work is handed out
    assert_eq!(reply, "submitted=0");

    let unknown = stack
        .fsctl
        .dispatch("mgm.pcmd=bogus", &fst)
        .await
        .unwrap_err();
    assert_eq!(unknown.errno(), libc::EOPNOTSUPP);
}
