// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! End-to-end open pipeline scenarios against an in-memory fleet.

use std::sync::Arc;

use parking_lot::Mutex;
use stratos_mgm_core::application::access::AccessControl;
use stratos_mgm_core::application::open::{
    HealDispatcher, OpenFlags, OpenOutcome, OpenPipeline,
};
use stratos_mgm_core::application::quota::{Quota, QuotaTag};
use stratos_mgm_core::application::scheduler::Scheduler;
use stratos_mgm_core::domain::attrs;
use stratos_mgm_core::domain::error::MgmError;
use stratos_mgm_core::domain::filesystem::{
    ActiveStatus, BootStatus, ConfigStatus, FsId, FsRegisters,
};
use stratos_mgm_core::domain::fsview::FsView;
use stratos_mgm_core::domain::identity::VirtualIdentity;
use stratos_mgm_core::domain::namespace::Fid;
use stratos_mgm_core::infrastructure::capability::CapabilityEngine;
use stratos_mgm_core::infrastructure::config_store::ConfigStore;
use stratos_mgm_core::infrastructure::namespace::Namespace;

struct Stack {
    fsview: Arc<FsView>,
    namespace: Arc<Namespace>,
    quota: Arc<Quota>,
    access: Arc<AccessControl>,
    capability: Arc<CapabilityEngine>,
    pipeline: Arc<OpenPipeline>,
}

fn healthy_regs(group: u32, host: &str) -> FsRegisters {
    FsRegisters {
        host: host.to_string(),
        port: 1095,
        space: "default".to_string(),
        group_index: group,
        boot_status: BootStatus::Booted,
        config_status: ConfigStatus::ReadWrite,
        active: ActiveStatus::Online,
        heartbeat: chrono::Utc::now().timestamp(),
        capacity_bytes: 1 << 40,
        used_bytes: 1 << 30,
        free_bytes: (1 << 40) - (1 << 30),
        net_eth_rate_mib: 1000.0,
        disk_utilization: 0.1,
        ..Default::default()
    }
}

fn stack(fs_hosts: &[&str]) -> Stack {
    let fsview = Arc::new(FsView::new());
    for (i, host) in fs_hosts.iter().enumerate() {
        fsview
            .register_filesystem(FsId(i as u32 + 1), healthy_regs(0, host), None)
            .unwrap();
    }

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
    let capability = Arc::new(CapabilityEngine::with_key("test", b"integration-test-key"));

    let pipeline = Arc::new(OpenPipeline::new(
        namespace.clone(),
        fsview.clone(),
        quota.clone(),
        capability.clone(),
        access.clone(),
        "mgm1:1094",
        "default",
    ));

    Stack {
        fsview,
        namespace,
        quota,
        access,
        capability,
        pipeline,
    }
}

fn set_attr(stack: &Stack, path: &str, key: &str, value: &str) {
    let mut cmd = stack.namespace.resolve_container(path).unwrap();
    cmd.xattrs.insert(key.to_string(), value.to_string());
    stack.namespace.update_container(&cmd).unwrap();
}

#[tokio::test]
async fn test_create_two_replica_file_redirects_and_places_two_stripes() {
    let stack = stack(&["fst1", "fst2", "fst3"]);
    set_attr(&stack, "/a", attrs::SYS_FORCED_LAYOUT, "replica");
    set_attr(&stack, "/a", attrs::SYS_FORCED_NSTRIPES, "2");

    let vid = VirtualIdentity::new(100, 200);
    let outcome = stack
        .pipeline
        .open("/a/b.dat", OpenFlags::create(), 0o644, "eos.bookingsize=4096", &vid)
        .await
        .unwrap();

    let OpenOutcome::Redirect(redirect) = outcome else {
        panic!("expected redirect, got {outcome:?}");
    };
    assert!(["fst1", "fst2", "fst3"].contains(&redirect.host.as_str()));
    assert!(redirect.query.contains("mgm.access=create"));
    assert!(redirect.query.contains("cap.mac="));
    assert!(redirect.query.contains("mgm.replicahead="));

    let fmd = stack.namespace.resolve_file("/a/b.dat").unwrap();
    assert_eq!(fmd.locations.len(), 2);
    assert_ne!(fmd.locations[0], fmd.locations[1]);
    assert_eq!(fmd.layout.stripe_count(), 2);
    assert_eq!(fmd.uid, 100);
}

#[tokio::test]
async fn test_read_degraded_replica_redirects_to_healthy_one() {
    let stack = stack(&["fst1", "fst2"]);

    let mut fmd = stack
        .namespace
        .create_file(
            "/a/r.dat",
            100,
            200,
            0o644,
            stratos_mgm_core::domain::layout::LayoutId::replica(2).unwrap(),
            (0, 0),
        )
        .unwrap();
    fmd.add_location(FsId(1)).unwrap();
    fmd.add_location(FsId(2)).unwrap();
    stack.namespace.update_file(&fmd).unwrap();

    // replica on fst2 goes dark
    stack
        .fsview
        .fs(FsId(2))
        .unwrap()
        .update(|r| r.boot_status = BootStatus::OpsError);

    let vid = VirtualIdentity::new(100, 200);
    let outcome = stack
        .pipeline
        .open("/a/r.dat", OpenFlags::read_only(), 0, "", &vid)
        .await
        .unwrap();

    let OpenOutcome::Redirect(redirect) = outcome else {
        panic!("expected redirect, got {outcome:?}");
    };
    assert_eq!(redirect.host, "fst1");
}

#[tokio::test]
async fn test_unavailable_file_heals_and_stalls() {
    struct Recorder(Mutex<Vec<(String, Fid)>>);
    impl HealDispatcher for Recorder {
        fn heal(&self, path: &str, fid: Fid, _unavailable: &[FsId]) {
            self.0.lock().push((path.to_string(), fid));
        }
    }

    let stack = stack(&["fst1", "fst2"]);
    let heal = Arc::new(Recorder(Mutex::new(Vec::new())));

    let pipeline = Arc::new(
        OpenPipeline::new(
            stack.namespace.clone(),
            stack.fsview.clone(),
            stack.quota.clone(),
            stack.capability.clone(),
            stack.access.clone(),
            "mgm1:1094",
            "default",
        )
        .with_heal(heal.clone()),
    );

    set_attr(&stack, "/a", attrs::SYS_HEAL_UNAVAILABLE, "3");

    let mut fmd = stack
        .namespace
        .create_file(
            "/a/r.dat",
            100,
            200,
            0o644,
            stratos_mgm_core::domain::layout::LayoutId::replica(2).unwrap(),
            (0, 0),
        )
        .unwrap();
    fmd.add_location(FsId(1)).unwrap();
    fmd.add_location(FsId(2)).unwrap();
    stack.namespace.update_file(&fmd).unwrap();

    // both replicas dark
    for fsid in [1, 2] {
        stack
            .fsview
            .fs(FsId(fsid))
            .unwrap()
            .update(|r| r.boot_status = BootStatus::OpsError);
    }

    let vid = VirtualIdentity::new(100, 200);
    let outcome = pipeline
        .open("/a/r.dat", OpenFlags::read_only(), 0, "", &vid)
        .await
        .unwrap();

    assert!(matches!(outcome, OpenOutcome::Stall { .. }));
    assert_eq!(heal.0.lock().len(), 1);
}

#[tokio::test]
async fn test_quota_exceeded_removes_half_created_file() {
    let stack = stack(&["fst1", "fst2", "fst3"]);

    stack
        .quota
        .set_quota("/a", QuotaTag::UserBytesTarget, 7, 1 << 30)
        .unwrap();

    // user 7 already sits one KiB below the target
    let mut existing = stack
        .namespace
        .create_file(
            "/a/existing",
            7,
            70,
            0o644,
            stratos_mgm_core::domain::layout::LayoutId::plain(),
            (0, 0),
        )
        .unwrap();
    existing.size = (1 << 30) - 1024;
    stack.namespace.update_file(&existing).unwrap();

    let vid = VirtualIdentity::new(7, 70);
    let err = stack
        .pipeline
        .open("/a/x", OpenFlags::create(), 0o644, "eos.bookingsize=2048", &vid)
        .await
        .unwrap_err();

    assert!(matches!(err, MgmError::Quota(_)));
    assert_eq!(err.errno(), libc::EDQUOT);
    assert!(stack.namespace.resolve_file("/a/x").is_err());
}

#[tokio::test]
async fn test_write_stall_rule_stalls_writers_not_readers() {
    let stack = stack(&["fst1"]);
    stack.access.set_stall("w:*", 60);

    let mut fmd = stack
        .namespace
        .create_file(
            "/a/f",
            100,
            100,
            0o644,
            stratos_mgm_core::domain::layout::LayoutId::plain(),
            (0, 0),
        )
        .unwrap();
    fmd.add_location(FsId(1)).unwrap();
    stack.namespace.update_file(&fmd).unwrap();

    let vid = VirtualIdentity::new(100, 100);
    let write = stack
        .pipeline
        .open("/a/f", OpenFlags::create(), 0o644, "", &vid)
        .await
        .unwrap();
    assert!(matches!(write, OpenOutcome::Stall { seconds: 60, .. }));

    let read = stack
        .pipeline
        .open("/a/f", OpenFlags::read_only(), 0, "", &vid)
        .await
        .unwrap();
    assert!(matches!(read, OpenOutcome::Redirect(_)));
}

#[tokio::test]
async fn test_banned_identity_gets_banner_stall() {
    let stack = stack(&["fst1"]);
    stack.access.ban_uid(666);

    let vid = VirtualIdentity::new(666, 666);
    let outcome = stack
        .pipeline
        .open("/a/f", OpenFlags::read_only(), 0, "", &vid)
        .await
        .unwrap();

    let OpenOutcome::Stall { seconds, message } = outcome else {
        panic!("expected stall");
    };
    assert_eq!(seconds, 300);
    assert!(message.contains("banned"));
}

#[tokio::test]
async fn test_enoent_redirect_attribute() {
    let stack = stack(&["fst1"]);
    set_attr(&stack, "/a", attrs::SYS_REDIRECT_ENOENT, "peer-mgm:2094");

    let vid = VirtualIdentity::new(100, 100);
    let outcome = stack
        .pipeline
        .open("/a/missing", OpenFlags::read_only(), 0, "", &vid)
        .await
        .unwrap();

    let OpenOutcome::Redirect(redirect) = outcome else {
        panic!("expected redirect");
    };
    assert_eq!(redirect.host, "peer-mgm");
    assert_eq!(redirect.port, 2094);
}

#[tokio::test]
async fn test_exclusive_create_on_existing_is_eexist() {
    let stack = stack(&["fst1"]);
    stack
        .namespace
        .create_file(
            "/a/f",
            100,
            100,
            0o644,
            stratos_mgm_core::domain::layout::LayoutId::plain(),
            (0, 0),
        )
        .unwrap();

    let vid = VirtualIdentity::new(100, 100);
    let mut flags = OpenFlags::create();
    flags.exclusive = true;

    let err = stack
        .pipeline
        .open("/a/f", flags, 0o644, "", &vid)
        .await
        .unwrap_err();
    assert_eq!(err.errno(), libc::EEXIST);
}

#[tokio::test]
async fn test_pio_read_lists_every_replica() {
    let stack = stack(&["fst1", "fst2"]);
    set_attr(&stack, "/a", attrs::SYS_FORCED_LAYOUT, "replica");
    set_attr(&stack, "/a", attrs::SYS_FORCED_NSTRIPES, "2");

    let vid = VirtualIdentity::new(100, 100);
    stack
        .pipeline
        .open("/a/p", OpenFlags::create(), 0o644, "eos.bookingsize=1024", &vid)
        .await
        .unwrap();

    let outcome = stack
        .pipeline
        .open("/a/p", OpenFlags::read_only(), 0, "eos.cli.access=pio", &vid)
        .await
        .unwrap();

    let OpenOutcome::Composite(envelope) = outcome else {
        panic!("expected composite, got {outcome:?}");
    };
    assert!(envelope.contains("pio.0="));
    assert!(envelope.contains("pio.1="));
}

#[tokio::test]
async fn test_path_rewrite_applies_longest_prefix() {
    let stack = stack(&["fst1"]);
    stack.pipeline.add_path_rewrite("/alias", "/a");

    let vid = VirtualIdentity::new(100, 100);
    stack
        .pipeline
        .open("/alias/f", OpenFlags::create(), 0o644, "", &vid)
        .await
        .unwrap();

    assert!(stack.namespace.resolve_file("/a/f").is_ok());
}

#[tokio::test]
async fn test_mkpath_creates_ancestors_with_inheritance() {
    let stack = stack(&["fst1"]);
    set_attr(&stack, "/a", attrs::SYS_ACL, "u:100:rwx");

    let vid = VirtualIdentity::new(100, 100);
    let mut flags = OpenFlags::create();
    flags.mkpath = true;

    stack
        .pipeline
        .open("/a/deep/tree/f", flags, 0o644, "", &vid)
        .await
        .unwrap();

    let deep = stack.namespace.resolve_container("/a/deep/tree").unwrap();
    assert_eq!(deep.xattrs.get(attrs::SYS_ACL).unwrap(), "u:100:rwx");
}
