// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # Stratos MGM daemon
//!
//! Boots the core services against a YAML manifest and runs the
//! background machinery: master supervisor, balance jobs, deletion
//! dispatcher. The wire layer attaches to the constructed services; it
//! is not part of this crate.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod config;

use config::MgmManifest;
use stratos_mgm_core::application::access::AccessControl;
use stratos_mgm_core::application::balance::{BalanceEngine, BalanceTuning};
use stratos_mgm_core::application::deletion::{DeletionDispatcher, DeletionTuning};
use stratos_mgm_core::application::drain::{DrainEngine, DrainTuning};
use stratos_mgm_core::application::master::{
    AdmissionGate, MasterConfig, MasterController, PeerEndpoint, StaticPeer,
};
use stratos_mgm_core::application::namespace_ops::NamespaceOps;
use stratos_mgm_core::application::open::OpenPipeline;
use stratos_mgm_core::application::quota::Quota;
use stratos_mgm_core::application::scheduler::Scheduler;
use stratos_mgm_core::application::transfer::TransferScheduler;
use stratos_mgm_core::domain::filesystem::{FsId, FsRegisters};
use stratos_mgm_core::domain::fsview::FsView;
use stratos_mgm_core::infrastructure::capability::CapabilityEngine;
use stratos_mgm_core::infrastructure::config_store::ConfigStore;
use stratos_mgm_core::infrastructure::message_queue::InMemoryBus;
use stratos_mgm_core::infrastructure::namespace::Namespace;
use stratos_mgm_core::presentation::fsctl::FsCtl;

/// Stratos MGM - metadata manager daemon
#[derive(Parser)]
#[command(name = "stratos-mgm")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the MGM manifest
    #[arg(
        short,
        long,
        env = "STRATOS_MGM_CONFIG",
        value_name = "FILE",
        default_value = "/etc/stratos/mgm.yaml"
    )]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "STRATOS_MGM_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log_level.clone())),
        )
        .init();

    let manifest = MgmManifest::load(&cli.config)
        .with_context(|| format!("loading manifest {}", cli.config.display()))?;
    info!(name = %manifest.metadata.name, "booting stratos-mgm");

    let shutdown = CancellationToken::new();
    let admission = AdmissionGate::default();

    // shared state
    let fsview = Arc::new(FsView::new());
    let namespace = Arc::new(Namespace::new());
    let access = Arc::new(AccessControl::new());
    let config_store = Arc::new(
        ConfigStore::open(manifest.spec.metadata_dir.join("mgm.config"))
            .context("opening config store")?,
    );

    let secret = manifest.spec.sym_key.resolve_secret()?;
    let capability = Arc::new(CapabilityEngine::with_key(
        &manifest.spec.sym_key.id,
        &secret,
    ));

    let manager = format!(
        "{}:{}",
        manifest.spec.manager.host, manifest.spec.manager.port
    );

    // fleet
    let drain_engine = DrainEngine::new(fsview.clone(), namespace.clone(), DrainTuning::default());
    for space in &manifest.spec.spaces {
        if let Some(options) = &space.options {
            fsview.register_space(&space.name, options.clone());
        }
        for fs in &space.filesystems {
            let regs = FsRegisters {
                host: fs.host.clone(),
                port: fs.port,
                local_prefix: fs.local_prefix.clone(),
                space: space.name.clone(),
                group_index: fs.group,
                geo_tag: fs.geo_tag.clone(),
                ..Default::default()
            };
            fsview
                .register_filesystem(FsId(fs.fsid), regs, Some(drain_engine.clone()))
                .with_context(|| format!("registering fs {}", fs.fsid))?;
        }
    }

    // subsystems
    let scheduler = Arc::new(Scheduler::new(fsview.clone()));
    let quota = Arc::new(Quota::new(
        namespace.clone(),
        scheduler.clone(),
        config_store.clone(),
        99,
    ));
    quota.load_nodes();
    quota.load_from_config();

    let pipeline = Arc::new(OpenPipeline::new(
        namespace.clone(),
        fsview.clone(),
        quota.clone(),
        capability.clone(),
        access.clone(),
        manager.clone(),
        manifest.spec.default_space.clone(),
    ));
    let ops = Arc::new(NamespaceOps::new(
        namespace.clone(),
        fsview.clone(),
        pipeline.clone(),
        capability.clone(),
    ));

    let peer: Arc<dyn PeerEndpoint> = Arc::new(StaticPeer::default());
    if manifest.spec.peer.is_none() {
        warn!("no peer configured, running single-master");
    }

    let mut master_cfg = MasterConfig::new(
        hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| manifest.spec.manager.host.clone()),
        manifest.spec.metadata_dir.clone(),
    );
    master_cfg.remote_host = manifest.spec.peer.as_ref().map(|p| p.host.clone());
    master_cfg.remote_port = manifest.spec.peer.as_ref().map(|p| p.port).unwrap_or(1094);

    let master = MasterController::with_admission_gate(
        master_cfg,
        access.clone(),
        namespace.clone(),
        peer,
        admission.clone(),
    )
    .context("booting master controller")?;
    master.spawn_supervisor(shutdown.clone());

    let transfers = Arc::new(TransferScheduler::new(
        fsview.clone(),
        namespace.clone(),
        capability.clone(),
        manager.clone(),
        admission.clone(),
    ));

    let balance = BalanceEngine::new(
        fsview.clone(),
        namespace.clone(),
        capability.clone(),
        manager.clone(),
        BalanceTuning::default(),
        admission.clone(),
    );
    for space in &manifest.spec.spaces {
        balance.spawn_for_space(&space.name);
    }

    let bus = Arc::new(InMemoryBus::new());
    let deletion = DeletionDispatcher::new(
        fsview.clone(),
        namespace.clone(),
        capability.clone(),
        bus,
        DeletionTuning::default(),
    );
    deletion.spawn(shutdown.clone());

    // the wire layer dispatches control commands into this
    let _fsctl = FsCtl::new(
        namespace.clone(),
        fsview.clone(),
        ops.clone(),
        transfers.clone(),
        master.clone(),
    );

    info!(manager = %manager, "stratos-mgm is up");

    let fatal = master.fatal_signal();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
        }
        _ = fatal.cancelled() => {
            warn!("fatal master failure, shutting down");
        }
    }

    shutdown.cancel();
    balance.shutdown();
    drain_engine.shutdown();
    if let Err(err) = config_store.save() {
        warn!(error = %err, "final config save failed");
    }

    Ok(())
}
