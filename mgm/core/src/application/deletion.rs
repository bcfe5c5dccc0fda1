// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Deletion dispatcher.
//!
//! Once per minute every file system's unlinked-file list is batched into
//! signed `drop` messages (at most 1024 fids each) and sent to the owning
//! node's queue. Nodes acknowledge physical deletion through the `drop`
//! control command, which finally clears the unlinked entry.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::fsview::FsView;
use crate::infrastructure::capability::CapabilityEngine;
use crate::infrastructure::message_queue::NodeMessageBus;
use crate::infrastructure::namespace::Namespace;

/// Maximum fids per drop message.
const DELETION_BATCH: usize = 1024;

#[derive(Debug, Clone)]
pub struct DeletionTuning {
    pub interval: Duration,
}

impl Default for DeletionTuning {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
        }
    }
}

pub struct DeletionDispatcher {
    fsview: Arc<FsView>,
    namespace: Arc<Namespace>,
    capability: Arc<CapabilityEngine>,
    bus: Arc<dyn NodeMessageBus>,
    tuning: DeletionTuning,
}

impl DeletionDispatcher {
    pub fn new(
        fsview: Arc<FsView>,
        namespace: Arc<Namespace>,
        capability: Arc<CapabilityEngine>,
        bus: Arc<dyn NodeMessageBus>,
        tuning: DeletionTuning,
    ) -> Arc<Self> {
        Arc::new(Self {
            fsview,
            namespace,
            capability,
            bus,
            tuning,
        })
    }

    pub fn spawn(self: &Arc<Self>, token: CancellationToken) {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(dispatcher.tuning.interval) => {}
                }
                dispatcher.run_round().await;
            }
        });
    }

    /// One dispatching round over the whole fleet. Returns the number of
    /// messages sent.
    pub async fn run_round(&self) -> usize {
        let mut sent = 0usize;

        for fs in self.fsview.all_filesystems() {
            let snap = fs.snapshot();
            let node_queue = snap.node_queue();

            // a dark node short-circuits the round for this FS
            if !self.bus.is_online(&node_queue) {
                debug!(fsid = %snap.id, "node offline, skipping deletion round");
                continue;
            }

            let unlinked = self.namespace.fs_unlinked(snap.id);
            if unlinked.is_empty() {
                continue;
            }

            for batch in unlinked.chunks(DELETION_BATCH) {
                let hex_fids: Vec<String> = batch.iter().map(|fid| format!("{fid:x}")).collect();
                let fields = vec![
                    ("mgm.access".to_string(), "delete".to_string()),
                    ("mgm.space".to_string(), snap.regs.space.clone()),
                    ("mgm.fsid".to_string(), snap.id.to_string()),
                    (
                        "mgm.localprefix".to_string(),
                        snap.regs.local_prefix.clone(),
                    ),
                    ("mgm.fids".to_string(), hex_fids.join(",")),
                ];

                let envelope = match self.capability.sign(&fields) {
                    Ok(envelope) => envelope,
                    Err(err) => {
                        warn!(fsid = %snap.id, error = %err, "cannot sign drop message");
                        continue;
                    }
                };

                match self.bus.send(&node_queue, envelope).await {
                    Ok(()) => {
                        sent += 1;
                        info!(fsid = %snap.id, fids = batch.len(), "dispatched deletion batch");
                    }
                    Err(err) => {
                        warn!(fsid = %snap.id, error = %err, "deletion dispatch failed");
                        break;
                    }
                }
            }
        }

        sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::filesystem::{FsId, FsRegisters};
    use crate::domain::layout::LayoutId;
    use crate::infrastructure::message_queue::InMemoryBus;

    async fn setup_with_unlinked(
        count: usize,
    ) -> (Arc<DeletionDispatcher>, Arc<InMemoryBus>, String) {
        let fsview = Arc::new(FsView::new());
        let namespace = Arc::new(Namespace::new());
        namespace
            .create_container("/del", 0, 0, 0o755, false, (0, 0))
            .unwrap();

        let regs = FsRegisters {
            host: "fst1".to_string(),
            port: 1095,
            ..Default::default()
        };
        let node_queue = format!("/fst/{}:{}", regs.host, regs.port);
        fsview.register_filesystem(FsId(9), regs, None).unwrap();

        for i in 0..count {
            let mut fmd = namespace
                .create_file(&format!("/del/f{i}"), 0, 0, 0o644, LayoutId::plain(), (0, 0))
                .unwrap();
            fmd.add_location(FsId(9)).unwrap();
            namespace.update_file(&fmd).unwrap();
            namespace.unlink_file(fmd.fid).unwrap();
        }

        let bus = Arc::new(InMemoryBus::new());
        let dispatcher = DeletionDispatcher::new(
            fsview,
            namespace,
            Arc::new(CapabilityEngine::with_key("d", b"drop-secret")),
            bus.clone(),
            DeletionTuning::default(),
        );
        (dispatcher, bus, node_queue)
    }

    #[tokio::test]
    async fn test_round_batches_drop_messages() {
        let (dispatcher, bus, queue) = setup_with_unlinked(3).await;

        let sent = dispatcher.run_round().await;
        assert_eq!(sent, 1);

        let messages = bus.take(&queue);
        assert_eq!(messages.len(), 1);
        assert!(messages[0].contains("mgm.access=delete"));
        assert!(messages[0].contains("mgm.fsid=9"));
        assert!(messages[0].contains("cap.mac="));
    }

    #[tokio::test]
    async fn test_large_lists_are_chunked() {
        let (dispatcher, bus, queue) = setup_with_unlinked(1500).await;

        let sent = dispatcher.run_round().await;
        assert_eq!(sent, 2);
        assert_eq!(bus.take(&queue).len(), 2);
    }

    #[tokio::test]
    async fn test_offline_node_short_circuits() {
        let (dispatcher, bus, queue) = setup_with_unlinked(2).await;
        bus.set_offline(&queue, true);

        assert_eq!(dispatcher.run_round().await, 0);
        assert!(bus.take(&queue).is_empty());
    }
}
