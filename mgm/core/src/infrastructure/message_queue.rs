// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Node message bus.
//!
//! The production transport shipping deletion batches and capability
//! messages to storage nodes is outside the core; the core only depends
//! on this trait. The in-memory implementation backs tests and
//! single-process setups.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MqError {
    #[error("node {0} unreachable")]
    Unreachable(String),
}

#[async_trait]
pub trait NodeMessageBus: Send + Sync {
    /// Deliver one opaque message to a node queue, FIFO per queue.
    async fn send(&self, node_queue: &str, body: String) -> Result<(), MqError>;

    /// Whether the node behind the queue is currently reachable.
    fn is_online(&self, node_queue: &str) -> bool;
}

#[derive(Debug, Default)]
pub struct InMemoryBus {
    queues: Mutex<HashMap<String, Vec<String>>>,
    offline: Mutex<Vec<String>>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_offline(&self, node_queue: &str, offline: bool) {
        let mut list = self.offline.lock();
        if offline {
            if !list.contains(&node_queue.to_string()) {
                list.push(node_queue.to_string());
            }
        } else {
            list.retain(|q| q != node_queue);
        }
    }

    /// Drain every message delivered to a queue (test hook).
    pub fn take(&self, node_queue: &str) -> Vec<String> {
        self.queues
            .lock()
            .get_mut(node_queue)
            .map(std::mem::take)
            .unwrap_or_default()
    }
}

#[async_trait]
impl NodeMessageBus for InMemoryBus {
    async fn send(&self, node_queue: &str, body: String) -> Result<(), MqError> {
        if !self.is_online(node_queue) {
            return Err(MqError::Unreachable(node_queue.to_string()));
        }
        self.queues
            .lock()
            .entry(node_queue.to_string())
            .or_default()
            .push(body);
        Ok(())
    }

    fn is_online(&self, node_queue: &str) -> bool {
        !self.offline.lock().iter().any(|q| q == node_queue)
    }
}
