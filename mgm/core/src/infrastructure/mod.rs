// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod capability;
pub mod changelog;
pub mod config_store;
pub mod message_queue;
pub mod namespace;
