// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # stratos-mgm-core
//!
//! Core control plane of the Stratos metadata manager (MGM). The MGM is
//! the authoritative namespace and scheduling brain of a cluster of
//! storage nodes: clients open/read/write/delete files against it and
//! receive signed capabilities redirecting each I/O to the concrete
//! nodes holding the data stripes.
//!
//! ## Subsystems
//!
//! | Subsystem | Module |
//! |---|---|
//! | Fleet view (spaces / groups / file systems) | [`domain::fsview`] |
//! | Placement & access scheduler | [`application::scheduler`] |
//! | Quota engine | [`application::quota`] |
//! | Open pipeline & namespace verbs | [`application::open`], [`application::namespace_ops`] |
//! | Drain & balance engines | [`application::drain`], [`application::balance`] |
//! | Transfer scheduling & deletion | [`application::transfer`], [`application::deletion`] |
//! | Master/slave lifecycle & compaction | [`application::master`] |
//! | Capability signing | [`infrastructure::capability`] |
//! | Control RPC (`mgm.pcmd`) | [`presentation::fsctl`] |
//!
//! ## Layer Structure
//!
//! ```text
//! presentation/   ← opaque control-RPC dispatch
//!     ↓
//! application/    ← subsystem services, background jobs
//!     ↓
//! domain/         ← value objects, aggregates, errors
//!     ↓
//! infrastructure/ ← namespace store, changelogs, signing, queues, config
//! ```
//!
//! Locking order across subsystems: fleet view lock, then the quota
//! projection map, then the namespace lock. Shorter component-private
//! mutexes nest innermost.

pub mod application;
pub mod domain;
pub mod infrastructure;
pub mod presentation;

pub use domain::*;
