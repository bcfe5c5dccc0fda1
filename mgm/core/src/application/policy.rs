// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Per-subtree layout and space policy.
//!
//! Resolved from the parent container's attribute map at open time; the
//! chosen layout id is persisted on newly created files.

use crate::domain::attrs::{self, AttrMap};
use crate::domain::filesystem::FsId;
use crate::domain::identity::VirtualIdentity;
use crate::domain::layout::{ChecksumKind, LayoutId, LayoutType};

/// Default booking when neither the client nor the subtree forces one.
pub const DEFAULT_BOOKING_SIZE: u64 = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct FilePolicy {
    pub layout: LayoutId,
    pub space: String,
    pub forced_fsid: Option<FsId>,
    pub forced_group: Option<u32>,
    pub booking_size: u64,
    pub min_size: u64,
    pub max_size: Option<u64>,
}

fn layout_type_from(name: &str) -> Option<LayoutType> {
    match name {
        "plain" => Some(LayoutType::Plain),
        "replica" => Some(LayoutType::Replica),
        "raiddp" => Some(LayoutType::RaidDp),
        "raid6" => Some(LayoutType::Raid6),
        "archive" => Some(LayoutType::Archive),
        _ => None,
    }
}

fn checksum_from(name: &str) -> Option<ChecksumKind> {
    match name {
        "none" => Some(ChecksumKind::None),
        "adler" | "adler32" => Some(ChecksumKind::Adler32),
        "crc32" => Some(ChecksumKind::Crc32),
        "crc32c" => Some(ChecksumKind::Crc32c),
        "md5" => Some(ChecksumKind::Md5),
        "sha1" => Some(ChecksumKind::Sha1),
        _ => None,
    }
}

fn blocksize_code_from(bytes: u64) -> u32 {
    let mut code = 0u32;
    while code < 15 && (4096u64 << code) < bytes {
        code += 1;
    }
    code
}

/// Resolve the effective layout, space and booking for a creation below
/// the container carrying `attrs`.
pub fn get_layout_and_space(
    default_space: &str,
    attrs: &AttrMap,
    _vid: &VirtualIdentity,
    requested_booking: Option<u64>,
) -> FilePolicy {
    let layout_type = attrs::get_str(attrs, attrs::SYS_FORCED_LAYOUT)
        .and_then(layout_type_from)
        .unwrap_or(LayoutType::Plain);

    let stripes = attrs::get_u32(attrs, attrs::SYS_FORCED_NSTRIPES)
        .unwrap_or(match layout_type {
            LayoutType::Plain => 1,
            LayoutType::Replica => 2,
            LayoutType::RaidDp | LayoutType::Raid6 => 6,
            LayoutType::Archive => 8,
        })
        .clamp(1, 256);

    let checksum = attrs::get_str(attrs, attrs::SYS_FORCED_CHECKSUM)
        .and_then(checksum_from)
        .unwrap_or(ChecksumKind::Adler32);

    let block_checksum = attrs::get_str(attrs, attrs::SYS_FORCED_BLOCKCHECKSUM)
        .and_then(checksum_from)
        .unwrap_or(ChecksumKind::None);

    let blocksize_code = attrs::get_u64(attrs, attrs::SYS_FORCED_BLOCKSIZE)
        .map(blocksize_code_from)
        .unwrap_or(0);

    let layout = LayoutId::new(layout_type, checksum, stripes, blocksize_code, block_checksum)
        .unwrap_or_else(|_| LayoutId::plain());

    let space = attrs::get_str(attrs, attrs::SYS_FORCED_SPACE)
        .unwrap_or(default_space)
        .to_string();

    let booking_size = attrs::get_u64(attrs, attrs::SYS_FORCED_BOOKINGSIZE)
        .or(requested_booking)
        .unwrap_or(DEFAULT_BOOKING_SIZE);

    FilePolicy {
        layout,
        space,
        forced_fsid: None,
        forced_group: None,
        booking_size,
        min_size: attrs::get_u64(attrs, attrs::SYS_FORCED_MINSIZE).unwrap_or(0),
        max_size: attrs::get_u64(attrs, attrs::SYS_FORCED_MAXSIZE),
    }
}
