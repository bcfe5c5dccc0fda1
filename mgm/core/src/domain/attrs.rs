// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Well-known container attribute keys.
//!
//! The extended-attribute map on a container is the only supported
//! mechanism for per-subtree policy; these are the keys the core reads.

use std::collections::BTreeMap;

pub const SYS_ACL: &str = "sys.acl";
pub const USER_ACL: &str = "user.acl";
pub const SYS_EVAL_USERACL: &str = "sys.eval.useracl";

/// `prot:name` / `prot:dn` entries escalating to the directory owner.
pub const SYS_OWNER_AUTH: &str = "sys.owner.auth";

pub const SYS_REDIRECT_ENOENT: &str = "sys.redirect.enoent";
pub const SYS_REDIRECT_ENONET: &str = "sys.redirect.enonet";
pub const SYS_STALL_UNAVAILABLE: &str = "sys.stall.unavailable";
pub const SYS_HEAL_UNAVAILABLE: &str = "sys.heal.unavailable";

pub const SYS_FORCED_SPACE: &str = "sys.forced.space";
pub const SYS_FORCED_LAYOUT: &str = "sys.forced.layout";
pub const SYS_FORCED_NSTRIPES: &str = "sys.forced.nstripes";
pub const SYS_FORCED_BLOCKSIZE: &str = "sys.forced.blocksize";
pub const SYS_FORCED_CHECKSUM: &str = "sys.forced.checksum";
pub const SYS_FORCED_BLOCKCHECKSUM: &str = "sys.forced.blockchecksum";
pub const SYS_FORCED_BOOKINGSIZE: &str = "sys.forced.bookingsize";
pub const SYS_FORCED_MINSIZE: &str = "sys.forced.minsize";
pub const SYS_FORCED_MAXSIZE: &str = "sys.forced.maxsize";

pub type AttrMap = BTreeMap<String, String>;

pub fn get_u64(attrs: &AttrMap, key: &str) -> Option<u64> {
    attrs.get(key).and_then(|v| v.trim().parse().ok())
}

pub fn get_u32(attrs: &AttrMap, key: &str) -> Option<u32> {
    attrs.get(key).and_then(|v| v.trim().parse().ok())
}

pub fn get_str<'a>(attrs: &'a AttrMap, key: &str) -> Option<&'a str> {
    attrs.get(key).map(String::as_str).filter(|v| !v.is_empty())
}

pub fn get_bool(attrs: &AttrMap, key: &str) -> bool {
    matches!(
        attrs.get(key).map(String::as_str),
        Some("1") | Some("true") | Some("yes")
    )
}
