// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Global access rules.
//!
//! Banned/allowed identity lists and the global stall/redirect rule table.
//! The master controller installs and removes rules here as the peer state
//! changes; the open pipeline consults them before touching the namespace.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;

use crate::domain::identity::VirtualIdentity;

/// Stall imposed on banned identities.
pub const BANNED_STALL_SECS: u32 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleKind {
    Write,
    Read,
    Enoent,
}

impl RuleKind {
    pub fn key(self) -> &'static str {
        match self {
            Self::Write => "w:*",
            Self::Read => "r:*",
            Self::Enoent => "ENOENT:*",
        }
    }
}

#[derive(Debug, Default)]
struct AccessRules {
    banned_uids: HashSet<u32>,
    banned_gids: HashSet<u32>,
    banned_hosts: HashSet<String>,

    allowed_uids: HashSet<u32>,
    allowed_gids: HashSet<u32>,
    allowed_hosts: HashSet<String>,

    /// Rule key (`w:*`, `r:*`, `*`, `ENOENT:*`) to stall seconds.
    stall_rules: HashMap<String, u32>,

    /// Rule key to redirect target.
    redirect_rules: HashMap<String, (String, u16)>,
}

#[derive(Debug, Default)]
pub struct AccessControl {
    inner: RwLock<AccessRules>,
}

impl AccessControl {
    pub fn new() -> Self {
        Self::default()
    }

    // -- identity lists ------------------------------------------------

    pub fn ban_uid(&self, uid: u32) {
        self.inner.write().banned_uids.insert(uid);
    }

    pub fn ban_gid(&self, gid: u32) {
        self.inner.write().banned_gids.insert(gid);
    }

    pub fn ban_host(&self, host: &str) {
        self.inner.write().banned_hosts.insert(host.to_string());
    }

    pub fn allow_uid(&self, uid: u32) {
        self.inner.write().allowed_uids.insert(uid);
    }

    pub fn allow_gid(&self, gid: u32) {
        self.inner.write().allowed_gids.insert(gid);
    }

    pub fn allow_host(&self, host: &str) {
        self.inner.write().allowed_hosts.insert(host.to_string());
    }

    pub fn unban_uid(&self, uid: u32) {
        self.inner.write().banned_uids.remove(&uid);
    }

    /// A human-readable refusal banner when the identity may not enter.
    ///
    /// Banned lists always win; when any allow list is configured the
    /// identity must additionally appear on one of them.
    pub fn refusal(&self, vid: &VirtualIdentity) -> Option<String> {
        let rules = self.inner.read();

        if rules.banned_uids.contains(&vid.uid) {
            return Some(format!("uid {} is banned in this instance", vid.uid));
        }
        if rules.banned_gids.contains(&vid.gid) {
            return Some(format!("gid {} is banned in this instance", vid.gid));
        }
        if rules.banned_hosts.contains(&vid.host) {
            return Some(format!("host {} is banned in this instance", vid.host));
        }

        let allow_configured = !rules.allowed_uids.is_empty()
            || !rules.allowed_gids.is_empty()
            || !rules.allowed_hosts.is_empty();
        if allow_configured
            && !rules.allowed_uids.contains(&vid.uid)
            && !rules.allowed_gids.contains(&vid.gid)
            && !rules.allowed_hosts.contains(&vid.host)
        {
            return Some("your identity is not on the access list of this instance".to_string());
        }

        None
    }

    // -- stall rules ---------------------------------------------------

    pub fn set_stall(&self, rule: &str, seconds: u32) {
        self.inner
            .write()
            .stall_rules
            .insert(rule.to_string(), seconds);
    }

    pub fn drop_stall(&self, rule: &str) -> Option<u32> {
        self.inner.write().stall_rules.remove(rule)
    }

    pub fn stall_seconds(&self, rule: &str) -> Option<u32> {
        self.inner.read().stall_rules.get(rule).copied()
    }

    /// Stall to apply for an operation class; the specific rule wins over
    /// the `*` catch-all.
    pub fn stall_for(&self, kind: RuleKind) -> Option<u32> {
        let rules = self.inner.read();
        rules
            .stall_rules
            .get(kind.key())
            .or_else(|| rules.stall_rules.get("*"))
            .copied()
    }

    // -- redirect rules ------------------------------------------------

    pub fn set_redirect(&self, rule: &str, host: &str, port: u16) {
        self.inner
            .write()
            .redirect_rules
            .insert(rule.to_string(), (host.to_string(), port));
    }

    pub fn drop_redirect(&self, rule: &str) -> Option<(String, u16)> {
        self.inner.write().redirect_rules.remove(rule)
    }

    pub fn redirect_for(&self, kind: RuleKind) -> Option<(String, u16)> {
        let rules = self.inner.read();
        rules
            .redirect_rules
            .get(kind.key())
            .or_else(|| rules.redirect_rules.get("*"))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_banned_identity_is_refused() {
        let access = AccessControl::new();
        access.ban_uid(7);

        let vid = VirtualIdentity::new(7, 7);
        assert!(access.refusal(&vid).is_some());
        assert!(access.refusal(&VirtualIdentity::new(8, 8)).is_none());
    }

    #[test]
    fn test_allow_list_excludes_everyone_else() {
        let access = AccessControl::new();
        access.allow_uid(100);

        assert!(access.refusal(&VirtualIdentity::new(100, 1)).is_none());
        assert!(access.refusal(&VirtualIdentity::new(101, 1)).is_some());
    }

    #[test]
    fn test_specific_stall_beats_catch_all() {
        let access = AccessControl::new();
        access.set_stall("*", 100);
        access.set_stall("w:*", 60);

        assert_eq!(access.stall_for(RuleKind::Write), Some(60));
        assert_eq!(access.stall_for(RuleKind::Read), Some(100));

        access.drop_stall("w:*");
        assert_eq!(access.stall_for(RuleKind::Write), Some(100));
    }

    #[test]
    fn test_redirect_rules() {
        let access = AccessControl::new();
        access.set_redirect("w:*", "peer-mgm", 1094);

        assert_eq!(
            access.redirect_for(RuleKind::Write),
            Some(("peer-mgm".to_string(), 1094))
        );
        assert_eq!(access.redirect_for(RuleKind::Read), None);
    }
}
