// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Directory ACL evaluation.
//!
//! An ACL string is a comma-separated rule list; each rule is
//! `{u|g|egroup}:{id}:{perms}`. Permission tokens: `r` read, `w` write,
//! `wo` write-once, `x` browse, `m` chmod, `+u` update, `!d` not-delete,
//! `+d` delete (undoes `!d`). Rules are evaluated in order, the last
//! matching rule wins. `sys.acl` is evaluated first; `user.acl` is only
//! honored when `sys.eval.useracl` is set on the container.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::identity::VirtualIdentity;

#[derive(Debug, Error)]
pub enum AclError {
    #[error("malformed acl rule: {0}")]
    MalformedRule(String),

    #[error("unknown permission token in: {0}")]
    UnknownPermission(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AclSubject {
    Uid(u32),
    Gid(u32),
    Egroup(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclRights {
    pub read: bool,
    pub write: bool,
    pub write_once: bool,
    pub browse: bool,
    pub update: bool,
    pub chmod: bool,
    pub not_delete: bool,
}

impl AclRights {
    pub fn can_write(&self) -> bool {
        self.write || self.write_once
    }
}

#[derive(Debug, Clone)]
pub struct AclEntry {
    pub subject: AclSubject,
    pub rights: AclRights,
}

/// Resolves egroup membership; the production resolver sits outside the
/// core and is injected at wiring time.
pub trait EgroupResolver: Send + Sync {
    fn is_member(&self, egroup: &str, vid: &VirtualIdentity) -> bool;
}

/// Resolver denying every egroup; the default when none is wired.
pub struct NoEgroups;

impl EgroupResolver for NoEgroups {
    fn is_member(&self, _egroup: &str, _vid: &VirtualIdentity) -> bool {
        false
    }
}

fn parse_perms(spec: &str) -> Result<AclRights, AclError> {
    let mut rights = AclRights::default();
    let mut chars = spec.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            'r' => rights.read = true,
            'w' => {
                if chars.peek() == Some(&'o') {
                    chars.next();
                    rights.write_once = true;
                } else {
                    rights.write = true;
                }
            }
            'x' => rights.browse = true,
            'm' => rights.chmod = true,
            '+' => match chars.next() {
                Some('u') => rights.update = true,
                Some('d') => rights.not_delete = false,
                _ => return Err(AclError::UnknownPermission(spec.to_string())),
            },
            '!' => match chars.next() {
                Some('d') => rights.not_delete = true,
                Some('u') => rights.update = false,
                Some('m') => rights.chmod = false,
                _ => return Err(AclError::UnknownPermission(spec.to_string())),
            },
            _ => return Err(AclError::UnknownPermission(spec.to_string())),
        }
    }

    Ok(rights)
}

pub fn parse_rules(acl: &str) -> Result<Vec<AclEntry>, AclError> {
    let mut entries = Vec::new();

    for rule in acl.split(',').filter(|r| !r.trim().is_empty()) {
        let rule = rule.trim();
        let mut parts = rule.splitn(3, ':');
        let kind = parts.next().unwrap_or_default();
        let id = parts
            .next()
            .ok_or_else(|| AclError::MalformedRule(rule.to_string()))?;
        let perms = parts
            .next()
            .ok_or_else(|| AclError::MalformedRule(rule.to_string()))?;

        let subject = match kind {
            "u" => AclSubject::Uid(
                id.parse()
                    .map_err(|_| AclError::MalformedRule(rule.to_string()))?,
            ),
            "g" => AclSubject::Gid(
                id.parse()
                    .map_err(|_| AclError::MalformedRule(rule.to_string()))?,
            ),
            "egroup" => AclSubject::Egroup(id.to_string()),
            _ => return Err(AclError::MalformedRule(rule.to_string())),
        };

        entries.push(AclEntry {
            subject,
            rights: parse_perms(perms)?,
        });
    }

    Ok(entries)
}

/// The evaluated ACL of one container for one identity.
#[derive(Debug, Clone, Default)]
pub struct Acl {
    pub has_acl: bool,
    pub rights: AclRights,
}

impl Acl {
    /// Evaluate `sys.acl` and (when enabled) `user.acl` for `vid`.
    ///
    /// Malformed rules are skipped rather than refused: a broken operator
    /// ACL must never lock the tree.
    pub fn evaluate(
        sys_acl: Option<&str>,
        user_acl: Option<&str>,
        eval_user_acl: bool,
        vid: &VirtualIdentity,
        egroups: &dyn EgroupResolver,
    ) -> Self {
        let mut acl = Acl::default();

        let mut apply = |spec: &str| {
            let entries = match parse_rules(spec) {
                Ok(entries) => entries,
                Err(err) => {
                    tracing::warn!(acl = spec, error = %err, "skipping malformed acl");
                    return;
                }
            };

            for entry in entries {
                let matches = match &entry.subject {
                    AclSubject::Uid(uid) => vid.has_uid(*uid),
                    AclSubject::Gid(gid) => vid.has_gid(*gid),
                    AclSubject::Egroup(name) => egroups.is_member(name, vid),
                };

                if matches {
                    acl.has_acl = true;
                    acl.rights = entry.rights;
                }
            }
        };

        if let Some(spec) = sys_acl {
            apply(spec);
        }
        if eval_user_acl {
            if let Some(spec) = user_acl {
                apply(spec);
            }
        }

        acl
    }
}

/// Check a `sys.owner.auth` escalation list against the caller.
///
/// Entries are `prot:name` or `prot:dn`, comma separated; `*` matches any
/// authenticated caller. A match remaps the effective identity to the
/// directory owner before re-evaluating permissions.
pub fn owner_auth_matches(list: &str, vid: &VirtualIdentity) -> bool {
    for entry in list.split(',').filter(|e| !e.trim().is_empty()) {
        let entry = entry.trim();
        if entry == "*" {
            return true;
        }

        if let Some((prot, who)) = entry.split_once(':') {
            if prot == vid.prot && (who == vid.name || who == vid.dn) {
                return true;
            }
        }
    }
    false
}
