// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Resolved client identity.
//!
//! The wire layer authenticates the client and hands the core a fully
//! resolved [`VirtualIdentity`]; the core never sees raw credentials.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualIdentity {
    pub uid: u32,
    pub gid: u32,

    /// All uids the client may act as (primary first).
    #[serde(default)]
    pub uid_list: Vec<u32>,

    /// All gids the client is a member of (primary first).
    #[serde(default)]
    pub gid_list: Vec<u32>,

    pub name: String,

    /// Client host as seen by the connection layer.
    pub host: String,

    /// Geo tag of the client, empty when the mapping has none.
    #[serde(default)]
    pub geo_location: String,

    /// Authentication protocol (`sss`, `krb5`, `gsi`, `unix`, ...).
    #[serde(default)]
    pub prot: String,

    /// Distinguished name for certificate-based protocols.
    #[serde(default)]
    pub dn: String,

    #[serde(default)]
    pub sudoer: bool,
}

impl VirtualIdentity {
    pub fn new(uid: u32, gid: u32) -> Self {
        Self {
            uid,
            gid,
            uid_list: vec![uid],
            gid_list: vec![gid],
            ..Default::default()
        }
    }

    pub fn root() -> Self {
        let mut vid = Self::new(0, 0);
        vid.name = "root".to_string();
        vid.sudoer = true;
        vid
    }

    pub fn is_root(&self) -> bool {
        self.uid == 0
    }

    pub fn has_uid(&self, uid: u32) -> bool {
        self.uid == uid || self.uid_list.contains(&uid)
    }

    pub fn has_gid(&self, gid: u32) -> bool {
        self.gid == gid || self.gid_list.contains(&gid)
    }

    pub fn with_geo(mut self, geo: impl Into<String>) -> Self {
        self.geo_location = geo.into();
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }
}
