// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Capability issuance.
//!
//! A capability is a `&`-joined `key=value` envelope authorising one
//! storage-node operation on a specific (fid, fsid). Envelopes are signed
//! with a keyed MAC (HMAC-SHA256); the key id travels in the envelope so
//! nodes can verify against a rotating key set. The whole envelope must
//! fit the 2 KiB error-buffer limit of the redirect channel.

use std::collections::HashMap;

use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::domain::error::MgmError;
use crate::domain::filesystem::FsSnapshot;
use crate::domain::layout::LayoutId;
use crate::domain::namespace::{Cid, Fid};
use crate::domain::transfer_queue::TransferJob;

type HmacSha256 = Hmac<Sha256>;

/// Hard ceiling for a signed envelope.
pub const MAX_ENVELOPE_LEN: usize = 2048;

pub const SYM_KEY_FIELD: &str = "cap.sym";
pub const MAC_FIELD: &str = "cap.mac";

#[derive(Debug, Error)]
pub enum CapabilityError {
    #[error("envelope length {0} exceeds {MAX_ENVELOPE_LEN} bytes")]
    TooLong(usize),

    #[error("no signing key configured")]
    NoKey,

    #[error("unknown key id {0}")]
    UnknownKey(String),

    #[error("signature mismatch")]
    BadSignature,

    #[error("malformed envelope: {0}")]
    Malformed(String),
}

impl From<CapabilityError> for MgmError {
    fn from(err: CapabilityError) -> Self {
        match err {
            CapabilityError::TooLong(len) => {
                MgmError::CapabilityTooLong(format!("{len} bytes"))
            }
            other => MgmError::SignFailure(other.to_string()),
        }
    }
}

/// Split an opaque `&`-separated query into key/value pairs, keeping order.
pub fn parse_pairs(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter(|kv| !kv.is_empty())
        .map(|kv| match kv.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (kv.to_string(), String::new()),
        })
        .collect()
}

pub fn join_pairs(pairs: &[(String, String)]) -> String {
    pairs
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

pub struct CapabilityEngine {
    keys: RwLock<HashMap<String, Vec<u8>>>,
    current: RwLock<Option<String>>,
}

impl CapabilityEngine {
    pub fn new() -> Self {
        Self {
            keys: RwLock::new(HashMap::new()),
            current: RwLock::new(None),
        }
    }

    pub fn with_key(id: &str, secret: &[u8]) -> Self {
        let engine = Self::new();
        engine.add_key(id, secret);
        engine
    }

    /// Install a key and make it the current signing key.
    pub fn add_key(&self, id: &str, secret: &[u8]) {
        self.keys.write().insert(id.to_string(), secret.to_vec());
        *self.current.write() = Some(id.to_string());
    }

    /// Sign a field list into an opaque envelope.
    pub fn sign(&self, fields: &[(String, String)]) -> Result<String, CapabilityError> {
        let current = self.current.read().clone().ok_or(CapabilityError::NoKey)?;
        let keys = self.keys.read();
        let secret = keys.get(&current).ok_or(CapabilityError::NoKey)?;

        let payload = join_pairs(fields);
        let mac = compute_mac(secret, payload.as_bytes());

        let envelope = format!("{payload}&{SYM_KEY_FIELD}={current}&{MAC_FIELD}={mac}");
        if envelope.len() > MAX_ENVELOPE_LEN {
            return Err(CapabilityError::TooLong(envelope.len()));
        }
        Ok(envelope)
    }

    /// Verify an envelope and hand back its payload fields.
    pub fn verify(&self, envelope: &str) -> Result<Vec<(String, String)>, CapabilityError> {
        let marker = format!("&{SYM_KEY_FIELD}=");
        let cut = envelope
            .find(&marker)
            .ok_or_else(|| CapabilityError::Malformed("missing key id".to_string()))?;

        let payload = &envelope[..cut];
        let trailer = parse_pairs(&envelope[cut + 1..]);
        let key_id = trailer
            .iter()
            .find(|(k, _)| k == SYM_KEY_FIELD)
            .map(|(_, v)| v.clone())
            .ok_or_else(|| CapabilityError::Malformed("missing key id".to_string()))?;
        let mac = trailer
            .iter()
            .find(|(k, _)| k == MAC_FIELD)
            .map(|(_, v)| v.clone())
            .ok_or_else(|| CapabilityError::Malformed("missing mac".to_string()))?;

        let keys = self.keys.read();
        let secret = keys
            .get(&key_id)
            .ok_or(CapabilityError::UnknownKey(key_id))?;

        let expected = compute_mac(secret, payload.as_bytes());
        if expected.as_bytes().ct_eq(mac.as_bytes()).unwrap_u8() != 1 {
            return Err(CapabilityError::BadSignature);
        }

        Ok(parse_pairs(payload))
    }
}

impl Default for CapabilityEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn compute_mac(secret: &[u8], payload: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Create,
    Update,
    Write,
    Delete,
    Verify,
}

impl AccessKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Create => "create",
            Self::Update => "update",
            Self::Write => "write",
            Self::Delete => "delete",
            Self::Verify => "verify",
        }
    }
}

/// One concrete stripe target inside a replica capability.
#[derive(Debug, Clone)]
pub struct ReplicaTarget {
    pub fsid: crate::domain::filesystem::FsId,
    pub host: String,
    pub port: u16,
    pub local_prefix: String,
}

impl ReplicaTarget {
    pub fn from_snapshot(snap: &FsSnapshot) -> Self {
        Self {
            fsid: snap.id,
            host: snap.regs.host.clone(),
            port: snap.regs.port,
            local_prefix: snap.regs.local_prefix.clone(),
        }
    }

    pub fn url(&self) -> String {
        format!("root://{}:{}//", self.host, self.port)
    }
}

/// Field assembly for a client open capability.
#[derive(Debug, Clone)]
pub struct ReplicaCapability {
    pub access: AccessKind,
    pub lid: LayoutId,
    pub cid: Cid,
    pub fid: Fid,
    pub path: String,
    pub manager: String,
    pub uid: u32,
    pub gid: u32,
    pub ruid: u32,
    pub rgid: u32,
    pub booking_size: u64,
    pub targets: Vec<ReplicaTarget>,
}

impl ReplicaCapability {
    /// Serialize into envelope fields with `head` as the addressed stripe.
    pub fn fields(&self, head: usize) -> Vec<(String, String)> {
        let mut fields = vec![
            ("mgm.access".to_string(), self.access.as_str().to_string()),
            ("mgm.ruid".to_string(), self.ruid.to_string()),
            ("mgm.rgid".to_string(), self.rgid.to_string()),
            ("mgm.uid".to_string(), self.uid.to_string()),
            ("mgm.gid".to_string(), self.gid.to_string()),
            ("mgm.path".to_string(), self.path.clone()),
            ("mgm.manager".to_string(), self.manager.clone()),
            ("mgm.fid".to_string(), format!("{:x}", self.fid)),
            ("mgm.cid".to_string(), self.cid.to_string()),
            ("mgm.lid".to_string(), self.lid.0.to_string()),
            (
                "mgm.bookingsize".to_string(),
                self.booking_size.to_string(),
            ),
        ];

        if let Some(target) = self.targets.get(head) {
            fields.push(("mgm.fsid".to_string(), target.fsid.to_string()));
            fields.push(("mgm.localprefix".to_string(), target.local_prefix.clone()));
        }

        if self.targets.len() > 1 {
            for (i, target) in self.targets.iter().enumerate() {
                fields.push((format!("mgm.url{i}"), target.url()));
                fields.push((format!("mgm.fsid{i}"), target.fsid.to_string()));
                fields.push((format!("mgm.localprefix{i}"), target.local_prefix.clone()));
            }
        }

        fields
    }
}

/// Build the signed source+target envelope pair for a drain or balance
/// transfer of one file.
pub fn build_transfer_job(
    engine: &CapabilityEngine,
    fid: Fid,
    lid: LayoutId,
    size: u64,
    manager: &str,
    source: &FsSnapshot,
    target: &FsSnapshot,
) -> Result<TransferJob, CapabilityError> {
    let replicate = format!("replicate:{fid:x}");

    let source_fields = vec![
        ("mgm.access".to_string(), AccessKind::Read.as_str().to_string()),
        ("mgm.fid".to_string(), format!("{fid:x}")),
        ("mgm.lid".to_string(), lid.0.to_string()),
        ("mgm.fsid".to_string(), source.id.to_string()),
        ("mgm.localprefix".to_string(), source.regs.local_prefix.clone()),
        ("mgm.manager".to_string(), manager.to_string()),
        ("mgm.bookingsize".to_string(), size.to_string()),
        (
            "url".to_string(),
            format!("root://{}//{}", source.host_port(), replicate),
        ),
    ];

    let target_fields = vec![
        ("mgm.access".to_string(), AccessKind::Write.as_str().to_string()),
        ("mgm.fid".to_string(), format!("{fid:x}")),
        ("mgm.lid".to_string(), lid.0.to_string()),
        ("mgm.fsid".to_string(), target.id.to_string()),
        ("mgm.localprefix".to_string(), target.regs.local_prefix.clone()),
        ("mgm.manager".to_string(), manager.to_string()),
        ("mgm.bookingsize".to_string(), size.to_string()),
        (
            "url".to_string(),
            format!("root://{}//{}", target.host_port(), replicate),
        ),
    ];

    let source_env = engine.sign(&source_fields)?;
    let target_env = engine.sign(&target_fields)?;

    let prefixed = |prefix: &str, env: &str| -> String {
        env.split('&')
            .map(|kv| format!("{prefix}.{kv}"))
            .collect::<Vec<_>>()
            .join("&")
    };

    let body = format!(
        "{}&{}",
        prefixed("source", &source_env),
        prefixed("target", &target_env)
    );
    Ok(TransferJob::new(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::filesystem::{FsId, FsRegisters};

    fn engine() -> CapabilityEngine {
        CapabilityEngine::with_key("k1", b"0123456789abcdef0123456789abcdef")
    }

    #[test]
    fn test_sign_verify_roundtrip() {
        let engine = engine();
        let fields = vec![
            ("mgm.access".to_string(), "read".to_string()),
            ("mgm.fid".to_string(), "abc".to_string()),
        ];

        let envelope = engine.sign(&fields).unwrap();
        assert!(envelope.contains("cap.sym=k1"));

        let verified = engine.verify(&envelope).unwrap();
        assert_eq!(verified, fields);
    }

    #[test]
    fn test_tampered_envelope_is_rejected() {
        let engine = engine();
        let envelope = engine
            .sign(&[("mgm.fid".to_string(), "1".to_string())])
            .unwrap();

        let tampered = envelope.replace("mgm.fid=1", "mgm.fid=2");
        assert!(matches!(
            engine.verify(&tampered),
            Err(CapabilityError::BadSignature)
        ));
    }

    #[test]
    fn test_unknown_key_is_rejected() {
        let signer = engine();
        let envelope = signer
            .sign(&[("mgm.fid".to_string(), "1".to_string())])
            .unwrap();

        let verifier = CapabilityEngine::with_key("other", b"xx");
        assert!(matches!(
            verifier.verify(&envelope),
            Err(CapabilityError::UnknownKey(_))
        ));
    }

    #[test]
    fn test_oversized_envelope_is_refused() {
        let engine = engine();
        let fields = vec![("mgm.path".to_string(), "x".repeat(MAX_ENVELOPE_LEN))];
        assert!(matches!(
            engine.sign(&fields),
            Err(CapabilityError::TooLong(_))
        ));
    }

    #[test]
    fn test_replica_fields_multi_stripe() {
        let cap = ReplicaCapability {
            access: AccessKind::Create,
            lid: LayoutId::replica(2).unwrap(),
            cid: 7,
            fid: 255,
            path: "/a/b".to_string(),
            manager: "mgm1:1094".to_string(),
            uid: 100,
            gid: 200,
            ruid: 100,
            rgid: 200,
            booking_size: 1024,
            targets: vec![
                ReplicaTarget {
                    fsid: FsId(1),
                    host: "fst1".to_string(),
                    port: 1095,
                    local_prefix: "/data01".to_string(),
                },
                ReplicaTarget {
                    fsid: FsId(2),
                    host: "fst2".to_string(),
                    port: 1095,
                    local_prefix: "/data02".to_string(),
                },
            ],
        };

        let fields = cap.fields(0);
        let get = |k: &str| {
            fields
                .iter()
                .find(|(key, _)| key == k)
                .map(|(_, v)| v.clone())
        };

        assert_eq!(get("mgm.fid").unwrap(), "ff");
        assert_eq!(get("mgm.uid").unwrap(), "100");
        assert_eq!(get("mgm.fsid").unwrap(), "1");
        assert_eq!(get("mgm.url1").unwrap(), "root://fst2:1095//");
        assert_eq!(get("mgm.localprefix1").unwrap(), "/data02");
    }

    #[test]
    fn test_transfer_job_has_source_and_target_urls() {
        let engine = engine();
        let mk_snap = |id: u32, host: &str| FsSnapshot {
            id: FsId(id),
            regs: FsRegisters {
                host: host.to_string(),
                port: 1095,
                ..Default::default()
            },
        };

        let job = build_transfer_job(
            &engine,
            0x2a,
            LayoutId::plain(),
            4096,
            "mgm1:1094",
            &mk_snap(1, "fst1"),
            &mk_snap(2, "fst2"),
        )
        .unwrap();

        assert!(job.body().contains("source.url=root://fst1:1095//replicate:2a"));
        assert!(job.body().contains("target.url=root://fst2:1095//replicate:2a"));
        assert!(job.body().contains("source.cap.mac="));
        assert!(job.body().contains("target.cap.mac="));
    }
}
