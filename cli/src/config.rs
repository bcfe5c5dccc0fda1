// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Daemon configuration manifest.
//!
//! YAML, Kubernetes-style envelope (apiVersion/kind/metadata/spec).

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use stratos_mgm_core::domain::fsview::SpaceOptions;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MgmManifest {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub metadata: ManifestMetadata,
    pub spec: MgmSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MgmSpec {
    pub manager: Endpoint,

    /// Peer MGM for the master/slave pair.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer: Option<Endpoint>,

    pub metadata_dir: PathBuf,

    #[serde(default = "default_space")]
    pub default_space: String,

    pub sym_key: SymKeyConfig,

    #[serde(default)]
    pub spaces: Vec<SpaceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymKeyConfig {
    pub id: String,
    /// Key material; `env:VAR` reads the named environment variable.
    pub secret: String,
}

impl SymKeyConfig {
    pub fn resolve_secret(&self) -> anyhow::Result<Vec<u8>> {
        if let Some(var) = self.secret.strip_prefix("env:") {
            Ok(std::env::var(var)?.into_bytes())
        } else {
            Ok(self.secret.clone().into_bytes())
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpaceConfig {
    pub name: String,
    #[serde(default)]
    pub options: Option<SpaceOptions>,
    #[serde(default)]
    pub filesystems: Vec<FsConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FsConfig {
    pub fsid: u32,
    pub host: String,
    #[serde(default = "default_fst_port")]
    pub port: u16,
    pub local_prefix: String,
    #[serde(default)]
    pub group: u32,
    #[serde(default)]
    pub geo_tag: String,
}

fn default_space() -> String {
    "default".to_string()
}

fn default_port() -> u16 {
    1094
}

fn default_fst_port() -> u16 {
    1095
}

impl MgmManifest {
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let manifest: Self = serde_yaml::from_str(&raw)?;
        anyhow::ensure!(
            manifest.kind == "MgmConfig",
            "unexpected manifest kind {}",
            manifest.kind
        );
        Ok(manifest)
    }
}
