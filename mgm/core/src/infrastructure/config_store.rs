// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Persisted configuration engine.
//!
//! A flat key-value store backing operator-visible settings; quota targets
//! persist here under `<path>:uid=<id>:<tag>` / `<path>:gid=<id>:<tag>`
//! keys. Saves are atomic (write to a temp file, rename over).

use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;

use parking_lot::RwLock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config io: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse: {0}")]
    Parse(#[from] serde_json::Error),
}

pub struct ConfigStore {
    path: Option<PathBuf>,
    entries: RwLock<BTreeMap<String, String>>,
}

impl ConfigStore {
    /// In-memory store, used in tests and for ephemeral setups.
    pub fn ephemeral() -> Self {
        Self {
            path: None,
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn open(path: PathBuf) -> Result<Self, ConfigError> {
        let entries = if path.exists() {
            serde_json::from_str(&std::fs::read_to_string(&path)?)?
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            path: Some(path),
            entries: RwLock::new(entries),
        })
    }

    pub fn set(&self, key: &str, value: &str) {
        self.entries
            .write()
            .insert(key.to_string(), value.to_string());
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.entries.read().get(key).cloned()
    }

    pub fn delete(&self, key: &str) -> bool {
        self.entries.write().remove(key).is_some()
    }

    /// Remove every entry whose key starts with `prefix`, returning the
    /// number of removed entries.
    pub fn delete_matching(&self, prefix: &str) -> usize {
        let mut entries = self.entries.write();
        let keys: Vec<String> = entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        for key in &keys {
            entries.remove(key);
        }
        keys.len()
    }

    pub fn entries_with_prefix(&self, prefix: &str) -> Vec<(String, String)> {
        self.entries
            .read()
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let serialized = serde_json::to_string_pretty(&*self.entries.read())?;
        let tmp = path.with_extension("tmp");
        {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(serialized.as_bytes())?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_delete() {
        let store = ConfigStore::ephemeral();
        store.set("/data/:uid=7:userbytes", "1073741824");
        assert_eq!(
            store.get("/data/:uid=7:userbytes").unwrap(),
            "1073741824"
        );
        assert!(store.delete("/data/:uid=7:userbytes"));
        assert!(store.get("/data/:uid=7:userbytes").is_none());
    }

    #[test]
    fn test_delete_matching_by_prefix() {
        let store = ConfigStore::ephemeral();
        store.set("/data/:uid=7:userbytes", "1");
        store.set("/data/:uid=7:userfiles", "2");
        store.set("/other/:uid=7:userbytes", "3");

        assert_eq!(store.delete_matching("/data/:uid=7:"), 2);
        assert!(store.get("/other/:uid=7:userbytes").is_some());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mgm.config");

        let store = ConfigStore::open(path.clone()).unwrap();
        store.set("a", "1");
        store.save().unwrap();

        let reloaded = ConfigStore::open(path).unwrap();
        assert_eq!(reloaded.get("a").unwrap(), "1");
    }
}
