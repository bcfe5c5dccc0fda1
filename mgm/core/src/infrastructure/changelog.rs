// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Namespace change-log files and their compaction.
//!
//! Two append-only logs exist per master host, `files.<host>.mdlog` and
//! `directories.<host>.mdlog`. Records are JSON lines `{id, op, data}`;
//! a `del` record supersedes every earlier record for the same id.
//!
//! Compaction is three-phase with the lock interleaving driven by the
//! master controller: `compact_prepare` snapshots the current log to a
//! `.oc` work file (under the namespace read lock), `compact` rewrites the
//! work file dropping superseded records (no lock), `compact_commit`
//! archives the current log as `<path>.<epoch>` and renames `.oc` into
//! place (under the namespace write lock).

use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChangelogError {
    #[error("changelog io: {0}")]
    Io(#[from] std::io::Error),

    #[error("changelog record: {0}")]
    Record(#[from] serde_json::Error),

    #[error("no prepared work file for {0:?}")]
    NotPrepared(ChangelogKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangelogKind {
    Files,
    Directories,
}

impl ChangelogKind {
    fn file_name(self, host: &str) -> String {
        match self {
            Self::Files => format!("files.{host}.mdlog"),
            Self::Directories => format!("directories.{host}.mdlog"),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChangelogRecord {
    pub id: u64,
    pub op: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Copy)]
pub struct CompactStats {
    pub records_before: u64,
    pub records_after: u64,
}

impl CompactStats {
    /// Fraction of records dropped by the rewrite.
    pub fn ratio(&self) -> f64 {
        if self.records_before == 0 {
            return 0.0;
        }
        1.0 - self.records_after as f64 / self.records_before as f64
    }
}

pub struct ChangelogStore {
    dir: PathBuf,
    host: String,
}

impl ChangelogStore {
    pub fn open(dir: impl Into<PathBuf>, host: &str) -> Result<Self, ChangelogError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let store = Self {
            dir,
            host: host.to_string(),
        };

        for kind in [ChangelogKind::Files, ChangelogKind::Directories] {
            let path = store.path(kind);
            if !path.exists() {
                std::fs::File::create(&path)?;
            }
        }
        Ok(store)
    }

    pub fn path(&self, kind: ChangelogKind) -> PathBuf {
        self.dir.join(kind.file_name(&self.host))
    }

    fn work_path(&self, kind: ChangelogKind) -> PathBuf {
        let mut p = self.path(kind).into_os_string();
        p.push(".oc");
        PathBuf::from(p)
    }

    pub fn size(&self, kind: ChangelogKind) -> Result<u64, ChangelogError> {
        Ok(std::fs::metadata(self.path(kind))?.len())
    }

    pub fn append(&self, kind: ChangelogKind, record: &ChangelogRecord) -> Result<(), ChangelogError> {
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(self.path(kind))?;
        file.write_all(serde_json::to_string(record)?.as_bytes())?;
        file.write_all(b"\n")?;
        Ok(())
    }

    /// Phase 1: snapshot the current log into the `.oc` work file.
    /// Caller holds the namespace read lock.
    pub fn compact_prepare(&self, kind: ChangelogKind) -> Result<(), ChangelogError> {
        std::fs::copy(self.path(kind), self.work_path(kind))?;
        Ok(())
    }

    /// Phase 2: rewrite the work file keeping only the last record per id
    /// and dropping ids whose last record is a deletion. No lock held.
    pub fn compact(&self, kind: ChangelogKind) -> Result<CompactStats, ChangelogError> {
        let work = self.work_path(kind);
        if !work.exists() {
            return Err(ChangelogError::NotPrepared(kind));
        }

        let mut last: BTreeMap<u64, ChangelogRecord> = BTreeMap::new();
        let mut before = 0u64;
        {
            let reader = BufReader::new(std::fs::File::open(&work)?);
            for line in reader.lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                before += 1;
                let record: ChangelogRecord = serde_json::from_str(&line)?;
                if record.op == "del" {
                    last.remove(&record.id);
                } else {
                    last.insert(record.id, record);
                }
            }
        }

        let after = last.len() as u64;
        let tmp = work.with_extension("oc.tmp");
        {
            let mut out = std::fs::File::create(&tmp)?;
            for record in last.values() {
                out.write_all(serde_json::to_string(record)?.as_bytes())?;
                out.write_all(b"\n")?;
            }
            out.sync_all()?;
        }
        std::fs::rename(&tmp, &work)?;

        Ok(CompactStats {
            records_before: before,
            records_after: after,
        })
    }

    /// Phase 3: archive the current log and promote the work file.
    /// Caller holds the namespace write lock.
    pub fn compact_commit(&self, kind: ChangelogKind, epoch: i64) -> Result<PathBuf, ChangelogError> {
        let work = self.work_path(kind);
        if !work.exists() {
            return Err(ChangelogError::NotPrepared(kind));
        }

        let current = self.path(kind);
        let archive = archive_path(&current, epoch);
        std::fs::rename(&current, &archive)?;
        std::fs::rename(&work, &current)?;
        Ok(archive)
    }

    /// Move the current logs aside before adopting a promoted role.
    pub fn rename_aside(&self, epoch: i64) -> Result<(), ChangelogError> {
        for kind in [ChangelogKind::Files, ChangelogKind::Directories] {
            let current = self.path(kind);
            if current.exists() {
                std::fs::rename(&current, archive_path(&current, epoch))?;
            }
            std::fs::File::create(&current)?;
        }
        Ok(())
    }
}

fn archive_path(current: &Path, epoch: i64) -> PathBuf {
    let mut p = current.as_os_str().to_os_string();
    p.push(format!(".{epoch}"));
    PathBuf::from(p)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(id: u64, op: &str) -> ChangelogRecord {
        ChangelogRecord {
            id,
            op: op.to_string(),
            data: json!({"v": id}),
        }
    }

    #[test]
    fn test_compaction_drops_superseded_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChangelogStore::open(dir.path(), "mgm1").unwrap();

        store.append(ChangelogKind::Files, &record(1, "set")).unwrap();
        store.append(ChangelogKind::Files, &record(1, "set")).unwrap();
        store.append(ChangelogKind::Files, &record(2, "set")).unwrap();
        store.append(ChangelogKind::Files, &record(2, "del")).unwrap();
        store.append(ChangelogKind::Files, &record(3, "set")).unwrap();

        store.compact_prepare(ChangelogKind::Files).unwrap();
        let stats = store.compact(ChangelogKind::Files).unwrap();
        assert_eq!(stats.records_before, 5);
        assert_eq!(stats.records_after, 2);
        assert!(stats.ratio() > 0.5);

        let archive = store.compact_commit(ChangelogKind::Files, 1700000000).unwrap();
        assert!(archive.exists());

        let remaining = std::fs::read_to_string(store.path(ChangelogKind::Files)).unwrap();
        assert_eq!(remaining.lines().count(), 2);
    }

    #[test]
    fn test_commit_without_prepare_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChangelogStore::open(dir.path(), "mgm1").unwrap();
        assert!(matches!(
            store.compact_commit(ChangelogKind::Files, 1),
            Err(ChangelogError::NotPrepared(_))
        ));
    }

    #[test]
    fn test_rename_aside_creates_fresh_logs() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChangelogStore::open(dir.path(), "mgm1").unwrap();
        store.append(ChangelogKind::Files, &record(1, "set")).unwrap();

        store.rename_aside(42).unwrap();
        assert_eq!(store.size(ChangelogKind::Files).unwrap(), 0);
        assert!(dir.path().join("files.mgm1.mdlog.42").exists());
    }
}
