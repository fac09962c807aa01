use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::SystemTime;

use containerd_snapshots::{Info, Kind};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, SnapshotError};

/// Snapshot kind as persisted in `metadata.json`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotKind {
    View,
    Active,
    Committed,
}

impl From<SnapshotKind> for Kind {
    fn from(kind: SnapshotKind) -> Self {
        match kind {
            SnapshotKind::View => Kind::View,
            SnapshotKind::Active => Kind::Active,
            SnapshotKind::Committed => Kind::Committed,
        }
    }
}

/// Persisted snapshot record, keyed by snapshot name in [`Metadata`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRecord {
    /// Numeric id; names the snapshot's directory under `snapshots/`.
    pub id: u64,
    pub kind: SnapshotKind,
    /// Parent snapshot name (empty = no parent).
    pub parent: String,
    pub labels: HashMap<String, String>,
    pub created_at: SystemTime,
    pub updated_at: SystemTime,
}

impl SnapshotRecord {
    /// Convert into the containerd `Info` shape under `name`.
    pub fn to_info(&self, name: &str) -> Info {
        Info {
            kind: self.kind.into(),
            name: name.to_owned(),
            parent: self.parent.clone(),
            labels: self.labels.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// All snapshot records plus the id allocator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Metadata {
    next_id: u64,
    snapshots: BTreeMap<String, SnapshotRecord>,
}

impl Metadata {
    /// Load metadata from `path`; a missing file yields an empty store.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(json) => Ok(serde_json::from_str(&json)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Persist to `path` atomically (temp file + rename).
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        if let Err(e) = std::fs::rename(&tmp, path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }
        debug!(path = %path.display(), snapshots = self.snapshots.len(), "metadata saved");
        Ok(())
    }

    pub fn get(&self, key: &str) -> Result<&SnapshotRecord> {
        self.snapshots
            .get(key)
            .ok_or_else(|| SnapshotError::NotFound(key.to_owned()))
    }

    pub fn get_mut(&mut self, key: &str) -> Result<&mut SnapshotRecord> {
        self.snapshots
            .get_mut(key)
            .ok_or_else(|| SnapshotError::NotFound(key.to_owned()))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.snapshots.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &SnapshotRecord)> {
        self.snapshots.iter()
    }

    /// Create a new record for `key` on top of `parent`.
    ///
    /// The parent, when non-empty, must exist and be committed.
    pub fn create(
        &mut self,
        key: &str,
        parent: &str,
        kind: SnapshotKind,
        labels: HashMap<String, String>,
    ) -> Result<&SnapshotRecord> {
        if key.is_empty() {
            return Err(SnapshotError::InvalidArgument("empty snapshot key".into()));
        }
        if self.contains(key) {
            return Err(SnapshotError::AlreadyExists(key.to_owned()));
        }
        if !parent.is_empty() {
            let p = self.get(parent)?;
            if p.kind != SnapshotKind::Committed {
                return Err(SnapshotError::FailedPrecondition(format!(
                    "parent {parent} is not committed"
                )));
            }
        }

        self.next_id += 1;
        let now = SystemTime::now();
        let record = SnapshotRecord {
            id: self.next_id,
            kind,
            parent: parent.to_owned(),
            labels,
            created_at: now,
            updated_at: now,
        };
        Ok(self.snapshots.entry(key.to_owned()).or_insert(record))
    }

    /// Re-key an active snapshot as committed under `name`.
    pub fn commit(
        &mut self,
        name: &str,
        key: &str,
        labels: HashMap<String, String>,
    ) -> Result<&SnapshotRecord> {
        if self.get(key)?.kind != SnapshotKind::Active {
            return Err(SnapshotError::FailedPrecondition(format!(
                "snapshot {key} is not active"
            )));
        }
        if self.contains(name) {
            return Err(SnapshotError::AlreadyExists(name.to_owned()));
        }

        let mut record = self
            .snapshots
            .remove(key)
            .ok_or_else(|| SnapshotError::NotFound(key.to_owned()))?;
        record.kind = SnapshotKind::Committed;
        record.labels.extend(labels);
        record.updated_at = SystemTime::now();
        Ok(self.snapshots.entry(name.to_owned()).or_insert(record))
    }

    /// Delete the record for `key`; fails if another snapshot builds on it.
    pub fn remove(&mut self, key: &str) -> Result<SnapshotRecord> {
        self.get(key)?;
        if let Some((child, _)) = self.snapshots.iter().find(|(_, r)| r.parent == key) {
            return Err(SnapshotError::FailedPrecondition(format!(
                "snapshot {key} has child {child}"
            )));
        }
        self.snapshots
            .remove(key)
            .ok_or_else(|| SnapshotError::NotFound(key.to_owned()))
    }

    /// Ancestors of `key`, nearest first.
    pub fn parents(&self, key: &str) -> Result<Vec<&SnapshotRecord>> {
        let mut chain = Vec::new();
        let mut parent = self.get(key)?.parent.as_str();
        while !parent.is_empty() {
            let record = self.get(parent).map_err(|_| {
                SnapshotError::Metadata(format!("snapshot {key} references missing parent {parent}"))
            })?;
            chain.push(record);
            parent = record.parent.as_str();
        }
        Ok(chain)
    }

    /// Drop every record (and its descendants) for which `keep` is false.
    /// Returns the names of dropped records.
    pub fn retain(&mut self, mut keep: impl FnMut(&SnapshotRecord) -> bool) -> Vec<String> {
        let mut dropped: Vec<String> = self
            .snapshots
            .iter()
            .filter(|(_, r)| !keep(r))
            .map(|(k, _)| k.clone())
            .collect();

        // Children of dropped snapshots lose their lower layers; drop them too.
        loop {
            let orphans: Vec<String> = self
                .snapshots
                .iter()
                .filter(|(k, r)| {
                    !dropped.contains(k) && !r.parent.is_empty() && dropped.contains(&r.parent)
                })
                .map(|(k, _)| k.clone())
                .collect();
            if orphans.is_empty() {
                break;
            }
            dropped.extend(orphans);
        }

        for key in &dropped {
            self.snapshots.remove(key);
        }
        dropped
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}
