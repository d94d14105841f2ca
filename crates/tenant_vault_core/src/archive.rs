//! Archive sinks and the snapshot archive layout.
//!
//! Keys are `{tenant_id}/{folder}/{filename}`. The latest snapshot of a tenant
//! is always at `{tenant_id}/snapshots/latest.json`; timestamped copies beside
//! it are pruned down to a retention count.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ValidationError, VaultError};
use crate::ports::{ArchiveSink, Result};
use crate::snapshot::Snapshot;

pub const SNAPSHOT_FOLDER: &str = "snapshots";
pub const LATEST_FILENAME: &str = "latest.json";
const SNAPSHOT_PREFIX: &str = "snapshot-";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArchiveKey {
    pub tenant_id: String,
    pub folder: String,
    pub filename: String,
}

impl ArchiveKey {
    /// Components are checked because the tenant id comes from callers.
    pub fn new(tenant_id: &str, folder: &str, filename: &str) -> std::result::Result<Self, ValidationError> {
        for part in [tenant_id, folder, filename] {
            if !is_key_component(part) {
                return Err(ValidationError::BadKeyComponent(part.to_string()));
            }
        }
        Ok(Self {
            tenant_id: tenant_id.to_string(),
            folder: folder.to_string(),
            filename: filename.to_string(),
        })
    }

    pub fn prefix(tenant_id: &str, folder: &str) -> std::result::Result<String, ValidationError> {
        for part in [tenant_id, folder] {
            if !is_key_component(part) {
                return Err(ValidationError::BadKeyComponent(part.to_string()));
            }
        }
        Ok(format!("{tenant_id}/{folder}/"))
    }
}

impl std::fmt::Display for ArchiveKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.tenant_id, self.folder, self.filename)
    }
}

fn is_key_component(part: &str) -> bool {
    !part.is_empty()
        && part != "."
        && part != ".."
        && !part.contains(['/', '\\', '\0'])
}

// ── Sinks ─────────────────────────────────────────────────────

/// Blob store rooted at a local directory. Writes land in a temp file first and
/// are renamed into place, so readers never observe a torn object.
pub struct FsArchiveSink {
    root: PathBuf,
}

impl FsArchiveSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let mut path = self.root.clone();
        for part in key.split('/') {
            if !is_key_component(part) {
                return Err(ValidationError::BadKeyComponent(part.to_string()).into());
            }
            path.push(part);
        }
        Ok(path)
    }
}

#[async_trait]
impl ArchiveSink for FsArchiveSink {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path_for(key)?;
        let parent = path
            .parent()
            .ok_or_else(|| anyhow!("archive key {key} has no parent"))?;
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
        let file_name = path
            .file_name()
            .ok_or_else(|| anyhow!("archive key {key} has no file name"))?
            .to_string_lossy();
        // One temp file per writer; concurrent puts to a key race only on the rename.
        let tmp = path.with_file_name(format!("{file_name}.{}.partial", Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, bytes)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("renaming into {}", path.display()))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(anyhow!(e).context(format!("reading {}", path.display())).into()),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        // Prefixes are `{tenant}/{folder}/`; only that directory is scanned.
        let dir_key = prefix.trim_end_matches('/');
        let dir = self.path_for(dir_key)?;
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(anyhow!(e).context(format!("listing {}", dir.display())).into()),
        };
        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| anyhow!(e))? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(".partial") {
                continue;
            }
            let key = format!("{dir_key}/{name}");
            if key.starts_with(prefix) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(anyhow!(e).context(format!("deleting {}", path.display())).into()),
        }
    }
}

#[derive(Default, Clone)]
pub struct MemoryArchiveSink {
    objects: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
    fail_puts: Arc<Mutex<bool>>,
}

impl MemoryArchiveSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_puts(&self, fail: bool) {
        *self.fail_puts.lock().unwrap_or_else(|p| p.into_inner()) = fail;
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .keys()
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ArchiveSink for MemoryArchiveSink {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        if *self.fail_puts.lock().unwrap_or_else(|p| p.into_inner()) {
            return Err(anyhow!("injected archive failure for {key}").into());
        }
        self.objects
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .objects
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(key)
            .cloned())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .objects
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.objects
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(key);
        Ok(())
    }
}

/// Primary sink plus an optional best-effort local mirror. Mirror failures are
/// logged, never raised.
#[derive(Clone)]
pub struct MirroredArchive {
    primary: Arc<dyn ArchiveSink>,
    mirror: Option<Arc<dyn ArchiveSink>>,
}

impl MirroredArchive {
    pub fn new(primary: Arc<dyn ArchiveSink>) -> Self {
        Self {
            primary,
            mirror: None,
        }
    }

    pub fn with_mirror(mut self, mirror: Arc<dyn ArchiveSink>) -> Self {
        self.mirror = Some(mirror);
        self
    }
}

#[async_trait]
impl ArchiveSink for MirroredArchive {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        self.primary.put(key, bytes).await?;
        if let Some(mirror) = &self.mirror {
            if let Err(e) = mirror.put(key, bytes).await {
                tracing::warn!(key, error = %e, "local mirror write failed");
            }
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.primary.get(key).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.primary.list(prefix).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.primary.delete(key).await?;
        if let Some(mirror) = &self.mirror {
            if let Err(e) = mirror.delete(key).await {
                tracing::warn!(key, error = %e, "local mirror delete failed");
            }
        }
        Ok(())
    }
}

// ── Snapshot archive ──────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchivedSnapshot {
    pub key: String,
    /// `None` when the snapshot was kept but not promoted to `latest`.
    pub latest_key: Option<String>,
    pub digest: String,
    pub bytes: usize,
}

/// Snapshot layout on top of any [`ArchiveSink`].
#[derive(Clone)]
pub struct SnapshotArchive {
    sink: Arc<dyn ArchiveSink>,
    retain: usize,
}

impl SnapshotArchive {
    pub fn new(sink: Arc<dyn ArchiveSink>, retain: usize) -> Self {
        Self {
            sink,
            retain: retain.max(1),
        }
    }

    /// Write the timestamped copy, then repoint `latest`, then prune.
    /// A failure leaves the previous `latest` in place.
    pub async fn store(&self, snapshot: &Snapshot) -> Result<ArchivedSnapshot> {
        self.write(snapshot, true).await
    }

    /// Keep a timestamped copy of an incomplete snapshot for inspection.
    /// `latest` keeps pointing at the last complete one, so a later
    /// `restore_latest` never replays a snapshot with missing entities.
    pub async fn store_partial(&self, snapshot: &Snapshot) -> Result<ArchivedSnapshot> {
        self.write(snapshot, false).await
    }

    async fn write(&self, snapshot: &Snapshot, promote: bool) -> Result<ArchivedSnapshot> {
        let bytes = snapshot.to_json_bytes().map_err(|e| anyhow!(e))?;
        let filename = format!(
            "{SNAPSHOT_PREFIX}{}.json",
            snapshot.created_at.format("%Y%m%dT%H%M%S%6fZ")
        );
        let key = ArchiveKey::new(&snapshot.tenant_id, SNAPSHOT_FOLDER, &filename)?.to_string();

        self.sink.put(&key, &bytes).await?;
        let latest_key = if promote {
            let latest_key =
                ArchiveKey::new(&snapshot.tenant_id, SNAPSHOT_FOLDER, LATEST_FILENAME)?.to_string();
            self.sink.put(&latest_key, &bytes).await?;
            Some(latest_key)
        } else {
            None
        };
        tracing::info!(
            tenant_id = %snapshot.tenant_id,
            %key,
            bytes = bytes.len(),
            promoted = promote,
            "snapshot archived"
        );

        if let Err(e) = self.prune(&snapshot.tenant_id).await {
            tracing::warn!(tenant_id = %snapshot.tenant_id, error = %e, "snapshot retention pruning failed");
        }

        Ok(ArchivedSnapshot {
            key,
            latest_key,
            digest: snapshot.content_digest(),
            bytes: bytes.len(),
        })
    }

    pub async fn load(&self, key: &str) -> Result<Snapshot> {
        let bytes = self
            .sink
            .get(key)
            .await?
            .ok_or_else(|| VaultError::NotFound(format!("archived snapshot {key}")))?;
        Snapshot::from_json_bytes(&bytes)
            .map_err(|e| anyhow!(e).context(format!("decoding {key}")).into())
    }

    pub async fn load_latest(&self, tenant_id: &str) -> Result<Snapshot> {
        let key = ArchiveKey::new(tenant_id, SNAPSHOT_FOLDER, LATEST_FILENAME)?.to_string();
        self.load(&key).await
    }

    /// Timestamped snapshot keys for a tenant, oldest first.
    pub async fn list(&self, tenant_id: &str) -> Result<Vec<String>> {
        let prefix = ArchiveKey::prefix(tenant_id, SNAPSHOT_FOLDER)?;
        let mut keys: Vec<String> = self
            .sink
            .list(&prefix)
            .await?
            .into_iter()
            .filter(|k| {
                k.rsplit('/')
                    .next()
                    .is_some_and(|f| f.starts_with(SNAPSHOT_PREFIX))
            })
            .collect();
        keys.sort();
        Ok(keys)
    }

    /// Delete all but the newest `retain` timestamped snapshots.
    pub async fn prune(&self, tenant_id: &str) -> Result<Vec<String>> {
        let keys = self.list(tenant_id).await?;
        let excess = keys.len().saturating_sub(self.retain);
        let doomed: Vec<String> = keys.into_iter().take(excess).collect();
        for key in &doomed {
            self.sink.delete(key).await?;
            tracing::debug!(tenant_id, %key, "pruned old snapshot");
        }
        Ok(doomed)
    }
}
