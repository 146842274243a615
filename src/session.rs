use crate::model::{SwarmSnapshot, TorrentTarget};
use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// The torrent engine as seen by the monitor.
#[async_trait]
pub trait SwarmSession: Send + Sync {
    async fn list_targets(&self) -> anyhow::Result<Vec<TorrentTarget>>;
    async fn snapshot(&self, target: &TorrentTarget) -> anyhow::Result<SwarmSnapshot>;
    async fn pause(&self, target: &TorrentTarget) -> anyhow::Result<()>;
    async fn resume(&self, target: &TorrentTarget) -> anyhow::Result<()>;
}

#[derive(Debug, Deserialize)]
struct SpoolDocument {
    target: TorrentTarget,
    #[serde(flatten)]
    snapshot: SwarmSnapshot,
}

/// Session backed by a spool directory the engine keeps up to date: one
/// `*.json` document per torrent, rewritten in place. Pause/resume requests
/// go back to the engine as `<info_hash>.control` files.
pub struct SpoolSession {
    dir: PathBuf,
    files: Mutex<HashMap<String, PathBuf>>,
}

impl SpoolSession {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            files: Mutex::new(HashMap::new()),
        }
    }

    async fn read_document(path: &Path) -> anyhow::Result<SpoolDocument> {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("read {}", path.display()))?;
        let doc: SpoolDocument = serde_json::from_slice(&bytes)
            .with_context(|| format!("parse {}", path.display()))?;
        Ok(doc)
    }

    fn path_for(&self, target: &TorrentTarget) -> anyhow::Result<PathBuf> {
        let files = self
            .files
            .lock()
            .map_err(|_| anyhow::anyhow!("spool index poisoned"))?;
        files
            .get(&target.info_hash)
            .cloned()
            .with_context(|| format!("unknown target {}", target.info_hash))
    }

    async fn write_control(&self, target: &TorrentTarget, command: &str) -> anyhow::Result<()> {
        let path = self.dir.join(format!("{}.control", target.info_hash));
        tokio::fs::write(&path, format!("{command}\n"))
            .await
            .with_context(|| format!("write {}", path.display()))
    }
}

/// Accepts v1 (40 hex) and v2 (64 hex) info hashes, lowercased.
pub fn normalize_info_hash(raw: &str) -> Option<String> {
    let raw = raw.trim();
    let bytes = hex::decode(raw).ok()?;
    matches!(bytes.len(), 20 | 32).then(|| raw.to_ascii_lowercase())
}

#[async_trait]
impl SwarmSession for SpoolSession {
    async fn list_targets(&self) -> anyhow::Result<Vec<TorrentTarget>> {
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .with_context(|| format!("read spool dir {}", self.dir.display()))?;

        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|e| e == "json") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut targets = Vec::new();
        let mut index = HashMap::new();
        for path in paths {
            let doc = match Self::read_document(&path).await {
                Ok(doc) => doc,
                Err(err) => {
                    tracing::warn!(err = %format!("{err:#}"), "session: skipping spool file");
                    continue;
                }
            };
            let Some(info_hash) = normalize_info_hash(&doc.target.info_hash) else {
                tracing::warn!(path = %path.display(), info_hash = %doc.target.info_hash, "session: invalid info hash");
                continue;
            };
            if index.contains_key(&info_hash) {
                tracing::warn!(path = %path.display(), %info_hash, "session: duplicate target ignored");
                continue;
            }
            index.insert(info_hash.clone(), path);
            targets.push(TorrentTarget {
                info_hash,
                ..doc.target
            });
        }

        *self
            .files
            .lock()
            .map_err(|_| anyhow::anyhow!("spool index poisoned"))? = index;
        Ok(targets)
    }

    async fn snapshot(&self, target: &TorrentTarget) -> anyhow::Result<SwarmSnapshot> {
        let path = self.path_for(target)?;
        Ok(Self::read_document(&path).await?.snapshot)
    }

    async fn pause(&self, target: &TorrentTarget) -> anyhow::Result<()> {
        self.write_control(target, "pause").await
    }

    async fn resume(&self, target: &TorrentTarget) -> anyhow::Result<()> {
        self.write_control(target, "resume").await
    }
}
