//! Durable catalog of tool schemas, one entry per configured server.
//!
//! Layout: one JSON file per server under the catalog directory. `put`
//! replaces the file atomically (temp file, fsync, rename), so a crash
//! mid-write never corrupts a committed entry and a successful `put` is
//! durable before it returns. An in-memory mirror backs all reads.

use std::{
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::{BrokerError, BrokerResult};

/// Schema of one callable action on a server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub input_schema: serde_json::Value,
    /// Content digest, used to detect schema drift between refreshes.
    pub digest: String,
}

impl ToolSchema {
    pub fn new(
        name: impl Into<String>,
        description: Option<String>,
        input_schema: serde_json::Value,
    ) -> Self {
        let name = name.into();
        let mut hasher = blake3::Hasher::new();
        hasher.update(name.as_bytes());
        if let Some(desc) = &description {
            hasher.update(b"\0");
            hasher.update(desc.as_bytes());
        }
        hasher.update(b"\0");
        hasher.update(input_schema.to_string().as_bytes());
        let digest = hasher.finalize().to_hex().to_string();
        Self {
            name,
            description,
            input_schema,
            digest,
        }
    }
}

/// Cached schemas for one server, replaced wholesale on refresh.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub server: String,
    pub tools: Vec<ToolSchema>,
    /// Digest of the launch spec the schemas were fetched under.
    pub config_digest: String,
    /// Derived token: unchanged token means the cached schemas are fresh.
    pub freshness: String,
    pub last_refreshed: DateTime<Utc>,
}

impl CatalogEntry {
    pub fn new(server: impl Into<String>, tools: Vec<ToolSchema>, config_digest: String) -> Self {
        let freshness = freshness_token(&config_digest, &tools);
        Self {
            server: server.into(),
            tools,
            config_digest,
            freshness,
            last_refreshed: Utc::now(),
        }
    }

    pub fn find_tool(&self, name: &str) -> Option<&ToolSchema> {
        self.tools.iter().find(|t| t.name == name)
    }
}

/// Freshness token over the launch-spec digest and every schema digest.
pub fn freshness_token(config_digest: &str, tools: &[ToolSchema]) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(config_digest.as_bytes());
    for tool in tools {
        hasher.update(b"\0");
        hasher.update(tool.digest.as_bytes());
    }
    hasher.finalize().to_hex().to_string()
}

pub struct CatalogStore {
    dir: PathBuf,
    entries: DashMap<String, CatalogEntry>,
    /// Bumped on every mutation; the search index compares against it to
    /// detect staleness.
    generation: AtomicU64,
}

impl CatalogStore {
    /// Open the store, loading every committed entry from disk. Files that
    /// fail to parse are skipped, they do not take down the rest of the
    /// catalog.
    pub async fn open(dir: impl Into<PathBuf>) -> BrokerResult<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| store_err(&dir, e))?;

        let entries = DashMap::new();
        let mut read_dir = tokio::fs::read_dir(&dir).await.map_err(|e| store_err(&dir, e))?;
        while let Some(dirent) = read_dir.next_entry().await.map_err(|e| store_err(&dir, e))? {
            let path = dirent.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match tokio::fs::read_to_string(&path).await {
                Ok(text) => match serde_json::from_str::<CatalogEntry>(&text) {
                    Ok(entry) => {
                        entries.insert(entry.server.clone(), entry);
                    }
                    Err(e) => warn!("skipping unreadable catalog file {}: {}", path.display(), e),
                },
                Err(e) => warn!("skipping unreadable catalog file {}: {}", path.display(), e),
            }
        }
        debug!("opened catalog at {} with {} entries", dir.display(), entries.len());

        Ok(Self {
            dir,
            entries,
            generation: AtomicU64::new(1),
        })
    }

    pub fn get(&self, server: &str) -> Option<CatalogEntry> {
        self.entries.get(server).map(|e| e.clone())
    }

    /// Snapshot of every entry; ordering is not significant.
    pub fn all_entries(&self) -> Vec<CatalogEntry> {
        self.entries.iter().map(|e| e.value().clone()).collect()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Atomically replace the entry for `entry.server`. Durable before this
    /// returns; readers see either the old entry or the new one.
    pub async fn put(&self, entry: CatalogEntry) -> BrokerResult<()> {
        let path = self.entry_path(&entry.server);
        let tmp = path.with_extension("json.tmp");
        let bytes =
            serde_json::to_vec_pretty(&entry).map_err(|e| BrokerError::StoreUnavailable(e.to_string()))?;

        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| store_err(&tmp, e))?;
        file.write_all(&bytes).await.map_err(|e| store_err(&tmp, e))?;
        file.sync_all().await.map_err(|e| store_err(&tmp, e))?;
        drop(file);
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| store_err(&path, e))?;

        debug!(
            "catalog entry for '{}' written ({} tools)",
            entry.server,
            entry.tools.len()
        );
        self.entries.insert(entry.server.clone(), entry);
        self.generation.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Drop the entry for a server, on disk and in memory.
    pub async fn invalidate(&self, server: &str) -> BrokerResult<()> {
        let removed = self.entries.remove(server).is_some();
        let path = self.entry_path(server);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(store_err(&path, e)),
        }
        if removed {
            self.generation.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn entry_path(&self, server: &str) -> PathBuf {
        let slug: String = server
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '-'
                }
            })
            .collect();
        // Short digest suffix keeps distinct names distinct after slugging.
        let hex = blake3::hash(server.as_bytes()).to_hex();
        self.dir.join(format!("{}-{}.json", slug, &hex.as_str()[..8]))
    }
}

fn store_err(path: &Path, e: std::io::Error) -> BrokerError {
    BrokerError::StoreUnavailable(format!("{}: {}", path.display(), e))
}
