//! Server registry and broker policy configuration.
//!
//! The configuration file is JSON: a map of server name to launch spec,
//! optional named sets of servers, and the broker policy knobs. The file is
//! read once at startup and again only on explicit reload.

use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{BrokerError, BrokerResult};

/// Launch spec and enablement for one configured server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl ServerConfig {
    /// Digest of the launch spec. Part of the catalog freshness token, so a
    /// config change invalidates cached schemas without a version counter.
    /// The `enabled` flag is not part of server identity and is excluded.
    pub fn digest(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.command.as_bytes());
        for arg in &self.args {
            hasher.update(b"\0");
            hasher.update(arg.as_bytes());
        }
        let mut env: Vec<_> = self.env.iter().collect();
        env.sort();
        for (key, value) in env {
            hasher.update(b"\0");
            hasher.update(key.as_bytes());
            hasher.update(b"=");
            hasher.update(value.as_bytes());
        }
        hasher.finalize().to_hex().to_string()
    }
}

/// Named group of servers, composable via `include_sets`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSet {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub servers: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include_sets: Vec<String>,
}

/// Runtime policy for the lifecycle manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerPolicy {
    /// Seconds a connected server may sit idle before auto-disconnect.
    /// 0 disables the idle reaper.
    #[serde(default)]
    pub idle_timeout_secs: u64,

    /// Maximum concurrently connected servers. 0 = unbounded. When the
    /// limit is reached, the least-recently-used connected server is
    /// disconnected before a new connect proceeds.
    #[serde(default)]
    pub max_connected: usize,

    /// Connect a cold server implicitly on execute. When false, executing
    /// against a disconnected server fails with `NotConnected`.
    #[serde(default = "default_true")]
    pub connect_on_demand: bool,

    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,

    #[serde(default = "default_execute_timeout")]
    pub execute_timeout_secs: u64,
}

impl Default for BrokerPolicy {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 0,
            max_connected: 0,
            connect_on_demand: true,
            handshake_timeout_secs: default_handshake_timeout(),
            execute_timeout_secs: default_execute_timeout(),
        }
    }
}

/// Root of the configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default)]
    pub servers: HashMap<String, ServerConfig>,
    #[serde(default)]
    pub sets: HashMap<String, ServerSet>,
    #[serde(default)]
    pub policy: BrokerPolicy,
}

fn default_true() -> bool {
    true
}

fn default_handshake_timeout() -> u64 {
    30
}

fn default_execute_timeout() -> u64 {
    120
}

/// Reloadable view of the configuration. Readers get snapshots; `reload`
/// replaces the whole config atomically.
pub struct ServerRegistry {
    path: Option<PathBuf>,
    inner: RwLock<BrokerConfig>,
}

impl ServerRegistry {
    /// Registry over an in-memory config, with no backing file.
    pub fn from_config(config: BrokerConfig) -> Self {
        Self {
            path: None,
            inner: RwLock::new(config),
        }
    }

    /// Load the registry from a JSON file. A missing file yields an empty
    /// registry so a fresh install starts cleanly.
    pub async fn load(path: impl Into<PathBuf>) -> BrokerResult<Self> {
        let path = path.into();
        let config = Self::read_config(&path).await?;
        Ok(Self {
            path: Some(path),
            inner: RwLock::new(config),
        })
    }

    async fn read_config(path: &Path) -> BrokerResult<BrokerConfig> {
        match tokio::fs::read_to_string(path).await {
            Ok(text) => serde_json::from_str(&text)
                .map_err(|e| BrokerError::Config(format!("{}: {}", path.display(), e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BrokerConfig::default()),
            Err(e) => Err(BrokerError::Config(format!("{}: {}", path.display(), e))),
        }
    }

    /// Re-read the backing file and replace the in-memory view. A registry
    /// without a backing file keeps its current config.
    pub async fn reload(&self) -> BrokerResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let config = Self::read_config(path).await?;
        *self.inner.write() = config;
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<ServerConfig> {
        self.inner.read().servers.get(name).cloned()
    }

    /// Config lookup gate used by every lifecycle operation.
    pub fn require_enabled(&self, name: &str) -> BrokerResult<ServerConfig> {
        let config = self
            .get(name)
            .ok_or_else(|| BrokerError::ConfigNotFound(name.to_string()))?;
        if !config.enabled {
            return Err(BrokerError::ConfigDisabled(name.to_string()));
        }
        Ok(config)
    }

    pub fn server_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.read().servers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn enabled_names(&self) -> HashSet<String> {
        self.inner
            .read()
            .servers
            .iter()
            .filter(|(_, c)| c.enabled)
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn snapshot_servers(&self) -> HashMap<String, ServerConfig> {
        self.inner.read().servers.clone()
    }

    pub fn policy(&self) -> BrokerPolicy {
        self.inner.read().policy.clone()
    }

    pub fn get_set(&self, name: &str) -> Option<ServerSet> {
        self.inner.read().sets.get(name).cloned()
    }

    pub fn list_sets(&self) -> HashMap<String, ServerSet> {
        self.inner.read().sets.clone()
    }

    /// Resolve a set to its member servers, following `include_sets`
    /// recursively. Include cycles are tolerated, each set contributes once.
    pub fn resolve_set(&self, name: &str) -> BrokerResult<Vec<String>> {
        let sets = self.list_sets();
        if !sets.contains_key(name) {
            return Err(BrokerError::SetNotFound(name.to_string()));
        }
        let mut visited = HashSet::new();
        let mut servers = Vec::new();
        Self::collect_set(&sets, name, &mut visited, &mut servers);
        Ok(servers)
    }

    fn collect_set(
        sets: &HashMap<String, ServerSet>,
        name: &str,
        visited: &mut HashSet<String>,
        out: &mut Vec<String>,
    ) {
        if !visited.insert(name.to_string()) {
            return;
        }
        let Some(set) = sets.get(name) else {
            return;
        };
        for server in &set.servers {
            if !out.contains(server) {
                out.push(server.clone());
            }
        }
        for included in &set.include_sets {
            Self::collect_set(sets, included, visited, out);
        }
    }

    /// Create or replace a set, persisting the config file when one backs
    /// this registry.
    pub async fn upsert_set(&self, name: &str, set: ServerSet) -> BrokerResult<()> {
        self.inner.write().sets.insert(name.to_string(), set);
        self.save().await
    }

    pub async fn delete_set(&self, name: &str) -> BrokerResult<()> {
        if self.inner.write().sets.remove(name).is_none() {
            return Err(BrokerError::SetNotFound(name.to_string()));
        }
        self.save().await
    }

    async fn save(&self) -> BrokerResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let bytes = {
            let config = self.inner.read();
            serde_json::to_vec_pretty(&*config)
                .map_err(|e| BrokerError::Config(e.to_string()))?
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| BrokerError::Config(format!("{}: {}", parent.display(), e)))?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| BrokerError::Config(format!("{}: {}", tmp.display(), e)))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| BrokerError::Config(format!("{}: {}", path.display(), e)))?;
        Ok(())
    }

    /// Default config file location under the user config directory.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("toolgate")
            .join("servers.json")
    }
}

/// Default catalog directory under the user cache directory.
pub fn default_catalog_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("toolgate")
        .join("catalog")
}
