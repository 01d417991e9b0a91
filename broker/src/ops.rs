//! Broker-facing operations.
//!
//! Every protocol binding goes through [`Broker::dispatch`], so the
//! operation set and the error taxonomy are identical on each transport by
//! construction. Discovery and search are cold-path: they answer from the
//! catalog and never require the target server to be running.

use std::{collections::HashSet, sync::Arc};

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use crate::{
    catalog::{CatalogSearch, CatalogStore},
    config::{ServerRegistry, ServerSet},
    error::{BrokerError, BrokerResult},
    lifecycle::{ConnectionState, LifecycleManager},
};

/// JSON error body shared by every binding.
pub fn error_body(err: &BrokerError) -> Value {
    json!({"kind": err.kind(), "message": err.to_string()})
}

fn parse<T: serde::de::DeserializeOwned>(params: Value) -> BrokerResult<T> {
    serde_json::from_value(params).map_err(|e| BrokerError::InvalidArguments(e.to_string()))
}

fn default_max_results() -> usize {
    20
}

#[derive(Deserialize)]
struct DiscoverParams {
    #[serde(default)]
    servers: Option<Vec<String>>,
    #[serde(default)]
    query: Option<String>,
    #[serde(default)]
    catalog_only: bool,
}

#[derive(Deserialize)]
struct ActionDetailsParams {
    server: String,
    action: String,
}

#[derive(Deserialize)]
struct ExecuteParams {
    server: String,
    action: String,
    #[serde(default)]
    args: Option<Value>,
}

#[derive(Deserialize)]
struct SearchParams {
    query: String,
    #[serde(default = "default_max_results")]
    max_results: usize,
}

#[derive(Deserialize)]
struct ServerParams {
    server: String,
}

#[derive(Deserialize)]
struct SetParams {
    set: String,
    #[serde(default)]
    exclusive: bool,
}

#[derive(Deserialize)]
struct UpsertSetParams {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    servers: Vec<String>,
    #[serde(default)]
    include_sets: Vec<String>,
}

#[derive(Deserialize)]
struct QueryParams {
    query: String,
}

pub struct Broker {
    manager: Arc<LifecycleManager>,
    registry: Arc<ServerRegistry>,
    store: Arc<CatalogStore>,
    search: Arc<CatalogSearch>,
}

impl Broker {
    pub fn new(
        manager: Arc<LifecycleManager>,
        registry: Arc<ServerRegistry>,
        store: Arc<CatalogStore>,
        search: Arc<CatalogSearch>,
    ) -> Self {
        Self {
            manager,
            registry,
            store,
            search,
        }
    }

    pub fn manager(&self) -> &Arc<LifecycleManager> {
        &self.manager
    }

    /// Route one operation by name. The single entry point for every
    /// binding.
    pub async fn dispatch(&self, op: &str, params: Value) -> BrokerResult<Value> {
        let params = if params.is_null() { json!({}) } else { params };
        match op {
            "discover" => self.discover(parse(params)?).await,
            "action_details" => self.action_details(parse(params)?).await,
            "execute" => self.execute(parse(params)?).await,
            "search_catalog" => self.search_catalog(parse(params)?),
            "connect" => self.connect(parse(params)?).await,
            "disconnect" => self.disconnect(parse(params)?).await,
            "list_servers" => self.list_servers(),
            "connect_set" => self.connect_set(parse(params)?).await,
            "disconnect_set" => self.disconnect_set(parse(params)?).await,
            "disconnect_all" => self.disconnect_all().await,
            "list_sets" => self.list_sets(),
            "search_sets" => self.search_sets(parse(params)?),
            "upsert_set" => self.upsert_set(parse(params)?).await,
            "delete_set" => self.delete_set(parse(params)?).await,
            "populate_catalog" => self.populate_catalog().await,
            "reload_config" => self.reload_config().await,
            other => Err(BrokerError::InvalidArguments(format!(
                "unknown operation '{}'",
                other
            ))),
        }
    }

    /// List cached actions per server, optionally filtered by a query.
    /// Reads the catalog; a connected server with no entry yet gets one
    /// refresh pass unless `catalog_only` was requested.
    async fn discover(&self, params: DiscoverParams) -> BrokerResult<Value> {
        let targets = match params.servers {
            Some(servers) if !servers.is_empty() => servers,
            _ => {
                let mut names: Vec<String> = self.registry.enabled_names().into_iter().collect();
                names.sort();
                names
            }
        };
        let query_tokens = params.query.as_deref().map(tokens_of);

        let mut per_server = serde_json::Map::new();
        for name in targets {
            let report = match self.registry.require_enabled(&name) {
                Err(e) => json!({"error": error_body(&e)}),
                Ok(_) => {
                    let mut entry = self.store.get(&name);
                    if entry.is_none()
                        && !params.catalog_only
                        && self.manager.state(&name) == ConnectionState::Connected
                    {
                        if let Err(e) = self.manager.refresh_catalog(&name).await {
                            warn!("discover refresh for '{}' failed: {}", name, e);
                        }
                        entry = self.store.get(&name);
                    }
                    match entry {
                        Some(entry) => {
                            let actions: Vec<Value> = entry
                                .tools
                                .iter()
                                .filter(|tool| match &query_tokens {
                                    Some(tokens) => tool_matches(tool, tokens),
                                    None => true,
                                })
                                .map(|tool| {
                                    json!({
                                        "name": tool.name,
                                        "description": tool.description,
                                    })
                                })
                                .collect();
                            json!({
                                "state": self.manager.state(&name),
                                "actions": actions,
                            })
                        }
                        None => json!({
                            "state": self.manager.state(&name),
                            "actions": Value::Null,
                            "note": "no catalog entry; connect the server or run populate_catalog",
                        }),
                    }
                }
            };
            per_server.insert(name, report);
        }
        Ok(json!({"servers": per_server}))
    }

    /// Full schema for one action, from the catalog first; a connected
    /// server gets a refresh pass before the lookup fails.
    async fn action_details(&self, params: ActionDetailsParams) -> BrokerResult<Value> {
        self.registry.require_enabled(&params.server)?;

        let lookup = |entry: Option<crate::catalog::CatalogEntry>| {
            entry.and_then(|e| e.find_tool(&params.action).cloned())
        };

        let mut tool = lookup(self.store.get(&params.server));
        if tool.is_none() && self.manager.state(&params.server) == ConnectionState::Connected {
            self.manager.refresh_catalog(&params.server).await?;
            tool = lookup(self.store.get(&params.server));
        }

        let tool = tool.ok_or_else(|| BrokerError::ActionNotFound {
            server: params.server.clone(),
            action: params.action.clone(),
        })?;
        Ok(json!({
            "server": params.server,
            "name": tool.name,
            "description": tool.description,
            "input_schema": tool.input_schema,
        }))
    }

    async fn execute(&self, params: ExecuteParams) -> BrokerResult<Value> {
        let args = match params.args {
            None | Some(Value::Null) => None,
            Some(Value::Object(map)) => Some(map),
            Some(other) => {
                return Err(BrokerError::InvalidArguments(format!(
                    "args must be an object, got {}",
                    other
                )))
            }
        };
        self.manager.execute(&params.server, &params.action, args).await
    }

    /// Search the offline catalog; results carry the server's live state so
    /// callers can tell whether execution needs a connect first.
    fn search_catalog(&self, params: SearchParams) -> BrokerResult<Value> {
        let enabled = self.registry.enabled_names();
        let hits = self.search.search(&params.query, params.max_results, &enabled);
        let tools: Vec<Value> = hits
            .into_iter()
            .map(|hit| {
                let online = self.manager.state(&hit.server) == ConnectionState::Connected;
                json!({
                    "server": hit.server,
                    "action": hit.action,
                    "description": hit.description,
                    "source": "catalog",
                    "current_status": if online { "online" } else { "offline" },
                })
            })
            .collect();

        let query_lower = params.query.to_lowercase();
        let collections: Vec<Value> = self
            .sorted_sets()
            .into_iter()
            .filter(|(name, set)| {
                name.to_lowercase().contains(&query_lower)
                    || set.description.to_lowercase().contains(&query_lower)
            })
            .map(|(name, set)| {
                json!({
                    "type": "collection",
                    "name": name,
                    "description": set.description,
                    "servers": set.servers,
                })
            })
            .collect();

        Ok(json!({"tools": tools, "collections": collections}))
    }

    async fn connect(&self, params: ServerParams) -> BrokerResult<Value> {
        self.manager.connect(&params.server).await?;
        Ok(json!({"server": params.server, "state": self.manager.state(&params.server)}))
    }

    async fn disconnect(&self, params: ServerParams) -> BrokerResult<Value> {
        self.manager.disconnect(&params.server).await?;
        Ok(json!({"server": params.server, "state": self.manager.state(&params.server)}))
    }

    fn list_servers(&self) -> BrokerResult<Value> {
        serde_json::to_value(self.manager.list())
            .map_err(|e| BrokerError::InvalidArguments(e.to_string()))
            .map(|servers| json!({"servers": servers}))
    }

    /// Batched connect over a named set. Exclusive mode first disconnects
    /// every connected server outside the set.
    async fn connect_set(&self, params: SetParams) -> BrokerResult<Value> {
        let members = self.registry.resolve_set(&params.set)?;

        let mut stopped = Vec::new();
        if params.exclusive {
            for status in self.manager.list() {
                if status.state == ConnectionState::Connected && !members.contains(&status.name) {
                    self.manager.disconnect(&status.name).await?;
                    stopped.push(status.name);
                }
            }
        }

        let mut results = serde_json::Map::new();
        for name in &members {
            let report = match self.manager.connect(name).await {
                Ok(()) => json!({"state": self.manager.state(name)}),
                Err(e) => json!({"error": error_body(&e)}),
            };
            results.insert(name.clone(), report);
        }
        Ok(json!({"set": params.set, "servers": results, "stopped": stopped}))
    }

    async fn disconnect_set(&self, params: SetParams) -> BrokerResult<Value> {
        let members = self.registry.resolve_set(&params.set)?;
        for name in &members {
            self.manager.disconnect(name).await?;
        }
        Ok(json!({"set": params.set, "stopped": members}))
    }

    async fn disconnect_all(&self) -> BrokerResult<Value> {
        let mut stopped = Vec::new();
        for status in self.manager.list() {
            if status.state != ConnectionState::Disconnected {
                self.manager.disconnect(&status.name).await?;
                stopped.push(status.name);
            }
        }
        Ok(json!({"stopped": stopped}))
    }

    fn list_sets(&self) -> BrokerResult<Value> {
        let sets: serde_json::Map<String, Value> = self
            .sorted_sets()
            .into_iter()
            .map(|(name, set)| {
                (
                    name,
                    json!({
                        "description": set.description,
                        "servers": set.servers,
                        "include_sets": set.include_sets,
                    }),
                )
            })
            .collect();
        Ok(json!({"sets": sets}))
    }

    fn search_sets(&self, params: QueryParams) -> BrokerResult<Value> {
        let query_lower = params.query.to_lowercase();
        let matches: Vec<Value> = self
            .sorted_sets()
            .into_iter()
            .filter(|(name, set)| {
                name.to_lowercase().contains(&query_lower)
                    || set.description.to_lowercase().contains(&query_lower)
            })
            .map(|(name, set)| {
                json!({"name": name, "description": set.description, "servers": set.servers})
            })
            .collect();
        Ok(json!({"sets": matches}))
    }

    async fn upsert_set(&self, params: UpsertSetParams) -> BrokerResult<Value> {
        if params.servers.is_empty() && params.include_sets.is_empty() {
            return Err(BrokerError::InvalidArguments(
                "a set needs servers or include_sets".to_string(),
            ));
        }
        self.registry
            .upsert_set(
                &params.name,
                ServerSet {
                    description: params.description,
                    servers: params.servers,
                    include_sets: params.include_sets,
                },
            )
            .await?;
        Ok(json!({"set": params.name, "saved": true}))
    }

    async fn delete_set(&self, params: SetParams) -> BrokerResult<Value> {
        self.registry.delete_set(&params.set).await?;
        Ok(json!({"set": params.set, "deleted": true}))
    }

    /// Bulk refresh: connect each enabled server that has no catalog entry,
    /// cache its schemas, and return it to its prior connection state.
    async fn populate_catalog(&self) -> BrokerResult<Value> {
        let mut names: Vec<String> = self.registry.enabled_names().into_iter().collect();
        names.sort();

        let mut indexed = Vec::new();
        let mut skipped = Vec::new();
        let mut failed = serde_json::Map::new();
        for name in names {
            if self.store.get(&name).is_some() {
                skipped.push(name);
                continue;
            }
            let was_connected = self.manager.state(&name) == ConnectionState::Connected;
            let result = async {
                if !was_connected {
                    self.manager.connect(&name).await?;
                }
                // Connect already refreshed; this is the explicit pass for
                // servers that were connected before the entry existed.
                if self.store.get(&name).is_none() {
                    self.manager.refresh_catalog(&name).await?;
                }
                BrokerResult::Ok(())
            }
            .await;

            if !was_connected {
                let _ = self.manager.disconnect(&name).await;
            }
            match result {
                Ok(()) => indexed.push(name),
                Err(e) => {
                    failed.insert(name, error_body(&e));
                }
            }
        }
        Ok(json!({"indexed": indexed, "skipped": skipped, "failed": failed}))
    }

    async fn reload_config(&self) -> BrokerResult<Value> {
        self.manager.reload().await?;
        self.list_servers()
    }

    fn sorted_sets(&self) -> Vec<(String, ServerSet)> {
        let mut sets: Vec<(String, ServerSet)> = self.registry.list_sets().into_iter().collect();
        sets.sort_by(|a, b| a.0.cmp(&b.0));
        sets
    }
}

fn tokens_of(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_lowercase())
        .collect()
}

fn tool_matches(tool: &crate::catalog::ToolSchema, query_tokens: &HashSet<String>) -> bool {
    let mut own = tokens_of(&tool.name);
    own.insert(tool.name.to_lowercase());
    if let Some(desc) = &tool.description {
        own.extend(tokens_of(desc));
    }
    query_tokens.iter().any(|t| own.contains(t))
}
