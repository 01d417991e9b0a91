//! Derived search index over the catalog, and the query service.
//!
//! The index is a disposable performance cache: everything in it is
//! reconstructible from the store. It is published through `ArcSwap`, so
//! in-flight searches keep the index they started with and never observe a
//! half-built one.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use super::store::{CatalogEntry, CatalogStore};

/// One search result, ready for the wire.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub server: String,
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ActionRef {
    server: String,
    action: String,
}

#[derive(Debug, Clone)]
struct ActionMeta {
    name_lower: String,
    description: Option<String>,
    desc_tokens: HashSet<String>,
}

/// Posting map from lowercase tokens to the actions mentioning them.
struct SearchIndex {
    generation: u64,
    postings: HashMap<String, HashSet<ActionRef>>,
    actions: HashMap<ActionRef, ActionMeta>,
}

impl SearchIndex {
    fn empty(generation: u64) -> Self {
        Self {
            generation,
            postings: HashMap::new(),
            actions: HashMap::new(),
        }
    }

    fn build(generation: u64, entries: &[CatalogEntry]) -> Self {
        let mut index = Self::empty(generation);
        for entry in entries {
            index.add_entry(entry);
        }
        index
    }

    /// Copy of `base` with one server's slice replaced.
    fn rebuilt_for_server(base: &Self, server: &str, entry: Option<&CatalogEntry>, generation: u64) -> Self {
        let mut index = Self::empty(generation);
        for (r, meta) in &base.actions {
            if r.server != server {
                index.actions.insert(r.clone(), meta.clone());
            }
        }
        for (token, refs) in &base.postings {
            let kept: HashSet<ActionRef> = refs.iter().filter(|r| r.server != server).cloned().collect();
            if !kept.is_empty() {
                index.postings.insert(token.clone(), kept);
            }
        }
        if let Some(entry) = entry {
            index.add_entry(entry);
        }
        index
    }

    fn add_entry(&mut self, entry: &CatalogEntry) {
        for tool in &entry.tools {
            let r = ActionRef {
                server: entry.server.clone(),
                action: tool.name.clone(),
            };
            let name_lower = tool.name.to_lowercase();
            let desc_tokens: HashSet<String> = tool
                .description
                .as_deref()
                .map(|d| tokenize(d).collect())
                .unwrap_or_default();

            let mut tokens: HashSet<String> = tokenize(&tool.name).collect();
            tokens.insert(name_lower.clone());
            tokens.extend(desc_tokens.iter().cloned());
            tokens.extend(tokenize(&entry.server));
            for token in tokens {
                self.postings.entry(token).or_default().insert(r.clone());
            }

            self.actions.insert(
                r,
                ActionMeta {
                    name_lower,
                    description: tool.description.clone(),
                    desc_tokens,
                },
            );
        }
    }

    fn search(&self, query: &str, limit: usize, enabled: &HashSet<String>) -> Vec<SearchHit> {
        let query_lower = query.trim().to_lowercase();
        let qtokens: HashSet<String> = tokenize(&query_lower).collect();
        if qtokens.is_empty() {
            return Vec::new();
        }

        let mut candidates: HashSet<&ActionRef> = HashSet::new();
        for token in &qtokens {
            if let Some(refs) = self.postings.get(token) {
                candidates.extend(refs.iter());
            }
        }

        let mut scored: Vec<(bool, usize, &ActionRef, &ActionMeta)> = candidates
            .into_iter()
            .filter(|r| enabled.contains(&r.server))
            .map(|r| {
                let meta = &self.actions[r];
                let exact = meta.name_lower == query_lower;
                let overlap = qtokens.iter().filter(|t| meta.desc_tokens.contains(*t)).count();
                (exact, overlap, r, meta)
            })
            .collect();

        // Exact name match first, then description term overlap, then
        // server name as the stable tie-break.
        scored.sort_by(|a, b| {
            b.0.cmp(&a.0)
                .then(b.1.cmp(&a.1))
                .then(a.2.server.cmp(&b.2.server))
                .then(a.2.action.cmp(&b.2.action))
        });

        scored
            .into_iter()
            .take(limit)
            .map(|(_, _, r, meta)| SearchHit {
                server: r.server.clone(),
                action: r.action.clone(),
                description: meta.description.clone(),
            })
            .collect()
    }
}

/// Lowercase alphanumeric runs of a text.
fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_lowercase())
}

/// Query service over the catalog. Searches suspend on nothing: they read
/// the store's in-memory mirror and a swapped-in index only.
pub struct CatalogSearch {
    store: Arc<CatalogStore>,
    index: ArcSwapOption<SearchIndex>,
    rebuild_lock: Mutex<()>,
}

impl CatalogSearch {
    pub fn new(store: Arc<CatalogStore>) -> Self {
        Self {
            store,
            index: ArcSwapOption::empty(),
            rebuild_lock: Mutex::new(()),
        }
    }

    /// Search cached schemas. Results are limited to the `enabled` servers;
    /// entries for disabled or unconfigured servers never surface.
    pub fn search(&self, query: &str, limit: usize, enabled: &HashSet<String>) -> Vec<SearchHit> {
        self.current_index().search(query, limit, enabled)
    }

    /// Rebuild the slice for one server after its entry changed. Readers
    /// keep the previous index until the replacement is complete.
    pub fn rebuild_server(&self, server: &str) {
        let _guard = self.rebuild_lock.lock();
        let generation = self.store.generation();
        let entry = self.store.get(server);
        let next = match self.index.load_full() {
            // Only this server's entry changed since the base was built, so
            // swapping its slice is enough.
            Some(base) if base.generation + 1 == generation => {
                SearchIndex::rebuilt_for_server(&base, server, entry.as_ref(), generation)
            }
            _ => SearchIndex::build(generation, &self.store.all_entries()),
        };
        debug!("search index rebuilt for '{}' at generation {}", server, generation);
        self.index.store(Some(Arc::new(next)));
    }

    fn current_index(&self) -> Arc<SearchIndex> {
        let generation = self.store.generation();
        if let Some(index) = self.index.load_full() {
            if index.generation == generation {
                return index;
            }
        }
        let _guard = self.rebuild_lock.lock();
        let generation = self.store.generation();
        if let Some(index) = self.index.load_full() {
            if index.generation == generation {
                return index;
            }
        }
        let index = Arc::new(SearchIndex::build(generation, &self.store.all_entries()));
        self.index.store(Some(Arc::clone(&index)));
        index
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::store::ToolSchema;

    fn schema(name: &str, description: &str) -> ToolSchema {
        ToolSchema::new(
            name,
            Some(description.to_string()),
            serde_json::json!({"type": "object"}),
        )
    }

    fn entry(server: &str, tools: Vec<ToolSchema>) -> CatalogEntry {
        CatalogEntry::new(server, tools, format!("cfg-{server}"))
    }

    async fn populated_search() -> (Arc<CatalogStore>, CatalogSearch, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CatalogStore::open(dir.path()).await.unwrap());
        store
            .put(entry(
                "notes",
                vec![
                    schema("add_note", "Create a new note"),
                    schema("search_notes", "Full text search across notes"),
                ],
            ))
            .await
            .unwrap();
        store
            .put(entry(
                "calendar",
                vec![schema("add_event", "Create a calendar event with a note")],
            ))
            .await
            .unwrap();
        let search = CatalogSearch::new(Arc::clone(&store));
        (store, search, dir)
    }

    fn all_enabled() -> HashSet<String> {
        ["notes", "calendar"].iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_exact_name_match_ranks_first() {
        let (_store, search, _dir) = populated_search().await;
        let hits = search.search("add_note", 10, &all_enabled());
        assert!(!hits.is_empty());
        assert_eq!(hits[0].server, "notes");
        assert_eq!(hits[0].action, "add_note");
    }

    #[tokio::test]
    async fn test_description_overlap_orders_results() {
        let (_store, search, _dir) = populated_search().await;
        // "create event" overlaps add_event's description on both terms,
        // add_note's on one.
        let hits = search.search("create event", 10, &all_enabled());
        assert_eq!(hits[0].action, "add_event");
        assert!(hits.iter().any(|h| h.action == "add_note"));
    }

    #[tokio::test]
    async fn test_server_name_breaks_ties() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CatalogStore::open(dir.path()).await.unwrap());
        store
            .put(entry("zeta", vec![schema("sync", "Synchronize state")]))
            .await
            .unwrap();
        store
            .put(entry("alpha", vec![schema("sync", "Synchronize state")]))
            .await
            .unwrap();
        let search = CatalogSearch::new(Arc::clone(&store));

        let enabled: HashSet<String> = ["alpha", "zeta"].iter().map(|s| s.to_string()).collect();
        let hits = search.search("sync", 10, &enabled);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].server, "alpha");
        assert_eq!(hits[1].server, "zeta");
    }

    #[tokio::test]
    async fn test_disabled_servers_never_surface() {
        let (_store, search, _dir) = populated_search().await;
        let only_calendar: HashSet<String> = ["calendar".to_string()].into_iter().collect();
        let hits = search.search("note", 10, &only_calendar);
        assert!(hits.iter().all(|h| h.server == "calendar"));
    }

    #[tokio::test]
    async fn test_index_reused_until_store_changes() {
        let (store, search, _dir) = populated_search().await;
        let first = search.current_index();
        let second = search.current_index();
        assert!(Arc::ptr_eq(&first, &second));

        store
            .put(entry("todo", vec![schema("add_task", "Track a task")]))
            .await
            .unwrap();
        let third = search.current_index();
        assert!(!Arc::ptr_eq(&first, &third));
    }

    #[tokio::test]
    async fn test_rebuild_server_replaces_only_that_slice() {
        let (store, search, _dir) = populated_search().await;
        // Materialize the index, then change one server.
        let enabled = all_enabled();
        assert!(!search.search("note", 10, &enabled).is_empty());

        store
            .put(entry("notes", vec![schema("pin_note", "Pin a note to the top")]))
            .await
            .unwrap();
        search.rebuild_server("notes");

        let hits = search.search("pin_note", 10, &enabled);
        assert_eq!(hits[0].action, "pin_note");
        // The old notes tools are gone; calendar is untouched.
        assert!(search
            .search("add_note", 10, &enabled)
            .iter()
            .all(|h| h.action != "add_note"));
        assert!(!search.search("add_event", 10, &enabled).is_empty());
    }

    #[tokio::test]
    async fn test_rebuild_after_invalidate_drops_server() {
        let (store, search, _dir) = populated_search().await;
        let enabled = all_enabled();
        assert!(!search.search("add_note", 10, &enabled).is_empty());

        store.invalidate("notes").await.unwrap();
        search.rebuild_server("notes");
        assert!(search
            .search("add_note", 10, &enabled)
            .iter()
            .all(|h| h.server != "notes"));
    }

    #[tokio::test]
    async fn test_blank_query_returns_nothing() {
        let (_store, search, _dir) = populated_search().await;
        assert!(search.search("   ", 10, &all_enabled()).is_empty());
    }

    #[tokio::test]
    async fn test_limit_is_respected() {
        let (_store, search, _dir) = populated_search().await;
        let hits = search.search("note", 1, &all_enabled());
        assert_eq!(hits.len(), 1);
    }
}
