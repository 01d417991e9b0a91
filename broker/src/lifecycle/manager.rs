//! JIT lifecycle manager.
//!
//! Owns every server handle, serializes start/stop per server, coalesces
//! concurrent connect attempts, and enforces at most one live transport per
//! server name. A successful connect refreshes the server's catalog entry,
//! so discovery and search keep working after the server is stopped again.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use crate::{
    catalog::{store::CatalogEntry, CatalogSearch, CatalogStore},
    config::{ServerConfig, ServerRegistry},
    error::{BrokerError, BrokerResult},
    lifecycle::handle::{ConnectionState, ServerHandle},
    transport::{ServerLauncher, ToolTransport},
};

/// Snapshot of one configured server for `list()`. Built from in-memory
/// state only.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub name: String,
    pub state: ConnectionState,
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

pub struct LifecycleManager {
    registry: Arc<ServerRegistry>,
    launcher: Arc<dyn ServerLauncher>,
    store: Arc<CatalogStore>,
    search: Arc<CatalogSearch>,
    handles: DashMap<String, Arc<ServerHandle>>,
    /// Recency order of connected servers, for `max_connected` eviction.
    /// Shared with launch tasks so registration survives caller
    /// cancellation.
    connected: Arc<Mutex<LruCache<String, ()>>>,
}

impl LifecycleManager {
    pub fn new(
        registry: Arc<ServerRegistry>,
        launcher: Arc<dyn ServerLauncher>,
        store: Arc<CatalogStore>,
        search: Arc<CatalogSearch>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            launcher,
            store,
            search,
            handles: DashMap::new(),
            connected: Arc::new(Mutex::new(LruCache::unbounded())),
        })
    }

    pub fn registry(&self) -> &Arc<ServerRegistry> {
        &self.registry
    }

    fn handle_for(&self, name: &str) -> Arc<ServerHandle> {
        if let Some(handle) = self.handles.get(name) {
            return Arc::clone(handle.value());
        }
        self.handles
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(ServerHandle::new(name)))
            .value()
            .clone()
    }

    pub fn state(&self, name: &str) -> ConnectionState {
        self.handles
            .get(name)
            .map(|h| h.state())
            .unwrap_or(ConnectionState::Disconnected)
    }

    /// Ensure the named server is connected. Idempotent: an already
    /// connected server returns immediately, and concurrent callers for the
    /// same server coalesce onto a single launch attempt.
    pub async fn connect(&self, name: &str) -> BrokerResult<()> {
        let config = self.registry.require_enabled(name)?;
        let handle = self.handle_for(name);

        loop {
            match handle.state() {
                ConnectionState::Connected => {
                    self.touch_recency(name, &handle);
                    return Ok(());
                }
                ConnectionState::Connecting | ConnectionState::Disconnecting => {
                    match handle.wait_settled().await {
                        ConnectionState::Connected => {
                            self.touch_recency(name, &handle);
                            return Ok(());
                        }
                        ConnectionState::Failed => return Err(self.attempt_error(name, &handle)),
                        _ => continue,
                    }
                }
                ConnectionState::Disconnected | ConnectionState::Failed => {
                    let guard = match handle.gate().try_lock_owned() {
                        Ok(guard) => guard,
                        Err(_) => {
                            // Another caller is mid-transition; adopt its
                            // outcome instead of starting a second attempt.
                            match handle.wait_settled().await {
                                ConnectionState::Connected => {
                                    self.touch_recency(name, &handle);
                                    return Ok(());
                                }
                                ConnectionState::Failed => {
                                    return Err(self.attempt_error(name, &handle))
                                }
                                _ => continue,
                            }
                        }
                    };
                    if handle.state() == ConnectionState::Connected {
                        self.touch_recency(name, &handle);
                        return Ok(());
                    }
                    handle.set_state(ConnectionState::Connecting);
                    self.reserve_capacity(name).await;
                    return self.launch(name, &handle, config, guard).await;
                }
            }
        }
    }

    /// Run the launch attempt in a spawned task so that cancelling one
    /// waiter never cancels the shared attempt; every waiter observes the
    /// outcome through the handle's state.
    async fn launch(
        &self,
        name: &str,
        handle: &Arc<ServerHandle>,
        config: ServerConfig,
        guard: OwnedMutexGuard<()>,
    ) -> BrokerResult<()> {
        let policy = self.registry.policy();
        let handshake_timeout = Duration::from_secs(policy.handshake_timeout_secs.max(1));
        let launcher = Arc::clone(&self.launcher);
        let store = Arc::clone(&self.store);
        let search = Arc::clone(&self.search);
        let connected = Arc::clone(&self.connected);
        let handle = Arc::clone(handle);
        let server = name.to_string();

        let attempt = tokio::spawn(async move {
            let _guard = guard;
            let launched =
                match tokio::time::timeout(handshake_timeout, launcher.launch(&server, &config)).await {
                    Ok(result) => result,
                    Err(_) => Err(BrokerError::HandshakeFailed {
                        server: server.clone(),
                        message: format!(
                            "handshake did not complete within {}s",
                            handshake_timeout.as_secs()
                        ),
                    }),
                };

            match launched {
                Ok(transport) => {
                    handle.install_transport(Arc::clone(&transport));
                    handle.set_last_error(None);
                    handle.touch();
                    connected.lock().put(server.clone(), ());
                    handle.set_state(ConnectionState::Connected);
                    info!("connected to server '{}'", server);

                    // Catalog refresh is best-effort: a store failure
                    // degrades discovery, it does not undo the connect.
                    if let Err(e) =
                        refresh_entry(&store, &search, &server, &config, transport.as_ref()).await
                    {
                        warn!("catalog refresh for '{}' failed: {}", server, e);
                    }
                    Ok(())
                }
                Err(e) => {
                    connected.lock().pop(server.as_str());
                    handle.set_last_error(Some(e.clone()));
                    handle.set_state(ConnectionState::Failed);
                    warn!("connect to server '{}' failed: {}", server, e);
                    Err(e)
                }
            }
        });

        attempt.await.unwrap_or_else(|e| {
            self.connected.lock().pop(name);
            Err(BrokerError::LaunchFailed {
                server: name.to_string(),
                message: format!("connect task aborted: {}", e),
            })
        })
    }

    fn attempt_error(&self, name: &str, handle: &ServerHandle) -> BrokerError {
        handle.last_error().unwrap_or_else(|| BrokerError::LaunchFailed {
            server: name.to_string(),
            message: "connect attempt failed".to_string(),
        })
    }

    /// Claim a connection slot for `name`, disconnecting least-recently-used
    /// servers until the claim fits under `max_connected`. Claiming under
    /// the recency lock keeps concurrent connects from overshooting the
    /// limit; a failed launch releases the claim.
    async fn reserve_capacity(&self, name: &str) {
        let max = self.registry.policy().max_connected;
        if max == 0 {
            return;
        }
        loop {
            let victim = {
                let mut lru = self.connected.lock();
                if lru.len() < max {
                    lru.put(name.to_string(), ());
                    return;
                }
                lru.pop_lru().map(|(victim, _)| victim)
            };
            let Some(victim) = victim else { return };
            info!("evicting least-recently-used server '{}'", victim);
            if let Err(e) = self.disconnect(&victim).await {
                warn!("eviction of '{}' reported: {}", victim, e);
            }
        }
    }

    /// Release the server's transport and return the handle to
    /// `Disconnected`. Idempotent; teardown errors are logged, never leaked
    /// back as a stuck handle.
    pub async fn disconnect(&self, name: &str) -> BrokerResult<()> {
        let Some(handle) = self.handles.get(name).map(|h| Arc::clone(h.value())) else {
            return Ok(());
        };
        let gate = handle.gate();
        let _guard = gate.lock().await;

        if handle.state() == ConnectionState::Disconnected {
            return Ok(());
        }
        handle.set_state(ConnectionState::Disconnecting);
        self.connected.lock().pop(name);
        if let Some(transport) = handle.take_transport() {
            if let Err(e) = transport.close().await {
                warn!("teardown of '{}' reported: {}", name, e);
            }
        }
        handle.set_state(ConnectionState::Disconnected);
        info!("disconnected server '{}'", name);
        Ok(())
    }

    /// Status of every configured server. Reads in-memory state only and
    /// never suspends on server I/O.
    pub fn list(&self) -> Vec<ServerStatus> {
        self.registry
            .server_names()
            .into_iter()
            .map(|name| {
                let enabled = self.registry.get(&name).map(|c| c.enabled).unwrap_or(false);
                match self.handles.get(&name) {
                    Some(handle) => {
                        let state = handle.state();
                        ServerStatus {
                            state,
                            enabled,
                            last_activity: (state == ConnectionState::Connected)
                                .then(|| handle.last_activity())
                                .flatten(),
                            last_error: (state == ConnectionState::Failed)
                                .then(|| handle.last_error().map(|e| e.to_string()))
                                .flatten(),
                            name,
                        }
                    }
                    None => ServerStatus {
                        state: ConnectionState::Disconnected,
                        enabled,
                        last_activity: None,
                        last_error: None,
                        name,
                    },
                }
            })
            .collect()
    }

    /// Invoke one action, connecting first when policy allows it.
    pub async fn execute(
        &self,
        name: &str,
        action: &str,
        args: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> BrokerResult<serde_json::Value> {
        let policy = self.registry.policy();
        self.registry.require_enabled(name)?;
        let handle = self.handle_for(name);

        let mut attempts = 0;
        let transport = loop {
            let live = (handle.state() == ConnectionState::Connected)
                .then(|| handle.transport())
                .flatten();
            if let Some(transport) = live {
                break transport;
            }
            if !policy.connect_on_demand {
                return Err(BrokerError::NotConnected(name.to_string()));
            }
            attempts += 1;
            if attempts > 2 {
                return Err(BrokerError::ServerUnavailable(format!(
                    "server '{}' did not stay connected",
                    name
                )));
            }
            self.connect(name).await?;
        };

        handle.touch();
        self.touch_recency(name, &handle);

        let timeout = Duration::from_secs(policy.execute_timeout_secs.max(1));
        match tokio::time::timeout(timeout, transport.invoke(action, args)).await {
            // A slow call alone is not evidence the transport is broken, so
            // the handle stays connected.
            Err(_) => Err(BrokerError::Timeout(format!(
                "action '{}' on '{}' did not complete within {}s",
                action,
                name,
                timeout.as_secs()
            ))),
            Ok(Ok(value)) => {
                handle.touch();
                Ok(value)
            }
            Ok(Err(e @ BrokerError::ServerUnavailable(_))) => {
                self.mark_failed(&handle, &transport, e.clone()).await;
                Err(e)
            }
            Ok(Err(e)) => Err(e),
        }
    }

    /// The transport died mid-session: record the error and move the handle
    /// to `Failed`, unless a newer transport has already replaced this one.
    async fn mark_failed(
        &self,
        handle: &Arc<ServerHandle>,
        observed: &Arc<dyn ToolTransport>,
        error: BrokerError,
    ) {
        let gate = handle.gate();
        let _guard = gate.lock().await;
        let current = handle.transport();
        let same = current.map_or(false, |t| Arc::ptr_eq(&t, observed));
        if !same {
            return;
        }
        if let Some(transport) = handle.take_transport() {
            let _ = transport.close().await;
        }
        self.connected.lock().pop(handle.name());
        handle.set_last_error(Some(error));
        handle.set_state(ConnectionState::Failed);
        warn!("server '{}' marked failed", handle.name());
    }

    /// Refresh the catalog entry for a connected server. Returns whether the
    /// stored entry changed; unchanged schemas leave the entry and the
    /// search index untouched.
    pub async fn refresh_catalog(&self, name: &str) -> BrokerResult<bool> {
        let config = self.registry.require_enabled(name)?;
        let handle = self.handle_for(name);
        let transport = (handle.state() == ConnectionState::Connected)
            .then(|| handle.transport())
            .flatten()
            .ok_or_else(|| BrokerError::NotConnected(name.to_string()))?;
        refresh_entry(&self.store, &self.search, name, &config, transport.as_ref()).await
    }

    /// Re-read the configuration. Connected servers whose launch spec is
    /// unchanged keep their transport; removed, disabled, or changed ones
    /// are disconnected.
    pub async fn reload(&self) -> BrokerResult<()> {
        let before = self.registry.snapshot_servers();
        self.registry.reload().await?;

        let names: Vec<String> = self.handles.iter().map(|e| e.key().clone()).collect();
        for name in names {
            if self.state(&name) == ConnectionState::Disconnected {
                continue;
            }
            let keep = match self.registry.get(&name) {
                Some(new) if new.enabled => before.get(&name) == Some(&new),
                _ => false,
            };
            if !keep {
                info!("config for '{}' changed on reload, disconnecting", name);
                let _ = self.disconnect(&name).await;
            }
        }
        Ok(())
    }

    /// Periodically disconnect servers idle past the configured timeout.
    pub fn spawn_idle_reaper(self: Arc<Self>) -> Option<tokio::task::JoinHandle<()>> {
        let idle_secs = self.registry.policy().idle_timeout_secs;
        if idle_secs == 0 {
            return None;
        }
        let manager = self;
        Some(tokio::spawn(async move {
            let sweep = Duration::from_secs((idle_secs / 2).max(1));
            let mut interval = tokio::time::interval(sweep);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let cutoff = Duration::from_secs(idle_secs);
                let idle: Vec<String> = manager
                    .handles
                    .iter()
                    .filter(|entry| {
                        entry.value().state() == ConnectionState::Connected
                            && entry.value().idle_for().map_or(false, |d| d >= cutoff)
                    })
                    .map(|entry| entry.key().clone())
                    .collect();
                for name in idle {
                    debug!("disconnecting idle server '{}'", name);
                    let _ = manager.disconnect(&name).await;
                }
            }
        }))
    }

    /// Force-disconnect everything. Called on broker shutdown so no server
    /// subprocess outlives the manager.
    pub async fn shutdown(&self) {
        let names: Vec<String> = self.handles.iter().map(|e| e.key().clone()).collect();
        for name in names {
            if let Err(e) = self.disconnect(&name).await {
                warn!("shutdown disconnect of '{}' reported: {}", name, e);
            }
        }
    }

    fn touch_recency(&self, name: &str, handle: &ServerHandle) {
        handle.touch();
        self.connected.lock().get(name);
    }
}

/// Fetch current schemas over the transport and store them when the
/// freshness token moved. The only path that mutates the catalog.
async fn refresh_entry(
    store: &CatalogStore,
    search: &CatalogSearch,
    server: &str,
    config: &ServerConfig,
    transport: &dyn ToolTransport,
) -> BrokerResult<bool> {
    let tools = transport.list_actions().await?;
    let config_digest = config.digest();
    let token = crate::catalog::freshness_token(&config_digest, &tools);

    if let Some(existing) = store.get(server) {
        if existing.freshness == token {
            debug!("catalog entry for '{}' is fresh, skipping rewrite", server);
            return Ok(false);
        }
    }

    let entry = CatalogEntry::new(server.to_string(), tools, config_digest);
    store.put(entry).await?;
    search.rebuild_server(server);
    Ok(true)
}

#[cfg(test)]
mod tests {
    use std::{
        collections::{HashMap, HashSet},
        sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    };

    use async_trait::async_trait;

    use super::*;
    use crate::{
        catalog::ToolSchema,
        config::{BrokerConfig, BrokerPolicy},
    };

    struct MockTransport {
        id: usize,
        tools: Vec<ToolSchema>,
        closed: AtomicBool,
        dead: AtomicBool,
        invoke_delay: Duration,
        invocations: AtomicUsize,
    }

    #[async_trait]
    impl ToolTransport for MockTransport {
        async fn list_actions(&self) -> BrokerResult<Vec<ToolSchema>> {
            Ok(self.tools.clone())
        }

        async fn invoke(
            &self,
            action: &str,
            _args: Option<serde_json::Map<String, serde_json::Value>>,
        ) -> BrokerResult<serde_json::Value> {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            if !self.invoke_delay.is_zero() {
                tokio::time::sleep(self.invoke_delay).await;
            }
            if self.dead.load(Ordering::SeqCst) {
                return Err(BrokerError::ServerUnavailable("pipe closed".into()));
            }
            Ok(serde_json::json!({"action": action, "transport": self.id}))
        }

        async fn close(&self) -> BrokerResult<()> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct MockLauncher {
        launches: AtomicUsize,
        launch_delay: Duration,
        fail_launch: AtomicBool,
        invoke_delay: parking_lot::Mutex<Duration>,
        tools: Vec<ToolSchema>,
        transports: parking_lot::Mutex<Vec<Arc<MockTransport>>>,
    }

    impl MockLauncher {
        fn new(tools: Vec<ToolSchema>) -> Arc<Self> {
            Self::with_launch_delay(tools, Duration::from_millis(30))
        }

        fn with_launch_delay(tools: Vec<ToolSchema>, launch_delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                launches: AtomicUsize::new(0),
                launch_delay,
                fail_launch: AtomicBool::new(false),
                invoke_delay: parking_lot::Mutex::new(Duration::ZERO),
                tools,
                transports: parking_lot::Mutex::new(Vec::new()),
            })
        }

        fn launch_count(&self) -> usize {
            self.launches.load(Ordering::SeqCst)
        }

        fn transport(&self, index: usize) -> Arc<MockTransport> {
            Arc::clone(&self.transports.lock()[index])
        }
    }

    #[async_trait]
    impl ServerLauncher for MockLauncher {
        async fn launch(
            &self,
            name: &str,
            _config: &ServerConfig,
        ) -> BrokerResult<Arc<dyn ToolTransport>> {
            tokio::time::sleep(self.launch_delay).await;
            if self.fail_launch.load(Ordering::SeqCst) {
                return Err(BrokerError::LaunchFailed {
                    server: name.to_string(),
                    message: "spawn refused".into(),
                });
            }
            let id = self.launches.fetch_add(1, Ordering::SeqCst);
            let transport = Arc::new(MockTransport {
                id,
                tools: self.tools.clone(),
                closed: AtomicBool::new(false),
                dead: AtomicBool::new(false),
                invoke_delay: *self.invoke_delay.lock(),
                invocations: AtomicUsize::new(0),
            });
            self.transports.lock().push(Arc::clone(&transport));
            Ok(transport)
        }
    }

    fn server(command: &str, enabled: bool) -> ServerConfig {
        ServerConfig {
            command: command.to_string(),
            args: vec![],
            env: HashMap::new(),
            enabled,
        }
    }

    fn registry(policy: BrokerPolicy) -> Arc<ServerRegistry> {
        let mut servers = HashMap::new();
        for name in ["alpha", "beta", "gamma"] {
            servers.insert(name.to_string(), server(&format!("{name}-server"), true));
        }
        servers.insert("paused".to_string(), server("paused-server", false));
        Arc::new(ServerRegistry::from_config(BrokerConfig {
            servers,
            policy,
            ..Default::default()
        }))
    }

    fn sample_tools() -> Vec<ToolSchema> {
        vec![
            ToolSchema::new(
                "rotate_logs",
                Some("Rotate server log files".into()),
                serde_json::json!({"type": "object"}),
            ),
            ToolSchema::new(
                "tail_logs",
                Some("Stream recent log lines".into()),
                serde_json::json!({"type": "object"}),
            ),
        ]
    }

    struct Fixture {
        manager: Arc<LifecycleManager>,
        launcher: Arc<MockLauncher>,
        store: Arc<CatalogStore>,
        search: Arc<CatalogSearch>,
        _dir: tempfile::TempDir,
    }

    async fn fixture(policy: BrokerPolicy) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CatalogStore::open(dir.path()).await.unwrap());
        let search = Arc::new(CatalogSearch::new(Arc::clone(&store)));
        let launcher = MockLauncher::new(sample_tools());
        let manager = LifecycleManager::new(
            registry(policy),
            Arc::clone(&launcher) as Arc<dyn ServerLauncher>,
            Arc::clone(&store),
            Arc::clone(&search),
        );
        Fixture {
            manager,
            launcher,
            store,
            search,
            _dir: dir,
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_concurrent_connects_coalesce() {
        let fx = fixture(BrokerPolicy::default()).await;
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let manager = Arc::clone(&fx.manager);
            tasks.push(tokio::spawn(async move { manager.connect("alpha").await }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(fx.launcher.launch_count(), 1);
        assert_eq!(fx.manager.state("alpha"), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let fx = fixture(BrokerPolicy::default()).await;
        fx.manager.connect("alpha").await.unwrap();
        fx.manager.connect("alpha").await.unwrap();
        assert_eq!(fx.launcher.launch_count(), 1);
    }

    #[tokio::test]
    async fn test_connect_unknown_and_disabled() {
        let fx = fixture(BrokerPolicy::default()).await;
        assert!(matches!(
            fx.manager.connect("ghost").await,
            Err(BrokerError::ConfigNotFound(_))
        ));
        assert!(matches!(
            fx.manager.connect("paused").await,
            Err(BrokerError::ConfigDisabled(_))
        ));
        assert_eq!(fx.launcher.launch_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_launch_is_recorded_and_retryable() {
        let fx = fixture(BrokerPolicy::default()).await;
        fx.launcher.fail_launch.store(true, Ordering::SeqCst);

        let err = fx.manager.connect("alpha").await.unwrap_err();
        assert!(matches!(err, BrokerError::LaunchFailed { .. }));
        assert_eq!(fx.manager.state("alpha"), ConnectionState::Failed);

        // No automatic retry, but the next explicit connect attempts again.
        fx.launcher.fail_launch.store(false, Ordering::SeqCst);
        fx.manager.connect("alpha").await.unwrap();
        assert_eq!(fx.manager.state("alpha"), ConnectionState::Connected);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cancelled_waiter_does_not_cancel_shared_attempt() {
        let fx = fixture(BrokerPolicy::default()).await;
        let first = {
            let manager = Arc::clone(&fx.manager);
            tokio::spawn(async move { manager.connect("alpha").await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        first.abort();

        // The detached attempt completes on its own; a later caller adopts
        // it instead of launching a second process.
        fx.manager.connect("alpha").await.unwrap();
        assert_eq!(fx.launcher.launch_count(), 1);
        assert_eq!(fx.manager.state("alpha"), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent_and_releases_transport() {
        let fx = fixture(BrokerPolicy::default()).await;
        fx.manager.connect("alpha").await.unwrap();
        fx.manager.disconnect("alpha").await.unwrap();
        fx.manager.disconnect("alpha").await.unwrap();
        fx.manager.disconnect("never-connected").await.unwrap();

        assert_eq!(fx.manager.state("alpha"), ConnectionState::Disconnected);
        assert!(fx.launcher.transport(0).closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_reconnect_never_reuses_prior_transport() {
        let fx = fixture(BrokerPolicy::default()).await;
        fx.manager.connect("alpha").await.unwrap();
        fx.manager.disconnect("alpha").await.unwrap();
        fx.manager.connect("alpha").await.unwrap();

        assert_eq!(fx.launcher.launch_count(), 2);
        let result = fx.manager.execute("alpha", "rotate_logs", None).await.unwrap();
        assert_eq!(result["transport"], 1);
    }

    #[tokio::test]
    async fn test_execute_connects_on_demand() {
        let fx = fixture(BrokerPolicy::default()).await;
        let result = fx.manager.execute("alpha", "rotate_logs", None).await.unwrap();
        assert_eq!(result["action"], "rotate_logs");
        assert_eq!(fx.launcher.launch_count(), 1);
        assert_eq!(fx.manager.state("alpha"), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_execute_fails_fast_when_policy_forbids() {
        let policy = BrokerPolicy {
            connect_on_demand: false,
            ..Default::default()
        };
        let fx = fixture(policy).await;
        assert!(matches!(
            fx.manager.execute("alpha", "rotate_logs", None).await,
            Err(BrokerError::NotConnected(_))
        ));
        assert_eq!(fx.launcher.launch_count(), 0);
    }

    #[tokio::test]
    async fn test_execute_timeout_leaves_server_connected() {
        let policy = BrokerPolicy {
            execute_timeout_secs: 1,
            ..Default::default()
        };
        let fx = fixture(policy).await;
        *fx.launcher.invoke_delay.lock() = Duration::from_millis(1500);

        let err = fx.manager.execute("alpha", "rotate_logs", None).await.unwrap_err();
        assert!(matches!(err, BrokerError::Timeout(_)));
        // Slow but alive: the handle is not torn down.
        assert_eq!(fx.manager.state("alpha"), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_dead_transport_fails_handle() {
        let fx = fixture(BrokerPolicy::default()).await;
        fx.manager.connect("alpha").await.unwrap();
        fx.launcher.transport(0).dead.store(true, Ordering::SeqCst);

        let err = fx.manager.execute("alpha", "rotate_logs", None).await.unwrap_err();
        assert!(matches!(err, BrokerError::ServerUnavailable(_)));
        assert_eq!(fx.manager.state("alpha"), ConnectionState::Failed);

        let listed = fx.manager.list();
        let alpha = listed.iter().find(|s| s.name == "alpha").unwrap();
        assert_eq!(alpha.state, ConnectionState::Failed);
        assert!(alpha.last_error.as_deref().unwrap().contains("pipe closed"));
    }

    #[tokio::test]
    async fn test_handshake_timeout_maps_to_handshake_failed() {
        let policy = BrokerPolicy {
            handshake_timeout_secs: 1,
            ..Default::default()
        };
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CatalogStore::open(dir.path()).await.unwrap());
        let search = Arc::new(CatalogSearch::new(Arc::clone(&store)));
        // Launch slower than the handshake budget.
        let launcher = MockLauncher::with_launch_delay(sample_tools(), Duration::from_millis(1500));
        let manager = LifecycleManager::new(
            registry(policy),
            Arc::clone(&launcher) as Arc<dyn ServerLauncher>,
            store,
            search,
        );

        let err = manager.connect("alpha").await.unwrap_err();
        assert!(matches!(err, BrokerError::HandshakeFailed { .. }));
        assert_eq!(manager.state("alpha"), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn test_eviction_disconnects_exactly_the_lru_server() {
        let policy = BrokerPolicy {
            max_connected: 2,
            ..Default::default()
        };
        let fx = fixture(policy).await;
        fx.manager.connect("alpha").await.unwrap();
        fx.manager.connect("beta").await.unwrap();
        // Touch alpha so beta becomes least recently used.
        fx.manager.execute("alpha", "rotate_logs", None).await.unwrap();

        fx.manager.connect("gamma").await.unwrap();

        assert_eq!(fx.manager.state("beta"), ConnectionState::Disconnected);
        assert_eq!(fx.manager.state("alpha"), ConnectionState::Connected);
        assert_eq!(fx.manager.state("gamma"), ConnectionState::Connected);
        assert!(fx.launcher.transport(1).closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_connect_refreshes_catalog_and_refresh_is_idempotent() {
        let fx = fixture(BrokerPolicy::default()).await;
        fx.manager.connect("alpha").await.unwrap();

        let entry = fx.store.get("alpha").unwrap();
        assert_eq!(entry.tools.len(), 2);
        let generation = fx.store.generation();

        // Unchanged schemas: no rewrite, no index rebuild trigger.
        let changed = fx.manager.refresh_catalog("alpha").await.unwrap();
        assert!(!changed);
        assert_eq!(fx.store.generation(), generation);
        assert_eq!(fx.store.get("alpha").unwrap().freshness, entry.freshness);
    }

    #[tokio::test]
    async fn test_refresh_requires_connected_server() {
        let fx = fixture(BrokerPolicy::default()).await;
        assert!(matches!(
            fx.manager.refresh_catalog("alpha").await,
            Err(BrokerError::NotConnected(_))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_disconnects_everything() {
        let fx = fixture(BrokerPolicy::default()).await;
        fx.manager.connect("alpha").await.unwrap();
        fx.manager.connect("beta").await.unwrap();

        fx.manager.shutdown().await;

        assert_eq!(fx.manager.state("alpha"), ConnectionState::Disconnected);
        assert_eq!(fx.manager.state("beta"), ConnectionState::Disconnected);
        assert!(fx.launcher.transport(0).closed.load(Ordering::SeqCst));
        assert!(fx.launcher.transport(1).closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_reload_disconnects_only_changed_servers() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("servers.json");
        tokio::fs::write(
            &config_path,
            r#"{"servers": {
                "alpha": {"command": "alpha-server"},
                "beta": {"command": "beta-server"}
            }}"#,
        )
        .await
        .unwrap();
        let registry = Arc::new(ServerRegistry::load(&config_path).await.unwrap());
        let store = Arc::new(CatalogStore::open(dir.path().join("catalog")).await.unwrap());
        let search = Arc::new(CatalogSearch::new(Arc::clone(&store)));
        let launcher = MockLauncher::new(sample_tools());
        let manager = LifecycleManager::new(
            registry,
            Arc::clone(&launcher) as Arc<dyn ServerLauncher>,
            store,
            search,
        );

        manager.connect("alpha").await.unwrap();
        manager.connect("beta").await.unwrap();

        // beta's launch spec changes, alpha's does not.
        tokio::fs::write(
            &config_path,
            r#"{"servers": {
                "alpha": {"command": "alpha-server"},
                "beta": {"command": "beta-server", "args": ["--fast"]}
            }}"#,
        )
        .await
        .unwrap();
        manager.reload().await.unwrap();

        assert_eq!(manager.state("alpha"), ConnectionState::Connected);
        assert_eq!(manager.state("beta"), ConnectionState::Disconnected);

        // The next connect picks up the new spec.
        manager.connect("beta").await.unwrap();
        assert_eq!(launcher.launch_count(), 3);
    }

    #[tokio::test]
    async fn test_end_to_end_lifecycle_and_offline_search() {
        let fx = fixture(BrokerPolicy::default()).await;

        // Disabled server refuses to connect.
        assert!(matches!(
            fx.manager.connect("paused").await,
            Err(BrokerError::ConfigDisabled(_))
        ));

        // Enabled server connects and populates the catalog.
        fx.manager.connect("alpha").await.unwrap();
        assert_eq!(fx.manager.state("alpha"), ConnectionState::Connected);
        fx.manager.disconnect("alpha").await.unwrap();

        // Search answers from the catalog with zero servers connected.
        let enabled: HashSet<String> = fx.manager.registry().enabled_names();
        let hits = fx.search.search("rotate_logs", 10, &enabled);
        assert_eq!(hits[0].server, "alpha");
        assert_eq!(hits[0].action, "rotate_logs");

        let listed = fx.manager.list();
        let alpha = listed.iter().find(|s| s.name == "alpha").unwrap();
        assert_eq!(alpha.state, ConnectionState::Disconnected);
        assert!(fx.launcher.transport(0).closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_list_never_blocks_and_covers_all_configured() {
        let fx = fixture(BrokerPolicy::default()).await;
        fx.manager.connect("alpha").await.unwrap();

        let listed = fx.manager.list();
        assert_eq!(listed.len(), 4);
        let alpha = listed.iter().find(|s| s.name == "alpha").unwrap();
        assert_eq!(alpha.state, ConnectionState::Connected);
        assert!(alpha.last_activity.is_some());
        let paused = listed.iter().find(|s| s.name == "paused").unwrap();
        assert!(!paused.enabled);
        assert_eq!(paused.state, ConnectionState::Disconnected);
    }
}
