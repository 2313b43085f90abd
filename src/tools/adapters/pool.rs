//! Process-wide connection pools shared by the HTTP and MCP adapters
//! (spec.md §4.10, §5, §9: "map from a structural key to a pooled
//! resource guarded by a single mutex during lookup").

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::Duration;

use super::mcp::McpClient;

/// Pool of `reqwest::Client`s keyed by timeout, so adapters sharing a
/// timeout reuse one connection-pooled client instead of constructing a
/// fresh one per invocation (spec.md §4.10 "HTTP adapter").
#[derive(Default)]
pub struct HttpClientPool {
    clients: Mutex<FxHashMap<Duration, reqwest::Client>>,
}

impl HttpClientPool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn get(&self, timeout: Duration) -> Result<reqwest::Client, reqwest::Error> {
        // Lock is held only for the map lookup/insert; the returned client
        // is itself concurrency-safe and all I/O happens outside the lock.
        let mut clients = self.clients.lock();
        if let Some(client) = clients.get(&timeout) {
            return Ok(client.clone());
        }
        let client = reqwest::Client::builder().timeout(timeout).pool_max_idle_per_host(32).build()?;
        clients.insert(timeout, client.clone());
        Ok(client)
    }
}

/// Structural key identifying a distinct MCP client: tools sharing the
/// same transport/config/overlay reuse one already-initialized client
/// (spec.md §4.10 "MCP adapter").
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct McpClientKey {
    pub name: String,
    pub transport: String,
    pub config_hash: u64,
    pub overlay_path: Option<String>,
}

/// Pool of MCP clients keyed by [`McpClientKey`], bounded by
/// `PETALFLOW_MCP_POOL_SIZE` (spec.md §6).
pub struct McpClientPool {
    clients: Mutex<FxHashMap<McpClientKey, Arc<McpClient>>>,
    max_size: usize,
}

impl McpClientPool {
    pub fn new(max_size: usize) -> Arc<Self> {
        Arc::new(Self {
            clients: Mutex::new(FxHashMap::default()),
            max_size: max_size.clamp(1, 32),
        })
    }

    /// Looks up an existing client for `key`, or inserts one built by
    /// `build` if the pool has room. The build closure runs outside the
    /// lock only when no entry exists yet and the pool is not full;
    /// construction itself (a process spawn or socket connect) is not
    /// under the lock once inserted — callers re-check after awaiting.
    pub fn get_or_insert(&self, key: McpClientKey, client: Arc<McpClient>) -> Arc<McpClient> {
        let mut clients = self.clients.lock();
        if let Some(existing) = clients.get(&key) {
            return existing.clone();
        }
        if clients.len() >= self.max_size {
            // Pool is full: serve this invocation its own client without
            // caching it, rather than blocking or evicting an active entry.
            return client;
        }
        clients.insert(key, client.clone());
        client
    }

    pub fn lookup(&self, key: &McpClientKey) -> Option<Arc<McpClient>> {
        self.clients.lock().get(key).cloned()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }
}

/// Reads `PETALFLOW_MCP_POOL_SIZE`, defaulting to 4 and capping at 32
/// (spec.md §6).
pub fn mcp_pool_size_from_env() -> usize {
    std::env::var("PETALFLOW_MCP_POOL_SIZE")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(4)
        .min(32)
}
