//! Pre-scanned TCP port pools.
//!
//! Every service addresses ports by name only; the pool manager is the
//! single owner of the service-name → port mapping. Pools are filled once
//! at startup by probing configured ranges, drained on allocation and
//! refilled at the tail on release. There are no hardcoded ports outside
//! the range loader and no silent fallbacks: exhaustion is an explicit
//! error, and the OS-assigned ephemeral path must be opted into.

use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    path::Path,
    sync::Mutex,
    time::Duration,
};

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::watch,
};
use tracing::{debug, info, warn};
use ts_rs::TS;

/// Pool names recognized by the range loader.
pub const MEMORY_SERVICE_POOL: &str = "memory-service";
pub const BACKEND_POOL: &str = "backend-service";
pub const TERMINALS_POOL: &str = "terminals";
pub const DEBUG_SERVER_POOL: &str = "debug-server";

/// Concurrent bind probes during the initial scan.
const SCAN_FAN_OUT: usize = 10;

/// Per-port probe budget during the scan.
const SCAN_PROBE_TIMEOUT: Duration = Duration::from_millis(50);

/// Budget for the liveness probe on idempotent re-allocation.
const REALLOC_PROBE_TIMEOUT: Duration = Duration::from_millis(250);

#[derive(Debug, Error)]
pub enum PortPoolError {
    #[error("No port range configuration available: {0}")]
    ScanConfig(String),

    #[error("No port available in pool '{0}'")]
    NoPortAvailable(String),

    #[error("Unknown pool: {0}")]
    UnknownPool(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One configured scan range. Numeric port literals appear only in
/// [`PortRange::defaults`] and in user-supplied configuration.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct PortRange {
    pub pool: String,
    pub start: u16,
    pub end: u16,
    pub pool_size: usize,
    #[serde(default)]
    pub priority: u8,
}

/// Shape of the optional `ports.yaml` override file.
#[derive(Debug, Deserialize)]
struct PortConfigFile {
    pools: Vec<PortRange>,
}

impl PortRange {
    /// Environment prefix for a pool name: uppercased, hyphens to
    /// underscores (`memory-service` → `MEMORY_SERVICE`).
    fn env_prefix(pool: &str) -> String {
        pool.to_uppercase().replace('-', "_")
    }

    fn from_env(pool: &str, default: PortRange) -> PortRange {
        let prefix = Self::env_prefix(pool);
        let read = |suffix: &str| {
            std::env::var(format!("{prefix}_{suffix}"))
                .ok()
                .and_then(|v| v.trim().parse::<u32>().ok())
        };

        PortRange {
            pool: pool.to_string(),
            start: read("PORT_START").map(|v| v as u16).unwrap_or(default.start),
            end: read("PORT_END").map(|v| v as u16).unwrap_or(default.end),
            pool_size: read("POOL_SIZE")
                .map(|v| v as usize)
                .unwrap_or(default.pool_size),
            priority: default.priority,
        }
    }

    /// Documented default ranges, used when the environment supplies
    /// nothing. This is the only place the core names specific ports.
    fn defaults() -> Vec<PortRange> {
        vec![
            PortRange {
                pool: MEMORY_SERVICE_POOL.to_string(),
                start: 37650,
                end: 37699,
                pool_size: 5,
                priority: 1,
            },
            PortRange {
                pool: BACKEND_POOL.to_string(),
                start: 37700,
                end: 37749,
                pool_size: 5,
                priority: 1,
            },
            PortRange {
                pool: TERMINALS_POOL.to_string(),
                start: 37800,
                end: 37899,
                pool_size: 20,
                priority: 2,
            },
            PortRange {
                pool: DEBUG_SERVER_POOL.to_string(),
                start: 37900,
                end: 37949,
                pool_size: 3,
                priority: 3,
            },
        ]
    }

    fn validate(&self) -> Result<(), PortPoolError> {
        if self.start < 1024 {
            return Err(PortPoolError::ScanConfig(format!(
                "pool '{}' starts below 1024 ({})",
                self.pool, self.start
            )));
        }
        if self.end < self.start {
            return Err(PortPoolError::ScanConfig(format!(
                "pool '{}' has an empty range ({}-{})",
                self.pool, self.start, self.end
            )));
        }
        if self.pool_size == 0 {
            return Err(PortPoolError::ScanConfig(format!(
                "pool '{}' has zero desired size",
                self.pool
            )));
        }
        Ok(())
    }
}

/// Load the effective range configuration: defaults, overridden by
/// environment variables, overridden by `ports.yaml` when present.
pub fn load_port_ranges(config_file: Option<&Path>) -> Result<Vec<PortRange>, PortPoolError> {
    let mut ranges: Vec<PortRange> = PortRange::defaults()
        .into_iter()
        .map(|d| PortRange::from_env(&d.pool.clone(), d))
        .collect();

    if let Some(path) = config_file
        && path.exists()
    {
        let raw = std::fs::read_to_string(path)?;
        let file: PortConfigFile = serde_yaml::from_str(&raw)
            .map_err(|e| PortPoolError::ScanConfig(format!("invalid ports.yaml: {e}")))?;
        for override_range in file.pools {
            match ranges.iter_mut().find(|r| r.pool == override_range.pool) {
                Some(existing) => *existing = override_range,
                None => ranges.push(override_range),
            }
        }
    }

    if ranges.is_empty() {
        return Err(PortPoolError::ScanConfig(
            "no port ranges configured".to_string(),
        ));
    }
    for range in &ranges {
        range.validate()?;
    }
    Ok(ranges)
}

/// Read-only snapshot of the manager's state.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct PortPoolDiagnostics {
    pub scan_complete: bool,
    /// Available ports per pool.
    pub pools: BTreeMap<String, usize>,
    /// Current service-name → port allocation table.
    pub allocations: BTreeMap<String, u16>,
    /// Ports handed out by the OS through the ephemeral path.
    pub ephemeral: Vec<u16>,
    pub allocation_failures: u64,
    pub scan_probe_failures: u64,
}

#[derive(Debug, Clone)]
struct Allocation {
    port: u16,
    pool: String,
}

#[derive(Default)]
struct PoolState {
    pools: HashMap<String, VecDeque<u16>>,
    allocations: HashMap<String, Allocation>,
    /// Last port released per service; never re-issued to the same
    /// service back-to-back within one boot.
    tombstones: HashMap<String, u16>,
    ephemeral: Vec<u16>,
    allocation_failures: u64,
    scan_probe_failures: u64,
}

/// The port pool manager (C1). One instance per process, owned by the
/// supervisor and initialized during the `supervisor` boot step.
pub struct PortPool {
    state: Mutex<PoolState>,
    scan_done_tx: watch::Sender<bool>,
    scan_done_rx: watch::Receiver<bool>,
}

impl Default for PortPool {
    fn default() -> Self {
        Self::new()
    }
}

impl PortPool {
    pub fn new() -> Self {
        let (scan_done_tx, scan_done_rx) = watch::channel(false);
        Self {
            state: Mutex::new(PoolState::default()),
            scan_done_tx,
            scan_done_rx,
        }
    }

    /// One-time parallel scan of every configured range.
    ///
    /// Probes candidate ports with bounded fan-out until each pool holds
    /// `pool_size` bindable ports or its range is exhausted, then latches
    /// the scan-done condition.
    pub async fn initialize(&self, ranges: Vec<PortRange>) -> Result<(), PortPoolError> {
        if *self.scan_done_rx.borrow() {
            warn!("Port scan already completed; ignoring re-initialization");
            return Ok(());
        }
        if ranges.is_empty() {
            return Err(PortPoolError::ScanConfig(
                "no port ranges configured".to_string(),
            ));
        }

        let mut ranges = ranges;
        ranges.sort_by_key(|r| r.priority);

        let mut claimed: HashSet<u16> = HashSet::new();
        for range in &ranges {
            range.validate()?;
            let candidates: Vec<u16> = (range.start..=range.end)
                .filter(|p| !claimed.contains(p))
                .collect();

            let mut probes = futures::stream::iter(candidates)
                .map(|port| async move { (port, probe_bindable(port).await) })
                .buffered(SCAN_FAN_OUT);

            let mut found: VecDeque<u16> = VecDeque::new();
            let mut failures = 0u64;
            while let Some((port, ok)) = probes.next().await {
                if ok {
                    found.push_back(port);
                    if found.len() >= range.pool_size {
                        break;
                    }
                } else {
                    failures += 1;
                }
            }
            drop(probes);

            if found.len() < range.pool_size {
                warn!(
                    pool = %range.pool,
                    wanted = range.pool_size,
                    got = found.len(),
                    "Port range exhausted before reaching desired pool size"
                );
            }
            info!(
                pool = %range.pool,
                available = found.len(),
                "Port pool scanned"
            );

            claimed.extend(found.iter().copied());
            let mut state = self.state.lock().expect("port pool poisoned");
            state.scan_probe_failures += failures;
            state.pools.insert(range.pool.clone(), found);
        }

        let _ = self.scan_done_tx.send(true);
        Ok(())
    }

    /// Await the scan-done latch.
    pub async fn wait_ready(&self) {
        let mut rx = self.scan_done_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Allocate a port for `service_name` from `pool_name`.
    ///
    /// Idempotent while the previous allocation still answers a local
    /// connect probe; otherwise the stale port is returned to the pool
    /// tail and a fresh one is popped. Exhaustion is an explicit error;
    /// callers wanting the OS path must call [`Self::allocate_ephemeral`]
    /// deliberately.
    pub async fn allocate_for_service(
        &self,
        service_name: &str,
        pool_name: &str,
    ) -> Result<u16, PortPoolError> {
        // Existing allocation: verify it still responds before reusing.
        let existing = {
            let state = self.state.lock().expect("port pool poisoned");
            state.allocations.get(service_name).cloned()
        };
        if let Some(alloc) = existing {
            if probe_connect(alloc.port).await {
                debug!(service = service_name, port = alloc.port, "Reusing live allocation");
                return Ok(alloc.port);
            }
            let mut state = self.state.lock().expect("port pool poisoned");
            if let Some(alloc) = state.allocations.remove(service_name) {
                state
                    .pools
                    .entry(alloc.pool)
                    .or_default()
                    .push_back(alloc.port);
            }
        }

        let mut state = self.state.lock().expect("port pool poisoned");
        let tombstone = state.tombstones.get(service_name).copied();
        let pool = state
            .pools
            .get_mut(pool_name)
            .ok_or_else(|| PortPoolError::UnknownPool(pool_name.to_string()))?;

        let port = match pool.pop_front() {
            // Same port the service just gave back: defer it once, as
            // long as an alternative exists.
            Some(p) if Some(p) == tombstone && !pool.is_empty() => {
                let next = pool.pop_front();
                pool.push_back(p);
                next
            }
            other => other,
        };

        match port {
            Some(port) => {
                state.allocations.insert(
                    service_name.to_string(),
                    Allocation {
                        port,
                        pool: pool_name.to_string(),
                    },
                );
                debug!(service = service_name, pool = pool_name, port, "Port allocated");
                Ok(port)
            }
            None => {
                state.allocation_failures += 1;
                Err(PortPoolError::NoPortAvailable(pool_name.to_string()))
            }
        }
    }

    /// Ask the operating system for a port by binding `:0` and reading
    /// the assignment back. Last resort; callers opt in explicitly.
    pub async fn allocate_ephemeral(&self) -> Result<u16, PortPoolError> {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.map_err(|e| {
            warn!(error = %e, "OS refused ephemeral bind");
            PortPoolError::NoPortAvailable("ephemeral".to_string())
        })?;
        let port = listener
            .local_addr()
            .map_err(|_| PortPoolError::NoPortAvailable("ephemeral".to_string()))?
            .port();
        drop(listener);

        let mut state = self.state.lock().expect("port pool poisoned");
        state.ephemeral.push(port);
        debug!(port, "Ephemeral port allocated");
        Ok(port)
    }

    /// Return the service's port to the tail of its originating pool.
    /// Recently released ports are tried last, easing TIME_WAIT pressure.
    /// No-op when nothing is allocated.
    pub fn release(&self, service_name: &str) {
        let mut state = self.state.lock().expect("port pool poisoned");
        if let Some(alloc) = state.allocations.remove(service_name) {
            state
                .tombstones
                .insert(service_name.to_string(), alloc.port);
            state
                .pools
                .entry(alloc.pool)
                .or_default()
                .push_back(alloc.port);
            debug!(service = service_name, port = alloc.port, "Port released");
        }
    }

    /// Port currently allocated to a service, if any.
    pub fn allocation(&self, service_name: &str) -> Option<u16> {
        let state = self.state.lock().expect("port pool poisoned");
        state.allocations.get(service_name).map(|a| a.port)
    }

    pub fn diagnostics(&self) -> PortPoolDiagnostics {
        let state = self.state.lock().expect("port pool poisoned");
        PortPoolDiagnostics {
            scan_complete: *self.scan_done_rx.borrow(),
            pools: state
                .pools
                .iter()
                .map(|(name, ports)| (name.clone(), ports.len()))
                .collect(),
            allocations: state
                .allocations
                .iter()
                .map(|(name, alloc)| (name.clone(), alloc.port))
                .collect(),
            ephemeral: state.ephemeral.clone(),
            allocation_failures: state.allocation_failures,
            scan_probe_failures: state.scan_probe_failures,
        }
    }
}

/// A port is pool-worthy if we can bind it on loopback right now.
async fn probe_bindable(port: u16) -> bool {
    matches!(
        tokio::time::timeout(SCAN_PROBE_TIMEOUT, TcpListener::bind(("127.0.0.1", port))).await,
        Ok(Ok(_))
    )
}

/// A previously allocated port is still live if something accepts on it.
async fn probe_connect(port: u16) -> bool {
    matches!(
        tokio::time::timeout(
            REALLOC_PROBE_TIMEOUT,
            TcpStream::connect(("127.0.0.1", port))
        )
        .await,
        Ok(Ok(_))
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn test_range(pool: &str, start: u16, end: u16, size: usize) -> PortRange {
        PortRange {
            pool: pool.to_string(),
            start,
            end,
            pool_size: size,
            priority: 1,
        }
    }

    #[test]
    #[serial]
    fn test_default_ranges_cover_all_pools() {
        let ranges = load_port_ranges(None).unwrap();
        let pools: Vec<&str> = ranges.iter().map(|r| r.pool.as_str()).collect();
        assert!(pools.contains(&MEMORY_SERVICE_POOL));
        assert!(pools.contains(&BACKEND_POOL));
        assert!(pools.contains(&TERMINALS_POOL));
        assert!(pools.contains(&DEBUG_SERVER_POOL));
        for range in &ranges {
            assert!(range.start >= 1024);
            assert!(range.end >= range.start);
        }
    }

    #[test]
    #[serial]
    fn test_env_overrides_default_range() {
        unsafe {
            std::env::set_var("TERMINALS_PORT_START", "42000");
            std::env::set_var("TERMINALS_PORT_END", "42099");
            std::env::set_var("TERMINALS_POOL_SIZE", "7");
        }
        let ranges = load_port_ranges(None).unwrap();
        let terminals = ranges.iter().find(|r| r.pool == TERMINALS_POOL).unwrap();
        assert_eq!(terminals.start, 42000);
        assert_eq!(terminals.end, 42099);
        assert_eq!(terminals.pool_size, 7);
        unsafe {
            std::env::remove_var("TERMINALS_PORT_START");
            std::env::remove_var("TERMINALS_PORT_END");
            std::env::remove_var("TERMINALS_POOL_SIZE");
        }
    }

    #[test]
    #[serial]
    fn test_yaml_overrides_environment() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ports.yaml");
        std::fs::write(
            &path,
            "pools:\n  - pool: backend-service\n    start: 45000\n    end: 45049\n    pool_size: 3\n    priority: 1\n",
        )
        .unwrap();

        let ranges = load_port_ranges(Some(&path)).unwrap();
        let backend = ranges.iter().find(|r| r.pool == BACKEND_POOL).unwrap();
        assert_eq!(backend.start, 45000);
        assert_eq!(backend.pool_size, 3);
    }

    #[test]
    #[serial]
    fn test_invalid_yaml_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ports.yaml");
        std::fs::write(&path, "pools: {not a list}").unwrap();

        let result = load_port_ranges(Some(&path));
        assert!(matches!(result, Err(PortPoolError::ScanConfig(_))));
    }

    #[test]
    fn test_privileged_range_rejected() {
        let range = test_range("bad", 80, 90, 2);
        assert!(matches!(
            range.validate(),
            Err(PortPoolError::ScanConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_scan_fills_pool_to_desired_size() {
        let pool = PortPool::new();
        pool.initialize(vec![test_range("scan-test", 43100, 43199, 4)])
            .await
            .unwrap();

        let diag = pool.diagnostics();
        assert!(diag.scan_complete);
        assert_eq!(diag.pools.get("scan-test"), Some(&4));
    }

    #[tokio::test]
    async fn test_allocate_pops_and_release_returns_to_tail() {
        let pool = PortPool::new();
        pool.initialize(vec![test_range("svc-pool", 43200, 43299, 3)])
            .await
            .unwrap();

        let port = pool.allocate_for_service("svc-a", "svc-pool").await.unwrap();
        let diag = pool.diagnostics();
        assert_eq!(diag.pools.get("svc-pool"), Some(&2));
        assert_eq!(diag.allocations.get("svc-a"), Some(&port));

        pool.release("svc-a");
        let diag = pool.diagnostics();
        assert_eq!(diag.pools.get("svc-pool"), Some(&3));
        assert!(diag.allocations.is_empty());
    }

    #[tokio::test]
    async fn test_same_service_never_gets_same_port_twice_in_a_row() {
        let pool = PortPool::new();
        pool.initialize(vec![test_range("recycle", 43300, 43399, 3)])
            .await
            .unwrap();

        let first = pool.allocate_for_service("svc", "recycle").await.unwrap();
        pool.release("svc");
        let second = pool.allocate_for_service("svc", "recycle").await.unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_exhaustion_fails_without_touching_other_pools() {
        let pool = PortPool::new();
        pool.initialize(vec![
            test_range("tiny", 43400, 43410, 1),
            test_range("other", 43450, 43460, 2),
        ])
        .await
        .unwrap();

        pool.allocate_for_service("svc-1", "tiny").await.unwrap();
        let err = pool.allocate_for_service("svc-2", "tiny").await;
        assert!(matches!(err, Err(PortPoolError::NoPortAvailable(_))));

        // The other pool is untouched by the failure.
        let diag = pool.diagnostics();
        assert_eq!(diag.pools.get("other"), Some(&2));
        assert_eq!(diag.allocation_failures, 1);
    }

    #[tokio::test]
    async fn test_unknown_pool_is_an_error() {
        let pool = PortPool::new();
        pool.initialize(vec![test_range("known", 43500, 43510, 1)])
            .await
            .unwrap();
        let err = pool.allocate_for_service("svc", "nope").await;
        assert!(matches!(err, Err(PortPoolError::UnknownPool(_))));
    }

    #[tokio::test]
    async fn test_ephemeral_allocation_records_port() {
        let pool = PortPool::new();
        let port = pool.allocate_ephemeral().await.unwrap();
        assert!(port >= 1024);
        assert!(pool.diagnostics().ephemeral.contains(&port));
    }

    #[tokio::test]
    async fn test_release_without_allocation_is_noop() {
        let pool = PortPool::new();
        pool.initialize(vec![test_range("noop", 43600, 43610, 2)])
            .await
            .unwrap();
        pool.release("ghost");
        assert_eq!(pool.diagnostics().pools.get("noop"), Some(&2));
    }

    #[tokio::test]
    async fn test_wait_ready_latches() {
        let pool = std::sync::Arc::new(PortPool::new());
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.wait_ready().await })
        };
        pool.initialize(vec![test_range("latch", 43700, 43710, 1)])
            .await
            .unwrap();
        waiter.await.unwrap();
        assert!(pool.diagnostics().scan_complete);
    }
}
