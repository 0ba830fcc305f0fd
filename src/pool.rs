//! Pool engine facade
//!
//! Composes the registry, record store, health checker, and rotation engine
//! into the single entry point consumed by API/CLI layers, and owns the
//! background health-check scheduler's lifecycle.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::error::Result;
use crate::health::{CheckReport, ConnectProber, HealthChecker, Prober};
use crate::models::{
    HealthStatus, NewProxy, ProxyEndpoint, ProxyFilter, ProxyHealthState, ProxyRecord,
};
use crate::registry::Registry;
use crate::rotation::{RotationStrategy, Rotator};
use crate::store::RecordStore;

/// Per-protocol slice of the pool statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProtocolStats {
    pub total: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub unknown: usize,
}

/// Aggregate pool statistics
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub unknown: usize,
    pub per_protocol: BTreeMap<String, ProtocolStats>,
}

/// Background scheduler handle; dropped on shutdown
struct Scheduler {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Proxy pool engine
///
/// Construction rehydrates the registry from the record store and starts the
/// background health-check scheduler. The scheduler is bound to this value's
/// lifetime: `shutdown` stops it gracefully, and dropping the pool signals it
/// to stop at the next tick.
pub struct ProxyPool {
    config: PoolConfig,
    registry: Arc<Registry>,
    store: Arc<dyn RecordStore>,
    checker: Arc<HealthChecker>,
    rotator: Rotator,
    scheduler: Mutex<Option<Scheduler>>,
}

impl ProxyPool {
    /// Start a pool probing real proxies per the configured check URL
    pub async fn start(config: PoolConfig, store: Arc<dyn RecordStore>) -> Result<Self> {
        let prober = Arc::new(ConnectProber::new(&config)?);
        Self::start_with_prober(config, store, prober).await
    }

    /// Start a pool with a custom prober (tests, alternative probe transports)
    pub async fn start_with_prober(
        config: PoolConfig,
        store: Arc<dyn RecordStore>,
        prober: Arc<dyn Prober>,
    ) -> Result<Self> {
        let registry = Arc::new(Registry::new());

        // Rehydrate from durable storage. Liveness is re-established by
        // probing, so status always comes back as unknown even when a health
        // snapshot survived.
        let endpoints = store.load_all_endpoints().await?;
        for endpoint in endpoints {
            let mut health = match store.load_health(endpoint.id).await {
                Ok(Some(health)) => health,
                Ok(None) => ProxyHealthState::new(),
                Err(e) => {
                    warn!(id = endpoint.id, error = %e, "Failed to load health snapshot");
                    ProxyHealthState::new()
                }
            };
            health.status = HealthStatus::Unknown;
            registry.restore(endpoint, health);
        }
        info!(count = registry.len(), "Rehydrated proxy registry");

        let checker = Arc::new(HealthChecker::new(
            registry.clone(),
            store.clone(),
            prober,
            (&config).into(),
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_scheduler(
            checker.clone(),
            config.health_check_interval,
            shutdown_rx,
        ));

        Ok(Self {
            config,
            registry,
            store,
            checker,
            rotator: Rotator::new(),
            scheduler: Mutex::new(Some(Scheduler { shutdown_tx, task })),
        })
    }

    /// Add a proxy to the pool
    ///
    /// The endpoint is persisted synchronously before success is returned; a
    /// storage failure rolls the registry back and surfaces to the caller.
    pub async fn add_proxy(&self, new: NewProxy) -> Result<ProxyEndpoint> {
        let record = self.registry.insert(new)?;

        if let Err(e) = self.store.save_endpoint(&record.endpoint).await {
            let _ = self.registry.remove(record.endpoint.id);
            return Err(e);
        }

        info!(
            id = record.endpoint.id,
            address = %record.endpoint.address(),
            protocol = %record.endpoint.protocol,
            "Added proxy"
        );
        Ok(record.endpoint)
    }

    /// Remove a proxy from the pool and the record store
    pub async fn remove_proxy(&self, id: u64) -> Result<()> {
        self.registry.get(id)?;
        self.store.delete_endpoint(id).await?;

        // A concurrent remove may have beaten us to the registry entry; the
        // store delete is idempotent, so the end state is the same.
        if self.registry.remove(id).is_ok() {
            info!(id, "Removed proxy");
        }
        Ok(())
    }

    /// Remove every proxy that is unhealthy with at least
    /// `eviction_threshold` consecutive failures, returning the evicted
    /// endpoints
    pub async fn evict_unhealthy(&self) -> Result<Vec<ProxyEndpoint>> {
        let threshold = self.config.eviction_threshold;
        let candidates: Vec<ProxyRecord> = self
            .registry
            .list(&ProxyFilter::all())
            .into_iter()
            .filter(|r| {
                r.health.status == HealthStatus::Unhealthy
                    && r.health.consecutive_failures >= threshold
            })
            .collect();

        let mut evicted = Vec::new();
        for record in candidates {
            match self.remove_proxy(record.endpoint.id).await {
                Ok(()) => {
                    info!(
                        id = record.endpoint.id,
                        address = %record.endpoint.address(),
                        failures = record.health.consecutive_failures,
                        "Evicted persistently unhealthy proxy"
                    );
                    evicted.push(record.endpoint);
                }
                Err(e) if e.is_not_found() => {
                    debug!(id = record.endpoint.id, "Eviction candidate already removed");
                }
                // A storage failure aborts the sweep; endpoint existence is
                // never mutated without durability.
                Err(e) => return Err(e),
            }
        }
        Ok(evicted)
    }

    /// Select one healthy proxy using the given strategy and filter
    ///
    /// Never blocks on network I/O. The handed-out proxy is best-effort; it
    /// may have turned unhealthy by the time the caller uses it.
    pub fn get_proxy(
        &self,
        strategy: RotationStrategy,
        filter: &ProxyFilter,
    ) -> Result<ProxyEndpoint> {
        let healthy = self.registry.healthy(filter);
        self.rotator.select(strategy, filter, &healthy)
    }

    /// Probe all matching proxies now, ignoring backoff
    pub async fn check_all(&self, filter: &ProxyFilter) -> CheckReport {
        self.checker.check_all(filter).await
    }

    /// Probe one proxy now, ignoring backoff
    pub async fn check_one(&self, id: u64) -> Result<ProxyHealthState> {
        self.checker
            .check_one(id, self.config.health_check_timeout)
            .await
    }

    /// Point-in-time record for one proxy
    pub fn get(&self, id: u64) -> Result<ProxyRecord> {
        self.registry.get(id)
    }

    /// Point-in-time snapshot of matching records, ordered by id
    pub fn list(&self, filter: &ProxyFilter) -> Vec<ProxyRecord> {
        self.registry.list(filter)
    }

    /// Aggregate counts with a per-protocol breakdown
    pub fn stats(&self) -> PoolStats {
        let records = self.registry.list(&ProxyFilter::all());

        let mut stats = PoolStats {
            total: records.len(),
            healthy: 0,
            unhealthy: 0,
            unknown: 0,
            per_protocol: BTreeMap::new(),
        };

        for record in &records {
            let protocol = stats
                .per_protocol
                .entry(record.endpoint.protocol.as_str().to_string())
                .or_default();
            protocol.total += 1;

            match record.health.status {
                HealthStatus::Healthy => {
                    stats.healthy += 1;
                    protocol.healthy += 1;
                }
                HealthStatus::Unhealthy => {
                    stats.unhealthy += 1;
                    protocol.unhealthy += 1;
                }
                // Checking is a pre-probe transient; it counts as unknown
                // until the in-flight probe lands.
                HealthStatus::Unknown | HealthStatus::Checking => {
                    stats.unknown += 1;
                    protocol.unknown += 1;
                }
            }
        }

        stats
    }

    /// Stop the background scheduler
    ///
    /// In-flight probes get `shutdown_grace` to finish; past that they are
    /// abandoned (their results, if they ever land, are still applied through
    /// the normal update path).
    pub async fn shutdown(&self) {
        let scheduler = self.scheduler.lock().take();
        if let Some(Scheduler { shutdown_tx, task }) = scheduler {
            let _ = shutdown_tx.send(true);
            match tokio::time::timeout(self.config.shutdown_grace, task).await {
                Ok(_) => info!("Health check scheduler stopped"),
                Err(_) => warn!(
                    grace_ms = self.config.shutdown_grace.as_millis() as u64,
                    "Scheduler drain grace expired; abandoning in-flight probes"
                ),
            }
        }
    }
}

impl Drop for ProxyPool {
    fn drop(&mut self) {
        // A pool dropped without an explicit shutdown still signals the
        // scheduler so the task exits at its next tick.
        if let Some(scheduler) = self.scheduler.lock().take() {
            let _ = scheduler.shutdown_tx.send(true);
        }
    }
}

/// Background scheduler loop
///
/// Sweeps are awaited inline, so a cycle can never overlap itself; ticks that
/// fire while a sweep is still running are skipped, not queued.
async fn run_scheduler(
    checker: Arc<HealthChecker>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(
        interval_s = period.as_secs(),
        "Starting health check scheduler"
    );

    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                checker.sweep().await;
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("Health check scheduler shutting down");
                    break;
                }
            }
        }
    }
}
