//! Health checking for pooled proxies
//!
//! Probes each proxy's reachability, records the outcome in the registry, and
//! persists health snapshots best-effort. Probe failure is a normal, recorded
//! outcome, never an error returned to the caller.

mod probe;

pub use probe::{ConnectProber, ProbeResult};

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::error::Result;
use crate::models::{ProxyEndpoint, ProxyFilter, ProxyHealthState, ProxyRecord};
use crate::registry::Registry;
use crate::store::RecordStore;

/// Reachability probe over a single endpoint
///
/// Implementations must not panic; every failure mode is an error description.
/// Mocked in tests to script batch outcomes.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, endpoint: &ProxyEndpoint) -> ProbeResult;
}

/// Per-proxy outcome within a batch check
#[derive(Debug, Clone, Serialize)]
pub struct CheckOutcome {
    pub id: u64,
    pub address: String,
    pub healthy: bool,
    pub latency_ms: Option<u64>,
    pub error: Option<String>,
}

/// Aggregate result of a batch health check
#[derive(Debug, Clone, Serialize)]
pub struct CheckReport {
    pub total: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub avg_latency_ms: Option<u64>,
    pub elapsed_ms: u64,
    pub details: Vec<CheckOutcome>,
}

/// Health checker configuration, derived from [`PoolConfig`]
#[derive(Debug, Clone)]
pub struct HealthCheckConfig {
    pub check_timeout: Duration,
    pub max_concurrent_checks: usize,
    /// Base probing interval; doubles per consecutive failure for backoff
    pub check_interval: Duration,
    pub backoff_max_interval: Duration,
}

impl From<&PoolConfig> for HealthCheckConfig {
    fn from(config: &PoolConfig) -> Self {
        Self {
            check_timeout: config.health_check_timeout,
            max_concurrent_checks: config.max_concurrent_checks,
            check_interval: config.health_check_interval,
            backoff_max_interval: config.backoff_max_interval,
        }
    }
}

/// Health checker over the shared registry
pub struct HealthChecker {
    registry: Arc<Registry>,
    store: Arc<dyn RecordStore>,
    prober: Arc<dyn Prober>,
    config: HealthCheckConfig,
}

impl HealthChecker {
    pub fn new(
        registry: Arc<Registry>,
        store: Arc<dyn RecordStore>,
        prober: Arc<dyn Prober>,
        config: HealthCheckConfig,
    ) -> Self {
        Self {
            registry,
            store,
            prober,
            config,
        }
    }

    /// Probe one proxy and record the outcome
    ///
    /// Probe failure is recorded in the returned health state, not raised.
    /// Fails with `NotFound` only if the proxy was removed before or during
    /// the check.
    pub async fn check_one(&self, id: u64, timeout: Duration) -> Result<ProxyHealthState> {
        let record = self.registry.get(id)?;
        let prior = self.registry.begin_check(id)?;

        let outcome = tokio::time::timeout(timeout, self.prober.probe(&record.endpoint)).await;

        let mut next = prior;
        match outcome {
            Ok(Ok(latency)) => next.record_success(latency.as_millis() as u64),
            Ok(Err(reason)) => next.record_failure(reason),
            Err(_) => next.record_failure(format!(
                "probe timed out after {}ms",
                timeout.as_millis()
            )),
        }

        // The proxy may have been removed while the probe was in flight; the
        // stale result is simply dropped in that case.
        self.registry.update_health(id, next.clone())?;
        self.persist_health(id, &next).await;

        Ok(next)
    }

    /// Probe all proxies matching the filter, bounded by the concurrency cap
    ///
    /// Individual probe failures never abort the batch. Proxies removed
    /// mid-batch are dropped from the report.
    pub async fn check_all(&self, filter: &ProxyFilter) -> CheckReport {
        let records = self.registry.list(filter);
        self.run_batch(records).await
    }

    /// Scheduled sweep over the whole registry, honoring per-proxy backoff
    pub async fn sweep(&self) -> CheckReport {
        let now = Utc::now();
        let records: Vec<ProxyRecord> = self
            .registry
            .list(&ProxyFilter::all())
            .into_iter()
            .filter(|r| self.due_for_check(&r.health, now))
            .collect();
        self.run_batch(records).await
    }

    async fn run_batch(&self, records: Vec<ProxyRecord>) -> CheckReport {
        let started = Instant::now();
        let candidates = records.len();

        let outcomes: Vec<Option<CheckOutcome>> = futures::stream::iter(records)
            .map(|record| async move {
                let id = record.endpoint.id;
                let address = record.endpoint.address();
                match self.check_one(id, self.config.check_timeout).await {
                    Ok(state) => Some(CheckOutcome {
                        id,
                        address,
                        healthy: state.status.is_healthy(),
                        latency_ms: state.latency_ms,
                        error: state.last_error,
                    }),
                    Err(e) if e.is_not_found() => {
                        debug!(id, "Proxy removed mid-check; dropping result");
                        None
                    }
                    Err(e) => {
                        warn!(id, error = %e, "Health check failed");
                        None
                    }
                }
            })
            .buffer_unordered(self.config.max_concurrent_checks.max(1))
            .collect()
            .await;

        let details: Vec<CheckOutcome> = outcomes.into_iter().flatten().collect();
        let healthy = details.iter().filter(|o| o.healthy).count();
        let unhealthy = details.len() - healthy;

        let latencies: Vec<u64> = details
            .iter()
            .filter(|o| o.healthy)
            .filter_map(|o| o.latency_ms)
            .collect();
        let avg_latency_ms = if latencies.is_empty() {
            None
        } else {
            Some(latencies.iter().sum::<u64>() / latencies.len() as u64)
        };

        let report = CheckReport {
            total: details.len(),
            healthy,
            unhealthy,
            avg_latency_ms,
            elapsed_ms: started.elapsed().as_millis() as u64,
            details,
        };

        info!(
            candidates,
            healthy = report.healthy,
            unhealthy = report.unhealthy,
            elapsed_ms = report.elapsed_ms,
            "Health check batch complete"
        );
        report
    }

    /// Whether a scheduled sweep should probe this proxy now
    ///
    /// Repeatedly failing proxies are probed at a reduced frequency: the base
    /// interval doubles per consecutive failure, capped at the configured
    /// maximum. Manual checks bypass this entirely.
    pub fn due_for_check(&self, health: &ProxyHealthState, now: chrono::DateTime<Utc>) -> bool {
        if health.consecutive_failures == 0 {
            return true;
        }
        let last = match health.last_checked_at {
            Some(last) => last,
            None => return true,
        };

        let exponent = health.consecutive_failures.min(16);
        let backoff = self
            .config
            .check_interval
            .saturating_mul(1u32 << exponent.min(31))
            .min(self.config.backoff_max_interval);
        let backoff = chrono::Duration::from_std(backoff)
            .unwrap_or_else(|_| chrono::Duration::max_value());

        now.signed_duration_since(last) >= backoff
    }

    /// Best-effort persistence; health tracking degrades to memory-only when
    /// the store is down.
    async fn persist_health(&self, id: u64, state: &ProxyHealthState) {
        if let Err(e) = self.store.save_health(id, state).await {
            warn!(id, error = %e, "Failed to persist health snapshot");
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::ScriptedProber;
    use super::*;
    use crate::models::{HealthStatus, NewProxy, ProxyProtocol};
    use crate::store::MemoryRecordStore;

    fn checker_fixture() -> (
        Arc<Registry>,
        Arc<MemoryRecordStore>,
        Arc<ScriptedProber>,
        HealthChecker,
    ) {
        let registry = Arc::new(Registry::new());
        let store = Arc::new(MemoryRecordStore::new());
        let prober = Arc::new(ScriptedProber::new());
        let config = HealthCheckConfig {
            check_timeout: Duration::from_millis(200),
            max_concurrent_checks: 4,
            check_interval: Duration::from_secs(60),
            backoff_max_interval: Duration::from_secs(900),
        };
        let checker = HealthChecker::new(
            registry.clone(),
            store.clone() as Arc<dyn RecordStore>,
            prober.clone() as Arc<dyn Prober>,
            config,
        );
        (registry, store, prober, checker)
    }

    #[tokio::test]
    async fn test_check_one_success_resets_failures() {
        let (registry, _store, prober, checker) = checker_fixture();
        let record = registry
            .insert(NewProxy::new("10.0.0.1", 8080, ProxyProtocol::Http))
            .unwrap();
        let id = record.endpoint.id;

        prober.fail("10.0.0.1:8080", "refused");
        let state = checker.check_one(id, Duration::from_secs(1)).await.unwrap();
        assert_eq!(state.status, HealthStatus::Unhealthy);
        assert_eq!(state.consecutive_failures, 1);
        assert_eq!(state.last_error.as_deref(), Some("refused"));

        let state = checker.check_one(id, Duration::from_secs(1)).await.unwrap();
        assert_eq!(state.consecutive_failures, 2);

        prober.succeed("10.0.0.1:8080", 35);
        let state = checker.check_one(id, Duration::from_secs(1)).await.unwrap();
        assert_eq!(state.status, HealthStatus::Healthy);
        assert_eq!(state.consecutive_failures, 0);
        assert_eq!(state.latency_ms, Some(35));
        assert!(state.last_error.is_none());

        // Registry reflects the final outcome, not the transient Checking state.
        assert_eq!(
            registry.get(id).unwrap().health.status,
            HealthStatus::Healthy
        );
    }

    #[tokio::test]
    async fn test_check_one_timeout_recorded_as_failure() {
        let (registry, _store, _prober, _checker) = checker_fixture();
        let record = registry
            .insert(NewProxy::new("10.0.0.1", 8080, ProxyProtocol::Http))
            .unwrap();

        let mut slow = ScriptedProber::new();
        slow.succeed("10.0.0.1:8080", 10);
        slow.delay = Some(Duration::from_millis(100));
        let checker = HealthChecker::new(
            registry.clone(),
            Arc::new(MemoryRecordStore::new()),
            Arc::new(slow),
            HealthCheckConfig {
                check_timeout: Duration::from_millis(10),
                max_concurrent_checks: 4,
                check_interval: Duration::from_secs(60),
                backoff_max_interval: Duration::from_secs(900),
            },
        );

        let state = checker
            .check_one(record.endpoint.id, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(state.status, HealthStatus::Unhealthy);
        assert!(state.last_error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_check_one_missing_proxy_is_not_found() {
        let (_registry, _store, _prober, checker) = checker_fixture();
        let err = checker.check_one(42, Duration::from_secs(1)).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_check_all_aggregates_and_persists() {
        let (registry, store, prober, checker) = checker_fixture();
        for port in [8081u16, 8082, 8083] {
            registry
                .insert(NewProxy::new("10.0.0.1", port, ProxyProtocol::Http))
                .unwrap();
        }
        prober.succeed("10.0.0.1:8081", 50);
        prober.succeed("10.0.0.1:8082", 10);
        prober.fail("10.0.0.1:8083", "connection reset");

        let report = checker.check_all(&ProxyFilter::all()).await;
        assert_eq!(report.total, 3);
        assert_eq!(report.healthy, 2);
        assert_eq!(report.unhealthy, 1);
        assert_eq!(report.avg_latency_ms, Some(30));
        assert_eq!(report.details.len(), 3);

        // Snapshots persisted best-effort.
        let persisted = store.load_health(1).await.unwrap().unwrap();
        assert_eq!(persisted.status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_check_all_with_filter() {
        let (registry, _store, prober, checker) = checker_fixture();
        registry
            .insert(NewProxy::new("10.0.0.1", 8081, ProxyProtocol::Http))
            .unwrap();
        registry
            .insert(NewProxy::new("10.0.0.1", 1080, ProxyProtocol::Socks5))
            .unwrap();
        prober.succeed("10.0.0.1:8081", 20);
        prober.succeed("10.0.0.1:1080", 20);

        let report = checker
            .check_all(&ProxyFilter::protocol(ProxyProtocol::Socks5))
            .await;
        assert_eq!(report.total, 1);
        assert_eq!(report.details[0].address, "10.0.0.1:1080");
    }

    #[tokio::test]
    async fn test_store_outage_does_not_fail_check() {
        let (registry, store, prober, checker) = checker_fixture();
        let record = registry
            .insert(NewProxy::new("10.0.0.1", 8080, ProxyProtocol::Http))
            .unwrap();
        prober.succeed("10.0.0.1:8080", 15);
        store.set_unavailable(true);

        let state = checker
            .check_one(record.endpoint.id, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(state.status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_backoff_schedule() {
        let (_registry, _store, _prober, checker) = checker_fixture();
        let now = Utc::now();

        let mut health = ProxyHealthState::new();
        assert!(checker.due_for_check(&health, now));

        // One failure checked just now: next probe waits 2x the base interval.
        health.record_failure("down".to_string());
        assert!(!checker.due_for_check(&health, now));
        assert!(!checker.due_for_check(&health, now + chrono::Duration::seconds(100)));
        assert!(checker.due_for_check(&health, now + chrono::Duration::seconds(130)));

        // Backoff is capped at the configured maximum.
        for _ in 0..10 {
            health.record_failure("down".to_string());
        }
        assert!(!checker.due_for_check(&health, now + chrono::Duration::seconds(890)));
        assert!(checker.due_for_check(&health, now + chrono::Duration::seconds(910)));
    }

    #[tokio::test]
    async fn test_sweep_skips_backed_off_proxies() {
        let (registry, _store, prober, checker) = checker_fixture();
        let failing = registry
            .insert(NewProxy::new("10.0.0.1", 8081, ProxyProtocol::Http))
            .unwrap();
        registry
            .insert(NewProxy::new("10.0.0.1", 8082, ProxyProtocol::Http))
            .unwrap();

        prober.fail("10.0.0.1:8081", "down");
        prober.succeed("10.0.0.1:8082", 10);

        // First sweep probes both; the failure enters backoff.
        let report = checker.sweep().await;
        assert_eq!(report.total, 2);

        // Second sweep runs immediately after: the failing proxy is skipped.
        let report = checker.sweep().await;
        assert_eq!(report.total, 1);
        assert_eq!(report.details[0].id, 2);

        // A manual check bypasses backoff.
        let state = checker
            .check_one(failing.endpoint.id, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(state.consecutive_failures, 2);
    }
}
