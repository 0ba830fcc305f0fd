//! In-memory proxy registry
//!
//! Authoritative live view of every known proxy and its health state. The map
//! is sharded (dashmap), so health updates for one proxy never block selection
//! reads for another, and every read observes a fully-formed record.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

use crate::error::{PoolError, Result};
use crate::models::{NewProxy, ProxyEndpoint, ProxyFilter, ProxyHealthState, ProxyRecord};

type AddressKey = (String, u16, crate::models::ProxyProtocol);

/// Thread-safe mapping from proxy id to (endpoint, health state)
pub struct Registry {
    records: DashMap<u64, ProxyRecord>,
    /// Secondary index enforcing (host, port, protocol) uniqueness
    addresses: DashMap<AddressKey, u64>,
    /// Last assigned id; ids are never reused
    next_id: AtomicU64,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            addresses: DashMap::new(),
            next_id: AtomicU64::new(0),
        }
    }

    /// Insert a new proxy, assigning it a fresh id
    ///
    /// Fails with `DuplicateAddress` if an endpoint with the same
    /// (host, port, protocol) already exists. The new record starts with
    /// `HealthStatus::Unknown`.
    pub fn insert(&self, new: NewProxy) -> Result<ProxyRecord> {
        let key = (new.host.clone(), new.port, new.protocol);

        // The address entry is claimed first so two concurrent inserts of the
        // same address cannot both succeed.
        match self.addresses.entry(key) {
            Entry::Occupied(_) => Err(PoolError::DuplicateAddress {
                address: format!("{}:{}", new.host, new.port),
                protocol: new.protocol.as_str().to_string(),
            }),
            Entry::Vacant(slot) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
                slot.insert(id);

                let record = ProxyRecord {
                    endpoint: ProxyEndpoint {
                        id,
                        host: new.host,
                        port: new.port,
                        protocol: new.protocol,
                        username: new.username,
                        password: new.password,
                        tags: new.tags,
                        created_at: Utc::now(),
                    },
                    health: ProxyHealthState::new(),
                };
                self.records.insert(id, record.clone());

                debug!(id, address = %record.endpoint.address(), "Registered proxy");
                Ok(record)
            }
        }
    }

    /// Re-insert a persisted endpoint on startup, keeping its original id
    pub fn restore(&self, endpoint: ProxyEndpoint, health: ProxyHealthState) {
        let key = (endpoint.host.clone(), endpoint.port, endpoint.protocol);
        self.next_id.fetch_max(endpoint.id, Ordering::Relaxed);
        self.addresses.insert(key, endpoint.id);
        self.records
            .insert(endpoint.id, ProxyRecord { endpoint, health });
    }

    /// Remove a proxy, returning the removed record
    pub fn remove(&self, id: u64) -> Result<ProxyRecord> {
        let (_, record) = self
            .records
            .remove(&id)
            .ok_or(PoolError::NotFound { id })?;

        let key = (
            record.endpoint.host.clone(),
            record.endpoint.port,
            record.endpoint.protocol,
        );
        // Only clear the index slot if it still points at this id; a restore
        // or re-add may have raced us.
        self.addresses.remove_if(&key, |_, &indexed| indexed == id);

        debug!(id, address = %record.endpoint.address(), "Removed proxy");
        Ok(record)
    }

    /// Get a point-in-time copy of a record
    pub fn get(&self, id: u64) -> Result<ProxyRecord> {
        self.records
            .get(&id)
            .map(|r| r.clone())
            .ok_or(PoolError::NotFound { id })
    }

    /// Snapshot of all records matching the filter, ordered by id
    ///
    /// The returned vector reflects registry state at call time; mutations
    /// after the call are not visible through it.
    pub fn list(&self, filter: &ProxyFilter) -> Vec<ProxyRecord> {
        let mut records: Vec<ProxyRecord> = self
            .records
            .iter()
            .filter(|r| filter.matches(&r.endpoint))
            .map(|r| r.clone())
            .collect();
        records.sort_by_key(|r| r.endpoint.id);
        records
    }

    /// Snapshot of records matching the filter that are currently healthy
    pub fn healthy(&self, filter: &ProxyFilter) -> Vec<ProxyRecord> {
        let mut records = self.list(filter);
        records.retain(|r| r.health.status.is_healthy());
        records
    }

    /// Atomically replace a proxy's health state
    ///
    /// Never touches the endpoint. Fails with `NotFound` if the id was removed
    /// concurrently; the health checker treats that as a benign race.
    pub fn update_health(&self, id: u64, health: ProxyHealthState) -> Result<()> {
        match self.records.get_mut(&id) {
            Some(mut record) => {
                record.health = health;
                Ok(())
            }
            None => Err(PoolError::NotFound { id }),
        }
    }

    /// Mark a proxy as being probed, returning its prior health state
    ///
    /// `Checking` is the pre-probe transient; the probe result always replaces
    /// it via `update_health`.
    pub fn begin_check(&self, id: u64) -> Result<ProxyHealthState> {
        match self.records.get_mut(&id) {
            Some(mut record) => {
                let prior = record.health.clone();
                record.health.status = crate::models::HealthStatus::Checking;
                Ok(prior)
            }
            None => Err(PoolError::NotFound { id }),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{HealthStatus, ProxyProtocol};

    fn new_proxy(host: &str, port: u16) -> NewProxy {
        NewProxy::new(host, port, ProxyProtocol::Http)
    }

    #[test]
    fn test_insert_assigns_sequential_ids() {
        let registry = Registry::new();
        let a = registry.insert(new_proxy("10.0.0.1", 8080)).unwrap();
        let b = registry.insert(new_proxy("10.0.0.2", 8080)).unwrap();

        assert_eq!(a.endpoint.id, 1);
        assert_eq!(b.endpoint.id, 2);
        assert_eq!(a.health.status, HealthStatus::Unknown);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_insert_duplicate_address_fails_and_leaves_state_unchanged() {
        let registry = Registry::new();
        registry.insert(new_proxy("10.0.0.1", 8080)).unwrap();

        let err = registry.insert(new_proxy("10.0.0.1", 8080)).unwrap_err();
        assert!(matches!(err, PoolError::DuplicateAddress { .. }));
        assert_eq!(registry.len(), 1);

        // Same host:port under a different protocol is a distinct endpoint.
        registry
            .insert(NewProxy::new("10.0.0.1", 8080, ProxyProtocol::Socks5))
            .unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_ids_are_never_reused() {
        let registry = Registry::new();
        let a = registry.insert(new_proxy("10.0.0.1", 8080)).unwrap();
        registry.remove(a.endpoint.id).unwrap();

        let b = registry.insert(new_proxy("10.0.0.1", 8080)).unwrap();
        assert!(b.endpoint.id > a.endpoint.id);
    }

    #[test]
    fn test_remove_and_get_not_found() {
        let registry = Registry::new();
        assert!(matches!(
            registry.remove(99),
            Err(PoolError::NotFound { id: 99 })
        ));
        assert!(registry.get(99).is_err());

        let record = registry.insert(new_proxy("10.0.0.1", 8080)).unwrap();
        let removed = registry.remove(record.endpoint.id).unwrap();
        assert_eq!(removed.endpoint.address(), "10.0.0.1:8080");
        assert!(registry.is_empty());
    }

    #[test]
    fn test_list_matches_operation_history() {
        let registry = Registry::new();
        let a = registry.insert(new_proxy("10.0.0.1", 8080)).unwrap();
        let b = registry.insert(new_proxy("10.0.0.2", 8080)).unwrap();
        let c = registry.insert(new_proxy("10.0.0.3", 8080)).unwrap();
        registry.remove(b.endpoint.id).unwrap();

        let ids: Vec<u64> = registry
            .list(&ProxyFilter::all())
            .iter()
            .map(|r| r.endpoint.id)
            .collect();
        assert_eq!(ids, vec![a.endpoint.id, c.endpoint.id]);
    }

    #[test]
    fn test_list_filters_by_protocol_and_tag() {
        let registry = Registry::new();
        registry
            .insert(NewProxy::new("10.0.0.1", 8080, ProxyProtocol::Http).with_tag("eu"))
            .unwrap();
        registry
            .insert(NewProxy::new("10.0.0.2", 1080, ProxyProtocol::Socks5).with_tag("us"))
            .unwrap();

        assert_eq!(registry.list(&ProxyFilter::all()).len(), 2);
        assert_eq!(
            registry
                .list(&ProxyFilter::protocol(ProxyProtocol::Socks5))
                .len(),
            1
        );
        assert_eq!(registry.list(&ProxyFilter::tag("eu")).len(), 1);
        assert_eq!(registry.list(&ProxyFilter::tag("apac")).len(), 0);
    }

    #[test]
    fn test_list_is_a_snapshot() {
        let registry = Registry::new();
        let a = registry.insert(new_proxy("10.0.0.1", 8080)).unwrap();
        let snapshot = registry.list(&ProxyFilter::all());

        registry.remove(a.endpoint.id).unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].endpoint.id, a.endpoint.id);
    }

    #[test]
    fn test_update_health_replaces_state_only() {
        let registry = Registry::new();
        let record = registry.insert(new_proxy("10.0.0.1", 8080)).unwrap();
        let id = record.endpoint.id;

        let mut health = ProxyHealthState::new();
        health.record_success(25);
        registry.update_health(id, health).unwrap();

        let updated = registry.get(id).unwrap();
        assert_eq!(updated.health.status, HealthStatus::Healthy);
        assert_eq!(updated.health.latency_ms, Some(25));
        assert_eq!(updated.endpoint.address(), "10.0.0.1:8080");

        registry.remove(id).unwrap();
        let err = registry
            .update_health(id, ProxyHealthState::new())
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_begin_check_marks_transient_and_returns_prior() {
        let registry = Registry::new();
        let record = registry.insert(new_proxy("10.0.0.1", 8080)).unwrap();
        let id = record.endpoint.id;

        let prior = registry.begin_check(id).unwrap();
        assert_eq!(prior.status, HealthStatus::Unknown);
        assert_eq!(registry.get(id).unwrap().health.status, HealthStatus::Checking);
    }

    #[test]
    fn test_restore_preserves_id_and_advances_counter() {
        let registry = Registry::new();
        let endpoint = ProxyEndpoint {
            id: 41,
            host: "10.0.0.1".to_string(),
            port: 8080,
            protocol: ProxyProtocol::Http,
            username: None,
            password: None,
            tags: Default::default(),
            created_at: Utc::now(),
        };
        registry.restore(endpoint, ProxyHealthState::new());

        assert_eq!(registry.get(41).unwrap().endpoint.port, 8080);

        let next = registry.insert(new_proxy("10.0.0.2", 8080)).unwrap();
        assert_eq!(next.endpoint.id, 42);
    }

    #[test]
    fn test_concurrent_inserts_get_distinct_ids() {
        use std::sync::Arc;

        let registry = Arc::new(Registry::new());
        let mut handles = Vec::new();
        for t in 0..8 {
            let registry = Arc::clone(&registry);
            handles.push(std::thread::spawn(move || {
                for p in 0..50u16 {
                    registry
                        .insert(new_proxy(&format!("10.0.{}.1", t), 1000 + p))
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let records = registry.list(&ProxyFilter::all());
        assert_eq!(records.len(), 400);
        let mut ids: Vec<u64> = records.iter().map(|r| r.endpoint.id).collect();
        ids.dedup();
        assert_eq!(ids.len(), 400);
    }
}
