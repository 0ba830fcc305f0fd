//! In-memory record store
//!
//! Backs ephemeral pools and tests. Supports simulating a storage outage so
//! callers can exercise `StorageUnavailable` paths.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::{PoolError, Result};
use crate::models::{ProxyEndpoint, ProxyHealthState};

use super::RecordStore;

/// Volatile `RecordStore` implementation
#[derive(Default)]
pub struct MemoryRecordStore {
    endpoints: DashMap<u64, ProxyEndpoint>,
    health: DashMap<u64, ProxyHealthState>,
    unavailable: AtomicBool,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle simulated backend outage
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Relaxed);
    }

    pub fn endpoint_count(&self) -> usize {
        self.endpoints.len()
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::Relaxed) {
            Err(PoolError::StorageUnavailable(
                "memory store marked unavailable".to_string(),
            ))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn save_endpoint(&self, endpoint: &ProxyEndpoint) -> Result<()> {
        self.check_available()?;
        self.endpoints.insert(endpoint.id, endpoint.clone());
        Ok(())
    }

    async fn delete_endpoint(&self, id: u64) -> Result<()> {
        self.check_available()?;
        self.endpoints.remove(&id);
        self.health.remove(&id);
        Ok(())
    }

    async fn load_all_endpoints(&self) -> Result<Vec<ProxyEndpoint>> {
        self.check_available()?;
        let mut endpoints: Vec<ProxyEndpoint> =
            self.endpoints.iter().map(|e| e.clone()).collect();
        endpoints.sort_by_key(|e| e.id);
        Ok(endpoints)
    }

    async fn save_health(&self, id: u64, state: &ProxyHealthState) -> Result<()> {
        self.check_available()?;
        self.health.insert(id, state.clone());
        Ok(())
    }

    async fn load_health(&self, id: u64) -> Result<Option<ProxyHealthState>> {
        self.check_available()?;
        Ok(self.health.get(&id).map(|h| h.clone()))
    }
}
