//! Proxy rotation strategies
//!
//! Stateless selection over a point-in-time snapshot of the healthy set. The
//! only auxiliary state is the per-filter round-robin cursor map, which has
//! its own locking independent of the registry.

use dashmap::DashMap;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::error::{PoolError, Result};
use crate::models::{ProxyEndpoint, ProxyFilter, ProxyRecord};

/// Strategy for choosing the next proxy from the healthy set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationStrategy {
    #[default]
    RoundRobin,
    Random,
    Latency,
}

impl RotationStrategy {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "round_robin" | "roundrobin" | "round-robin" => Some(Self::RoundRobin),
            "random" => Some(Self::Random),
            "latency" => Some(Self::Latency),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoundRobin => "round_robin",
            Self::Random => "random",
            Self::Latency => "latency",
        }
    }
}

impl std::fmt::Display for RotationStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Rotation engine
///
/// Holds one monotonic cursor per filter signature. Cursors advance on every
/// successful round-robin selection and are normalized modulo the current
/// healthy-set size, so rotation stays fair when the pool grows or shrinks.
pub struct Rotator {
    cursors: DashMap<String, u64>,
}

impl Rotator {
    pub fn new() -> Self {
        Self {
            cursors: DashMap::new(),
        }
    }

    /// Select one endpoint from the given healthy snapshot
    ///
    /// `healthy` must be ordered by id (the registry's `healthy()` snapshot
    /// already is). Fails with `NoHealthyProxy` on an empty set. The returned
    /// endpoint is best-effort: it may turn unhealthy right after selection.
    pub fn select(
        &self,
        strategy: RotationStrategy,
        filter: &ProxyFilter,
        healthy: &[ProxyRecord],
    ) -> Result<ProxyEndpoint> {
        if healthy.is_empty() {
            return Err(PoolError::NoHealthyProxy);
        }

        let record = match strategy {
            RotationStrategy::RoundRobin => self.round_robin(filter, healthy),
            RotationStrategy::Random => Self::random(healthy),
            RotationStrategy::Latency => Self::lowest_latency(healthy),
        };

        Ok(record.endpoint.clone())
    }

    fn round_robin<'a>(&self, filter: &ProxyFilter, healthy: &'a [ProxyRecord]) -> &'a ProxyRecord {
        let mut cursor = self.cursors.entry(filter.signature()).or_insert(0);
        let index = (*cursor % healthy.len() as u64) as usize;
        *cursor += 1;
        &healthy[index]
    }

    fn random(healthy: &[ProxyRecord]) -> &ProxyRecord {
        let mut rng = rand::thread_rng();
        // Non-empty by precondition.
        healthy.choose(&mut rng).unwrap_or(&healthy[0])
    }

    /// Lowest recorded latency wins; ties break to the lowest id. Proxies that
    /// were never successfully probed are excluded unless nothing has a
    /// latency yet, in which case selection falls back to random.
    fn lowest_latency(healthy: &[ProxyRecord]) -> &ProxyRecord {
        healthy
            .iter()
            .filter(|r| r.health.latency_ms.is_some())
            .min_by_key(|r| (r.health.latency_ms, r.endpoint.id))
            .unwrap_or_else(|| Self::random(healthy))
    }
}

impl Default for Rotator {
    fn default() -> Self {
        Self::new()
    }
}
