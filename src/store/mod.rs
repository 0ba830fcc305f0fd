//! Durable persistence for proxy definitions and last-known health metrics
//!
//! The pool engine only ever talks to the narrow [`RecordStore`] interface.
//! Endpoint existence is written through synchronously; health snapshots are
//! persisted best-effort and may be lost on crash.

mod memory;
mod postgres;

pub use memory::MemoryRecordStore;
pub use postgres::PgRecordStore;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{ProxyEndpoint, ProxyHealthState};

/// Narrow persistence interface consumed by the pool engine
///
/// Implementations must distinguish `StorageUnavailable` (backend failure)
/// from absence, which is reported through `Option`/row counts, never as an
/// error.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Persist an endpoint definition (upsert by id)
    async fn save_endpoint(&self, endpoint: &ProxyEndpoint) -> Result<()>;

    /// Delete an endpoint and any persisted health snapshot for it
    async fn delete_endpoint(&self, id: u64) -> Result<()>;

    /// Load every persisted endpoint
    async fn load_all_endpoints(&self) -> Result<Vec<ProxyEndpoint>>;

    /// Persist a health snapshot (best-effort; callers may swallow failures)
    async fn save_health(&self, id: u64, state: &ProxyHealthState) -> Result<()>;

    /// Load the last persisted health snapshot for an endpoint, if any
    async fn load_health(&self, id: u64) -> Result<Option<ProxyHealthState>>;
}
