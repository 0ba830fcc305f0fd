//! rotapool — proxy pool engine with health checking and rotation
//!
//! Maintains a registry of upstream proxies (HTTP, HTTPS, SOCKS5), keeps it
//! durable through a pluggable record store, probes each proxy's reachability
//! on a background schedule, and hands out healthy proxies via pluggable
//! rotation strategies.
//!
//! [`ProxyPool`] is the single entry point:
//!
//! ```no_run
//! use std::sync::Arc;
//! use rotapool::{
//!     MemoryRecordStore, NewProxy, PoolConfig, ProxyFilter, ProxyPool,
//!     ProxyProtocol, RotationStrategy,
//! };
//!
//! # async fn run() -> rotapool::Result<()> {
//! let config = PoolConfig::from_env()?;
//! let store = Arc::new(MemoryRecordStore::new());
//! let pool = ProxyPool::start(config, store).await?;
//!
//! pool.add_proxy(NewProxy::new("10.0.0.1", 8080, ProxyProtocol::Http))
//!     .await?;
//! pool.check_all(&ProxyFilter::all()).await;
//!
//! let proxy = pool.get_proxy(RotationStrategy::RoundRobin, &ProxyFilter::all())?;
//! println!("using {}", proxy.url());
//!
//! pool.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod health;
pub mod models;
pub mod pool;
pub mod registry;
pub mod rotation;
pub mod store;

pub use config::PoolConfig;
pub use error::{PoolError, Result};
pub use health::{CheckOutcome, CheckReport, ConnectProber, HealthChecker, Prober};
pub use models::{
    HealthStatus, NewProxy, ProxyEndpoint, ProxyFilter, ProxyHealthState, ProxyProtocol,
    ProxyRecord,
};
pub use pool::{PoolStats, ProtocolStats, ProxyPool};
pub use registry::Registry;
pub use rotation::{RotationStrategy, Rotator};
pub use store::{MemoryRecordStore, PgRecordStore, RecordStore};
