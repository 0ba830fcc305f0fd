//! Data model for the proxy pool
//!
//! Endpoint identity, per-endpoint health state, and the filter type used by
//! listing, checking, and rotation.

mod proxy;

pub use proxy::{
    HealthStatus, NewProxy, ProxyEndpoint, ProxyFilter, ProxyHealthState, ProxyProtocol,
    ProxyRecord,
};
