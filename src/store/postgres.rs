//! PostgreSQL-backed record store

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use tracing::{info, warn};

use crate::error::{PoolError, Result};
use crate::models::{HealthStatus, ProxyEndpoint, ProxyHealthState, ProxyProtocol};

use super::RecordStore;

/// Durable `RecordStore` backed by PostgreSQL
#[derive(Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

#[derive(FromRow)]
struct EndpointRow {
    id: i64,
    host: String,
    port: i32,
    protocol: String,
    username: Option<String>,
    password: Option<String>,
    tags: serde_json::Value,
    created_at: DateTime<Utc>,
}

#[derive(FromRow)]
struct HealthRow {
    status: String,
    last_checked_at: Option<DateTime<Utc>>,
    latency_ms: Option<i64>,
    consecutive_failures: i32,
    last_error: Option<String>,
    success_count: i64,
    failure_count: i64,
}

impl PgRecordStore {
    /// Connect to the database and ensure the schema exists
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        info!("Connecting to proxy record store");

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .map_err(|e| PoolError::StorageUnavailable(e.to_string()))?;

        let store = Self { pool };
        store.init_schema().await?;

        info!("Record store ready");
        Ok(store)
    }

    /// Wrap an existing pool (schema must already exist)
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS proxies (
                id BIGINT PRIMARY KEY,
                host TEXT NOT NULL,
                port INTEGER NOT NULL,
                protocol VARCHAR(16) NOT NULL DEFAULT 'http',
                username TEXT,
                password TEXT,
                tags JSONB NOT NULL DEFAULT '[]'::jsonb,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                UNIQUE (host, port, protocol)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS proxy_health (
                proxy_id BIGINT PRIMARY KEY,
                status VARCHAR(16) NOT NULL DEFAULT 'unknown',
                last_checked_at TIMESTAMPTZ,
                latency_ms BIGINT,
                consecutive_failures INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                success_count BIGINT NOT NULL DEFAULT 0,
                failure_count BIGINT NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn save_endpoint(&self, endpoint: &ProxyEndpoint) -> Result<()> {
        let tags = serde_json::to_value(&endpoint.tags)
            .unwrap_or_else(|_| serde_json::Value::Array(Vec::new()));

        sqlx::query(
            r#"
            INSERT INTO proxies (id, host, port, protocol, username, password, tags, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO UPDATE
            SET tags = EXCLUDED.tags
            "#,
        )
        .bind(endpoint.id as i64)
        .bind(&endpoint.host)
        .bind(endpoint.port as i32)
        .bind(endpoint.protocol.as_str())
        .bind(&endpoint.username)
        .bind(&endpoint.password)
        .bind(tags)
        .bind(endpoint.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete_endpoint(&self, id: u64) -> Result<()> {
        sqlx::query("DELETE FROM proxy_health WHERE proxy_id = $1")
            .bind(id as i64)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM proxies WHERE id = $1")
            .bind(id as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn load_all_endpoints(&self) -> Result<Vec<ProxyEndpoint>> {
        let rows = sqlx::query_as::<_, EndpointRow>(
            r#"
            SELECT id, host, port, protocol, username, password, tags, created_at
            FROM proxies
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut endpoints = Vec::with_capacity(rows.len());
        for row in rows {
            let protocol = match ProxyProtocol::from_str(&row.protocol) {
                Some(p) => p,
                None => {
                    warn!(id = row.id, protocol = %row.protocol, "Skipping proxy with unknown protocol");
                    continue;
                }
            };
            let tags: BTreeSet<String> =
                serde_json::from_value(row.tags).unwrap_or_default();

            endpoints.push(ProxyEndpoint {
                id: row.id as u64,
                host: row.host,
                port: row.port as u16,
                protocol,
                username: row.username,
                password: row.password,
                tags,
                created_at: row.created_at,
            });
        }

        Ok(endpoints)
    }

    async fn save_health(&self, id: u64, state: &ProxyHealthState) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO proxy_health (
                proxy_id, status, last_checked_at, latency_ms,
                consecutive_failures, last_error, success_count, failure_count
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (proxy_id) DO UPDATE
            SET status = EXCLUDED.status,
                last_checked_at = EXCLUDED.last_checked_at,
                latency_ms = EXCLUDED.latency_ms,
                consecutive_failures = EXCLUDED.consecutive_failures,
                last_error = EXCLUDED.last_error,
                success_count = EXCLUDED.success_count,
                failure_count = EXCLUDED.failure_count
            "#,
        )
        .bind(id as i64)
        .bind(state.status.as_str())
        .bind(state.last_checked_at)
        .bind(state.latency_ms.map(|l| l as i64))
        .bind(state.consecutive_failures as i32)
        .bind(&state.last_error)
        .bind(state.success_count as i64)
        .bind(state.failure_count as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn load_health(&self, id: u64) -> Result<Option<ProxyHealthState>> {
        let row = sqlx::query_as::<_, HealthRow>(
            r#"
            SELECT status, last_checked_at, latency_ms,
                   consecutive_failures, last_error, success_count, failure_count
            FROM proxy_health
            WHERE proxy_id = $1
            "#,
        )
        .bind(id as i64)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| ProxyHealthState {
            status: HealthStatus::from_str(&row.status).unwrap_or_default(),
            last_checked_at: row.last_checked_at,
            latency_ms: row.latency_ms.map(|l| l as u64),
            consecutive_failures: row.consecutive_failures.max(0) as u32,
            last_error: row.last_error,
            success_count: row.success_count.max(0) as u64,
            failure_count: row.failure_count.max(0) as u64,
        }))
    }
}
