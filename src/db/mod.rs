//! Postgres-backed store: connection pool, migrations, and health check.
//!
//! Implements [`EventStore`](crate::store::EventStore) with direct SQLx
//! queries; see the `events` and `executions` submodules.

pub mod events;
pub mod executions;

use std::time::Duration;

use crate::error::Result;
use crate::model::*;
use crate::store::{EventQuery, EventStore, ExecutionQuery};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Database handle. Owns the connection pool.
pub struct Db {
    pool: PgPool,
    statement_timeout: Option<Duration>,
}

impl Db {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(5))
            .connect(url)
            .await?;
        Ok(Self {
            pool,
            statement_timeout: None,
        })
    }

    /// Bound every event insert on the server side.
    ///
    /// Keep this below the normalizer's write timeout so the server gives up
    /// on a slow insert before the normalizer does.
    pub fn with_statement_timeout(mut self, timeout: Duration) -> Self {
        self.statement_timeout = Some(timeout);
        self
    }

    pub fn statement_timeout(&self) -> Option<Duration> {
        self.statement_timeout
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| crate::error::Error::Other(format!("migration failed: {e}")))?;
        Ok(())
    }

    /// Simple health check: run a SELECT 1.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub(crate) fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl EventStore for Db {
    async fn append_event(&self, record: &EventRecord) -> Result<()> {
        self.insert_event(record).await
    }

    async fn last_sequence(&self, execution_id: ExecutionId) -> Result<u64> {
        self.fetch_last_sequence(execution_id).await
    }

    async fn upsert_execution(&self, run: &ExecutionRun) -> Result<()> {
        self.save_execution(run).await
    }

    async fn upsert_wave(&self, wave: &Wave) -> Result<()> {
        self.save_wave(wave).await
    }

    async fn get_execution(&self, id: ExecutionId) -> Result<ExecutionRun> {
        self.fetch_execution(id).await
    }

    async fn get_wave(&self, id: WaveId) -> Result<Wave> {
        self.fetch_wave(id).await
    }

    async fn list_waves(&self, execution_id: ExecutionId) -> Result<Vec<Wave>> {
        self.fetch_waves(execution_id).await
    }

    async fn query_events(&self, query: &EventQuery) -> Result<Vec<EventRecord>> {
        self.fetch_events(query).await
    }

    async fn list_executions(&self, query: &ExecutionQuery) -> Result<Vec<ExecutionRun>> {
        self.fetch_executions(query).await
    }
}
