//! Event record persistence: append and filtered history reads.

use crate::error::Result;
use crate::model::*;
use crate::store::EventQuery;
use uuid::Uuid;

impl super::Db {
    /// Append one record. Append order is kept in `ingest_order`.
    ///
    /// With a statement timeout set, the insert runs in its own transaction
    /// under `SET LOCAL statement_timeout`, so a slow write is aborted by the
    /// server and reported as an error instead of committing after the caller
    /// gave up on it.
    pub async fn insert_event(&self, record: &EventRecord) -> Result<()> {
        let mut tx = self.pool().begin().await?;
        if let Some(timeout) = self.statement_timeout() {
            sqlx::query(&format!(
                "SET LOCAL statement_timeout = {}",
                timeout.as_millis().max(1)
            ))
            .execute(&mut *tx)
            .await?;
        }

        let c = &record.correlation;
        sqlx::query(
            "INSERT INTO events (id, occurred_at, sequence, source, entry_type, category, summary, details, duration_ms,
                                 execution_id, task_id, agent_instance_id, wave_id, wave_number, chat_id, script_name,
                                 user_id, session_id, webhook_url, correlation_id)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)",
        )
        .bind(record.id.0)
        .bind(record.timestamp)
        .bind(record.sequence.map(|s| s as i64))
        .bind(record.source.as_str())
        .bind(&record.entry_type)
        .bind(record.category.as_str())
        .bind(&record.summary)
        .bind(&record.details)
        .bind(record.duration_ms.map(|d| d as i64))
        .bind(c.execution_id.map(|id| id.0))
        .bind(&c.task_id)
        .bind(&c.agent_instance_id)
        .bind(c.wave_id.map(|id| id.0))
        .bind(c.wave_number.map(|n| n as i32))
        .bind(&c.chat_id)
        .bind(&c.script_name)
        .bind(&c.user_id)
        .bind(&c.session_id)
        .bind(&c.webhook_url)
        .bind(&c.correlation_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Highest persisted sequence of one execution, 0 when it has none.
    pub async fn fetch_last_sequence(&self, execution_id: ExecutionId) -> Result<u64> {
        let last: Option<i64> =
            sqlx::query_scalar("SELECT MAX(sequence) FROM events WHERE execution_id = $1")
                .bind(execution_id.0)
                .fetch_one(self.pool())
                .await?;
        Ok(last.map_or(0, |s| s.max(0) as u64))
    }

    /// Filtered history read in append order.
    pub async fn fetch_events(&self, query: &EventQuery) -> Result<Vec<EventRecord>> {
        let rows: Vec<EventRow> = sqlx::query_as(
            "SELECT id, occurred_at, sequence, source, entry_type, category, summary, details, duration_ms,
                    execution_id, task_id, agent_instance_id, wave_id, wave_number, chat_id, script_name,
                    user_id, session_id, webhook_url, correlation_id
             FROM events
             WHERE ($1::uuid IS NULL OR execution_id = $1)
             AND ($2::bigint IS NULL OR (sequence IS NOT NULL AND sequence > $2))
             AND ($3::timestamptz IS NULL OR occurred_at >= $3)
             AND ($4::timestamptz IS NULL OR occurred_at < $4)
             AND ($5::text IS NULL OR source = $5)
             AND ($6::text IS NULL OR category = $6)
             AND ($7::text IS NULL OR entry_type = $7)
             ORDER BY ingest_order ASC
             LIMIT $8 OFFSET $9",
        )
        .bind(query.execution_id.map(|id| id.0))
        .bind(query.after_sequence.map(|s| s as i64))
        .bind(query.since)
        .bind(query.until)
        .bind(query.source.map(Source::as_str))
        .bind(query.category.map(Category::as_str))
        .bind(query.entry_type.as_deref())
        .bind(query.effective_limit())
        .bind(query.offset.max(0))
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(EventRow::try_into_record).collect()
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct EventRow {
    id: Uuid,
    occurred_at: chrono::DateTime<chrono::Utc>,
    sequence: Option<i64>,
    source: String,
    entry_type: String,
    category: String,
    summary: String,
    details: serde_json::Value,
    duration_ms: Option<i64>,
    execution_id: Option<Uuid>,
    task_id: Option<String>,
    agent_instance_id: Option<String>,
    wave_id: Option<Uuid>,
    wave_number: Option<i32>,
    chat_id: Option<String>,
    script_name: Option<String>,
    user_id: Option<String>,
    session_id: Option<String>,
    webhook_url: Option<String>,
    correlation_id: Option<String>,
}

impl EventRow {
    fn try_into_record(self) -> Result<EventRecord> {
        Ok(EventRecord {
            id: EventId(self.id),
            timestamp: self.occurred_at,
            sequence: self.sequence.map(|s| s as u64),
            source: self.source.parse()?,
            entry_type: self.entry_type,
            category: self.category.parse()?,
            summary: self.summary,
            details: self.details,
            duration_ms: self.duration_ms.map(|d| d as u64),
            correlation: Correlation {
                execution_id: self.execution_id.map(ExecutionId),
                task_id: self.task_id,
                agent_instance_id: self.agent_instance_id,
                wave_id: self.wave_id.map(WaveId),
                wave_number: self.wave_number.map(|n| n as u32),
                chat_id: self.chat_id,
                script_name: self.script_name,
                user_id: self.user_id,
                session_id: self.session_id,
                webhook_url: self.webhook_url,
                correlation_id: self.correlation_id,
            },
        })
    }
}
