//! Execution run and wave aggregates: upserts and lookups.

use crate::error::{Error, Result};
use crate::model::*;
use crate::store::ExecutionQuery;
use uuid::Uuid;

impl super::Db {
    /// Insert or overwrite an execution row.
    pub async fn save_execution(&self, run: &ExecutionRun) -> Result<()> {
        sqlx::query(
            "INSERT INTO executions (id, work_item_id, status, total_tasks, completed_tasks, failed_tasks,
                                     total_waves, current_wave, error, started_at, completed_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
             ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status,
                total_tasks = EXCLUDED.total_tasks,
                completed_tasks = EXCLUDED.completed_tasks,
                failed_tasks = EXCLUDED.failed_tasks,
                total_waves = EXCLUDED.total_waves,
                current_wave = EXCLUDED.current_wave,
                error = EXCLUDED.error,
                completed_at = EXCLUDED.completed_at",
        )
        .bind(run.id.0)
        .bind(&run.work_item_id)
        .bind(run.status.as_str())
        .bind(run.total_tasks as i32)
        .bind(run.completed_tasks as i32)
        .bind(run.failed_tasks as i32)
        .bind(run.total_waves as i32)
        .bind(run.current_wave as i32)
        .bind(&run.error)
        .bind(run.started_at)
        .bind(run.completed_at)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Insert or overwrite a wave row.
    pub async fn save_wave(&self, wave: &Wave) -> Result<()> {
        sqlx::query(
            "INSERT INTO waves (id, execution_id, wave_number, status, task_count, completed_count, failed_count,
                                duration_ms, pass_rate, started_at, completed_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
             ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status,
                completed_count = EXCLUDED.completed_count,
                failed_count = EXCLUDED.failed_count,
                duration_ms = EXCLUDED.duration_ms,
                pass_rate = EXCLUDED.pass_rate,
                completed_at = EXCLUDED.completed_at",
        )
        .bind(wave.id.0)
        .bind(wave.execution_id.0)
        .bind(wave.wave_number as i32)
        .bind(wave.status.as_str())
        .bind(wave.task_count as i32)
        .bind(wave.completed_count as i32)
        .bind(wave.failed_count as i32)
        .bind(wave.duration_ms.map(|d| d as i64))
        .bind(wave.pass_rate)
        .bind(wave.started_at)
        .bind(wave.completed_at)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Get an execution by ID.
    pub async fn fetch_execution(&self, id: ExecutionId) -> Result<ExecutionRun> {
        let row: Option<ExecutionRow> = sqlx::query_as(
            "SELECT id, work_item_id, status, total_tasks, completed_tasks, failed_tasks, total_waves,
                    current_wave, error, started_at, completed_at
             FROM executions WHERE id = $1",
        )
        .bind(id.0)
        .fetch_optional(self.pool())
        .await?;

        row.ok_or_else(|| Error::NotFound(format!("execution {id}")))?
            .try_into_run()
    }

    /// List executions, newest first.
    pub async fn fetch_executions(&self, query: &ExecutionQuery) -> Result<Vec<ExecutionRun>> {
        let rows: Vec<ExecutionRow> = sqlx::query_as(
            "SELECT id, work_item_id, status, total_tasks, completed_tasks, failed_tasks, total_waves,
                    current_wave, error, started_at, completed_at
             FROM executions
             WHERE ($1::text IS NULL OR status = $1)
             AND ($2::text IS NULL OR work_item_id = $2)
             ORDER BY started_at DESC
             LIMIT $3 OFFSET $4",
        )
        .bind(query.status.map(ExecutionStatus::as_str))
        .bind(query.work_item_id.as_deref())
        .bind(query.effective_limit())
        .bind(query.offset.max(0))
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(ExecutionRow::try_into_run).collect()
    }

    /// Get a wave by ID.
    pub async fn fetch_wave(&self, id: WaveId) -> Result<Wave> {
        let row: Option<WaveRow> = sqlx::query_as(
            "SELECT id, execution_id, wave_number, status, task_count, completed_count, failed_count,
                    duration_ms, pass_rate, started_at, completed_at
             FROM waves WHERE id = $1",
        )
        .bind(id.0)
        .fetch_optional(self.pool())
        .await?;

        row.ok_or_else(|| Error::NotFound(format!("wave {id}")))?
            .try_into_wave()
    }

    /// Waves of one execution, ordered by wave number.
    pub async fn fetch_waves(&self, execution_id: ExecutionId) -> Result<Vec<Wave>> {
        let rows: Vec<WaveRow> = sqlx::query_as(
            "SELECT id, execution_id, wave_number, status, task_count, completed_count, failed_count,
                    duration_ms, pass_rate, started_at, completed_at
             FROM waves WHERE execution_id = $1
             ORDER BY wave_number ASC",
        )
        .bind(execution_id.0)
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(WaveRow::try_into_wave).collect()
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct ExecutionRow {
    id: Uuid,
    work_item_id: String,
    status: String,
    total_tasks: i32,
    completed_tasks: i32,
    failed_tasks: i32,
    total_waves: i32,
    current_wave: i32,
    error: Option<String>,
    started_at: chrono::DateTime<chrono::Utc>,
    completed_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl ExecutionRow {
    fn try_into_run(self) -> Result<ExecutionRun> {
        Ok(ExecutionRun {
            id: ExecutionId(self.id),
            work_item_id: self.work_item_id,
            status: self.status.parse()?,
            total_tasks: self.total_tasks as u32,
            completed_tasks: self.completed_tasks as u32,
            failed_tasks: self.failed_tasks as u32,
            total_waves: self.total_waves as u32,
            current_wave: self.current_wave as u32,
            error: self.error,
            started_at: self.started_at,
            completed_at: self.completed_at,
        })
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct WaveRow {
    id: Uuid,
    execution_id: Uuid,
    wave_number: i32,
    status: String,
    task_count: i32,
    completed_count: i32,
    failed_count: i32,
    duration_ms: Option<i64>,
    pass_rate: f64,
    started_at: chrono::DateTime<chrono::Utc>,
    completed_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl WaveRow {
    fn try_into_wave(self) -> Result<Wave> {
        Ok(Wave {
            id: WaveId(self.id),
            execution_id: ExecutionId(self.execution_id),
            wave_number: self.wave_number as u32,
            status: self.status.parse()?,
            task_count: self.task_count as u32,
            completed_count: self.completed_count as u32,
            failed_count: self.failed_count as u32,
            duration_ms: self.duration_ms.map(|d| d as u64),
            pass_rate: self.pass_rate,
            started_at: self.started_at,
            completed_at: self.completed_at,
        })
    }
}
