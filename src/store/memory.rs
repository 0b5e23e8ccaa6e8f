//! In-process store.
//!
//! Keeps records in append order and aggregates in maps. Supports a simulated
//! outage and an artificial write delay so failure handling can be exercised.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::{EventQuery, EventStore, ExecutionQuery};
use crate::error::{Error, Result};
use crate::model::*;

#[derive(Default)]
struct Tables {
    events: Vec<EventRecord>,
    executions: HashMap<ExecutionId, ExecutionRun>,
    waves: HashMap<WaveId, Wave>,
}

/// Store backed by process memory.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    outage: AtomicBool,
    write_delay: Mutex<Option<Duration>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// While an outage is active every write fails with [`Error::Unavailable`].
    pub fn set_outage(&self, down: bool) {
        self.outage.store(down, Ordering::SeqCst);
    }

    /// Delay applied before every event append.
    pub fn set_write_delay(&self, delay: Option<Duration>) {
        *self
            .write_delay
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = delay;
    }

    /// Snapshot of every stored record, in append order.
    pub fn events(&self) -> Vec<EventRecord> {
        self.tables().events.clone()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_available(&self) -> Result<()> {
        if self.outage.load(Ordering::SeqCst) {
            Err(Error::Unavailable("memory store outage".to_string()))
        } else {
            Ok(())
        }
    }

    fn delay(&self) -> Option<Duration> {
        *self
            .write_delay
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl EventStore for MemoryStore {
    async fn append_event(&self, record: &EventRecord) -> Result<()> {
        if let Some(delay) = self.delay() {
            tokio::time::sleep(delay).await;
        }
        self.check_available()?;
        self.tables().events.push(record.clone());
        Ok(())
    }

    async fn last_sequence(&self, execution_id: ExecutionId) -> Result<u64> {
        Ok(self
            .tables()
            .events
            .iter()
            .filter(|r| r.correlation.execution_id == Some(execution_id))
            .filter_map(|r| r.sequence)
            .max()
            .unwrap_or(0))
    }

    async fn upsert_execution(&self, run: &ExecutionRun) -> Result<()> {
        self.check_available()?;
        self.tables().executions.insert(run.id, run.clone());
        Ok(())
    }

    async fn upsert_wave(&self, wave: &Wave) -> Result<()> {
        self.check_available()?;
        self.tables().waves.insert(wave.id, wave.clone());
        Ok(())
    }

    async fn get_execution(&self, id: ExecutionId) -> Result<ExecutionRun> {
        self.tables()
            .executions
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("execution {id}")))
    }

    async fn get_wave(&self, id: WaveId) -> Result<Wave> {
        self.tables()
            .waves
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("wave {id}")))
    }

    async fn list_waves(&self, execution_id: ExecutionId) -> Result<Vec<Wave>> {
        let mut waves: Vec<Wave> = self
            .tables()
            .waves
            .values()
            .filter(|w| w.execution_id == execution_id)
            .cloned()
            .collect();
        waves.sort_by_key(|w| w.wave_number);
        Ok(waves)
    }

    async fn query_events(&self, query: &EventQuery) -> Result<Vec<EventRecord>> {
        Ok(self
            .tables()
            .events
            .iter()
            .filter(|r| query.matches(r))
            .skip(query.offset.max(0) as usize)
            .take(query.effective_limit() as usize)
            .cloned()
            .collect())
    }

    async fn list_executions(&self, query: &ExecutionQuery) -> Result<Vec<ExecutionRun>> {
        let mut runs: Vec<ExecutionRun> = self
            .tables()
            .executions
            .values()
            .filter(|r| query.matches(r))
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(runs
            .into_iter()
            .skip(query.offset.max(0) as usize)
            .take(query.effective_limit() as usize)
            .collect())
    }
}
