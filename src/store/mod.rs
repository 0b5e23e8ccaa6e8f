//! Durable store interface.
//!
//! The pipeline consumes the store as an ordered append target for event
//! records, an upsert target for execution and wave aggregates, and a query
//! interface for the read side. [`crate::db::Db`] implements it over Postgres;
//! [`MemoryStore`] keeps everything in process for tests and demos.

pub mod memory;

pub use memory::MemoryStore;

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::model::*;

/// Default page size for history reads.
pub const DEFAULT_PAGE_SIZE: i64 = 100;
/// Largest page a single read may request.
pub const MAX_PAGE_SIZE: i64 = 1000;

/// Append/upsert/query capability the pipeline needs from persistence.
pub trait EventStore: Send + Sync + 'static {
    /// Append one immutable record. Records are returned by queries in append order.
    fn append_event(&self, record: &EventRecord) -> impl Future<Output = Result<()>> + Send;

    /// Highest sequence persisted for an execution, 0 when it has none.
    fn last_sequence(
        &self,
        execution_id: ExecutionId,
    ) -> impl Future<Output = Result<u64>> + Send;

    fn upsert_execution(&self, run: &ExecutionRun) -> impl Future<Output = Result<()>> + Send;

    fn upsert_wave(&self, wave: &Wave) -> impl Future<Output = Result<()>> + Send;

    fn get_execution(&self, id: ExecutionId)
    -> impl Future<Output = Result<ExecutionRun>> + Send;

    fn get_wave(&self, id: WaveId) -> impl Future<Output = Result<Wave>> + Send;

    /// Waves of one execution, ordered by wave number.
    fn list_waves(
        &self,
        execution_id: ExecutionId,
    ) -> impl Future<Output = Result<Vec<Wave>>> + Send;

    fn query_events(
        &self,
        query: &EventQuery,
    ) -> impl Future<Output = Result<Vec<EventRecord>>> + Send;

    /// Executions ordered newest first.
    fn list_executions(
        &self,
        query: &ExecutionQuery,
    ) -> impl Future<Output = Result<Vec<ExecutionRun>>> + Send;
}

impl<S: EventStore> EventStore for Arc<S> {
    fn append_event(&self, record: &EventRecord) -> impl Future<Output = Result<()>> + Send {
        (**self).append_event(record)
    }

    fn last_sequence(
        &self,
        execution_id: ExecutionId,
    ) -> impl Future<Output = Result<u64>> + Send {
        (**self).last_sequence(execution_id)
    }

    fn upsert_execution(&self, run: &ExecutionRun) -> impl Future<Output = Result<()>> + Send {
        (**self).upsert_execution(run)
    }

    fn upsert_wave(&self, wave: &Wave) -> impl Future<Output = Result<()>> + Send {
        (**self).upsert_wave(wave)
    }

    fn get_execution(
        &self,
        id: ExecutionId,
    ) -> impl Future<Output = Result<ExecutionRun>> + Send {
        (**self).get_execution(id)
    }

    fn get_wave(&self, id: WaveId) -> impl Future<Output = Result<Wave>> + Send {
        (**self).get_wave(id)
    }

    fn list_waves(
        &self,
        execution_id: ExecutionId,
    ) -> impl Future<Output = Result<Vec<Wave>>> + Send {
        (**self).list_waves(execution_id)
    }

    fn query_events(
        &self,
        query: &EventQuery,
    ) -> impl Future<Output = Result<Vec<EventRecord>>> + Send {
        (**self).query_events(query)
    }

    fn list_executions(
        &self,
        query: &ExecutionQuery,
    ) -> impl Future<Output = Result<Vec<ExecutionRun>>> + Send {
        (**self).list_executions(query)
    }
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

/// Filters for event history reads. Unset fields do not constrain the result.
#[derive(Debug, Clone)]
pub struct EventQuery {
    pub execution_id: Option<ExecutionId>,
    /// Only sequenced records with a sequence strictly greater than this.
    pub after_sequence: Option<u64>,
    /// Inclusive lower bound.
    pub since: Option<DateTime<Utc>>,
    /// Exclusive upper bound.
    pub until: Option<DateTime<Utc>>,
    pub source: Option<Source>,
    pub category: Option<Category>,
    pub entry_type: Option<String>,
    pub limit: i64,
    pub offset: i64,
}

impl Default for EventQuery {
    fn default() -> Self {
        Self {
            execution_id: None,
            after_sequence: None,
            since: None,
            until: None,
            source: None,
            category: None,
            entry_type: None,
            limit: DEFAULT_PAGE_SIZE,
            offset: 0,
        }
    }
}

impl EventQuery {
    pub fn for_execution(execution_id: ExecutionId) -> Self {
        Self {
            execution_id: Some(execution_id),
            ..Self::default()
        }
    }

    pub fn after_sequence(mut self, sequence: u64) -> Self {
        self.after_sequence = Some(sequence);
        self
    }

    pub fn window(mut self, since: DateTime<Utc>, until: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self.until = Some(until);
        self
    }

    pub fn source(mut self, source: Source) -> Self {
        self.source = Some(source);
        self
    }

    pub fn category(mut self, category: Category) -> Self {
        self.category = Some(category);
        self
    }

    pub fn entry_type(mut self, entry_type: impl Into<String>) -> Self {
        self.entry_type = Some(entry_type.into());
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = limit;
        self
    }

    pub fn offset(mut self, offset: i64) -> Self {
        self.offset = offset;
        self
    }

    /// Row limit for the store. One row beyond [`MAX_PAGE_SIZE`] is allowed
    /// so pagers can look ahead.
    pub fn effective_limit(&self) -> i64 {
        self.limit.clamp(1, MAX_PAGE_SIZE + 1)
    }

    /// Does `record` satisfy every filter? Pagination is not considered.
    pub fn matches(&self, record: &EventRecord) -> bool {
        if self
            .execution_id
            .is_some_and(|id| record.correlation.execution_id != Some(id))
        {
            return false;
        }
        if let Some(after) = self.after_sequence {
            match record.sequence {
                Some(seq) if seq > after => {}
                _ => return false,
            }
        }
        if self.since.is_some_and(|since| record.timestamp < since) {
            return false;
        }
        if self.until.is_some_and(|until| record.timestamp >= until) {
            return false;
        }
        if self.source.is_some_and(|s| record.source != s) {
            return false;
        }
        if self.category.is_some_and(|c| record.category != c) {
            return false;
        }
        if let Some(ref entry_type) = self.entry_type {
            if &record.entry_type != entry_type {
                return false;
            }
        }
        true
    }
}

/// Filters for execution listings.
#[derive(Debug, Clone)]
pub struct ExecutionQuery {
    pub status: Option<ExecutionStatus>,
    pub work_item_id: Option<String>,
    pub limit: i64,
    pub offset: i64,
}

impl Default for ExecutionQuery {
    fn default() -> Self {
        Self {
            status: None,
            work_item_id: None,
            limit: DEFAULT_PAGE_SIZE,
            offset: 0,
        }
    }
}

impl ExecutionQuery {
    pub fn effective_limit(&self) -> i64 {
        self.limit.clamp(1, MAX_PAGE_SIZE + 1)
    }

    pub fn matches(&self, run: &ExecutionRun) -> bool {
        self.status.is_none_or(|s| run.status == s)
            && self
                .work_item_id
                .as_ref()
                .is_none_or(|w| &run.work_item_id == w)
    }
}
