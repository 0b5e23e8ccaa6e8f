//! Read-only queries for the route layer.
//!
//! Reads go to the durable store, except [`History::recent`], which serves
//! the hub's in-memory replay buffer.

use std::sync::Arc;

use serde::Serialize;

use crate::error::Result;
use crate::hub::{Hub, HubStats};
use crate::model::{EventRecord, ExecutionId, ExecutionRun, Wave};
use crate::store::{EventQuery, EventStore, ExecutionQuery, MAX_PAGE_SIZE};

/// One page of a paginated read.
#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub offset: i64,
    pub limit: i64,
    pub has_more: bool,
    /// Offset of the following page, when there is one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_offset: Option<i64>,
}

impl<T> Page<T> {
    /// Build a page from up to `limit + 1` fetched rows. The extra row only
    /// signals that another page exists.
    fn from_overfetch(mut rows: Vec<T>, offset: i64, limit: i64) -> Self {
        let has_more = rows.len() as i64 > limit;
        rows.truncate(limit as usize);
        Self {
            items: rows,
            offset,
            limit,
            has_more,
            next_offset: has_more.then_some(offset + limit),
        }
    }
}

/// An execution with its waves, ordered by wave number.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionDetail {
    pub run: ExecutionRun,
    pub waves: Vec<Wave>,
}

pub struct History<S> {
    store: S,
    hub: Hub,
}

impl<S: EventStore> History<S> {
    pub fn new(store: S, hub: Hub) -> Self {
        Self { store, hub }
    }

    /// Filtered event history in append order.
    pub async fn events(&self, query: &EventQuery) -> Result<Page<EventRecord>> {
        let limit = query.limit.clamp(1, MAX_PAGE_SIZE);
        let offset = query.offset.max(0);
        let lookahead = EventQuery {
            limit: limit + 1,
            offset,
            ..query.clone()
        };
        let rows = self.store.query_events(&lookahead).await?;
        Ok(Page::from_overfetch(rows, offset, limit))
    }

    pub async fn execution(&self, id: ExecutionId) -> Result<ExecutionDetail> {
        let run = self.store.get_execution(id).await?;
        let mut waves = self.store.list_waves(id).await?;
        waves.sort_by_key(|w| w.wave_number);
        Ok(ExecutionDetail { run, waves })
    }

    /// Executions, newest first.
    pub async fn executions(&self, query: &ExecutionQuery) -> Result<Page<ExecutionRun>> {
        let limit = query.limit.clamp(1, MAX_PAGE_SIZE);
        let offset = query.offset.max(0);
        let lookahead = ExecutionQuery {
            limit: limit + 1,
            offset,
            ..query.clone()
        };
        let rows = self.store.list_executions(&lookahead).await?;
        Ok(Page::from_overfetch(rows, offset, limit))
    }

    /// The execution's replay buffer, oldest first. Empty when nothing is buffered.
    pub fn recent(&self, execution_id: ExecutionId) -> Vec<Arc<EventRecord>> {
        self.hub.buffered(execution_id)
    }

    pub fn hub_stats(&self) -> HubStats {
        self.hub.stats()
    }
}
