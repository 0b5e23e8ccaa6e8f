//! Per-execution sequence counters.
//!
//! Each execution owns one counter behind its own async mutex. An emitter
//! holds the counter (a [`SequenceSlot`]) across the durable write and the
//! broadcast, and bumps it only once the write succeeded. Concurrent emitters
//! on the same execution therefore get gap-free, duplicate-free numbers, and
//! publish in sequence order. Different executions never contend.
//!
//! A counter this process has not seen yet is unseeded: the first emitter to
//! acquire it must [`SequenceSlot::seed`] it from the highest persisted
//! sequence before peeking, so numbering continues across restarts.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::model::ExecutionId;

#[derive(Debug, Default)]
struct Counter {
    /// Last committed sequence; `None` until seeded or reset.
    last: Option<u64>,
    /// Detached from the map; holders must look the execution up again.
    removed: bool,
}

#[derive(Debug, Default)]
pub struct SequenceCounter {
    counters: RwLock<HashMap<ExecutionId, Arc<Mutex<Counter>>>>,
}

impl SequenceCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restart numbering for an execution: the next committed sequence is 1.
    ///
    /// Waits for an emitter currently holding the counter to finish.
    pub async fn reset(&self, execution_id: ExecutionId) {
        self.lock(execution_id).await.last = Some(0);
    }

    /// Last committed sequence. 0 when nothing was committed or seeded.
    pub async fn current(&self, execution_id: ExecutionId) -> u64 {
        let Some(counter) = self.existing(execution_id) else {
            return 0;
        };
        let value = counter.lock().await.last.unwrap_or(0);
        value
    }

    /// Take exclusive hold of an execution's counter.
    pub async fn acquire(&self, execution_id: ExecutionId) -> SequenceSlot {
        SequenceSlot {
            guard: self.lock(execution_id).await,
        }
    }

    /// Forget an execution's counter.
    ///
    /// Waits for the current holder. Emitters queued behind it retry against
    /// a fresh, unseeded counter.
    pub async fn remove(&self, execution_id: ExecutionId) {
        let Some(counter) = self.existing(execution_id) else {
            return;
        };
        let mut guard = counter.lock().await;
        if guard.removed {
            return;
        }
        guard.removed = true;
        let mut counters = self
            .counters
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if counters
            .get(&execution_id)
            .is_some_and(|current| Arc::ptr_eq(current, &counter))
        {
            counters.remove(&execution_id);
        }
    }

    /// Executions with a counter.
    pub fn tracked(&self) -> usize {
        self.counters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    async fn lock(&self, execution_id: ExecutionId) -> OwnedMutexGuard<Counter> {
        loop {
            let guard = self.counter(execution_id).lock_owned().await;
            if !guard.removed {
                return guard;
            }
        }
    }

    fn existing(&self, execution_id: ExecutionId) -> Option<Arc<Mutex<Counter>>> {
        self.counters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&execution_id)
            .cloned()
    }

    fn counter(&self, execution_id: ExecutionId) -> Arc<Mutex<Counter>> {
        if let Some(counter) = self.existing(execution_id) {
            return counter;
        }
        let mut counters = self
            .counters
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(counters.entry(execution_id).or_default())
    }
}

/// Exclusive hold on one execution's counter. Released on drop.
pub struct SequenceSlot {
    guard: OwnedMutexGuard<Counter>,
}

impl SequenceSlot {
    /// False until the counter was reset, seeded or committed in this process.
    pub fn is_seeded(&self) -> bool {
        self.guard.last.is_some()
    }

    /// Continue numbering after `last`, the highest sequence already persisted.
    pub fn seed(&mut self, last: u64) {
        self.guard.last = Some(last);
    }

    /// The number the next committed record will carry.
    pub fn peek(&self) -> u64 {
        self.guard.last.unwrap_or(0) + 1
    }

    /// Consume the peeked number.
    pub fn commit(&mut self) -> u64 {
        let next = self.peek();
        self.guard.last = Some(next);
        next
    }
}
