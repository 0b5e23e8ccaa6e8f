//! Event normalizer: the single ingestion point for every producer.
//!
//! `emit` validates the producer context, stamps id, timestamp and (inside an
//! execution) a sequence number, writes the record durably, then hands it to
//! the hub. It never fails the caller: a bad context comes back as
//! [`Emitted::Rejected`], a failed or slow write as [`Emitted::Dropped`].

pub mod sequence;

pub use sequence::{SequenceCounter, SequenceSlot};

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{SubsecRound, Utc};
use opentelemetry::KeyValue;
use tracing::{Instrument, debug, warn};

use crate::hub::Hub;
use crate::model::*;
use crate::store::EventStore;
use crate::telemetry::{metrics, spans};

#[derive(Debug, Clone)]
pub struct NormalizerConfig {
    pub summary_max_chars: usize,
    /// Upper bound on one durable write. A slower write drops the record.
    pub write_timeout: Duration,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            summary_max_chars: DEFAULT_SUMMARY_MAX_CHARS,
            write_timeout: Duration::from_secs(2),
        }
    }
}

/// Outcome of one emit call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Emitted {
    /// Persisted and broadcast.
    Recorded {
        id: EventId,
        sequence: Option<u64>,
    },
    /// The durable write (or the sequence lookup before it) failed or timed
    /// out. Not broadcast; no sequence consumed.
    Dropped { id: EventId, reason: String },
    /// The context was inconsistent with its source. Nothing was written.
    Rejected { reason: String },
}

impl Emitted {
    pub fn id(&self) -> Option<EventId> {
        match self {
            Emitted::Recorded { id, .. } | Emitted::Dropped { id, .. } => Some(*id),
            Emitted::Rejected { .. } => None,
        }
    }

    pub fn sequence(&self) -> Option<u64> {
        match self {
            Emitted::Recorded { sequence, .. } => *sequence,
            _ => None,
        }
    }

    pub fn is_recorded(&self) -> bool {
        matches!(self, Emitted::Recorded { .. })
    }

    fn outcome(&self) -> &'static str {
        match self {
            Emitted::Recorded { .. } => "recorded",
            Emitted::Dropped { .. } => "dropped",
            Emitted::Rejected { .. } => "rejected",
        }
    }
}

struct Inner<S> {
    store: S,
    hub: Hub,
    counters: Arc<SequenceCounter>,
    config: NormalizerConfig,
}

/// Cheap to clone; clones share the store, hub and counters.
pub struct Normalizer<S> {
    inner: Arc<Inner<S>>,
}

impl<S> Clone for Normalizer<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: EventStore> Normalizer<S> {
    pub fn new(store: S, hub: Hub, config: NormalizerConfig) -> Self {
        Self::with_counters(store, hub, Arc::new(SequenceCounter::new()), config)
    }

    /// Build around an existing counter service.
    pub fn with_counters(
        store: S,
        hub: Hub,
        counters: Arc<SequenceCounter>,
        config: NormalizerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                hub,
                counters,
                config,
            }),
        }
    }

    pub fn store(&self) -> &S {
        &self.inner.store
    }

    pub fn hub(&self) -> &Hub {
        &self.inner.hub
    }

    pub fn counters(&self) -> &SequenceCounter {
        &self.inner.counters
    }

    pub fn config(&self) -> &NormalizerConfig {
        &self.inner.config
    }

    /// Normalize, persist and broadcast one record.
    pub async fn emit(&self, context: impl Into<EventContext>, payload: EventPayload) -> Emitted {
        self.ingest(context.into(), payload, true).await
    }

    /// Record without a sequence number even inside an execution.
    /// Used for markers that open an execution's activity window.
    pub(crate) async fn emit_unsequenced(
        &self,
        context: impl Into<EventContext>,
        payload: EventPayload,
    ) -> Emitted {
        self.ingest(context.into(), payload, false).await
    }

    /// System-sourced record outside any execution.
    pub async fn emit_system(
        &self,
        entry_type: &str,
        summary: &str,
        details: serde_json::Value,
    ) -> Emitted {
        let payload = EventPayload::new(entry_type, Category::System, summary).details(details);
        self.emit(SystemContext::new(), payload).await
    }

    /// System-sourced lifecycle record scoped to an execution.
    pub async fn emit_lifecycle(
        &self,
        execution_id: ExecutionId,
        entry_type: &str,
        summary: &str,
        details: serde_json::Value,
    ) -> Emitted {
        let payload = EventPayload::new(entry_type, Category::Lifecycle, summary).details(details);
        self.emit(SystemContext::new().execution(execution_id), payload)
            .await
    }

    async fn ingest(&self, context: EventContext, payload: EventPayload, sequenced: bool) -> Emitted {
        let source = context.source();
        let span = spans::start_emit_span(source, &payload.entry_type);
        let emitted = self
            .ingest_inner(context, payload, sequenced)
            .instrument(span.clone())
            .await;

        span.record("event.outcome", emitted.outcome());
        if let Some(seq) = emitted.sequence() {
            span.record("event.sequence", seq);
        }
        metrics::events_emitted().add(
            1,
            &[
                KeyValue::new("source", source.as_str()),
                KeyValue::new("outcome", emitted.outcome()),
            ],
        );
        emitted
    }

    async fn ingest_inner(
        &self,
        context: EventContext,
        payload: EventPayload,
        sequenced: bool,
    ) -> Emitted {
        if let Err(e) = check(&context, &payload) {
            warn!(source = %context.source(), entry_type = %payload.entry_type, error = %e, "event rejected");
            return Emitted::Rejected {
                reason: e.to_string(),
            };
        }

        let record = EventRecord {
            id: EventId::new(),
            timestamp: Utc::now().trunc_subsecs(3),
            sequence: None,
            source: context.source(),
            entry_type: payload.entry_type,
            category: payload.category,
            summary: cap_summary(&payload.summary, self.inner.config.summary_max_chars),
            details: payload.details,
            duration_ms: payload.duration_ms,
            correlation: context.correlation(),
        };

        match record.execution_id().filter(|_| sequenced) {
            Some(execution_id) => {
                // Held until the record is published.
                let mut slot = self.inner.counters.acquire(execution_id).await;
                if !slot.is_seeded() {
                    match self.last_sequence(execution_id).await {
                        Ok(last) => slot.seed(last),
                        Err(reason) => return self.finish(record, Err(reason)),
                    }
                }
                let record = EventRecord {
                    sequence: Some(slot.peek()),
                    ..record
                };
                let written = self.persist(&record).await;
                if written.is_ok() {
                    slot.commit();
                }
                self.finish(record, written)
            }
            None => {
                let written = self.persist(&record).await;
                self.finish(record, written)
            }
        }
    }

    /// Highest persisted sequence, for a counter this process has not seen.
    async fn last_sequence(&self, execution_id: ExecutionId) -> Result<u64, String> {
        let timeout = self.inner.config.write_timeout;
        match tokio::time::timeout(timeout, self.inner.store.last_sequence(execution_id)).await {
            Ok(Ok(last)) => {
                debug!(execution_id = %execution_id, last, "sequence counter seeded from store");
                Ok(last)
            }
            Ok(Err(e)) => Err(format!("sequence lookup failed: {e}")),
            Err(_) => Err(format!(
                "sequence lookup timed out after {}ms",
                timeout.as_millis()
            )),
        }
    }

    async fn persist(&self, record: &EventRecord) -> Result<(), String> {
        let started = Instant::now();
        let written =
            tokio::time::timeout(self.inner.config.write_timeout, self.inner.store.append_event(record))
                .await;
        let outcome = match written {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!(
                "write timed out after {}ms",
                self.inner.config.write_timeout.as_millis()
            )),
        };
        metrics::emit_duration_ms().record(
            started.elapsed().as_secs_f64() * 1000.0,
            &[KeyValue::new(
                "outcome",
                if outcome.is_ok() { "ok" } else { "error" },
            )],
        );
        outcome
    }

    fn finish(&self, record: EventRecord, written: Result<(), String>) -> Emitted {
        let id = record.id;
        match written {
            Ok(()) => {
                let sequence = record.sequence;
                let record = Arc::new(record);
                let delivered = self.inner.hub.publish(Arc::clone(&record));
                debug!(
                    record_id = %id,
                    entry_type = %record.entry_type,
                    sequence = ?sequence,
                    delivered,
                    "event recorded"
                );
                Emitted::Recorded { id, sequence }
            }
            Err(reason) => {
                warn!(
                    record_id = %id,
                    execution_id = ?record.execution_id(),
                    entry_type = %record.entry_type,
                    error = %reason,
                    "event dropped, durable write failed"
                );
                Emitted::Dropped { id, reason }
            }
        }
    }
}

fn check(context: &EventContext, payload: &EventPayload) -> crate::error::Result<()> {
    context.validate()?;
    if payload.entry_type.trim().is_empty() {
        return Err(crate::error::Error::InvalidContext(
            "entry_type must not be empty".to_string(),
        ));
    }
    Ok(())
}
