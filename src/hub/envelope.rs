//! Delivered-message envelope.
//!
//! Every message handed to a subscriber sink carries a kind tag, a timestamp,
//! the scope it belongs to, and a kind-specific payload: the full record for
//! history kinds, a compact tuple for lifecycle and heartbeat messages.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::subscription::SubscriptionId;
use crate::model::{EventRecord, ExecutionId, WaveId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    /// A live record.
    Event,
    /// A buffered record delivered on subscribe.
    Replay,
    /// End of the replayed history; live records follow.
    ReplayComplete,
    Lifecycle,
    Heartbeat,
    /// A malformed request was refused.
    Rejected,
}

impl EnvelopeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EnvelopeKind::Event => "event",
            EnvelopeKind::Replay => "replay",
            EnvelopeKind::ReplayComplete => "replay_complete",
            EnvelopeKind::Lifecycle => "lifecycle",
            EnvelopeKind::Heartbeat => "heartbeat",
            EnvelopeKind::Rejected => "rejected",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    pub kind: EnvelopeKind,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<ExecutionId>,
    pub payload: EnvelopePayload,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum EnvelopePayload {
    Record(Arc<EventRecord>),
    ReplayComplete {
        subscription: SubscriptionId,
        replayed: usize,
        /// Matching records the subscriber's backlog could not take.
        dropped: usize,
    },
    Lifecycle(LifecycleSignal),
    Heartbeat {
        subscription: SubscriptionId,
    },
    Rejected {
        reason: String,
    },
}

/// Compact lifecycle notification published alongside the lifecycle record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LifecycleSignal {
    pub execution_id: ExecutionId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wave_id: Option<WaveId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wave_number: Option<u32>,
    pub status: String,
}

impl Envelope {
    pub fn event(record: Arc<EventRecord>) -> Self {
        Self::record(EnvelopeKind::Event, record)
    }

    pub fn replay(record: Arc<EventRecord>) -> Self {
        Self::record(EnvelopeKind::Replay, record)
    }

    fn record(kind: EnvelopeKind, record: Arc<EventRecord>) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
            scope: record.execution_id(),
            payload: EnvelopePayload::Record(record),
        }
    }

    pub fn replay_complete(
        scope: ExecutionId,
        subscription: SubscriptionId,
        replayed: usize,
        dropped: usize,
    ) -> Self {
        Self {
            kind: EnvelopeKind::ReplayComplete,
            timestamp: Utc::now(),
            scope: Some(scope),
            payload: EnvelopePayload::ReplayComplete {
                subscription,
                replayed,
                dropped,
            },
        }
    }

    pub fn lifecycle(signal: LifecycleSignal) -> Self {
        Self {
            kind: EnvelopeKind::Lifecycle,
            timestamp: Utc::now(),
            scope: Some(signal.execution_id),
            payload: EnvelopePayload::Lifecycle(signal),
        }
    }

    pub fn heartbeat(scope: Option<ExecutionId>, subscription: SubscriptionId) -> Self {
        Self {
            kind: EnvelopeKind::Heartbeat,
            timestamp: Utc::now(),
            scope,
            payload: EnvelopePayload::Heartbeat { subscription },
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            kind: EnvelopeKind::Rejected,
            timestamp: Utc::now(),
            scope: None,
            payload: EnvelopePayload::Rejected {
                reason: reason.into(),
            },
        }
    }

    /// The carried record, for `event` and `replay` envelopes.
    pub fn event_record(&self) -> Option<&EventRecord> {
        match &self.payload {
            EnvelopePayload::Record(record) => Some(record),
            _ => None,
        }
    }

    /// Serialize for a text transport.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
