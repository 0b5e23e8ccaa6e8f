//! Subscription scope, filters, and the client-facing request shape.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::topic::{Topic, TopicSet};
use crate::model::{EventRecord, ExecutionId};

/// Rejection reasons for subscription requests.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubscriptionError {
    #[error("unknown topic: {0}")]
    UnknownTopic(String),

    #[error("invalid scope: {0}")]
    InvalidScope(String),

    #[error("malformed request: {0}")]
    Malformed(String),

    #[error("unknown subscription: {0}")]
    UnknownSubscription(SubscriptionId),
}

/// Hub-assigned subscription identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(pub u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Which records a subscription is routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    Execution(ExecutionId),
    /// Every record, regardless of execution.
    All,
}

impl Scope {
    pub fn execution_id(self) -> Option<ExecutionId> {
        match self {
            Scope::Execution(id) => Some(id),
            Scope::All => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Scope::Execution(_) => "execution",
            Scope::All => "all",
        }
    }
}

impl std::str::FromStr for Scope {
    type Err = SubscriptionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("all") {
            return Ok(Scope::All);
        }
        ExecutionId::parse(s)
            .map(Scope::Execution)
            .map_err(|_| SubscriptionError::InvalidScope(s.to_string()))
    }
}

/// What a subscriber receives.
#[derive(Debug, Clone)]
pub struct SubscriptionFilter {
    pub scope: Scope,
    pub topics: TopicSet,
    pub task_id: Option<String>,
    pub tool_name: Option<String>,
    /// Receive the execution's buffered history before live records.
    /// Ignored for [`Scope::All`].
    pub replay: bool,
}

impl SubscriptionFilter {
    /// Every topic of one execution, with replay.
    pub fn execution(id: ExecutionId) -> Self {
        Self {
            scope: Scope::Execution(id),
            topics: TopicSet::all(),
            task_id: None,
            tool_name: None,
            replay: true,
        }
    }

    /// Every topic of every execution, live only.
    pub fn all() -> Self {
        Self {
            scope: Scope::All,
            topics: TopicSet::all(),
            task_id: None,
            tool_name: None,
            replay: false,
        }
    }

    pub fn topics(mut self, topics: TopicSet) -> Self {
        self.topics = topics;
        self
    }

    pub fn task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn tool(mut self, tool_name: impl Into<String>) -> Self {
        self.tool_name = Some(tool_name.into());
        self
    }

    pub fn replay(mut self, replay: bool) -> Self {
        self.replay = replay;
        self
    }

    pub fn has_field_filters(&self) -> bool {
        self.task_id.is_some() || self.tool_name.is_some()
    }

    /// Should a record with the given topic be delivered to this subscriber?
    pub fn matches(&self, record: &EventRecord, topic: Topic) -> bool {
        if let Scope::Execution(id) = self.scope {
            if record.correlation.execution_id != Some(id) {
                return false;
            }
        }
        if !self.topics.contains(topic) {
            return false;
        }
        if let Some(ref task_id) = self.task_id {
            if record.correlation.task_id.as_ref() != Some(task_id) {
                return false;
            }
        }
        if let Some(ref tool_name) = self.tool_name {
            if record.tool_name() != Some(tool_name.as_str()) {
                return false;
            }
        }
        true
    }
}

/// Subscription request as sent by a client over the transport.
///
/// ```json
/// {"scope": "all", "topics": ["tools"], "tool_name": "bash"}
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct SubscribeRequest {
    /// An execution id, or `"all"`.
    pub scope: String,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub tool_name: Option<String>,
    #[serde(default = "default_replay")]
    pub replay: bool,
}

fn default_replay() -> bool {
    true
}

impl TryFrom<SubscribeRequest> for SubscriptionFilter {
    type Error = SubscriptionError;

    fn try_from(req: SubscribeRequest) -> Result<Self, Self::Error> {
        let scope: Scope = req.scope.parse()?;
        let topics = TopicSet::parse(&req.topics)?;
        for (field, value) in [("task_id", &req.task_id), ("tool_name", &req.tool_name)] {
            if value.as_ref().is_some_and(|v| v.trim().is_empty()) {
                return Err(SubscriptionError::Malformed(format!(
                    "{field} must not be empty"
                )));
            }
        }
        Ok(Self {
            scope,
            topics,
            task_id: req.task_id,
            tool_name: req.tool_name,
            replay: req.replay && matches!(scope, Scope::Execution(_)),
        })
    }
}

/// Revocable handle for one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    pub id: SubscriptionId,
    pub scope: Scope,
}
