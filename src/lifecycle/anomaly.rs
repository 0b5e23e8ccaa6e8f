use serde::Serialize;

use crate::model::ExecutionId;

/// A lifecycle operation that was refused because it does not fit the
/// current state: a terminal run, an out-of-order wave, an unknown id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Anomaly {
    pub operation: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<ExecutionId>,
    pub reason: String,
}

impl Anomaly {
    pub fn new(
        operation: &'static str,
        execution_id: Option<ExecutionId>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            operation,
            execution_id,
            reason: reason.into(),
        }
    }

    pub(crate) fn unknown_execution(operation: &'static str, execution_id: ExecutionId) -> Self {
        Self::new(
            operation,
            Some(execution_id),
            format!("unknown execution {execution_id}"),
        )
    }
}

impl std::fmt::Display for Anomaly {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.operation, self.reason)
    }
}

/// Outcome of a lifecycle operation.
#[derive(Debug, Clone, PartialEq)]
#[must_use]
pub enum Transition<T> {
    Applied(T),
    Rejected(Anomaly),
}

impl<T> Transition<T> {
    pub fn is_applied(&self) -> bool {
        matches!(self, Transition::Applied(_))
    }

    pub fn applied(self) -> Option<T> {
        match self {
            Transition::Applied(value) => Some(value),
            Transition::Rejected(_) => None,
        }
    }

    pub fn anomaly(&self) -> Option<&Anomaly> {
        match self {
            Transition::Applied(_) => None,
            Transition::Rejected(anomaly) => Some(anomaly),
        }
    }
}
