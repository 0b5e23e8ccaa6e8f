//! Execution runs and waves: the aggregates owned by the lifecycle tracker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ExecutionId, WaveId};
use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Execution Run
// ---------------------------------------------------------------------------

/// One end-to-end run of orchestrated work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRun {
    pub id: ExecutionId,
    /// The work item this execution belongs to. Opaque to the tracker.
    pub work_item_id: String,
    pub status: ExecutionStatus,
    pub total_tasks: u32,
    pub completed_tasks: u32,
    pub failed_tasks: u32,
    pub total_waves: u32,
    /// Wave currently executing. 0 when the execution has no waves.
    pub current_wave: u32,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Lifecycle state of an execution run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    /// Terminal.
    Completed,
    /// Terminal.
    Failed,
    /// Terminal.
    Cancelled,
}

impl ExecutionStatus {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, to),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(ExecutionStatus::Pending),
            "running" => Ok(ExecutionStatus::Running),
            "completed" => Ok(ExecutionStatus::Completed),
            "failed" => Ok(ExecutionStatus::Failed),
            "cancelled" => Ok(ExecutionStatus::Cancelled),
            other => Err(Error::InvalidValue {
                field: "execution status",
                value: other.to_string(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Wave
// ---------------------------------------------------------------------------

/// A bounded, ordered group of parallel tasks inside an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Wave {
    pub id: WaveId,
    pub execution_id: ExecutionId,
    /// Strictly increasing per execution, starting at 1.
    pub wave_number: u32,
    pub status: WaveStatus,
    pub task_count: u32,
    pub completed_count: u32,
    pub failed_count: u32,
    pub duration_ms: Option<u64>,
    /// completed / task_count, 0 when the wave has no tasks.
    pub pass_rate: f64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Lifecycle state of a wave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaveStatus {
    Pending,
    InProgress,
    /// Terminal.
    Completed,
    /// Terminal.
    Failed,
}

impl WaveStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, WaveStatus::Completed | WaveStatus::Failed)
    }

    /// Outcome of a finished wave: any failed task fails the wave.
    pub fn from_counts(failed: u32) -> Self {
        if failed == 0 {
            WaveStatus::Completed
        } else {
            WaveStatus::Failed
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WaveStatus::Pending => "pending",
            WaveStatus::InProgress => "in_progress",
            WaveStatus::Completed => "completed",
            WaveStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for WaveStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WaveStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(WaveStatus::Pending),
            "in_progress" => Ok(WaveStatus::InProgress),
            "completed" => Ok(WaveStatus::Completed),
            "failed" => Ok(WaveStatus::Failed),
            other => Err(Error::InvalidValue {
                field: "wave status",
                value: other.to_string(),
            }),
        }
    }
}

/// Fraction of a wave's tasks that completed. Defined as 0 for an empty wave.
pub fn pass_rate(completed: u32, task_count: u32) -> f64 {
    if task_count == 0 {
        0.0
    } else {
        f64::from(completed) / f64::from(task_count)
    }
}
