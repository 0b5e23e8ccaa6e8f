//! Event records and the producer contexts they are normalized from.
//!
//! Producers describe themselves with an [`EventContext`], a tagged variant
//! over the source kinds. The normalizer flattens it into the sparse
//! [`Correlation`] set carried by every [`EventRecord`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{EventId, ExecutionId, WaveId};
use crate::error::{Error, Result};

/// Default cap on summary length, in characters.
pub const DEFAULT_SUMMARY_MAX_CHARS: usize = 200;

// ---------------------------------------------------------------------------
// Event Record
// ---------------------------------------------------------------------------

/// A canonical, immutable unit of history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: EventId,
    /// Millisecond precision.
    pub timestamp: DateTime<Utc>,
    /// Monotonic within one execution, starting at 1. `None` outside an execution.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
    pub source: Source,
    /// Open tag, e.g. `tool_start` or `wave_complete`.
    pub entry_type: String,
    pub category: Category,
    pub summary: String,
    pub details: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(flatten)]
    pub correlation: Correlation,
}

impl EventRecord {
    pub fn execution_id(&self) -> Option<ExecutionId> {
        self.correlation.execution_id
    }

    /// Tool name carried in the details payload, if any.
    pub fn tool_name(&self) -> Option<&str> {
        self.details
            .get("tool_name")
            .or_else(|| self.details.get("tool"))
            .and_then(|v| v.as_str())
    }
}

/// Sparse correlation set. Only the subset valid for the record's source is populated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Correlation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<ExecutionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_instance_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wave_id: Option<WaveId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wave_number: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Source
// ---------------------------------------------------------------------------

/// Producer kind. Closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    AgentRun,
    Chat,
    Script,
    User,
    Webhook,
    System,
    Session,
    Custom,
}

impl Source {
    pub fn as_str(self) -> &'static str {
        match self {
            Source::AgentRun => "agent_run",
            Source::Chat => "chat",
            Source::Script => "script",
            Source::User => "user",
            Source::Webhook => "webhook",
            Source::System => "system",
            Source::Session => "session",
            Source::Custom => "custom",
        }
    }
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Source {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "agent_run" | "agent-run" => Ok(Source::AgentRun),
            "chat" => Ok(Source::Chat),
            "script" => Ok(Source::Script),
            "user" => Ok(Source::User),
            "webhook" => Ok(Source::Webhook),
            "system" => Ok(Source::System),
            "session" => Ok(Source::Session),
            "custom" => Ok(Source::Custom),
            other => Err(Error::InvalidValue {
                field: "source",
                value: other.to_string(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Category
// ---------------------------------------------------------------------------

/// Coarse grouping of entry types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Lifecycle,
    Tool,
    Validation,
    Coordination,
    Message,
    System,
    Error,
    Custom,
}

impl Category {
    pub fn as_str(self) -> &'static str {
        match self {
            Category::Lifecycle => "lifecycle",
            Category::Tool => "tool",
            Category::Validation => "validation",
            Category::Coordination => "coordination",
            Category::Message => "message",
            Category::System => "system",
            Category::Error => "error",
            Category::Custom => "custom",
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Category {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "lifecycle" => Ok(Category::Lifecycle),
            "tool" => Ok(Category::Tool),
            "validation" => Ok(Category::Validation),
            "coordination" => Ok(Category::Coordination),
            "message" => Ok(Category::Message),
            "system" => Ok(Category::System),
            "error" => Ok(Category::Error),
            "custom" => Ok(Category::Custom),
            other => Err(Error::InvalidValue {
                field: "category",
                value: other.to_string(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Payload
// ---------------------------------------------------------------------------

/// What happened, as supplied by the producer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventPayload {
    pub entry_type: String,
    pub category: Category,
    pub summary: String,
    #[serde(default)]
    pub details: serde_json::Value,
    #[serde(default)]
    pub duration_ms: Option<u64>,
}

impl EventPayload {
    pub fn new(
        entry_type: impl Into<String>,
        category: Category,
        summary: impl Into<String>,
    ) -> Self {
        Self {
            entry_type: entry_type.into(),
            category,
            summary: summary.into(),
            details: serde_json::Value::Null,
            duration_ms: None,
        }
    }

    pub fn details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    pub fn duration_ms(mut self, ms: u64) -> Self {
        self.duration_ms = Some(ms);
        self
    }
}

/// Cap a summary at `max` characters. Over-long input is truncated and ends in an ellipsis.
pub fn cap_summary(summary: &str, max: usize) -> String {
    if summary.chars().count() <= max {
        return summary.to_string();
    }
    if max == 0 {
        return String::new();
    }
    let mut capped: String = summary.chars().take(max - 1).collect();
    capped.push('…');
    capped
}

// ---------------------------------------------------------------------------
// Producer contexts
// ---------------------------------------------------------------------------

/// Producer-supplied context: one variant per source kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum EventContext {
    AgentRun(AgentRunContext),
    Chat(ChatContext),
    Script(ScriptContext),
    User(UserContext),
    Webhook(WebhookContext),
    System(SystemContext),
    Session(SessionContext),
    Custom(CustomContext),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRunContext {
    pub execution_id: ExecutionId,
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub agent_instance_id: Option<String>,
    #[serde(default)]
    pub wave_id: Option<WaveId>,
    #[serde(default)]
    pub wave_number: Option<u32>,
    #[serde(default)]
    pub correlation_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatContext {
    pub chat_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub correlation_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptContext {
    pub script_name: String,
    #[serde(default)]
    pub execution_id: Option<ExecutionId>,
    #[serde(default)]
    pub correlation_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserContext {
    pub user_id: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub correlation_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookContext {
    pub webhook_url: String,
    #[serde(default)]
    pub correlation_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemContext {
    #[serde(default)]
    pub execution_id: Option<ExecutionId>,
    #[serde(default)]
    pub wave_id: Option<WaveId>,
    #[serde(default)]
    pub wave_number: Option<u32>,
    #[serde(default)]
    pub correlation_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionContext {
    pub session_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub correlation_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CustomContext {
    #[serde(default)]
    pub execution_id: Option<ExecutionId>,
    #[serde(default)]
    pub correlation_id: Option<String>,
}

impl AgentRunContext {
    pub fn new(execution_id: ExecutionId) -> Self {
        Self {
            execution_id,
            task_id: None,
            agent_instance_id: None,
            wave_id: None,
            wave_number: None,
            correlation_id: None,
        }
    }

    pub fn task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn agent_instance(mut self, agent_instance_id: impl Into<String>) -> Self {
        self.agent_instance_id = Some(agent_instance_id.into());
        self
    }

    pub fn wave(mut self, wave_id: WaveId, wave_number: u32) -> Self {
        self.wave_id = Some(wave_id);
        self.wave_number = Some(wave_number);
        self
    }

    pub fn correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }
}

impl ChatContext {
    pub fn new(chat_id: impl Into<String>) -> Self {
        Self {
            chat_id: chat_id.into(),
            user_id: None,
            session_id: None,
            correlation_id: None,
        }
    }

    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

impl ScriptContext {
    pub fn new(script_name: impl Into<String>) -> Self {
        Self {
            script_name: script_name.into(),
            execution_id: None,
            correlation_id: None,
        }
    }

    pub fn execution(mut self, execution_id: ExecutionId) -> Self {
        self.execution_id = Some(execution_id);
        self
    }
}

impl SystemContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn execution(mut self, execution_id: ExecutionId) -> Self {
        self.execution_id = Some(execution_id);
        self
    }

    pub fn wave(mut self, wave_id: WaveId, wave_number: u32) -> Self {
        self.wave_id = Some(wave_id);
        self.wave_number = Some(wave_number);
        self
    }
}

macro_rules! into_context {
    ($($ctx:ident => $variant:ident),* $(,)?) => {
        $(impl From<$ctx> for EventContext {
            fn from(ctx: $ctx) -> Self {
                EventContext::$variant(ctx)
            }
        })*
    };
}

into_context!(
    AgentRunContext => AgentRun,
    ChatContext => Chat,
    ScriptContext => Script,
    UserContext => User,
    WebhookContext => Webhook,
    SystemContext => System,
    SessionContext => Session,
    CustomContext => Custom,
);

impl EventContext {
    pub fn source(&self) -> Source {
        match self {
            EventContext::AgentRun(_) => Source::AgentRun,
            EventContext::Chat(_) => Source::Chat,
            EventContext::Script(_) => Source::Script,
            EventContext::User(_) => Source::User,
            EventContext::Webhook(_) => Source::Webhook,
            EventContext::System(_) => Source::System,
            EventContext::Session(_) => Source::Session,
            EventContext::Custom(_) => Source::Custom,
        }
    }

    pub fn execution_id(&self) -> Option<ExecutionId> {
        match self {
            EventContext::AgentRun(c) => Some(c.execution_id),
            EventContext::Script(c) => c.execution_id,
            EventContext::System(c) => c.execution_id,
            EventContext::Custom(c) => c.execution_id,
            _ => None,
        }
    }

    /// Check field contents against the source's correlation subset.
    pub fn validate(&self) -> Result<()> {
        match self {
            EventContext::AgentRun(c) => {
                optional_non_empty("task_id", &c.task_id)?;
                optional_non_empty("agent_instance_id", &c.agent_instance_id)?;
                check_wave(c.wave_id, c.wave_number)?;
                optional_non_empty("correlation_id", &c.correlation_id)
            }
            EventContext::Chat(c) => {
                required("chat_id", &c.chat_id)?;
                optional_non_empty("user_id", &c.user_id)?;
                optional_non_empty("session_id", &c.session_id)?;
                optional_non_empty("correlation_id", &c.correlation_id)
            }
            EventContext::Script(c) => {
                required("script_name", &c.script_name)?;
                optional_non_empty("correlation_id", &c.correlation_id)
            }
            EventContext::User(c) => {
                required("user_id", &c.user_id)?;
                optional_non_empty("session_id", &c.session_id)?;
                optional_non_empty("correlation_id", &c.correlation_id)
            }
            EventContext::Webhook(c) => {
                required("webhook_url", &c.webhook_url)?;
                if !(c.webhook_url.starts_with("http://") || c.webhook_url.starts_with("https://"))
                {
                    return Err(Error::InvalidContext(format!(
                        "webhook_url must be http(s): {}",
                        c.webhook_url
                    )));
                }
                optional_non_empty("correlation_id", &c.correlation_id)
            }
            EventContext::System(c) => {
                if c.wave_id.is_some() && c.execution_id.is_none() {
                    return Err(Error::InvalidContext(
                        "system wave correlation requires an execution_id".to_string(),
                    ));
                }
                check_wave(c.wave_id, c.wave_number)?;
                optional_non_empty("correlation_id", &c.correlation_id)
            }
            EventContext::Session(c) => {
                required("session_id", &c.session_id)?;
                optional_non_empty("user_id", &c.user_id)?;
                optional_non_empty("correlation_id", &c.correlation_id)
            }
            EventContext::Custom(c) => optional_non_empty("correlation_id", &c.correlation_id),
        }
    }

    /// Flatten into the record's correlation set. Fields outside the source's subset stay unset.
    pub fn correlation(&self) -> Correlation {
        match self {
            EventContext::AgentRun(c) => Correlation {
                execution_id: Some(c.execution_id),
                task_id: c.task_id.clone(),
                agent_instance_id: c.agent_instance_id.clone(),
                wave_id: c.wave_id,
                wave_number: c.wave_number,
                correlation_id: c.correlation_id.clone(),
                ..Correlation::default()
            },
            EventContext::Chat(c) => Correlation {
                chat_id: Some(c.chat_id.clone()),
                user_id: c.user_id.clone(),
                session_id: c.session_id.clone(),
                correlation_id: c.correlation_id.clone(),
                ..Correlation::default()
            },
            EventContext::Script(c) => Correlation {
                script_name: Some(c.script_name.clone()),
                execution_id: c.execution_id,
                correlation_id: c.correlation_id.clone(),
                ..Correlation::default()
            },
            EventContext::User(c) => Correlation {
                user_id: Some(c.user_id.clone()),
                session_id: c.session_id.clone(),
                correlation_id: c.correlation_id.clone(),
                ..Correlation::default()
            },
            EventContext::Webhook(c) => Correlation {
                webhook_url: Some(c.webhook_url.clone()),
                correlation_id: c.correlation_id.clone(),
                ..Correlation::default()
            },
            EventContext::System(c) => Correlation {
                execution_id: c.execution_id,
                wave_id: c.wave_id,
                wave_number: c.wave_number,
                correlation_id: c.correlation_id.clone(),
                ..Correlation::default()
            },
            EventContext::Session(c) => Correlation {
                session_id: Some(c.session_id.clone()),
                user_id: c.user_id.clone(),
                correlation_id: c.correlation_id.clone(),
                ..Correlation::default()
            },
            EventContext::Custom(c) => Correlation {
                execution_id: c.execution_id,
                correlation_id: c.correlation_id.clone(),
                ..Correlation::default()
            },
        }
    }
}

fn required(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::InvalidContext(format!("{field} must not be empty")));
    }
    Ok(())
}

fn optional_non_empty(field: &str, value: &Option<String>) -> Result<()> {
    match value {
        Some(v) => required(field, v),
        None => Ok(()),
    }
}

fn check_wave(wave_id: Option<WaveId>, wave_number: Option<u32>) -> Result<()> {
    match (wave_id, wave_number) {
        (_, Some(0)) => Err(Error::InvalidContext(
            "wave_number starts at 1".to_string(),
        )),
        (Some(_), None) => Err(Error::InvalidContext(
            "wave_id requires a wave_number".to_string(),
        )),
        _ => Ok(()),
    }
}
