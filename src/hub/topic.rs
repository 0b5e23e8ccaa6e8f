//! Topics: coarse groups of entry types used to filter delivery.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::subscription::SubscriptionError;

/// Coarse category a subscriber can ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    Tools,
    Assertions,
    Skills,
    Lifecycle,
    Agents,
    Messages,
    Errors,
    Other,
}

impl Topic {
    /// Map an entry type to its topic. Hyphens and underscores are interchangeable.
    pub fn of(entry_type: &str) -> Topic {
        let t = entry_type.trim().to_ascii_lowercase().replace('-', "_");
        let has = |prefix: &str| t == prefix.trim_end_matches('_') || t.starts_with(prefix);

        if has("tool_") {
            Topic::Tools
        } else if has("assertion_") || has("validation_") || has("test_") {
            Topic::Assertions
        } else if has("skill_") {
            Topic::Skills
        } else if has("execution_") || has("wave_") || has("task_") || has("lifecycle_") {
            Topic::Lifecycle
        } else if has("agent_") {
            Topic::Agents
        } else if has("chat_") || has("message_") || has("command_") {
            Topic::Messages
        } else if t == "error" || t == "anomaly" || t.ends_with("_error") {
            Topic::Errors
        } else {
            Topic::Other
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Topic::Tools => "tools",
            Topic::Assertions => "assertions",
            Topic::Skills => "skills",
            Topic::Lifecycle => "lifecycle",
            Topic::Agents => "agents",
            Topic::Messages => "messages",
            Topic::Errors => "errors",
            Topic::Other => "other",
        }
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Topic {
    type Err = SubscriptionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tools" => Ok(Topic::Tools),
            "assertions" => Ok(Topic::Assertions),
            "skills" => Ok(Topic::Skills),
            "lifecycle" => Ok(Topic::Lifecycle),
            "agents" => Ok(Topic::Agents),
            "messages" => Ok(Topic::Messages),
            "errors" => Ok(Topic::Errors),
            "other" => Ok(Topic::Other),
            _ => Err(SubscriptionError::UnknownTopic(s.to_string())),
        }
    }
}

/// The topics a subscriber wants. `all` matches every topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSet {
    all: bool,
    topics: BTreeSet<Topic>,
}

impl TopicSet {
    pub fn all() -> Self {
        Self {
            all: true,
            topics: BTreeSet::new(),
        }
    }

    pub fn only(topics: impl IntoIterator<Item = Topic>) -> Self {
        Self {
            all: false,
            topics: topics.into_iter().collect(),
        }
    }

    /// Parse topic names as sent by a client. An empty list means `all`.
    pub fn parse<S: AsRef<str>>(names: &[S]) -> Result<Self, SubscriptionError> {
        if names.is_empty() {
            return Ok(Self::all());
        }
        let mut topics = BTreeSet::new();
        for name in names {
            let name = name.as_ref();
            if name.trim().eq_ignore_ascii_case("all") {
                return Ok(Self::all());
            }
            topics.insert(name.parse()?);
        }
        Ok(Self { all: false, topics })
    }

    pub fn contains(&self, topic: Topic) -> bool {
        self.all || self.topics.contains(&topic)
    }

    pub fn is_all(&self) -> bool {
        self.all
    }
}

impl Default for TopicSet {
    fn default() -> Self {
        Self::all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_types_map_to_topics() {
        assert_eq!(Topic::of("tool_start"), Topic::Tools);
        assert_eq!(Topic::of("tool-output"), Topic::Tools);
        assert_eq!(Topic::of("tool_error"), Topic::Tools);
        assert_eq!(Topic::of("assertion_failed"), Topic::Assertions);
        assert_eq!(Topic::of("skill_invoked"), Topic::Skills);
        assert_eq!(Topic::of("wave_complete"), Topic::Lifecycle);
        assert_eq!(Topic::of("execution_start"), Topic::Lifecycle);
        assert_eq!(Topic::of("chat_command"), Topic::Messages);
        assert_eq!(Topic::of("build_error"), Topic::Errors);
        assert_eq!(Topic::of("something_else"), Topic::Other);
    }

    #[test]
    fn topic_set_parsing() {
        assert!(TopicSet::parse::<&str>(&[]).unwrap().is_all());
        assert!(TopicSet::parse(&["tools", "ALL"]).unwrap().is_all());

        let set = TopicSet::parse(&["tools", "skills"]).unwrap();
        assert!(set.contains(Topic::Tools));
        assert!(!set.contains(Topic::Lifecycle));

        assert!(matches!(
            TopicSet::parse(&["tools", "bogus"]),
            Err(SubscriptionError::UnknownTopic(t)) if t == "bogus"
        ));
    }
}
