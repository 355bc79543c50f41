//! Subject name strategies.
//!
//! A subject is the registry namespace a schema is registered under. Which
//! subject a (topic, record) pair maps to is decided by a strategy chosen per
//! role when the client is built:
//!
//! | strategy      | key subject             | value subject            |
//! |---------------|-------------------------|--------------------------|
//! | `Topic`       | `{topic}-key`           | `{topic}-value`          |
//! | `Record`      | `{record}`              | `{record}`               |
//! | `TopicRecord` | `{topic}-{record}`      | `{topic}-{record}`       |

use crate::error::RegistryError;
use std::fmt;
use std::str::FromStr;

/// Which half of a message a schema describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubjectRole {
    Key,
    Value,
}

impl SubjectRole {
    pub fn suffix(&self) -> &'static str {
        match self {
            SubjectRole::Key => "key",
            SubjectRole::Value => "value",
        }
    }
}

/// How a subject name is derived from a topic and a record name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SubjectNameStrategy {
    /// `{topic}-key` / `{topic}-value`
    #[default]
    Topic,
    /// The record's fully-qualified name
    Record,
    /// `{topic}-{record}`
    TopicRecord,
}

impl SubjectNameStrategy {
    pub fn subject_name(&self, topic: &str, record_name: &str, role: SubjectRole) -> String {
        match self {
            SubjectNameStrategy::Topic => format!("{}-{}", topic, role.suffix()),
            SubjectNameStrategy::Record => record_name.to_string(),
            SubjectNameStrategy::TopicRecord => format!("{}-{}", topic, record_name),
        }
    }

    /// Whether the strategy reads the record name at all.
    pub fn uses_record_name(&self) -> bool {
        !matches!(self, SubjectNameStrategy::Topic)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SubjectNameStrategy::Topic => "Topic",
            SubjectNameStrategy::Record => "Record",
            SubjectNameStrategy::TopicRecord => "TopicRecord",
        }
    }
}

impl fmt::Display for SubjectNameStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubjectNameStrategy {
    type Err = RegistryError;

    /// Accepts `Topic`, `Record`, `TopicRecord` in any case, and the
    /// `...NameStrategy` spellings used by Java clients.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let token = s.trim().to_ascii_lowercase();
        let token = token.strip_suffix("namestrategy").unwrap_or(&token);
        match token {
            "topic" => Ok(SubjectNameStrategy::Topic),
            "record" => Ok(SubjectNameStrategy::Record),
            "topicrecord" | "topic_record" => Ok(SubjectNameStrategy::TopicRecord),
            _ => Err(RegistryError::Configuration(format!(
                "unknown subject name strategy '{}' (expected Topic, Record or TopicRecord)",
                s
            ))),
        }
    }
}

/// Per-role strategy pair, fixed for the lifetime of a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SubjectNameResolver {
    pub key: SubjectNameStrategy,
    pub value: SubjectNameStrategy,
}

impl SubjectNameResolver {
    pub fn new(key: SubjectNameStrategy, value: SubjectNameStrategy) -> Self {
        Self { key, value }
    }

    pub fn strategy(&self, role: SubjectRole) -> SubjectNameStrategy {
        match role {
            SubjectRole::Key => self.key,
            SubjectRole::Value => self.value,
        }
    }

    pub fn subject_name(&self, topic: &str, record_name: &str, role: SubjectRole) -> String {
        self.strategy(role).subject_name(topic, record_name, role)
    }

    pub fn key_subject_name(&self, topic: &str, record_name: &str) -> String {
        self.subject_name(topic, record_name, SubjectRole::Key)
    }

    pub fn value_subject_name(&self, topic: &str, record_name: &str) -> String {
        self.subject_name(topic, record_name, SubjectRole::Value)
    }
}
