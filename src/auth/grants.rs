//! Permission grants

use crate::topics::TopicPattern;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Types of permissions that can be granted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GrantType {
    /// Stream broadcasts from matching topics
    Read,
    /// Push data frames that handlers republish to matching topics
    Write,
}

impl GrantType {
    /// Parse from string, including "all" which expands to all types
    pub fn parse_all(s: &str) -> Option<Vec<GrantType>> {
        match s.to_lowercase().as_str() {
            "read" => Some(vec![GrantType::Read]),
            "write" => Some(vec![GrantType::Write]),
            "all" => Some(vec![GrantType::Read, GrantType::Write]),
            _ => None,
        }
    }
}

impl fmt::Display for GrantType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GrantType::Read => write!(f, "read"),
            GrantType::Write => write!(f, "write"),
        }
    }
}

/// A single grant: permission type + topic pattern
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grant {
    pub grant_type: GrantType,
    #[serde(with = "topic_pattern_serde")]
    pub pattern: TopicPattern,
}

impl Grant {
    pub fn new(grant_type: GrantType, pattern: TopicPattern) -> Self {
        Self { grant_type, pattern }
    }

    pub fn allows(&self, grant_type: GrantType, topic: &str) -> bool {
        self.grant_type == grant_type && self.pattern.matches(topic)
    }
}

impl fmt::Display for Grant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.grant_type, self.pattern)
    }
}

/// A collection of grants carried by an identity
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantSet {
    grants: Vec<Grant>,
}

impl GrantSet {
    pub fn new() -> Self {
        Self { grants: Vec::new() }
    }

    /// Add a grant to the set, ignoring duplicates
    pub fn add(&mut self, grant: Grant) {
        if !self.grants.iter().any(|g| g == &grant) {
            self.grants.push(grant);
        }
    }

    pub fn allows(&self, grant_type: GrantType, topic: &str) -> bool {
        self.grants.iter().any(|g| g.allows(grant_type, topic))
    }

    pub fn can_read(&self, topic: &str) -> bool {
        self.allows(GrantType::Read, topic)
    }

    pub fn can_write(&self, topic: &str) -> bool {
        self.allows(GrantType::Write, topic)
    }

    pub fn grants(&self) -> &[Grant] {
        &self.grants
    }

    pub fn is_empty(&self) -> bool {
        self.grants.is_empty()
    }
}

impl FromIterator<Grant> for GrantSet {
    fn from_iter<T: IntoIterator<Item = Grant>>(iter: T) -> Self {
        let mut set = GrantSet::new();
        for grant in iter {
            set.add(grant);
        }
        set
    }
}

/// Serde helper for TopicPattern
mod topic_pattern_serde {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S>(pattern: &TopicPattern, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&pattern.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<TopicPattern, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        TopicPattern::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grant_allows() {
        let grant = Grant::new(GrantType::Read, TopicPattern::parse("room:*").unwrap());

        assert!(grant.allows(GrantType::Read, "room:42"));
        assert!(!grant.allows(GrantType::Read, "lobby"));
        assert!(!grant.allows(GrantType::Write, "room:42"));
    }

    #[test]
    fn test_grant_set() {
        let set: GrantSet = [
            Grant::new(GrantType::Read, TopicPattern::parse("room:*").unwrap()),
            Grant::new(GrantType::Write, TopicPattern::parse("room:42").unwrap()),
            Grant::new(GrantType::Write, TopicPattern::parse("room:42").unwrap()),
        ]
        .into_iter()
        .collect();

        assert_eq!(set.grants().len(), 2);
        assert!(set.can_read("room:42"));
        assert!(set.can_read("room:7"));
        assert!(set.can_write("room:42"));
        assert!(!set.can_write("room:7"));
        assert!(!set.can_read("other"));
    }

    #[test]
    fn test_grant_type_parse_all() {
        assert_eq!(GrantType::parse_all("read"), Some(vec![GrantType::Read]));
        assert_eq!(GrantType::parse_all("WRITE"), Some(vec![GrantType::Write]));
        assert_eq!(
            GrantType::parse_all("all"),
            Some(vec![GrantType::Read, GrantType::Write])
        );
        assert_eq!(GrantType::parse_all("create"), None);
    }

    #[test]
    fn test_grant_set_serde() {
        let mut set = GrantSet::new();
        set.add(Grant::new(GrantType::Read, TopicPattern::parse("room:*").unwrap()));

        let json = serde_json::to_value(&set).unwrap();
        assert_eq!(json["grants"][0]["pattern"], "room:*");
        assert_eq!(json["grants"][0]["grant_type"], "read");

        let back: GrantSet = serde_json::from_value(json).unwrap();
        assert_eq!(back, set);
    }
}
