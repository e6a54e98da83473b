//! Topic naming and pattern matching
//!
//! Topics are segments joined by `.` or `:` separators: `room:42`,
//! `chat.room.42.messages`. Each segment must match: [a-zA-Z0-9_-]+
//!
//! Patterns (used by grants and channel routes) may end with a wildcard:
//! - `room:*` matches `room:42`, `room:42:typing`
//! - `chat.*` matches anything under `chat.`
//! - `*` matches everything (admin only)

use std::fmt;
use thiserror::Error;

/// Valid characters for a topic segment
fn is_valid_segment_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

fn is_separator(c: char) -> bool {
    c == '.' || c == ':'
}

/// Validate a single segment
fn is_valid_segment(s: &str) -> bool {
    !s.is_empty() && s.chars().all(is_valid_segment_char)
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopicError {
    #[error("topic name cannot be empty")]
    Empty,

    #[error("invalid segment '{0}': must match [a-zA-Z0-9_-]+")]
    InvalidSegment(String),

    #[error("wildcard '*' can only appear as the last segment")]
    WildcardNotAtEnd,

    #[error("empty segment in topic name")]
    EmptySegment,
}

fn validate_segments(name: &str) -> Result<usize, TopicError> {
    let mut count = 0;
    for part in name.split(is_separator) {
        if part.is_empty() {
            return Err(TopicError::EmptySegment);
        }
        if part.contains('*') {
            return Err(TopicError::WildcardNotAtEnd);
        }
        if !is_valid_segment(part) {
            return Err(TopicError::InvalidSegment(part.to_string()));
        }
        count += 1;
    }
    Ok(count)
}

/// A validated topic name (no wildcards)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicName {
    name: String,
    segments: usize,
}

impl TopicName {
    /// Parse and validate a topic name
    pub fn parse(name: &str) -> Result<Self, TopicError> {
        if name.is_empty() {
            return Err(TopicError::Empty);
        }

        let segments = validate_segments(name)?;

        Ok(Self {
            name: name.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.name
    }

    pub fn segment_count(&self) -> usize {
        self.segments
    }

    pub fn into_string(self) -> String {
        self.name
    }
}

impl fmt::Display for TopicName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

impl AsRef<str> for TopicName {
    fn as_ref(&self) -> &str {
        &self.name
    }
}

/// A topic pattern that may include a trailing wildcard
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicPattern {
    /// The prefix before the wildcard (or full name if no wildcard),
    /// including the trailing separator for wildcard patterns
    prefix: String,
    is_wildcard: bool,
}

impl TopicPattern {
    /// Parse a topic pattern (may end with `.*` or `:*`)
    pub fn parse(pattern: &str) -> Result<Self, TopicError> {
        if pattern.is_empty() {
            return Err(TopicError::Empty);
        }

        if pattern == "*" {
            return Ok(Self::any());
        }

        if let Some(stem) = pattern.strip_suffix('*') {
            // "room*" without a separator before the star is not a segment wildcard
            let base = match stem.strip_suffix(is_separator) {
                Some(base) => base,
                None => return Err(TopicError::WildcardNotAtEnd),
            };
            if base.is_empty() {
                return Err(TopicError::EmptySegment);
            }
            validate_segments(base)?;
            return Ok(Self {
                prefix: stem.to_string(),
                is_wildcard: true,
            });
        }

        validate_segments(pattern)?;

        Ok(Self {
            prefix: pattern.to_string(),
            is_wildcard: false,
        })
    }

    /// The `*` pattern
    pub fn any() -> Self {
        Self {
            prefix: String::new(),
            is_wildcard: true,
        }
    }

    /// Check if this pattern matches a topic name
    pub fn matches(&self, topic: &str) -> bool {
        if self.is_wildcard {
            // Prefix already ends with its separator, so "room:*" never matches "rooms:1"
            topic.len() > self.prefix.len() && topic.starts_with(&self.prefix)
        } else {
            topic == self.prefix
        }
    }

    /// Check if every topic matched by `other` is also matched by `self`
    pub fn covers(&self, other: &TopicPattern) -> bool {
        match (self.is_wildcard, other.is_wildcard) {
            (true, true) => other.prefix.starts_with(&self.prefix),
            (true, false) => self.matches(&other.prefix),
            (false, true) => false,
            (false, false) => self.prefix == other.prefix,
        }
    }

    pub fn is_wildcard(&self) -> bool {
        self.is_wildcard
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_wildcard {
            write!(f, "{}*", self.prefix)
        } else {
            write!(f, "{}", self.prefix)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_parse_valid() {
        assert!(TopicName::parse("room").is_ok());
        assert!(TopicName::parse("room:42").is_ok());
        assert!(TopicName::parse("chat.room.42.messages").is_ok());
        assert!(TopicName::parse("user:user-123:inbox").is_ok());
        assert_eq!(TopicName::parse("room:42:typing").unwrap().segment_count(), 3);
    }

    #[test]
    fn test_topic_parse_invalid() {
        assert_eq!(TopicName::parse(""), Err(TopicError::Empty));
        assert_eq!(TopicName::parse("room::42"), Err(TopicError::EmptySegment));
        assert_eq!(TopicName::parse("room:*"), Err(TopicError::WildcardNotAtEnd));
        assert!(TopicName::parse("room 42").is_err());
        assert!(TopicName::parse("room@42").is_err());
        assert!(TopicName::parse("room:").is_err());
    }

    #[test]
    fn test_pattern_parse() {
        assert!(TopicPattern::parse("room:42").is_ok());
        assert!(TopicPattern::parse("room:*").is_ok());
        assert!(TopicPattern::parse("chat.*").is_ok());
        assert!(TopicPattern::parse("*").is_ok());

        assert!(TopicPattern::parse("").is_err());
        assert!(TopicPattern::parse("room*").is_err());
        assert!(TopicPattern::parse("room:*:typing").is_err());
        assert!(TopicPattern::parse(":*").is_err());
    }

    #[test]
    fn test_pattern_matching() {
        let all = TopicPattern::parse("*").unwrap();
        let rooms = TopicPattern::parse("room:*").unwrap();
        let exact = TopicPattern::parse("room:42").unwrap();

        assert!(all.matches("room:42"));
        assert!(all.matches("anything.else"));

        assert!(rooms.matches("room:42"));
        assert!(rooms.matches("room:42:typing"));
        assert!(!rooms.matches("rooms:42"));
        assert!(!rooms.matches("room"));

        assert!(exact.matches("room:42"));
        assert!(!exact.matches("room:43"));
    }

    #[test]
    fn test_pattern_covers() {
        let rooms = TopicPattern::parse("room:*").unwrap();
        let room42 = TopicPattern::parse("room:42:*").unwrap();
        let exact = TopicPattern::parse("room:42").unwrap();

        assert!(rooms.covers(&room42));
        assert!(rooms.covers(&exact));
        assert!(!room42.covers(&rooms));
        assert!(!exact.covers(&rooms));
        assert!(TopicPattern::parse("*").unwrap().covers(&rooms));
    }

    #[test]
    fn test_pattern_display_roundtrip() {
        for p in ["*", "room:*", "chat.*", "room:42"] {
            assert_eq!(TopicPattern::parse(p).unwrap().to_string(), p);
        }
    }
}
