//! Topic pattern compilation and matching.
//!
//! Patterns are dot-separated tokens: `*` matches exactly one segment and
//! `#` matches zero-or-more trailing segments. Both subscriptions and
//! topic exchanges match against the same compiled form.

use crate::error::RoutingError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
enum Segment {
    Literal(String),
    /// `*` — exactly one segment
    Single,
    /// `#` — the remainder, including nothing
    Rest,
}

/// A compiled topic pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicPattern {
    raw: String,
    segments: Vec<Segment>,
}

impl TopicPattern {
    /// Compile a pattern string.
    ///
    /// `#` is only valid as the final token; empty tokens are rejected.
    pub fn compile(pattern: &str) -> Result<Self, RoutingError> {
        if pattern.is_empty() {
            return Err(RoutingError::InvalidPattern {
                pattern: pattern.to_string(),
                reason: "pattern is empty".into(),
            });
        }

        let tokens: Vec<&str> = pattern.split('.').collect();
        let mut segments = Vec::with_capacity(tokens.len());
        for (i, token) in tokens.iter().enumerate() {
            match *token {
                "" => {
                    return Err(RoutingError::InvalidPattern {
                        pattern: pattern.to_string(),
                        reason: "empty segment".into(),
                    });
                }
                "#" => {
                    if i != tokens.len() - 1 {
                        return Err(RoutingError::InvalidPattern {
                            pattern: pattern.to_string(),
                            reason: "'#' must be the final segment".into(),
                        });
                    }
                    segments.push(Segment::Rest);
                }
                "*" => segments.push(Segment::Single),
                literal => segments.push(Segment::Literal(literal.to_string())),
            }
        }

        Ok(Self {
            raw: pattern.to_string(),
            segments,
        })
    }

    /// The pattern string as written.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Whether the pattern contains any wildcard token.
    pub fn is_wildcard(&self) -> bool {
        self.segments
            .iter()
            .any(|s| matches!(s, Segment::Single | Segment::Rest))
    }

    /// Match a concrete topic against this pattern, segment by segment.
    ///
    /// `Rest` short-circuits to true; `Single` consumes exactly one segment.
    pub fn matches(&self, topic: &str) -> bool {
        let parts: Vec<&str> = topic.split('.').collect();
        let mut i = 0;

        for segment in &self.segments {
            match segment {
                Segment::Rest => return true,
                Segment::Single => {
                    if i >= parts.len() {
                        return false;
                    }
                    i += 1;
                }
                Segment::Literal(lit) => {
                    if i >= parts.len() || parts[i] != lit {
                        return false;
                    }
                    i += 1;
                }
            }
        }

        i == parts.len()
    }
}

impl std::fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.raw)
    }
}
