//! Queue name patterns with topic-exchange wildcards.
//!
//! Queue names and patterns are dot-separated words:
//! - `*` matches exactly one word
//! - `#` matches zero or more words
//!
//! Patterns are anchored: `one.*` matches `one.foo` but not `one.foo.bar`,
//! and `one.#` matches `one`, `one.foo` and `one.foo.two`.

use crate::error::SelectionError;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Word(String),
    One,
    Many,
}

/// A parsed queue name pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuePattern {
    raw: String,
    segments: Vec<Segment>,
}

impl QueuePattern {
    /// Parse a pattern, rejecting blank input and empty words
    pub fn parse(pattern: &str) -> Result<Self, SelectionError> {
        let raw = pattern.trim();
        if raw.is_empty() {
            return Err(SelectionError::InvalidPattern {
                pattern: pattern.to_string(),
                message: "pattern is blank".to_string(),
            });
        }

        let segments = raw
            .split('.')
            .map(|word| match word {
                "" => Err(SelectionError::InvalidPattern {
                    pattern: raw.to_string(),
                    message: "empty word between dots".to_string(),
                }),
                "*" => Ok(Segment::One),
                "#" => Ok(Segment::Many),
                literal => Ok(Segment::Word(literal.to_string())),
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Check whether the pattern has no wildcards
    pub fn is_literal(&self) -> bool {
        self.segments.iter().all(|s| matches!(s, Segment::Word(_)))
    }

    /// Check whether the whole queue name matches the pattern
    pub fn matches(&self, queue_name: &str) -> bool {
        if self.is_literal() {
            return self.raw == queue_name;
        }

        let words: Vec<&str> = queue_name.split('.').collect();
        Self::matches_from(&self.segments, &words)
    }

    fn matches_from(segments: &[Segment], words: &[&str]) -> bool {
        match segments.split_first() {
            None => words.is_empty(),
            Some((Segment::Many, rest)) => {
                // Zero words, then one more word at a time
                (0..=words.len()).any(|skip| Self::matches_from(rest, &words[skip..]))
            }
            Some((Segment::One, rest)) => {
                !words.is_empty() && Self::matches_from(rest, &words[1..])
            }
            Some((Segment::Word(literal), rest)) => match words.split_first() {
                Some((word, remaining)) if word == literal => Self::matches_from(rest, remaining),
                _ => false,
            },
        }
    }
}

impl fmt::Display for QueuePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

impl FromStr for QueuePattern {
    type Err = SelectionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Select the available queue names matched by any requested pattern
///
/// Blank and duplicate patterns are ignored. The result lists each matched
/// queue once, in the order patterns were requested.
///
/// # Errors
///
/// Returns [`SelectionError::Unmatched`] naming every pattern that matched
/// no queue, or [`SelectionError::InvalidPattern`] for malformed input.
pub fn select<P, Q>(patterns: &[P], available: &[Q]) -> Result<Vec<String>, SelectionError>
where
    P: AsRef<str>,
    Q: AsRef<str>,
{
    let mut parsed: Vec<QueuePattern> = Vec::new();
    for pattern in patterns {
        if pattern.as_ref().trim().is_empty() {
            continue;
        }
        let pattern = QueuePattern::parse(pattern.as_ref())?;
        if !parsed.contains(&pattern) {
            parsed.push(pattern);
        }
    }

    let mut selected: Vec<String> = Vec::new();
    let mut unmatched: Vec<String> = Vec::new();

    for pattern in &parsed {
        let mut found = false;
        for name in available.iter().map(AsRef::as_ref) {
            if pattern.matches(name) {
                found = true;
                if !selected.iter().any(|s| s == name) {
                    selected.push(name.to_string());
                }
            }
        }
        if !found {
            unmatched.push(pattern.as_str().to_string());
        }
    }

    if unmatched.is_empty() {
        Ok(selected)
    } else {
        Err(SelectionError::Unmatched {
            patterns: unmatched,
        })
    }
}

#[cfg(test)]
#[path = "patterns_tests.rs"]
mod tests;
