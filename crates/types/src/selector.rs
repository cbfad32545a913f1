//! Label selector grammar and in-memory matching.
//!
//! Supports the usual forms: `k=v`, `k==v`, `k!=v`, `k in (a,b)`,
//! `k notin (a,b)`, `k` (exists) and `!k` (does not exist), joined by
//! top-level commas. The store pushes the same requirements down as JSON
//! path probes; `matches` applies identical semantics in memory so that a
//! re-check never disagrees with the pushed-down query.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("invalid selector {selector:?}: {message}")]
pub struct SelectorParseError {
    pub selector: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    Equals,
    NotEquals,
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Operator::Equals => "=",
            Operator::NotEquals => "!=",
            Operator::In => "in",
            Operator::NotIn => "notin",
            Operator::Exists => "exists",
            Operator::DoesNotExist => "!",
        };
        write!(f, "{}", s)
    }
}

/// One clause of a label selector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirement {
    pub key: String,
    pub operator: Operator,
    pub values: Vec<String>,
}

impl Requirement {
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        let value = labels.get(&self.key);
        match self.operator {
            Operator::Equals => match (value, self.values.first()) {
                (Some(v), Some(w)) => v == w,
                _ => false,
            },
            Operator::NotEquals => match (value, self.values.first()) {
                (Some(v), Some(w)) => v != w,
                _ => false,
            },
            Operator::In => value.is_some_and(|v| self.values.iter().any(|w| w == v)),
            Operator::NotIn => value.is_some_and(|v| self.values.iter().all(|w| w != v)),
            Operator::Exists => value.is_some(),
            Operator::DoesNotExist => value.is_none(),
        }
    }
}

/// A parsed label selector: the conjunction of its requirements.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSelector {
    requirements: Vec<Requirement>,
}

impl LabelSelector {
    /// A selector that matches everything.
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn from_requirements(requirements: Vec<Requirement>) -> Self {
        Self { requirements }
    }

    pub fn parse(selector: &str) -> Result<Self, SelectorParseError> {
        let mut requirements = Vec::new();
        for clause in split_top_level(selector) {
            let clause = clause.trim();
            if clause.is_empty() {
                continue;
            }
            requirements.push(parse_clause(selector, clause)?);
        }
        Ok(Self { requirements })
    }

    pub fn requirements(&self) -> &[Requirement] {
        &self.requirements
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|r| r.matches(labels))
    }
}

/// Split on commas that are not inside a parenthesized value set.
fn split_top_level(s: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (i, c) in s.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                out.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    out.push(&s[start..]);
    out
}

fn parse_clause(selector: &str, clause: &str) -> Result<Requirement, SelectorParseError> {
    let err = |message: &str| SelectorParseError {
        selector: selector.to_string(),
        message: message.to_string(),
    };

    if let Some(key) = clause.strip_prefix('!') {
        let key = key.trim();
        if key.is_empty() {
            return Err(err("expected key after '!'"));
        }
        return Ok(Requirement {
            key: key.to_string(),
            operator: Operator::DoesNotExist,
            values: Vec::new(),
        });
    }

    // Set-based forms: `key in (a, b)` / `key notin (a, b)`.
    for (word, operator) in [(" notin ", Operator::NotIn), (" in ", Operator::In)] {
        if let Some(pos) = clause.find(word) {
            let key = clause[..pos].trim();
            let rest = clause[pos + word.len()..].trim();
            let inner = rest
                .strip_prefix('(')
                .and_then(|r| r.strip_suffix(')'))
                .ok_or_else(|| err("expected parenthesized value set"))?;
            let values: Vec<String> = inner
                .split(',')
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .collect();
            if key.is_empty() {
                return Err(err("expected key before set operator"));
            }
            if values.is_empty() {
                return Err(err("expected at least one value in set"));
            }
            return Ok(Requirement {
                key: key.to_string(),
                operator,
                values,
            });
        }
    }

    // Equality forms, longest operator first so `!=` and `==` win over `=`.
    for (op, operator) in [
        ("!=", Operator::NotEquals),
        ("==", Operator::Equals),
        ("=", Operator::Equals),
    ] {
        if let Some(pos) = clause.find(op) {
            let key = clause[..pos].trim();
            let value = clause[pos + op.len()..].trim();
            if key.is_empty() {
                return Err(err("expected key before operator"));
            }
            return Ok(Requirement {
                key: key.to_string(),
                operator,
                values: vec![value.to_string()],
            });
        }
    }

    // Bare key: existence.
    Ok(Requirement {
        key: clause.to_string(),
        operator: Operator::Exists,
        values: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn parse_equality() {
        let s = LabelSelector::parse("test2=2").unwrap();
        assert_eq!(s.requirements().len(), 1);
        assert_eq!(s.requirements()[0].operator, Operator::Equals);
        assert!(s.matches(&labels(&[("test2", "2")])));
        assert!(!s.matches(&labels(&[("test2", "3")])));
        assert!(!s.matches(&labels(&[])));
    }

    #[test]
    fn parse_not_equals() {
        let s = LabelSelector::parse("env!=prod").unwrap();
        assert!(s.matches(&labels(&[("env", "dev")])));
        assert!(!s.matches(&labels(&[("env", "prod")])));
        // value comparison requires the key to be present
        assert!(!s.matches(&labels(&[])));
    }

    #[test]
    fn parse_in_set() {
        let s = LabelSelector::parse("test in (1,2,3)").unwrap();
        assert_eq!(s.requirements()[0].operator, Operator::In);
        assert_eq!(s.requirements()[0].values, vec!["1", "2", "3"]);
        assert!(s.matches(&labels(&[("test", "2")])));
        assert!(!s.matches(&labels(&[("test", "4")])));
    }

    #[test]
    fn parse_notin_set() {
        let s = LabelSelector::parse("test notin (1,2,3)").unwrap();
        assert!(s.matches(&labels(&[("test", "0")])));
        assert!(!s.matches(&labels(&[("test", "1")])));
    }

    #[test]
    fn parse_exists_and_not_exists() {
        let s = LabelSelector::parse("test1").unwrap();
        assert_eq!(s.requirements()[0].operator, Operator::Exists);
        assert!(s.matches(&labels(&[("test1", "1")])));
        assert!(!s.matches(&labels(&[("test0", "0")])));

        let s = LabelSelector::parse("!test1").unwrap();
        assert_eq!(s.requirements()[0].operator, Operator::DoesNotExist);
        assert!(s.matches(&labels(&[("test0", "0")])));
        assert!(!s.matches(&labels(&[("test1", "1")])));
    }

    #[test]
    fn parse_conjunction_with_set_commas() {
        let s = LabelSelector::parse("a=1,b in (2,3),!c").unwrap();
        assert_eq!(s.requirements().len(), 3);
        assert!(s.matches(&labels(&[("a", "1"), ("b", "3")])));
        assert!(!s.matches(&labels(&[("a", "1"), ("b", "3"), ("c", "x")])));
    }

    #[test]
    fn parse_rejects_malformed_set() {
        assert!(LabelSelector::parse("b in 2,3").is_err());
        assert!(LabelSelector::parse("in (1)").is_err());
        assert!(LabelSelector::parse("!").is_err());
    }

    #[test]
    fn empty_selector_matches_everything() {
        let s = LabelSelector::parse("").unwrap();
        assert!(s.is_empty());
        assert!(s.matches(&labels(&[("anything", "at-all")])));
    }
}
