//! Field selectors.
//!
//! Field selection is intentionally narrow: `metadata.name` and
//! `metadata.namespace` are rewritten by the store into primary key
//! predicates, every other `metadata.*` field is silently ignored, and the
//! remaining `Equals` requirements are probed as JSON paths into the spec
//! blob. `NotEquals` is honored by the in-memory matcher only.

use crate::selector::{Operator, SelectorParseError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One `field=value` (or `field!=value`) clause.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldRequirement {
    pub field: String,
    pub operator: Operator,
    pub value: String,
}

impl FieldRequirement {
    /// Evaluate against the serialized object. Missing paths compare as the
    /// empty string.
    pub fn matches(&self, object: &Value) -> bool {
        let actual = lookup(object, &self.field);
        match self.operator {
            Operator::Equals => actual == self.value,
            Operator::NotEquals => actual != self.value,
            _ => true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSelector {
    requirements: Vec<FieldRequirement>,
}

impl FieldSelector {
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn parse(selector: &str) -> Result<Self, SelectorParseError> {
        let mut requirements = Vec::new();
        for clause in selector.split(',') {
            let clause = clause.trim();
            if clause.is_empty() {
                continue;
            }
            let (field, operator, value) = if let Some(pos) = clause.find("!=") {
                (&clause[..pos], Operator::NotEquals, &clause[pos + 2..])
            } else if let Some(pos) = clause.find("==") {
                (&clause[..pos], Operator::Equals, &clause[pos + 2..])
            } else if let Some(pos) = clause.find('=') {
                (&clause[..pos], Operator::Equals, &clause[pos + 1..])
            } else {
                return Err(SelectorParseError {
                    selector: selector.to_string(),
                    message: "expected field=value".to_string(),
                });
            };
            let field = field.trim();
            if field.is_empty() {
                return Err(SelectorParseError {
                    selector: selector.to_string(),
                    message: "expected field before operator".to_string(),
                });
            }
            requirements.push(FieldRequirement {
                field: field.to_string(),
                operator,
                value: value.trim().to_string(),
            });
        }
        Ok(Self { requirements })
    }

    pub fn requirements(&self) -> &[FieldRequirement] {
        &self.requirements
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    /// The value an `Equals` requirement on the given field demands, if any.
    pub fn required_value(&self, field: &str) -> Option<&str> {
        self.requirements
            .iter()
            .find(|r| r.field == field && r.operator == Operator::Equals)
            .map(|r| r.value.as_str())
    }

    pub fn matches(&self, object: &Value) -> bool {
        self.requirements.iter().all(|r| r.matches(object))
    }
}

/// Resolve a dot path against a JSON object, stringifying scalars.
fn lookup(object: &Value, path: &str) -> String {
    let mut current = object;
    for part in path.split('.') {
        match current.get(part) {
            Some(v) => current = v,
            None => return String::new(),
        }
    }
    match current {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
