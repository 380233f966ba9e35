//! Field contracts: the declarative description of one extractable data point.
//!
//! A contract names the intermediate keys the model may populate per document,
//! how those keys assemble into the field's final value, and how per-document
//! results are combined across documents.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Declared type of an intermediate key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Number,
    Boolean,
    String,
}

impl ValueType {
    /// Parse a contract type name. Missing or unrecognised names mean `string`.
    pub fn parse(name: Option<&str>) -> Self {
        match name.map(|n| n.trim().to_ascii_lowercase()).as_deref() {
            Some("number") => Self::Number,
            Some("boolean") => Self::Boolean,
            _ => Self::String,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::String => "string",
        }
    }

    /// Placeholder slot used in prompt schemas.
    pub fn placeholder(&self) -> &'static str {
        match self {
            Self::Number => "<number|null>",
            Self::Boolean => "<true|false|null>",
            Self::String => "<string|null>",
        }
    }

    /// Zero value substituted for a missing key. Callers must read it as a
    /// low-confidence default, not a measured zero.
    pub fn default_value(&self) -> Value {
        match self {
            Self::Number => Value::from(0.0),
            Self::Boolean => Value::Bool(false),
            Self::String => Value::String(String::new()),
        }
    }
}

/// One named, typed sub-value the model populates per document.
#[derive(Debug, Clone, PartialEq)]
pub struct IntermediateKey {
    pub name: String,
    pub value_type: ValueType,
    pub required: bool,
    pub description: String,
}

/// Shape of a field's final value.
#[derive(Debug, Clone, PartialEq)]
pub enum ReturnShape {
    /// The value is a single intermediate entry.
    Scalar(String),
    /// The value is an object restricted to these intermediate keys, in order.
    Structured(Vec<String>),
}

impl ReturnShape {
    /// Intermediate keys referenced by this shape.
    pub fn keys(&self) -> Vec<&str> {
        match self {
            Self::Scalar(key) => vec![key.as_str()],
            Self::Structured(keys) => keys.iter().map(String::as_str).collect(),
        }
    }
}

/// Rule names accepted in contracts and the canonical rule each one means.
const RULE_ALIASES: &[(&str, &str)] = &[
    ("true_if_any", "any_true"),
    ("any", "any_true"),
    ("or", "any_true"),
    ("false_if_any", "any_false"),
    ("majority", "majority_vote"),
];

/// Per-key deterministic reduction rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReductionRule {
    AnyTrue,
    AnyFalse,
    AllTrue,
    TakeMax,
    TakeMin,
    MajorityVote,
    /// A rule name outside the closed vocabulary. Passed to the model verbatim,
    /// treated as "no rule" by the deterministic fallback.
    Other(String),
}

impl ReductionRule {
    /// Canonicalise a rule name through the alias table.
    pub fn parse(name: &str) -> Self {
        let trimmed = name.trim();
        let canonical = RULE_ALIASES
            .iter()
            .find(|(alias, _)| *alias == trimmed)
            .map_or(trimmed, |(_, canonical)| *canonical);

        match canonical {
            "any_true" => Self::AnyTrue,
            "any_false" => Self::AnyFalse,
            "all_true" => Self::AllTrue,
            "take_max" => Self::TakeMax,
            "take_min" => Self::TakeMin,
            "majority_vote" => Self::MajorityVote,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::AnyTrue => "any_true",
            Self::AnyFalse => "any_false",
            Self::AllTrue => "all_true",
            Self::TakeMax => "take_max",
            Self::TakeMin => "take_min",
            Self::MajorityVote => "majority_vote",
            Self::Other(name) => name,
        }
    }
}

/// Reduction rules declared by a policy: either keyed by intermediate key or
/// a bare list of rule names.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum RuleSet {
    #[default]
    None,
    PerKey(Vec<(String, ReductionRule)>),
    Listed(Vec<ReductionRule>),
}

impl RuleSet {
    /// Rule for one intermediate key. Listed rules are not bound to a key.
    pub fn rule_for(&self, key: &str) -> Option<&ReductionRule> {
        match self {
            Self::PerKey(rules) => rules.iter().find(|(k, _)| k == key).map(|(_, r)| r),
            Self::None | Self::Listed(_) => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::None => true,
            Self::PerKey(rules) => rules.is_empty(),
            Self::Listed(rules) => rules.is_empty(),
        }
    }
}

/// Cross-document aggregation policy.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReducerPolicy {
    /// Resolved at load time: the policy's own `expected_unit` when present,
    /// otherwise the field unit.
    pub expected_unit: Option<String>,
    pub method: Option<String>,
    pub strategy: Option<String>,
    pub source_keys: Vec<(String, String)>,
    pub rules: RuleSet,
    pub instructions: Vec<String>,
}

/// Descriptive metadata carried through to results untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldMeta {
    pub section: Option<String>,
    pub document: Option<String>,
    pub data_point: String,
    pub category: Option<String>,
    pub weight: Option<Value>,
}

/// Declarative specification of one extractable field.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldContract {
    pub key: String,
    pub meta: FieldMeta,
    /// Declared intermediate keys in contract order. The only keys the model
    /// may populate.
    pub intermediate: Vec<IntermediateKey>,
    pub return_value: Option<ReturnShape>,
    /// Field-level unit, used in the per-document prompt.
    pub unit: Option<String>,
    pub reducer_policy: ReducerPolicy,
    pub prompt_hints: Vec<String>,
}

impl FieldContract {
    /// Declaration of an intermediate key.
    pub fn intermediate_key(&self, name: &str) -> Option<&IntermediateKey> {
        self.intermediate.iter().find(|k| k.name == name)
    }

    pub fn declares(&self, name: &str) -> bool {
        self.intermediate_key(name).is_some()
    }

    /// Declared type of an intermediate key; undeclared keys read as strings.
    pub fn value_type(&self, name: &str) -> ValueType {
        self.intermediate_key(name)
            .map_or(ValueType::String, |k| k.value_type)
    }

    /// Unit the final value is expressed in.
    pub fn expected_unit(&self) -> Option<&str> {
        self.reducer_policy.expected_unit.as_deref()
    }
}
