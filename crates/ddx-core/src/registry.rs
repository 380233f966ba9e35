//! Field registry: the set of field contracts loaded once per run.
//!
//! The registry is an ordinary immutable value built by the caller and passed
//! into the pipeline. Raw configuration is deserialised permissively and then
//! converted into typed contracts, so the rest of the system never sees
//! free-form JSON for contract data.

use std::path::Path;

use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::info;

use crate::contract::{
    FieldContract, FieldMeta, IntermediateKey, ReducerPolicy, ReductionRule, ReturnShape, RuleSet,
    ValueType,
};
use crate::error::ConfigError;

/// Immutable collection of field contracts, in configuration order.
#[derive(Debug, Clone, Default)]
pub struct FieldRegistry {
    version: Option<String>,
    fields: Vec<FieldContract>,
}

impl FieldRegistry {
    /// Load a registry from a JSON field configuration file.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let registry = Self::from_json_str(&text)?;
        info!(
            path = %path.display(),
            fields = registry.len(),
            "loaded field config"
        );
        Ok(registry)
    }

    /// Parse a registry from JSON text.
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = serde_json::from_str(text)?;
        let fields = raw
            .fields
            .unwrap_or_default()
            .into_iter()
            .map(|(key, value)| contract_from_raw(key, value))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            version: raw.version.map(|v| match v {
                Value::String(s) => s,
                other => other.to_string(),
            }),
            fields,
        })
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    /// Exact-key lookup.
    pub fn get(&self, key: &str) -> Option<&FieldContract> {
        self.fields.iter().find(|f| f.key == key)
    }

    /// Exact-key lookup, falling back to the first key (in configuration
    /// order) that ends with `key`.
    pub fn resolve(&self, key: &str) -> Option<&FieldContract> {
        self.get(key)
            .or_else(|| self.fields.iter().find(|f| f.key.ends_with(key)))
    }

    pub fn iter(&self) -> impl Iterator<Item = &FieldContract> {
        self.fields.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.key.as_str())
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

// ── Raw configuration ──

#[derive(Deserialize)]
struct RawConfig {
    #[serde(default)]
    version: Option<Value>,
    #[serde(default)]
    fields: Option<Map<String, Value>>,
}

#[derive(Deserialize, Default)]
struct RawField {
    #[serde(default)]
    doc_category: Option<String>,
    #[serde(default)]
    doc_subcategory: Option<String>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    weight: Option<Value>,
    #[serde(default)]
    unit: Option<String>,
    #[serde(default)]
    prompt_hints: Option<Vec<String>>,
    #[serde(default)]
    extraction_contract: Option<RawExtractionContract>,
    /// Kept untyped so an explicit `"expected_unit": null` can be told apart
    /// from an absent key.
    #[serde(default)]
    reducer_policy: Option<Map<String, Value>>,
}

#[derive(Deserialize, Default)]
struct RawExtractionContract {
    #[serde(default)]
    intermediate: Option<Map<String, Value>>,
    #[serde(default)]
    return_value: Option<Value>,
}

#[derive(Deserialize, Default)]
struct RawIntermediate {
    #[serde(rename = "type", default)]
    value_type: Option<String>,
    #[serde(default)]
    required: Option<bool>,
    #[serde(default, alias = "description")]
    desc: Option<String>,
}

fn contract_from_raw(key: String, value: Value) -> Result<FieldContract, ConfigError> {
    let raw: RawField = if value.is_null() {
        RawField::default()
    } else {
        serde_json::from_value(value).map_err(|source| ConfigError::InvalidField {
            key: key.clone(),
            source,
        })?
    };

    let ec = raw.extraction_contract.unwrap_or_default();

    let mut intermediate = Vec::new();
    for (name, spec) in ec.intermediate.unwrap_or_default() {
        let spec: RawIntermediate = if spec.is_null() {
            RawIntermediate::default()
        } else {
            serde_json::from_value(spec).map_err(|source| ConfigError::InvalidField {
                key: key.clone(),
                source,
            })?
        };
        intermediate.push(IntermediateKey {
            name,
            value_type: ValueType::parse(spec.value_type.as_deref()),
            required: spec.required.unwrap_or(false),
            description: spec.desc.unwrap_or_default(),
        });
    }

    let return_value = parse_return_shape(&key, ec.return_value)?;
    let unit = raw.unit.filter(|u| !is_none_unit(u));
    let reducer_policy = parse_policy(&key, raw.reducer_policy.unwrap_or_default(), &unit)?;

    let contract = FieldContract {
        meta: FieldMeta {
            section: raw.doc_category,
            document: raw.doc_subcategory,
            data_point: data_point_name(&key),
            category: raw.category,
            weight: raw.weight,
        },
        key,
        intermediate,
        return_value,
        unit,
        reducer_policy,
        prompt_hints: raw.prompt_hints.unwrap_or_default(),
    };
    validate(&contract)?;
    Ok(contract)
}

fn parse_return_shape(key: &str, value: Option<Value>) -> Result<Option<ReturnShape>, ConfigError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(name)) => Ok(Some(ReturnShape::Scalar(name))),
        Some(Value::Array(items)) => items
            .into_iter()
            .map(|item| match item {
                Value::String(name) => Ok(name),
                other => Err(ConfigError::InvalidContract {
                    key: key.to_string(),
                    reason: format!("return_value entries must be strings, got {other}"),
                }),
            })
            .collect::<Result<Vec<_>, _>>()
            .map(|keys| Some(ReturnShape::Structured(keys))),
        Some(other) => Err(ConfigError::InvalidContract {
            key: key.to_string(),
            reason: format!("return_value must be a string or a list, got {other}"),
        }),
    }
}

fn parse_policy(
    key: &str,
    mut raw: Map<String, Value>,
    field_unit: &Option<String>,
) -> Result<ReducerPolicy, ConfigError> {
    let expected_unit = match raw.remove("expected_unit") {
        Some(v) => value_as_string(v).filter(|u| !is_none_unit(u)),
        None => field_unit.clone(),
    };

    let rules = match raw.remove("rules") {
        None | Some(Value::Null) => RuleSet::None,
        Some(Value::Object(map)) => RuleSet::PerKey(
            map.into_iter()
                .map(|(k, v)| {
                    let name = value_as_string(v).unwrap_or_default();
                    (k, ReductionRule::parse(&name))
                })
                .collect(),
        ),
        Some(Value::Array(items)) => RuleSet::Listed(
            items
                .into_iter()
                .filter_map(value_as_string)
                .map(|name| ReductionRule::parse(&name))
                .collect(),
        ),
        Some(other) => {
            return Err(ConfigError::InvalidContract {
                key: key.to_string(),
                reason: format!("reducer_policy.rules must be a mapping or a list, got {other}"),
            });
        }
    };

    let source_keys = match raw.remove("source_keys") {
        Some(Value::Object(map)) => map
            .into_iter()
            .filter_map(|(k, v)| value_as_string(v).map(|v| (k, v)))
            .collect(),
        _ => Vec::new(),
    };

    let instructions = match raw.remove("instructions") {
        Some(Value::Array(items)) => items.into_iter().filter_map(value_as_string).collect(),
        Some(v) => value_as_string(v)
            .filter(|s| !s.trim().is_empty())
            .into_iter()
            .collect(),
        None => Vec::new(),
    };

    Ok(ReducerPolicy {
        expected_unit,
        method: raw.remove("method").and_then(value_as_string),
        strategy: raw.remove("strategy").and_then(value_as_string),
        source_keys,
        rules,
        instructions,
    })
}

/// Every key named by the return shape or by per-key rules must be declared.
fn validate(contract: &FieldContract) -> Result<(), ConfigError> {
    let mut referenced: Vec<&str> = contract
        .return_value
        .as_ref()
        .map(ReturnShape::keys)
        .unwrap_or_default();
    if let RuleSet::PerKey(rules) = &contract.reducer_policy.rules {
        referenced.extend(rules.iter().map(|(k, _)| k.as_str()));
    }

    match referenced.into_iter().find(|name| !contract.declares(name)) {
        Some(name) => Err(ConfigError::UndeclaredKey {
            field: contract.key.clone(),
            name: name.to_string(),
        }),
        None => Ok(()),
    }
}

fn value_as_string(v: Value) -> Option<String> {
    match v {
        Value::Null => None,
        Value::String(s) => Some(s),
        other => Some(other.to_string()),
    }
}

fn is_none_unit(unit: &str) -> bool {
    unit.is_empty() || unit == "None"
}

/// Human-readable data point name: last dotted segment, underscores to
/// spaces, title-cased.
fn data_point_name(key: &str) -> String {
    let last = key.rsplit('.').next().unwrap_or(key).replace('_', " ");
    let mut out = String::with_capacity(last.len());
    let mut at_word_start = true;
    for c in last.chars() {
        if c.is_alphabetic() {
            if at_word_start {
                out.extend(c.to_uppercase());
            } else {
                out.extend(c.to_lowercase());
            }
            at_word_start = false;
        } else {
            out.push(c);
            at_word_start = true;
        }
    }
    if out.is_empty() {
        "Data Point".to_string()
    } else {
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"{
        "version": "3",
        "fields": {
            "site.energy.utility_rate": {
                "doc_category": "Energy",
                "doc_subcategory": "Utility bills",
                "unit": "USD/kWh",
                "prompt_hints": ["Look for the energy charge line"],
                "extraction_contract": {
                    "intermediate": {
                        "energy_charge_usd": {"type": "number", "required": true, "desc": "Energy charge"},
                        "monthly_kwh": {"type": "number", "required": true},
                        "rate_usd_per_kwh": {"type": "number", "description": "Rate"}
                    },
                    "return_value": "rate_usd_per_kwh"
                },
                "reducer_policy": {"method": "median", "rules": {"rate_usd_per_kwh": "take_max"}}
            },
            "site.permits.interconnection": {
                "doc_category": "Permitting",
                "extraction_contract": {
                    "intermediate": {
                        "has_agreement": {"type": "boolean"},
                        "utility_name": {"type": "string"}
                    },
                    "return_value": ["has_agreement", "utility_name"]
                },
                "reducer_policy": {
                    "expected_unit": null,
                    "rules": {"has_agreement": "true_if_any"},
                    "source_keys": {"flag": "has_agreement"},
                    "instructions": "Prefer signed agreements."
                }
            }
        }
    }"#;

    #[test]
    fn loads_fields_in_order() {
        let reg = FieldRegistry::from_json_str(CONFIG).unwrap();
        assert_eq!(reg.version(), Some("3"));
        let keys: Vec<&str> = reg.keys().collect();
        assert_eq!(
            keys,
            vec!["site.energy.utility_rate", "site.permits.interconnection"]
        );
    }

    #[test]
    fn intermediate_keys_are_typed_in_contract_order() {
        let reg = FieldRegistry::from_json_str(CONFIG).unwrap();
        let f = reg.get("site.energy.utility_rate").unwrap();
        let names: Vec<&str> = f.intermediate.iter().map(|k| k.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["energy_charge_usd", "monthly_kwh", "rate_usd_per_kwh"]
        );
        assert_eq!(f.value_type("monthly_kwh"), ValueType::Number);
        assert!(f.intermediate[0].required);
        assert!(!f.intermediate[2].required);
        assert_eq!(f.intermediate[2].description, "Rate");
        assert_eq!(
            f.return_value,
            Some(ReturnShape::Scalar("rate_usd_per_kwh".into()))
        );
    }

    #[test]
    fn expected_unit_falls_back_to_field_unit() {
        let reg = FieldRegistry::from_json_str(CONFIG).unwrap();
        let rate = reg.get("site.energy.utility_rate").unwrap();
        assert_eq!(rate.expected_unit(), Some("USD/kWh"));
    }

    #[test]
    fn explicit_null_expected_unit_wins() {
        let json = r#"{"fields": {"f": {
            "unit": "kW",
            "extraction_contract": {"intermediate": {"a": {"type": "number"}}, "return_value": "a"},
            "reducer_policy": {"expected_unit": null}
        }}}"#;
        let reg = FieldRegistry::from_json_str(json).unwrap();
        let f = reg.get("f").unwrap();
        assert_eq!(f.unit.as_deref(), Some("kW"));
        assert_eq!(f.expected_unit(), None);
    }

    #[test]
    fn policy_rules_are_canonicalised_at_load() {
        let reg = FieldRegistry::from_json_str(CONFIG).unwrap();
        let f = reg.get("site.permits.interconnection").unwrap();
        assert_eq!(
            f.reducer_policy.rules.rule_for("has_agreement"),
            Some(&ReductionRule::AnyTrue)
        );
        assert_eq!(
            f.reducer_policy.source_keys,
            vec![("flag".to_string(), "has_agreement".to_string())]
        );
        assert_eq!(f.reducer_policy.instructions, vec!["Prefer signed agreements."]);
        assert!(matches!(f.return_value, Some(ReturnShape::Structured(_))));
    }

    #[test]
    fn resolve_falls_back_to_suffix_match() {
        let reg = FieldRegistry::from_json_str(CONFIG).unwrap();
        assert_eq!(
            reg.resolve("utility_rate").map(|f| f.key.as_str()),
            Some("site.energy.utility_rate")
        );
        assert!(reg.get("utility_rate").is_none());
        assert!(reg.resolve("nonexistent").is_none());
    }

    #[test]
    fn data_point_is_title_cased_last_segment() {
        let reg = FieldRegistry::from_json_str(CONFIG).unwrap();
        let f = reg.get("site.permits.interconnection").unwrap();
        assert_eq!(f.meta.data_point, "Interconnection");
        assert_eq!(data_point_name("a.b.utility_rate"), "Utility Rate");
        assert_eq!(data_point_name("x.kWh_total"), "Kwh Total");
    }

    #[test]
    fn missing_contract_yields_empty_field() {
        let reg = FieldRegistry::from_json_str(r#"{"fields": {"bare": {}}}"#).unwrap();
        let f = reg.get("bare").unwrap();
        assert!(f.intermediate.is_empty());
        assert!(f.return_value.is_none());
        assert!(f.reducer_policy.rules.is_empty());
    }

    #[test]
    fn undeclared_return_key_is_rejected() {
        let json = r#"{"fields": {"f": {
            "extraction_contract": {"intermediate": {"a": {"type": "number"}}, "return_value": ["a", "b"]}
        }}}"#;
        let err = FieldRegistry::from_json_str(json).unwrap_err();
        assert!(
            matches!(err, ConfigError::UndeclaredKey { ref name, .. } if name == "b"),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn undeclared_rule_key_is_rejected() {
        let json = r#"{"fields": {"f": {
            "extraction_contract": {"intermediate": {"a": {"type": "boolean"}}, "return_value": "a"},
            "reducer_policy": {"rules": {"z": "any_true"}}
        }}}"#;
        assert!(matches!(
            FieldRegistry::from_json_str(json),
            Err(ConfigError::UndeclaredKey { .. })
        ));
    }

    #[test]
    fn malformed_json_is_a_config_error() {
        assert!(matches!(
            FieldRegistry::from_json_str("{not json"),
            Err(ConfigError::Json(_))
        ));
    }

    #[test]
    fn from_path_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = FieldRegistry::from_path(&dir.path().join("fields.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn from_path_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fields.json");
        std::fs::write(&path, CONFIG).unwrap();
        let reg = FieldRegistry::from_path(&path).unwrap();
        assert_eq!(reg.len(), 2);
    }
}
