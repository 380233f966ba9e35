//! Per-document normalisation: coerce a raw [`DocumentExtraction`] into a
//! [`NormalizedExtraction`] that satisfies its field contract.
//!
//! Normalisation is total and idempotent. Every declared intermediate key
//! ends up present and typed, undeclared keys are dropped, and feeding a
//! normalised result back in reproduces it exactly.

use serde_json::{Map, Value};

use crate::contract::{FieldContract, ReturnShape, ValueType};
use crate::extraction::{
    DocumentExtraction, EvidenceEntry, EvidenceItem, NormalizedExtraction, is_paginated,
};

/// Maximum snippet length, in characters, for synthesised evidence.
pub const SNIPPET_MAX_CHARS: usize = 240;

/// Derived per-kWh rate and the two keys it is computed from.
pub const RATE_KEY: &str = "rate_usd_per_kwh";
pub const COST_KEY: &str = "energy_charge_usd";
pub const CONSUMPTION_KEY: &str = "monthly_kwh";

const AFFIRMATIVE: &[&str] = &["true", "1", "yes", "y", "si", "sí"];

/// Normalise one document's extraction against `contract`.
///
/// `doc_index` is the 1-based position of the document in run order.
pub fn normalize(
    extraction: &DocumentExtraction,
    contract: &FieldContract,
    doc_index: usize,
    filename: &str,
) -> NormalizedExtraction {
    let mut intermediate = Map::new();
    for key in &contract.intermediate {
        let cast = extraction
            .intermediate
            .get(&key.name)
            .and_then(|v| cast_value(v, key.value_type));
        intermediate.insert(key.name.clone(), cast.unwrap_or(Value::Null));
    }

    derive_rate(&mut intermediate, contract);

    for key in &contract.intermediate {
        if let Some(slot) = intermediate.get_mut(&key.name)
            && slot.is_null()
        {
            *slot = key.value_type.default_value();
        }
    }

    let value = match &contract.return_value {
        Some(ReturnShape::Structured(keys)) => Value::Object(
            keys.iter()
                .map(|k| (k.clone(), intermediate.get(k).cloned().unwrap_or(Value::Null)))
                .collect(),
        ),
        Some(ReturnShape::Scalar(key)) => intermediate.get(key).cloned().unwrap_or(Value::Null),
        None => Value::Bool(false),
    };

    let mut notes = extraction.notes.clone();
    let confidence = if extraction.is_failed() {
        notes.push(failure_note(extraction));
        0.0
    } else {
        extraction.confidence.unwrap_or(0.0).clamp(0.0, 1.0)
    };

    let mut evidence = extraction.evidence.clone();
    let mut evidence_structured = if extraction.evidence_structured.iter().any(EvidenceItem::has_snippet) {
        extraction.evidence_structured.clone()
    } else {
        synthesize_evidence(&extraction.evidence, filename)
    };

    if !is_paginated(filename) {
        for item in &mut evidence_structured {
            item.page = None;
        }
        for entry in &mut evidence {
            if let EvidenceEntry::Item(item) = entry {
                item.page = None;
            }
        }
    }

    NormalizedExtraction {
        value,
        unit: extraction.unit.clone(),
        intermediate,
        evidence,
        evidence_structured,
        confidence,
        notes,
        doc_index,
        filename: filename.to_string(),
        failed: extraction.is_failed(),
    }
}

/// Coerce a JSON value to a declared type. `None` means the value is absent
/// or could not be read as that type.
pub fn cast_value(value: &Value, value_type: ValueType) -> Option<Value> {
    match (value_type, value) {
        (_, Value::Null) => None,

        (ValueType::Number, Value::Number(n)) => n.as_f64().and_then(finite),
        (ValueType::Number, Value::Bool(b)) => Some(Value::from(if *b { 1.0 } else { 0.0 })),
        (ValueType::Number, Value::String(s)) => parse_number(s).and_then(finite),
        (ValueType::Number, _) => None,

        (ValueType::Boolean, Value::Bool(b)) => Some(Value::Bool(*b)),
        (ValueType::Boolean, Value::String(s)) => Some(Value::Bool(is_affirmative(s))),
        (ValueType::Boolean, other) => Some(Value::Bool(is_affirmative(&other.to_string()))),

        (ValueType::String, Value::String(s)) => Some(Value::String(s.clone())),
        (ValueType::String, other) => Some(Value::String(other.to_string())),
    }
}

/// Parse a number written with either decimal-separator convention.
///
/// With both `.` and `,` present, whichever comes last is the decimal
/// separator and the other groups thousands. A lone `,` is a decimal comma;
/// several commas group thousands. Several dots with no comma are ambiguous
/// and rejected.
pub fn parse_number(text: &str) -> Option<f64> {
    let s: String = text
        .trim()
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();

    let last_dot = s.rfind('.');
    let last_comma = s.rfind(',');
    let canonical = match (last_dot, last_comma) {
        (Some(dot), Some(comma)) if comma > dot => s.replace('.', "").replace(',', "."),
        (Some(_), Some(_)) => s.replace(',', ""),
        (None, Some(_)) if s.matches(',').count() == 1 => s.replace(',', "."),
        (None, Some(_)) => s.replace(',', ""),
        (Some(_), None) if s.matches('.').count() > 1 => return None,
        _ => s,
    };

    canonical.parse::<f64>().ok().filter(|f| f.is_finite())
}

fn is_affirmative(text: &str) -> bool {
    let lower = text.trim().to_lowercase();
    AFFIRMATIVE.contains(&lower.as_str())
}

fn finite(f: f64) -> Option<Value> {
    f.is_finite().then(|| Value::from(f))
}

/// Fill the per-kWh rate from cost and consumption when the rate is missing
/// and both operands are non-zero.
fn derive_rate(intermediate: &mut Map<String, Value>, contract: &FieldContract) {
    if !contract.declares(RATE_KEY) || !intermediate.get(RATE_KEY).is_none_or(Value::is_null) {
        return;
    }
    let operand = |k: &str| {
        intermediate
            .get(k)
            .and_then(Value::as_f64)
            .filter(|f| *f != 0.0)
    };
    if let (Some(cost), Some(kwh)) = (operand(COST_KEY), operand(CONSUMPTION_KEY))
        && let Some(rate) = finite(cost / kwh)
    {
        intermediate.insert(RATE_KEY.to_string(), rate);
    }
}

/// Build structured evidence from the flat evidence list.
fn synthesize_evidence(evidence: &[EvidenceEntry], filename: &str) -> Vec<EvidenceItem> {
    evidence
        .iter()
        .map(|entry| match entry {
            EvidenceEntry::Item(item) => EvidenceItem {
                doc: Some(
                    item.doc
                        .clone()
                        .filter(|d| !d.is_empty())
                        .unwrap_or_else(|| filename.to_string()),
                ),
                page: item.page,
                snippet: item.snippet.as_deref().and_then(truncate_snippet),
                label: None,
            },
            EvidenceEntry::Text(text) => EvidenceItem {
                doc: Some(filename.to_string()),
                page: None,
                snippet: truncate_snippet(text),
                label: None,
            },
        })
        .collect()
}

fn truncate_snippet(text: &str) -> Option<String> {
    let s: String = text.chars().take(SNIPPET_MAX_CHARS).collect();
    (!s.is_empty()).then_some(s)
}

fn failure_note(extraction: &DocumentExtraction) -> String {
    match &extraction.error {
        Some(err) => format!("Extraction failed: {err}"),
        None => "Extraction output was not valid JSON.".to_string(),
    }
}
