//! Reduce phase: combine a field's per-document results into one answer.
//!
//! The model is asked first, under a strict schema. If it fails, times out,
//! or answers with anything but an object carrying `value`, a deterministic
//! rule-based merge takes over. Either way a complete [`ReducedResult`] comes
//! back; nothing here returns an error.

use std::time::Duration;

use ddx_core::extraction::number_of;
use ddx_core::json::parse_lenient;
use ddx_core::normalize::cast_value;
use ddx_core::schema::{ReductionCandidate, SYSTEM_PROMPT, reduction_prompt};
use ddx_core::{
    EvidenceEntry, FieldContract, NormalizedExtraction, ReducedResult, ReductionRule, ReturnShape,
};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::client::{ModelClient, invoke_with_timeout};

/// Confidence assumed when the model's reduction omits one.
pub const DEFAULT_DELEGATED_CONFIDENCE: f64 = 0.85;

pub async fn reduce(
    client: &dyn ModelClient,
    contract: &FieldContract,
    extractions: &[NormalizedExtraction],
    timeout: Duration,
) -> ReducedResult {
    // Failed documents hold type defaults, not readings.
    let candidates: Vec<ReductionCandidate> = extractions
        .iter()
        .filter(|e| !e.failed)
        .map(|e| ReductionCandidate::new(contract, e))
        .collect();
    if candidates.len() < extractions.len() {
        debug!(
            field = %contract.key,
            skipped = extractions.len() - candidates.len(),
            "failed documents left out of reduction"
        );
    }

    if candidates.is_empty() {
        return fallback(contract, &candidates);
    }

    let prompt = reduction_prompt(contract, &candidates);
    match invoke_with_timeout(client, SYSTEM_PROMPT, &prompt, true, timeout).await {
        Ok(raw) => {
            if let Value::Object(map) = parse_lenient(&raw)
                && let Some(result) = conform_delegated(contract, map)
            {
                info!(field = %contract.key, candidates = candidates.len(), "reduced by model");
                return result;
            }
            warn!(field = %contract.key, "model reduction unusable, using rule-based fallback");
        }
        Err(e) => {
            warn!(field = %contract.key, error = %e, "reduction call failed, using rule-based fallback");
        }
    }
    fallback(contract, &candidates)
}

/// Shape the model's reduction to the contract. `None` when it cannot be
/// accepted.
fn conform_delegated(contract: &FieldContract, mut map: Map<String, Value>) -> Option<ReducedResult> {
    let raw_value = map.remove("value")?;
    let value = match &contract.return_value {
        Some(ReturnShape::Structured(keys)) => {
            let Value::Object(obj) = raw_value else {
                return None;
            };
            Value::Object(
                keys.iter()
                    .map(|k| {
                        let ty = contract.value_type(k);
                        let v = obj
                            .get(k)
                            .and_then(|v| cast_value(v, ty))
                            .unwrap_or_else(|| ty.default_value());
                        (k.clone(), v)
                    })
                    .collect(),
            )
        }
        Some(ReturnShape::Scalar(key)) => {
            cast_value(&raw_value, contract.value_type(key)).unwrap_or(Value::Null)
        }
        None => raw_value,
    };

    let unit = match map.remove("unit") {
        Some(Value::String(u)) if !u.is_empty() && u != "None" => Some(u),
        _ => None,
    };
    let evidence = match map.remove("evidence") {
        Some(Value::Array(items)) => items.iter().filter_map(EvidenceEntry::from_value).collect(),
        _ => Vec::new(),
    };
    let notes = match map.remove("notes") {
        Some(Value::Array(items)) => items
            .into_iter()
            .filter_map(|n| match n {
                Value::String(s) => Some(s),
                Value::Null => None,
                other => Some(other.to_string()),
            })
            .collect(),
        Some(Value::String(s)) if !s.trim().is_empty() => vec![s],
        _ => Vec::new(),
    };

    Some(ReducedResult {
        value,
        unit,
        justification: match map.remove("justification") {
            Some(Value::String(s)) => s,
            _ => String::new(),
        },
        evidence,
        confidence: map
            .get("confidence")
            .and_then(number_of)
            .map_or(DEFAULT_DELEGATED_CONFIDENCE, |c| c.clamp(0.0, 1.0)),
        notes,
        fallback: false,
    })
}

/// Deterministic merge used when delegation fails.
pub fn fallback(contract: &FieldContract, candidates: &[ReductionCandidate]) -> ReducedResult {
    let unit = contract.expected_unit().map(str::to_string);

    let Some(ReturnShape::Structured(keys)) = &contract.return_value else {
        let best = highest_confidence(candidates.iter().map(|c| c.confidence));
        let best = best.map(|i| &candidates[i]);
        return ReducedResult {
            value: best.map_or(Value::Null, |c| c.value.clone()),
            unit,
            justification: "Reducer fallback".to_string(),
            evidence: best.map(|c| c.evidence.clone()).unwrap_or_default(),
            confidence: best.map_or(0.0, |c| c.confidence),
            notes: vec![
                "Fallback: selected highest confidence candidate due to model reduce failure."
                    .to_string(),
            ],
            fallback: true,
        };
    };

    let mut merged = Map::new();
    for key in keys {
        let (values, confidences): (Vec<&Value>, Vec<f64>) = candidates
            .iter()
            .filter_map(|c| {
                c.intermediate
                    .get(key)
                    .filter(|v| !v.is_null())
                    .map(|v| (v, c.confidence))
            })
            .unzip();

        let value = if values.is_empty() {
            contract.value_type(key).default_value()
        } else {
            merge_key(contract.reducer_policy.rules.rule_for(key), &values, &confidences)
        };
        merged.insert(key.clone(), value);
    }

    ReducedResult {
        value: Value::Object(merged),
        unit,
        justification: "Fallback: merged per rules from per-doc results.".to_string(),
        evidence: candidates.iter().flat_map(|c| c.evidence.iter().cloned()).collect(),
        confidence: candidates.iter().map(|c| c.confidence).fold(0.0, f64::max),
        notes: vec![
            "Reducer fallback: model aggregation failed or returned invalid JSON.".to_string(),
        ],
        fallback: true,
    }
}

/// Apply one key's rule to its non-null candidate values.
fn merge_key(rule: Option<&ReductionRule>, values: &[&Value], confidences: &[f64]) -> Value {
    let by_confidence = || {
        highest_confidence(confidences.iter().copied())
            .map_or(Value::Null, |i| values[i].clone())
    };

    match rule {
        Some(ReductionRule::AnyTrue) => Value::Bool(values.iter().any(|v| truthy(v))),
        Some(ReductionRule::AnyFalse) => Value::Bool(values.iter().any(|v| **v == Value::Bool(false))),
        Some(ReductionRule::AllTrue) => Value::Bool(values.iter().all(|v| truthy(v))),
        Some(ReductionRule::TakeMax) => numeric_extremum(values, |a, b| a > b).unwrap_or_else(by_confidence),
        Some(ReductionRule::TakeMin) => numeric_extremum(values, |a, b| a < b).unwrap_or_else(by_confidence),
        Some(ReductionRule::MajorityVote) => majority(values),
        Some(ReductionRule::Other(_)) | None => by_confidence(),
    }
}

/// Index of the highest confidence; the earliest wins ties.
fn highest_confidence(confidences: impl Iterator<Item = f64>) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (i, c) in confidences.enumerate() {
        if best.is_none_or(|(_, b)| c > b) {
            best = Some((i, c));
        }
    }
    best.map(|(i, _)| i)
}

/// The extreme value when every candidate is numeric.
fn numeric_extremum(values: &[&Value], better: impl Fn(f64, f64) -> bool) -> Option<Value> {
    let mut best: Option<(f64, &Value)> = None;
    for v in values {
        let n = v.as_f64()?;
        if best.is_none_or(|(b, _)| better(n, b)) {
            best = Some((n, *v));
        }
    }
    best.map(|(_, v)| v.clone())
}

/// Most frequent value; among equally frequent values the first seen wins.
fn majority(values: &[&Value]) -> Value {
    let mut counts: Vec<(&Value, usize)> = Vec::new();
    for v in values {
        match counts.iter_mut().find(|(seen, _)| **seen == **v) {
            Some((_, n)) => *n += 1,
            None => counts.push((*v, 1)),
        }
    }
    let mut best: Option<(&Value, usize)> = None;
    for (v, n) in counts {
        if best.is_none_or(|(_, b)| n > b) {
            best = Some((v, n));
        }
    }
    best.map_or(Value::Null, |(v, _)| v.clone())
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}
