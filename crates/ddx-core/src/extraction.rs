//! Per-document and per-field extraction records.
//!
//! Lifecycle: a [`DocumentExtraction`] is the raw model answer for one
//! (field, document) pair; normalisation turns it into a
//! [`NormalizedExtraction`]; the reducer combines those into a
//! [`ReducedResult`]; the pipeline wraps everything into a [`FieldResult`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::contract::FieldMeta;
use crate::json::is_parse_error;

/// One source document handed over by ingestion: a filename and its full
/// extracted text (with `[Page N]` markers for paginated sources).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceDocument {
    pub filename: String,
    pub text: String,
}

impl SourceDocument {
    pub fn new(filename: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            text: text.into(),
        }
    }

    /// KMZ/KML sources have no pages.
    pub fn is_paginated(&self) -> bool {
        is_paginated(&self.filename)
    }
}

/// Whether citations into `filename` may carry page numbers.
pub fn is_paginated(filename: &str) -> bool {
    let lower = filename.to_ascii_lowercase();
    !(lower.ends_with(".kmz") || lower.ends_with(".kml"))
}

/// A (document, page, snippet) citation. `label` names the intermediate key
/// the citation supports.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvidenceItem {
    pub doc: Option<String>,
    pub page: Option<u32>,
    pub snippet: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl EvidenceItem {
    /// Read a citation object leniently: numbers become strings, numeric
    /// strings become page numbers, anything unusable becomes `None`.
    pub fn from_map(map: &Map<String, Value>) -> Self {
        Self {
            doc: map.get("doc").and_then(text_of),
            page: map.get("page").and_then(page_of),
            snippet: map.get("snippet").and_then(text_of),
            label: map.get("label").and_then(text_of),
        }
    }

    pub fn has_snippet(&self) -> bool {
        self.snippet.as_deref().is_some_and(|s| !s.trim().is_empty())
    }
}

/// An entry of the flat `evidence` list: a citation object or a bare quote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EvidenceEntry {
    Item(EvidenceItem),
    Text(String),
}

impl EvidenceEntry {
    /// Strings and objects are kept; other JSON values are dropped.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(Self::Text(s.clone())),
            Value::Object(map) => Some(Self::Item(EvidenceItem::from_map(map))),
            _ => None,
        }
    }

    /// As a citation; bare quotes get no document or page.
    pub fn to_item(&self) -> EvidenceItem {
        match self {
            Self::Item(item) => item.clone(),
            Self::Text(snippet) => EvidenceItem {
                snippet: Some(snippet.clone()),
                ..EvidenceItem::default()
            },
        }
    }
}

/// Raw model answer for one document, before normalisation.
///
/// Built leniently from whatever JSON the model produced, or from a call
/// failure. Never rejected: normalisation turns every instance into a
/// structurally valid [`NormalizedExtraction`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocumentExtraction {
    pub value: Value,
    pub unit: Option<String>,
    pub intermediate: Map<String, Value>,
    pub evidence: Vec<EvidenceEntry>,
    pub evidence_structured: Vec<EvidenceItem>,
    pub confidence: Option<f64>,
    pub notes: Vec<String>,
    /// Call failure or timeout description.
    pub error: Option<String>,
    /// Original response text when it could not be parsed.
    pub raw: Option<String>,
}

impl DocumentExtraction {
    /// Read a parsed model response.
    pub fn from_value(value: Value) -> Self {
        if is_parse_error(&value) {
            return Self {
                raw: Some(value.get("raw").and_then(text_of).unwrap_or_default()),
                ..Self::default()
            };
        }
        let mut map = match value {
            Value::Object(map) => map,
            other => return Self::failed(format!("model response is not a JSON object: {other}")),
        };

        Self {
            value: map.remove("value").unwrap_or(Value::Null),
            unit: map.get("unit").and_then(text_of),
            intermediate: match map.remove("intermediate") {
                Some(Value::Object(m)) => m,
                _ => Map::new(),
            },
            evidence: list_of(map.get("evidence"))
                .iter()
                .filter_map(EvidenceEntry::from_value)
                .collect(),
            evidence_structured: list_of(map.get("evidence_structured"))
                .iter()
                .filter_map(Value::as_object)
                .map(EvidenceItem::from_map)
                .collect(),
            confidence: map.get("confidence").and_then(number_of),
            notes: notes_of(map.get("notes")),
            error: map.get("error").and_then(text_of),
            raw: None,
        }
    }

    /// Placeholder for a document whose extraction call failed.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }

    /// Whether the call failed or its output was unusable.
    pub fn is_failed(&self) -> bool {
        self.error.is_some() || self.raw.is_some()
    }
}

impl From<&NormalizedExtraction> for DocumentExtraction {
    fn from(n: &NormalizedExtraction) -> Self {
        Self {
            value: n.value.clone(),
            unit: n.unit.clone(),
            intermediate: n.intermediate.clone(),
            evidence: n.evidence.clone(),
            evidence_structured: n.evidence_structured.clone(),
            confidence: Some(n.confidence),
            notes: n.notes.clone(),
            error: None,
            raw: None,
        }
    }
}

/// A per-document result that satisfies its field contract: every declared
/// intermediate key is present and typed, `value` is derived from
/// `intermediate`, and structured evidence is populated whenever any evidence
/// exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedExtraction {
    pub value: Value,
    pub unit: Option<String>,
    pub intermediate: Map<String, Value>,
    pub evidence: Vec<EvidenceEntry>,
    pub evidence_structured: Vec<EvidenceItem>,
    pub confidence: f64,
    pub notes: Vec<String>,
    /// 1-based position in document order.
    #[serde(rename = "_doc_index")]
    pub doc_index: usize,
    #[serde(rename = "_filename")]
    pub filename: String,
    /// The extraction call failed or returned no usable JSON, so every
    /// intermediate value is a type default rather than a reading.
    #[serde(skip)]
    pub failed: bool,
}

/// The reduce phase's answer for one field.
#[derive(Debug, Clone, PartialEq)]
pub struct ReducedResult {
    pub value: Value,
    pub unit: Option<String>,
    pub justification: String,
    pub evidence: Vec<EvidenceEntry>,
    pub confidence: f64,
    pub notes: Vec<String>,
    /// Produced by the deterministic rules rather than the model.
    pub fallback: bool,
}

/// Final, persisted record for one requested field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldResult {
    pub key: String,
    pub meta: FieldMeta,
    pub prompt: String,
    pub value: Value,
    pub unit: Option<String>,
    pub justification: String,
    pub confidence: f64,
    pub evidence: Vec<EvidenceItem>,
    pub notes: Vec<String>,
    pub files_processed: Vec<String>,
    pub files_count: usize,
    pub empty_text_docs: Vec<String>,
    pub intermediate_per_doc: Vec<NormalizedExtraction>,
}

/// A requested key that matched no contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnknownField {
    pub key: String,
    pub error: String,
}

impl UnknownField {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            error: "Unknown field key".to_string(),
        }
    }
}

/// One entry of a run's result list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldEntry {
    Resolved(Box<FieldResult>),
    Unknown(UnknownField),
}

impl FieldEntry {
    pub fn key(&self) -> &str {
        match self {
            Self::Resolved(r) => &r.key,
            Self::Unknown(u) => &u.key,
        }
    }

    pub fn as_resolved(&self) -> Option<&FieldResult> {
        match self {
            Self::Resolved(r) => Some(r),
            Self::Unknown(_) => None,
        }
    }
}

/// Result envelope for a run: one entry per requested field, in request order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunOutput {
    pub results: Vec<FieldEntry>,
}

// ── Lenient readers ──

fn text_of(v: &Value) -> Option<String> {
    match v {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn page_of(v: &Value) -> Option<u32> {
    match v {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0 && *f >= 0.0).map(|f| f as u64))
            .and_then(|p| u32::try_from(p).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Finite number from a JSON number or a numeric string.
pub fn number_of(v: &Value) -> Option<f64> {
    let n = match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    n.filter(|f| f.is_finite())
}

fn list_of(v: Option<&Value>) -> &[Value] {
    match v {
        Some(Value::Array(items)) => items,
        _ => &[],
    }
}

fn notes_of(v: Option<&Value>) -> Vec<String> {
    match v {
        Some(Value::Array(items)) => items.iter().filter_map(text_of).collect(),
        Some(Value::String(s)) if !s.trim().is_empty() => vec![s.clone()],
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::json::parse_lenient;
    use serde_json::json;

    #[test]
    fn reads_model_response_leniently() {
        let ex = DocumentExtraction::from_value(json!({
            "value": 12.5,
            "unit": "kW",
            "intermediate": {"capacity_kw": "12,5"},
            "evidence": ["quoted text", {"doc": "a.pdf", "page": "3", "snippet": "s"}, 42],
            "evidence_structured": [{"doc": "a.pdf", "page": 3, "snippet": "s", "label": "capacity_kw"}, "junk"],
            "confidence": "0.7",
            "notes": "single note"
        }));
        assert_eq!(ex.value, json!(12.5));
        assert_eq!(ex.unit.as_deref(), Some("kW"));
        assert_eq!(ex.intermediate["capacity_kw"], "12,5");
        assert_eq!(ex.evidence.len(), 2);
        assert_eq!(
            ex.evidence[1],
            EvidenceEntry::Item(EvidenceItem {
                doc: Some("a.pdf".into()),
                page: Some(3),
                snippet: Some("s".into()),
                label: None,
            })
        );
        assert_eq!(ex.evidence_structured.len(), 1);
        assert_eq!(ex.evidence_structured[0].label.as_deref(), Some("capacity_kw"));
        assert_eq!(ex.confidence, Some(0.7));
        assert_eq!(ex.notes, vec!["single note"]);
        assert!(!ex.is_failed());
    }

    #[test]
    fn parse_error_marker_becomes_failed_extraction() {
        let ex = DocumentExtraction::from_value(parse_lenient("no json here"));
        assert!(ex.is_failed());
        assert_eq!(ex.raw.as_deref(), Some("no json here"));
        assert!(ex.error.is_none());
    }

    #[test]
    fn non_object_response_is_failed() {
        let ex = DocumentExtraction::from_value(json!([1, 2, 3]));
        assert!(ex.is_failed());
        assert!(ex.error.unwrap().contains("not a JSON object"));
    }

    #[test]
    fn kmz_and_kml_are_not_paginated() {
        assert!(!is_paginated("site.KMZ"));
        assert!(!is_paginated("layout.kml"));
        assert!(is_paginated("report.pdf"));
        assert!(SourceDocument::new("bill.txt", "").is_paginated());
    }

    #[test]
    fn field_entry_untagged_roundtrip() {
        let unknown = FieldEntry::Unknown(UnknownField::new("nope"));
        let json = serde_json::to_string(&unknown).unwrap();
        assert_eq!(json, r#"{"key":"nope","error":"Unknown field key"}"#);
        let back: FieldEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back, unknown);
        assert_eq!(back.key(), "nope");
        assert!(back.as_resolved().is_none());
    }

    #[test]
    fn normalized_extraction_uses_underscore_trace_keys() {
        let n = NormalizedExtraction {
            value: json!(true),
            unit: None,
            intermediate: Map::new(),
            evidence: vec![],
            evidence_structured: vec![],
            confidence: 0.5,
            notes: vec![],
            doc_index: 2,
            filename: "b.pdf".into(),
            failed: true,
        };
        let v = serde_json::to_value(&n).unwrap();
        assert_eq!(v["_doc_index"], 2);
        assert_eq!(v["_filename"], "b.pdf");
        assert!(v.get("failed").is_none());
    }
}
