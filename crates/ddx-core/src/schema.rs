//! Prompt compiler: renders a [`FieldContract`] into the instruction text and
//! output template for the per-document extraction call and the
//! cross-document reduction call.
//!
//! Pure templating over contract data. A contract with no intermediate keys
//! still yields a complete prompt with an empty `intermediate` slot.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::contract::{FieldContract, ReturnShape, RuleSet};
use crate::extraction::{EvidenceEntry, NormalizedExtraction};

/// System message sent with every extraction and reduction call.
pub const SYSTEM_PROMPT: &str = "Return ONLY valid JSON matching the schema. No prose.";

/// Prompt recorded for a field when there were no documents to extract from.
pub const NO_DOCUMENTS_PROMPT: &str = "(n/a)";

const ANY_VALUE_PLACEHOLDER: &str = "<number|string|boolean|null>";

/// Body of the per-document extraction prompt. The document text is appended
/// by the caller.
pub fn extraction_prompt(contract: &FieldContract, filename: Option<&str>) -> String {
    let doc = filename.unwrap_or("<string>");
    let category = contract
        .meta
        .category
        .as_deref()
        .or(contract.meta.document.as_deref())
        .unwrap_or("(unspecified)");

    let (value_placeholder, unit_literal) = match &contract.return_value {
        Some(ReturnShape::Structured(keys)) => (typed_object(contract, keys), "null".to_string()),
        Some(ReturnShape::Scalar(key)) => (
            contract.value_type(key).placeholder().to_string(),
            json_str_or_null(contract.unit.as_deref()),
        ),
        None => (
            ANY_VALUE_PLACEHOLDER.to_string(),
            json_str_or_null(contract.unit.as_deref()),
        ),
    };

    let mut rules = Vec::new();
    if unit_literal != "null"
        && let Some(unit) = &contract.unit
    {
        rules.push(format!("- Use the field's expected unit: {unit}."));
    }
    rules.extend(
        [
            "- Only use keys declared in the contract.",
            "- Populate EVERY 'intermediate' key; use null when not found in the doc.",
            "- Evidence: include at least one item with the exact filename in 'doc', a 'page' number \
             using the [Page N] markers present in this document (or null for non-paged sources), \
             and a short quote/phrase snippet (<= 240 chars) justifying your extraction.",
            "- If the source is a KMZ/KML, set page to null; snippet can be a short structured summary.",
        ]
        .map(String::from),
    );

    let intermediate = typed_object(
        contract,
        &contract
            .intermediate
            .iter()
            .map(|k| k.name.clone())
            .collect::<Vec<_>>(),
    );

    let template = format!(
        r#"Return ONLY JSON:
{{
  "value": {value_placeholder},
  "unit": {unit_literal},
  "intermediate": {intermediate},
  "evidence": [
    {{
      "doc": "{doc}",
      "page": <number|null>,
      "snippet": "<string>"
    }}
  ],
  "evidence_structured": [
    {{
      "doc": "{doc}",
      "page": <number|null>,
      "snippet": "<string>",
      "label": "<one of the intermediate keys>"
    }}
  ],
  "confidence": <0..1>,
  "notes": [<string>]
}}"#
    );

    format!(
        r#"You are extracting "{data_point}" from ONE document in category: {category}.

Contract for "intermediate" (allowed keys only):
{contract_lines}

Rules:
{rules}

Hints:
{hints}

{template}

Output requirements:
- For every intermediate key you set (true/false/number/string), add at least one item to "evidence_structured"
  with a short directly-quoted snippet and the page number where it appears (page may be null for non-paginated docs).
- The "label" in each evidence_structured item MUST match an intermediate key you returned.
- If evidence supports FALSE (e.g., explicit "no...", "not provided", "absence noted"), quote that text.
- Prefer citing THIS document over generic manuals or codes when justifying booleans.
- Always answer in English, however evidence should stay unmodified.
"#,
        data_point = contract.meta.data_point,
        contract_lines = contract_lines(contract),
        rules = rules.join("\n"),
        hints = bullet_list(&contract.prompt_hints),
    )
}

/// One per-document result as shown to the model during reduction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReductionCandidate {
    pub value: Value,
    pub unit: Option<String>,
    pub intermediate: Map<String, Value>,
    pub evidence: Vec<EvidenceEntry>,
    pub confidence: f64,
    pub filename: String,
}

impl ReductionCandidate {
    /// Scalar fields whose assembled value is null fall back to the
    /// intermediate entry.
    pub fn new(contract: &FieldContract, extraction: &NormalizedExtraction) -> Self {
        let value = match (&extraction.value, &contract.return_value) {
            (Value::Null, Some(ReturnShape::Scalar(key))) => extraction
                .intermediate
                .get(key)
                .cloned()
                .unwrap_or(Value::Null),
            (v, _) => v.clone(),
        };
        Self {
            value,
            unit: extraction.unit.clone(),
            intermediate: extraction.intermediate.clone(),
            evidence: extraction.evidence.clone(),
            confidence: extraction.confidence,
            filename: extraction.filename.clone(),
        }
    }
}

/// Prompt for the cross-document reduction call, embedding every candidate
/// and the policy parameters.
pub fn reduction_prompt(contract: &FieldContract, candidates: &[ReductionCandidate]) -> String {
    let policy = &contract.reducer_policy;
    let expected_unit = contract.expected_unit();
    let method = policy.method.as_deref().unwrap_or("");

    let (value_placeholder, per_doc_placeholder) = match &contract.return_value {
        Some(ReturnShape::Structured(keys)) => {
            let obj = typed_object(contract, keys);
            (obj.clone(), obj)
        }
        Some(ReturnShape::Scalar(key)) => {
            let slot = contract.value_type(key).placeholder();
            (slot.to_string(), format!(r#"{{ "{key}": {slot} }}"#))
        }
        None => ("<string|null>".to_string(), "{ }".to_string()),
    };

    let source_keys: Map<String, Value> = policy
        .source_keys
        .iter()
        .map(|(k, v)| (k.clone(), Value::from(v.as_str())))
        .collect();

    let rules_lines = match &policy.rules {
        RuleSet::None => Vec::new(),
        RuleSet::PerKey(rules) => rules
            .iter()
            .map(|(k, r)| format!("- {k}: {}", r.as_str()))
            .collect(),
        RuleSet::Listed(rules) => rules.iter().map(|r| format!("- {}", r.as_str())).collect(),
    };
    let rules_text = if policy.rules.is_empty() {
        "- (none)".to_string()
    } else {
        rules_lines.join("\n")
    };

    let mut instructions = Vec::new();
    if !method.is_empty() {
        instructions.push(format!("- Use reducer method: {method}"));
    }
    if let Some(unit) = expected_unit {
        instructions.push(format!("- Expected output unit: {unit}"));
    }
    if !policy.source_keys.is_empty() {
        let names: Vec<&str> = policy.source_keys.iter().map(|(_, v)| v.as_str()).collect();
        instructions.push(format!("- Source keys: {}", names.join(", ")));
    }
    instructions.extend(policy.instructions.iter().cloned());
    instructions.push(
        "- Always include a 'justification' field explaining how you aggregated across \
         documents/snippets. Be specific, when referring to documents, cite the snippet and page number"
            .to_string(),
    );

    let candidates_json =
        serde_json::to_string_pretty(candidates).unwrap_or_else(|_| "[]".to_string());
    let unit_literal = json_str_or_null(expected_unit);
    let unit_display = expected_unit.unwrap_or("None");

    format!(
        r#"You are synthesizing the final value for "{data_point}" ({key}) from multiple per-document JSON objects.

Reducer policy:
- expected_unit = {unit_display}
- method = {method_display}
- strategy = {strategy}
- source_keys = {source_keys}
- rules:
{rules_text}

Final "value" must be computed strictly from the structured per-document fields listed in the extraction contract.
{instructions}

Intermediate results (per-doc):
{candidates_json}

Always set unit to {unit_literal}. Output STRICT JSON only. No prose.
Return ONLY JSON:
{{
  "value": {value_placeholder},
  "unit": {unit_literal},
  "justification": "<string>",
  "intermediate": {{
    "final_method": "{method}",
    "per_doc": [{per_doc_placeholder}]
  }},
  "evidence": [{{"doc":"<string>","page":<number|null>,"snippet":"<string>"}}],
  "confidence": <0..1>,
  "notes": [<string>]
}}"#,
        data_point = contract.meta.data_point,
        key = contract.key,
        method_display = policy.method.as_deref().unwrap_or("None"),
        strategy = policy.strategy.as_deref().unwrap_or("None"),
        source_keys = Value::Object(source_keys),
        instructions = instructions.join("\n"),
    )
}

/// Human-readable listing of the declared intermediate keys.
fn contract_lines(contract: &FieldContract) -> String {
    if contract.intermediate.is_empty() {
        return "- (no intermediate keys)".to_string();
    }
    contract
        .intermediate
        .iter()
        .map(|k| {
            let req = if k.required { "required" } else { "optional" };
            format!(r#"- "{}": {}, {req}. {}"#, k.name, k.value_type.as_str(), k.description)
                .trim_end()
                .to_string()
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// `{ "a": <number|null>, "b": <string|null> }` for the given keys.
fn typed_object(contract: &FieldContract, keys: &[String]) -> String {
    if keys.is_empty() {
        return "{}".to_string();
    }
    let slots: Vec<String> = keys
        .iter()
        .map(|k| format!(r#""{k}": {}"#, contract.value_type(k).placeholder()))
        .collect();
    format!("{{ {} }}", slots.join(", "))
}

fn bullet_list(items: &[String]) -> String {
    if items.is_empty() {
        return "- (none)".to_string();
    }
    items.iter().map(|h| format!("- {h}")).collect::<Vec<_>>().join("\n")
}

fn json_str_or_null(s: Option<&str>) -> String {
    s.map_or_else(|| "null".to_string(), |s| Value::from(s).to_string())
}
