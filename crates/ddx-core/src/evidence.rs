//! Evidence consolidation for a field's final result.

use crate::extraction::{EvidenceEntry, EvidenceItem, NormalizedExtraction};

/// Substrings marking reference material rather than project documents.
const GENERIC_SOURCE_MARKERS: &[&str] = &["guidebook", "permitting", "manual", "code"];

/// Whether a cited document looks like generic reference material.
pub fn is_generic_source(doc: Option<&str>) -> bool {
    doc.is_some_and(|d| {
        let lower = d.to_lowercase();
        GENERIC_SOURCE_MARKERS.iter().any(|m| lower.contains(m))
    })
}

/// Final evidence list for a field.
///
/// Structured evidence from every document, in document order, or the
/// reducer's own evidence when there is none. Generic citations are dropped
/// whenever at least one project-specific citation remains.
pub fn consolidate(
    extractions: &[NormalizedExtraction],
    reduced_evidence: &[EvidenceEntry],
) -> Vec<EvidenceItem> {
    let mut items: Vec<EvidenceItem> = extractions
        .iter()
        .flat_map(|e| e.evidence_structured.iter().cloned())
        .collect();
    if items.is_empty() {
        items = reduced_evidence.iter().map(EvidenceEntry::to_item).collect();
    }

    if items.iter().any(|i| !is_generic_source(i.doc.as_deref())) {
        items.retain(|i| !is_generic_source(i.doc.as_deref()));
    }
    items
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Map, Value};

    fn item(doc: &str, snippet: &str) -> EvidenceItem {
        EvidenceItem {
            doc: Some(doc.into()),
            page: Some(1),
            snippet: Some(snippet.into()),
            label: None,
        }
    }

    fn extraction(evidence: Vec<EvidenceItem>) -> NormalizedExtraction {
        NormalizedExtraction {
            value: Value::Null,
            unit: None,
            intermediate: Map::new(),
            evidence: vec![],
            evidence_structured: evidence,
            confidence: 0.5,
            notes: vec![],
            doc_index: 1,
            filename: "x".into(),
            failed: false,
        }
    }

    #[test]
    fn prefers_project_specific_citations() {
        let ex = vec![
            extraction(vec![item("install_manual.pdf", "generic")]),
            extraction(vec![item("site_report_042.pdf", "specific")]),
        ];
        let out = consolidate(&ex, &[]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].doc.as_deref(), Some("site_report_042.pdf"));
    }

    #[test]
    fn keeps_generic_citations_when_nothing_else_exists() {
        let ex = vec![extraction(vec![
            item("Permitting_Guidebook.pdf", "a"),
            item("fire CODE 2021.pdf", "b"),
        ])];
        assert_eq!(consolidate(&ex, &[]).len(), 2);
    }

    #[test]
    fn undocumented_items_count_as_specific() {
        let reduced = vec![
            EvidenceEntry::Text("bare quote".into()),
            EvidenceEntry::Item(item("electrical_code.pdf", "c")),
        ];
        let out = consolidate(&[extraction(vec![])], &reduced);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].doc, None);
        assert_eq!(out[0].page, None);
        assert_eq!(out[0].snippet.as_deref(), Some("bare quote"));
    }

    #[test]
    fn generic_heuristic_is_case_insensitive() {
        assert!(is_generic_source(Some("Owner_MANUAL.PDF")));
        assert!(!is_generic_source(Some("site_report.pdf")));
        assert!(!is_generic_source(None));
    }
}
