//! Pipeline driver: map, normalise and reduce each requested field.

use std::sync::Arc;

use ddx_core::evidence::consolidate;
use ddx_core::schema::{NO_DOCUMENTS_PROMPT, extraction_prompt};
use ddx_core::{
    FieldContract, FieldEntry, FieldRegistry, FieldResult, NormalizedExtraction, RunOutput,
    SourceDocument, UnknownField, normalize,
};
use futures::stream::{self, StreamExt};
use serde_json::Value;
use tracing::{info, warn};

use crate::client::ModelClient;
use crate::map::run_map;
use crate::options::PipelineOptions;
use crate::reduce::reduce;

/// Runs field extractions over one document set.
///
/// Holds the model client and the registry for the lifetime of a run; both
/// are shared read-only between concurrently processed fields.
#[derive(Clone)]
pub struct Pipeline {
    client: Arc<dyn ModelClient>,
    registry: Arc<FieldRegistry>,
    options: PipelineOptions,
}

impl Pipeline {
    pub fn new(
        client: Arc<dyn ModelClient>,
        registry: Arc<FieldRegistry>,
        options: PipelineOptions,
    ) -> Self {
        Self {
            client,
            registry,
            options,
        }
    }

    /// Extract every requested field. One entry per key, in request order,
    /// whatever the model does.
    pub async fn run(&self, field_keys: &[String], docs: &[SourceDocument]) -> RunOutput {
        info!(
            fields = field_keys.len(),
            docs = docs.len(),
            "run started"
        );
        let results: Vec<FieldEntry> = stream::iter(field_keys)
            .map(|key| self.run_field(key, docs))
            .buffered(self.options.field_concurrency.max(1))
            .collect()
            .await;
        info!(fields = results.len(), "run finished");
        RunOutput { results }
    }

    /// Extract one field. Unknown keys yield an error entry instead.
    pub async fn run_field(&self, key: &str, docs: &[SourceDocument]) -> FieldEntry {
        let Some(contract) = self.registry.resolve(key) else {
            warn!(field = %key, "unknown field key");
            return FieldEntry::Unknown(UnknownField::new(key));
        };
        if contract.key != key {
            info!(requested = %key, field = %contract.key, "resolved field by suffix");
        }

        if docs.is_empty() {
            info!(field = %contract.key, "no documents");
            return FieldEntry::Resolved(Box::new(empty_result(contract)));
        }

        let map = run_map(self.client.as_ref(), contract, docs, &self.options).await;
        let normalized: Vec<NormalizedExtraction> = map
            .extractions
            .iter()
            .zip(docs)
            .enumerate()
            .map(|(i, (extraction, doc))| normalize(extraction, contract, i + 1, &doc.filename))
            .collect();

        let reduced = reduce(
            self.client.as_ref(),
            contract,
            &normalized,
            self.options.call_timeout,
        )
        .await;

        let unit = reduced
            .unit
            .clone()
            .or_else(|| contract.expected_unit().map(str::to_string))
            .or_else(|| contract.unit.clone());
        let evidence = consolidate(&normalized, &reduced.evidence);

        info!(
            field = %contract.key,
            confidence = reduced.confidence,
            fallback = reduced.fallback,
            evidence = evidence.len(),
            "field extracted"
        );

        FieldEntry::Resolved(Box::new(FieldResult {
            key: contract.key.clone(),
            meta: contract.meta.clone(),
            prompt: extraction_prompt(contract, None),
            value: reduced.value,
            unit,
            justification: reduced.justification,
            confidence: reduced.confidence,
            evidence,
            notes: reduced.notes,
            files_processed: docs.iter().map(|d| d.filename.clone()).collect(),
            files_count: docs.len(),
            empty_text_docs: map.empty_text_docs,
            intermediate_per_doc: normalized,
        }))
    }
}

fn empty_result(contract: &FieldContract) -> FieldResult {
    FieldResult {
        key: contract.key.clone(),
        meta: contract.meta.clone(),
        prompt: NO_DOCUMENTS_PROMPT.to_string(),
        value: Value::Null,
        unit: None,
        justification: String::new(),
        confidence: 0.0,
        evidence: Vec::new(),
        notes: Vec::new(),
        files_processed: Vec::new(),
        files_count: 0,
        empty_text_docs: Vec::new(),
        intermediate_per_doc: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Reply, ScriptedClient, is_reduce_prompt};
    use serde_json::json;
    use std::time::Duration;

    const CONFIG: &str = r#"{
        "fields": {
            "site.permits.interconnection": {
                "doc_category": "Permitting",
                "extraction_contract": {
                    "intermediate": {
                        "has_agreement": {"type": "boolean"},
                        "utility_name": {"type": "string"}
                    },
                    "return_value": ["has_agreement", "utility_name"]
                },
                "reducer_policy": {"expected_unit": null, "rules": {"has_agreement": "any_true"}}
            },
            "site.energy.utility_rate": {
                "unit": "USD/kWh",
                "extraction_contract": {
                    "intermediate": {
                        "energy_charge_usd": {"type": "number"},
                        "monthly_kwh": {"type": "number"},
                        "rate_usd_per_kwh": {"type": "number"}
                    },
                    "return_value": "rate_usd_per_kwh"
                }
            }
        }
    }"#;

    fn docs() -> Vec<SourceDocument> {
        vec![
            SourceDocument::new("install_manual.pdf", "[Page 1] generic guidance"),
            SourceDocument::new("site_report_042.pdf", "[Page 1] IA signed with PG&E"),
            SourceDocument::new("layout.kmz", ""),
        ]
    }

    fn pipeline(client: ScriptedClient) -> Pipeline {
        Pipeline::new(
            Arc::new(client),
            Arc::new(FieldRegistry::from_json_str(CONFIG).unwrap()),
            PipelineOptions {
                call_timeout: Duration::from_millis(200),
                ..PipelineOptions::default()
            },
        )
    }

    /// Per-document answers keyed by filename; reduction always unusable.
    fn scripted() -> ScriptedClient {
        ScriptedClient::new(|user| {
            if is_reduce_prompt(user) {
                return Reply::Text("no idea".into());
            }
            if user.contains(r#""doc": "install_manual.pdf""#) {
                Reply::json(json!({
                    "intermediate": {"has_agreement": false, "utility_name": "Generic", "energy_charge_usd": 10, "monthly_kwh": 100},
                    "evidence_structured": [{"doc": "install_manual.pdf", "page": 1, "snippet": "generic", "label": "has_agreement"}],
                    "confidence": 0.3
                }))
            } else if user.contains(r#""doc": "site_report_042.pdf""#) {
                Reply::json(json!({
                    "intermediate": {"has_agreement": "yes", "utility_name": "PG&E", "energy_charge_usd": "1.200,00", "monthly_kwh": 6000},
                    "evidence_structured": [{"doc": "site_report_042.pdf", "page": "1", "snippet": "IA signed", "label": "has_agreement"}],
                    "confidence": 0.8
                }))
            } else {
                Reply::Hang
            }
        })
    }

    #[tokio::test]
    async fn results_follow_request_order_with_unknown_keys() {
        let p = pipeline(scripted());
        let keys = vec![
            "utility_rate".to_string(),
            "nope.missing".to_string(),
            "site.permits.interconnection".to_string(),
        ];
        let out = p.run(&keys, &docs()).await;

        assert_eq!(out.results.len(), 3);
        assert_eq!(out.results[0].key(), "site.energy.utility_rate");
        assert_eq!(
            out.results[1],
            FieldEntry::Unknown(UnknownField::new("nope.missing"))
        );
        assert_eq!(out.results[2].key(), "site.permits.interconnection");
    }

    #[tokio::test]
    async fn structured_field_survives_failures_and_filters_generic_evidence() {
        let p = pipeline(scripted());
        let entry = p.run_field("site.permits.interconnection", &docs()).await;
        let r = entry.as_resolved().unwrap();

        assert_eq!(r.value, json!({"has_agreement": true, "utility_name": "PG&E"}));
        assert_eq!(r.unit, None);
        assert_eq!(r.confidence, 0.8);
        assert_eq!(r.files_count, 3);
        assert_eq!(r.empty_text_docs, vec!["layout.kmz"]);
        assert_eq!(r.intermediate_per_doc.len(), 3);
        assert_eq!(r.intermediate_per_doc[2].confidence, 0.0);
        assert_eq!(r.intermediate_per_doc[2].doc_index, 3);
        assert_eq!(
            Value::Object(r.intermediate_per_doc[2].intermediate.clone()),
            json!({"has_agreement": false, "utility_name": ""})
        );
        assert_eq!(r.evidence.len(), 1);
        assert_eq!(r.evidence[0].doc.as_deref(), Some("site_report_042.pdf"));
        assert_eq!(r.evidence[0].page, Some(1));
        assert_eq!(r.meta.section.as_deref(), Some("Permitting"));
        assert!(r.prompt.contains(r#""doc": "<string>""#));
    }

    #[tokio::test]
    async fn scalar_field_uses_field_unit_and_best_candidate() {
        let p = pipeline(scripted());
        let entry = p.run_field("site.energy.utility_rate", &docs()).await;
        let r = entry.as_resolved().unwrap();

        assert_eq!(r.value, json!(0.2));
        assert_eq!(r.unit.as_deref(), Some("USD/kWh"));
        assert!(r.notes[0].starts_with("Fallback"));
    }

    #[tokio::test]
    async fn empty_document_set_is_a_valid_result() {
        let client = ScriptedClient::new(|_| Reply::Fail(500));
        let p = pipeline(client);
        let entry = p.run_field("site.energy.utility_rate", &[]).await;
        let r = entry.as_resolved().unwrap();

        assert_eq!(r.prompt, "(n/a)");
        assert_eq!(r.value, Value::Null);
        assert_eq!(r.files_count, 0);
        assert!(r.evidence.is_empty());
    }

    #[tokio::test]
    async fn total_model_outage_still_completes() {
        let p = pipeline(ScriptedClient::new(|_| Reply::Fail(503)));
        let keys = vec![
            "site.permits.interconnection".to_string(),
            "site.energy.utility_rate".to_string(),
        ];
        let out = p.run(&keys, &docs()).await;

        let first = out.results[0].as_resolved().unwrap();
        assert_eq!(first.value, json!({"has_agreement": false, "utility_name": ""}));
        assert_eq!(first.confidence, 0.0);
        let second = out.results[1].as_resolved().unwrap();
        assert_eq!(second.value, Value::Null);
        assert_eq!(second.intermediate_per_doc[0].intermediate["rate_usd_per_kwh"], json!(0.0));
        assert!(
            second.intermediate_per_doc[0].notes[0].contains("503"),
            "failure is recorded per document"
        );
    }

    #[tokio::test]
    async fn delegated_reduction_is_used_when_valid() {
        let client = ScriptedClient::new(|user| {
            if is_reduce_prompt(user) {
                Reply::json(json!({
                    "value": 0.18,
                    "justification": "bill total",
                    "evidence": ["$0.18/kWh"],
                    "confidence": 0.95
                }))
            } else {
                Reply::json(json!({"intermediate": {"rate_usd_per_kwh": 0.18}, "confidence": 0.9}))
            }
        });
        let p = pipeline(client);
        let docs = vec![SourceDocument::new("bill.txt", "[Page 1] Rate $0.18/kWh")];
        let entry = p.run_field("site.energy.utility_rate", &docs).await;
        let r = entry.as_resolved().unwrap();

        assert_eq!(r.value, json!(0.18));
        assert_eq!(r.unit.as_deref(), Some("USD/kWh"));
        assert_eq!(r.justification, "bill total");
        assert_eq!(r.confidence, 0.95);
        // No per-document citations, so the reducer's quote is used.
        assert_eq!(r.evidence[0].snippet.as_deref(), Some("$0.18/kWh"));
    }
}
