//! Map phase: one extraction call per document for a single field.

use ddx_core::json::parse_lenient;
use ddx_core::schema::{SYSTEM_PROMPT, extraction_prompt};
use ddx_core::{DocumentExtraction, FieldContract, SourceDocument};
use futures::stream::{self, StreamExt};
use tracing::{debug, info, warn};

use crate::client::{ModelClient, invoke_with_timeout};
use crate::options::PipelineOptions;

/// Appended to document text cut at the character budget.
pub const TRUNCATION_MARKER: &str = "\n[...truncated...]";

/// Map-phase output for one field, in document order.
#[derive(Debug, Clone, Default)]
pub struct MapOutput {
    pub extractions: Vec<DocumentExtraction>,
    /// Filenames whose text was empty or whitespace-only.
    pub empty_text_docs: Vec<String>,
}

/// Run the extraction call for every document, at most
/// `options.map_concurrency` at a time.
///
/// Never fails: a call error, timeout or unparseable response becomes a
/// failed [`DocumentExtraction`] in that document's slot.
pub async fn run_map(
    client: &dyn ModelClient,
    contract: &FieldContract,
    docs: &[SourceDocument],
    options: &PipelineOptions,
) -> MapOutput {
    info!(field = %contract.key, docs = docs.len(), "map phase started");

    let extractions: Vec<DocumentExtraction> = stream::iter(docs)
        .map(|doc| extract_document(client, contract, doc, options))
        .buffered(options.map_concurrency.max(1))
        .collect()
        .await;

    let empty_text_docs: Vec<String> = docs
        .iter()
        .filter(|d| d.text.trim().is_empty())
        .map(|d| d.filename.clone())
        .collect();

    let failed = extractions.iter().filter(|e| e.is_failed()).count();
    info!(
        field = %contract.key,
        docs = docs.len(),
        failed,
        empty = empty_text_docs.len(),
        "map phase finished"
    );
    MapOutput {
        extractions,
        empty_text_docs,
    }
}

async fn extract_document(
    client: &dyn ModelClient,
    contract: &FieldContract,
    doc: &SourceDocument,
    options: &PipelineOptions,
) -> DocumentExtraction {
    let prompt = extraction_prompt(contract, Some(&doc.filename));
    let user = format!(
        "{prompt}\n\nDocument:\n{}",
        truncate_text(&doc.text, options.max_doc_chars)
    );

    match invoke_with_timeout(client, SYSTEM_PROMPT, &user, true, options.call_timeout).await {
        Ok(raw) => {
            let extraction = DocumentExtraction::from_value(parse_lenient(&raw));
            if extraction.is_failed() {
                warn!(field = %contract.key, doc = %doc.filename, "unusable extraction output");
            } else {
                debug!(field = %contract.key, doc = %doc.filename, "extracted");
            }
            extraction
        }
        Err(e) => {
            warn!(field = %contract.key, doc = %doc.filename, error = %e, "extraction call failed");
            DocumentExtraction::failed(e.to_string())
        }
    }
}

/// Cut `text` to at most `max_chars` characters, marking the cut.
pub fn truncate_text(text: &str, max_chars: usize) -> std::borrow::Cow<'_, str> {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => format!("{}{TRUNCATION_MARKER}", &text[..byte_idx]).into(),
        None => text.into(),
    }
}
