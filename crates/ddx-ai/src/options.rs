use std::time::Duration;

/// Tuning knobs for a pipeline run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineOptions {
    /// Document text beyond this many characters is cut before extraction.
    pub max_doc_chars: usize,
    /// Extraction calls in flight at once for one field.
    pub map_concurrency: usize,
    /// Fields processed at once.
    pub field_concurrency: usize,
    /// Upper bound on each model call.
    pub call_timeout: Duration,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            max_doc_chars: 12_000,
            map_concurrency: 4,
            field_concurrency: 1,
            call_timeout: Duration::from_secs(120),
        }
    }
}
