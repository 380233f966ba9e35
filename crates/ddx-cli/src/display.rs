//! Human-readable rendering of run results and the field registry.

use ddx_core::{FieldEntry, FieldRegistry, FieldResult, RunOutput};
use ddx_store::StoredRun;
use serde_json::Value;

const MAX_VALUE_CHARS: usize = 48;

/// One card per field: value, unit, confidence, then the top citations.
pub fn print_run(output: &RunOutput, stored: Option<&StoredRun>) {
    for entry in &output.results {
        match entry {
            FieldEntry::Resolved(result) => print_field(result),
            FieldEntry::Unknown(u) => {
                println!("── {} ──", u.key);
                println!("  error       {}", u.error);
                println!();
            }
        }
    }
    if let Some(stored) = stored {
        println!("Stored run {} → {}", stored.run_id, stored.run_json.display());
    }
}

fn print_field(r: &FieldResult) {
    println!("── {} ({}) ──", r.meta.data_point, r.key);
    println!("  value       {}", format_value(&r.value));
    if let Some(unit) = &r.unit {
        println!("  unit        {unit}");
    }
    println!("  confidence  {:.2}", r.confidence);
    println!("  files       {}", r.files_count);
    if !r.empty_text_docs.is_empty() {
        println!("  no text     {}", r.empty_text_docs.join(", "));
    }
    if !r.justification.is_empty() {
        println!("  why         {}", truncate(&r.justification, 100));
    }
    for ev in r.evidence.iter().take(3) {
        let doc = ev.doc.as_deref().unwrap_or("?");
        let page = ev.page.map(|p| format!(" p.{p}")).unwrap_or_default();
        let snippet = ev.snippet.as_deref().unwrap_or("");
        println!("  evidence    {doc}{page}: {}", truncate(snippet, 80));
    }
    if r.evidence.len() > 3 {
        println!("              ... and {} more", r.evidence.len() - 3);
    }
    for note in &r.notes {
        println!("  note        {note}");
    }
    println!();
}

/// Tabular listing of every field in the registry.
pub fn print_fields(registry: &FieldRegistry) {
    if let Some(version) = registry.version() {
        println!("Field config version {version}");
    }
    println!("{:<48} {:<20} {}", "KEY", "SECTION", "DATA POINT");
    for c in registry.iter() {
        println!(
            "{:<48} {:<20} {}",
            c.key,
            c.meta.section.as_deref().unwrap_or("-"),
            c.meta.data_point
        );
    }
    println!("{} fields", registry.len());
}

/// Compact single-line rendering of a result value.
pub fn format_value(value: &Value) -> String {
    match value {
        Value::Null => "(none)".to_string(),
        Value::String(s) if s.is_empty() => "\"\"".to_string(),
        Value::String(s) => truncate(s, MAX_VALUE_CHARS),
        Value::Object(map) => {
            let parts: Vec<String> = map
                .iter()
                .map(|(k, v)| format!("{k}={}", format_value(v)))
                .collect();
            truncate(&parts.join(", "), MAX_VALUE_CHARS * 2)
        }
        other => truncate(&other.to_string(), MAX_VALUE_CHARS),
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    let one_line = s.replace('\n', " ");
    if one_line.chars().count() <= max_chars {
        one_line
    } else {
        let cut: String = one_line.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{cut}...")
    }
}
