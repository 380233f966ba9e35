//! Document ingestion: discover source files in a directory and turn each
//! into a [`SourceDocument`].
//!
//! Text and CSV files are read directly. PDF and KMZ decoding live outside
//! this binary, so those files contribute empty text and surface in the
//! run's `empty_text_docs`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use ddx_core::SourceDocument;
use tracing::{debug, warn};

/// Characters of CSV content included after the summary header.
const CSV_PREVIEW_CHARS: usize = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Pdf,
    Text,
    Csv,
    Kmz,
}

impl SourceKind {
    /// Discovery order.
    pub const ALL: [SourceKind; 4] = [Self::Pdf, Self::Text, Self::Csv, Self::Kmz];

    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "pdf" => Some(Self::Pdf),
            "txt" => Some(Self::Text),
            "csv" => Some(Self::Csv),
            "kmz" => Some(Self::Kmz),
            _ => None,
        }
    }
}

/// Supported files in `dir`: PDFs, then text, then CSV, then KMZ, each group
/// sorted by name. A missing directory has no files.
pub fn discover_files(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        warn!(dir = %dir.display(), "documents directory not found");
        return Ok(Vec::new());
    }
    let mut found: Vec<(SourceKind, PathBuf)> = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("listing {}", dir.display()))? {
        let path = entry?.path();
        if path.is_file()
            && let Some(kind) = SourceKind::from_path(&path)
        {
            found.push((kind, path));
        }
    }

    let mut files = Vec::with_capacity(found.len());
    for kind in SourceKind::ALL {
        let mut group: Vec<PathBuf> = found
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, p)| p.clone())
            .collect();
        group.sort();
        files.extend(group);
    }
    Ok(files)
}

/// Page texts for one file. Always at least one page.
pub fn read_pages(path: &Path, kind: SourceKind) -> Vec<String> {
    let name = file_name(path);
    match kind {
        SourceKind::Text => vec![read_lossy(path).unwrap_or_default()],
        SourceKind::Csv => vec![
            read_lossy(path)
                .map(|content| csv_summary(&name, &content))
                .unwrap_or_default(),
        ],
        SourceKind::Pdf | SourceKind::Kmz => {
            warn!(file = %name, "no decoder for this format, using empty text");
            vec![String::new()]
        }
    }
}

/// Join pages into one document text. Paginated sources get `[Page N] `
/// prefixes; a file whose pages are all blank yields empty text.
pub fn join_pages(pages: &[String], kind: SourceKind) -> String {
    if pages.iter().all(|p| p.trim().is_empty()) {
        return String::new();
    }
    match kind {
        SourceKind::Kmz => pages.join("\n"),
        _ => pages
            .iter()
            .enumerate()
            .map(|(i, page)| format!("[Page {}] {page}", i + 1))
            .collect::<Vec<_>>()
            .join("\n\n"),
    }
}

/// Read every supported document in `dir`, in discovery order.
pub fn load_documents(dir: Option<&Path>) -> anyhow::Result<Vec<SourceDocument>> {
    let Some(dir) = dir else {
        return Ok(Vec::new());
    };
    let files = discover_files(dir)?;
    let total = files.len();

    let mut docs = Vec::with_capacity(total);
    for (i, path) in files.iter().enumerate() {
        let Some(kind) = SourceKind::from_path(path) else {
            continue;
        };
        let name = file_name(path);
        eprintln!("  Reading [{}/{total}] {name}", i + 1);
        let text = join_pages(&read_pages(path, kind), kind);
        debug!(file = %name, chars = text.chars().count(), "read document");
        docs.push(SourceDocument::new(name, text));
    }
    Ok(docs)
}

fn csv_summary(name: &str, content: &str) -> String {
    let mut lines = content.lines();
    let head = lines.next().unwrap_or("");
    let rows = lines.count();
    let preview: String = content.chars().take(CSV_PREVIEW_CHARS).collect();
    format!("CSV:{name}\nHeader:{head}\nRows:{rows}\n\n{preview}")
}

fn read_lossy(path: &Path) -> Option<String> {
    match fs::read(path) {
        Ok(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
        Err(e) => {
            warn!(file = %path.display(), error = %e, "cannot read document");
            None
        }
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discovery_orders_by_kind_then_name() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.txt", "a.txt", "z.pdf", "site.KMZ", "rates.csv", "notes.md"] {
            fs::write(dir.path().join(name), "x").unwrap();
        }
        fs::create_dir(dir.path().join("nested.pdf")).unwrap();

        let names: Vec<String> = discover_files(dir.path())
            .unwrap()
            .iter()
            .map(|p| file_name(p))
            .collect();
        assert_eq!(names, vec!["z.pdf", "a.txt", "b.txt", "rates.csv", "site.KMZ"]);
    }

    #[test]
    fn missing_directory_has_no_files() {
        let dir = tempfile::tempdir().unwrap();
        assert!(discover_files(&dir.path().join("absent")).unwrap().is_empty());
        assert!(load_documents(None).unwrap().is_empty());
    }

    #[test]
    fn csv_becomes_a_summary_page() {
        assert_eq!(
            csv_summary("rates.csv", "month,kwh\njan,100\nfeb,120\n"),
            "CSV:rates.csv\nHeader:month,kwh\nRows:2\n\nmonth,kwh\njan,100\nfeb,120\n"
        );
        let long = format!("id\n{}", "a".repeat(2500));
        let summary = csv_summary("big.csv", &long);
        let (head, preview) = summary.split_once("\n\n").unwrap();
        assert_eq!(head, "CSV:big.csv\nHeader:id\nRows:1");
        assert_eq!(preview.chars().count(), 2000);
        assert_eq!(preview, format!("id\n{}", "a".repeat(1997)));
    }

    #[test]
    fn pages_are_marked_and_joined() {
        let pages = vec!["one".to_string(), "two".to_string()];
        assert_eq!(join_pages(&pages, SourceKind::Text), "[Page 1] one\n\n[Page 2] two");
        assert_eq!(join_pages(&pages, SourceKind::Kmz), "one\ntwo");
        assert_eq!(join_pages(&[" ".to_string()], SourceKind::Pdf), "");
    }

    #[test]
    fn loads_documents_with_empty_text_for_undecoded_formats() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("bill.txt"), "Energy charge: $1.200,00").unwrap();
        fs::write(dir.path().join("scan.pdf"), b"%PDF-1.7").unwrap();

        let docs = load_documents(Some(dir.path())).unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0], SourceDocument::new("scan.pdf", ""));
        assert_eq!(docs[1].filename, "bill.txt");
        assert_eq!(docs[1].text, "[Page 1] Energy charge: $1.200,00");
    }
}
