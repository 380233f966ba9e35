//! JSON file store.
//!
//! Layout under the store root:
//!
//! ```text
//! runs/<project>/<run_id>.json          full run snapshot
//! fields/<project>/<slug>.latest.json   newest entry per field (overwritten)
//! fields/<project>/<slug>.history.jsonl one line per run (appended)
//! ```

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use ddx_core::{FieldEntry, RunOutput};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::StoreError;

/// Caller-supplied description of a run, stored alongside its results.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunMeta {
    pub project_id: String,
    #[serde(default)]
    pub docs_dir: Option<String>,
    #[serde(default)]
    pub fields: Vec<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub run_id: String,
    #[serde(flatten)]
    pub run: RunMeta,
}

/// Contents of `runs/<project>/<run_id>.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub meta: SnapshotMeta,
    pub results: Vec<FieldEntry>,
}

/// One field entry tagged with the run that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSnapshot {
    pub run_id: String,
    #[serde(flatten)]
    pub entry: FieldEntry,
}

/// Where one field's files were written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredField {
    pub key: String,
    pub latest: PathBuf,
    pub history: PathBuf,
}

/// Paths written by [`JsonStore::save_run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRun {
    pub run_id: String,
    pub run_json: PathBuf,
    pub fields: Vec<StoredField>,
}

/// File-backed store rooted at one directory.
pub struct JsonStore {
    root: PathBuf,
}

impl JsonStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Persist a run. `run_id` defaults to the current UTC time as
    /// `YYYYMMDD-HHMMSS`.
    pub fn save_run(
        &self,
        output: &RunOutput,
        run_id: Option<&str>,
        meta: RunMeta,
    ) -> Result<StoredRun, StoreError> {
        validate_project_id(&meta.project_id)?;
        let run_id = run_id.map_or_else(new_run_id, str::to_string);
        let project = meta.project_id.clone();

        let run_dir = self.root.join("runs").join(&project);
        create_dir(&run_dir)?;
        let run_json = run_dir.join(format!("{run_id}.json"));
        let snapshot = RunSnapshot {
            meta: SnapshotMeta {
                run_id: run_id.clone(),
                run: meta,
            },
            results: output.results.clone(),
        };
        write_file(&run_json, serde_json::to_string_pretty(&snapshot)?.as_bytes())?;

        let fields_dir = self.fields_dir(&project);
        create_dir(&fields_dir)?;
        let mut fields = Vec::with_capacity(output.results.len());
        for entry in &output.results {
            let slug = slug(entry.key());
            let latest = fields_dir.join(format!("{slug}.latest.json"));
            let history = fields_dir.join(format!("{slug}.history.jsonl"));
            let record = FieldSnapshot {
                run_id: run_id.clone(),
                entry: entry.clone(),
            };

            write_file(&latest, serde_json::to_string_pretty(&record)?.as_bytes())?;
            append_line(&history, &serde_json::to_string(&record)?)?;
            debug!(field = %entry.key(), path = %latest.display(), "stored field");

            fields.push(StoredField {
                key: entry.key().to_string(),
                latest,
                history,
            });
        }

        info!(
            run_id = %run_id,
            project = %project,
            fields = fields.len(),
            path = %run_json.display(),
            "saved run"
        );
        Ok(StoredRun {
            run_id,
            run_json,
            fields,
        })
    }

    /// Most recent stored entry for a field, if any.
    pub fn load_latest(
        &self,
        project_id: &str,
        key: &str,
    ) -> Result<Option<FieldSnapshot>, StoreError> {
        validate_project_id(project_id)?;
        let path = self
            .fields_dir(project_id)
            .join(format!("{}.latest.json", slug(key)));
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(StoreError::Io { path, source }),
        };
        Ok(Some(serde_json::from_str(&text)?))
    }

    fn fields_dir(&self, project_id: &str) -> PathBuf {
        self.root.join("fields").join(project_id)
    }
}

/// Lowercase `key`, collapse runs of non-alphanumerics to `_`, trim `_`.
pub fn slug(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for c in key.to_lowercase().chars() {
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            out.push(c);
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }
    out.trim_matches('_').to_string()
}

fn new_run_id() -> String {
    Utc::now().format("%Y%m%d-%H%M%S").to_string()
}

fn validate_project_id(id: &str) -> Result<(), StoreError> {
    if id.trim().is_empty() || id.contains(['/', '\\']) || id.contains("..") {
        return Err(StoreError::InvalidProjectId(id.to_string()));
    }
    Ok(())
}

fn create_dir(path: &Path) -> Result<(), StoreError> {
    fs::create_dir_all(path).map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn write_file(path: &Path, contents: &[u8]) -> Result<(), StoreError> {
    fs::write(path, contents).map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn append_line(path: &Path, line: &str) -> Result<(), StoreError> {
    let io_err = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(io_err)?;
    writeln!(file, "{line}").map_err(io_err)
}
