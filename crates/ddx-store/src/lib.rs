//! Storage layer: run snapshots and per-field latest/history files on disk.

mod error;
mod json;

pub use error::StoreError;
pub use json::{
    FieldSnapshot, JsonStore, RunMeta, RunSnapshot, SnapshotMeta, StoredField, StoredRun, slug,
};
