//! Field contracts and the pure half of the ddx extraction pipeline: prompt
//! compilation, lenient JSON recovery, per-document normalisation and
//! evidence consolidation. Nothing in this crate performs I/O beyond loading
//! the field configuration.

pub mod contract;
pub mod error;
pub mod evidence;
pub mod extraction;
pub mod json;
pub mod normalize;
pub mod registry;
pub mod schema;

pub use contract::{
    FieldContract, FieldMeta, IntermediateKey, ReducerPolicy, ReductionRule, ReturnShape, RuleSet,
    ValueType,
};
pub use error::ConfigError;
pub use extraction::{
    DocumentExtraction, EvidenceEntry, EvidenceItem, FieldEntry, FieldResult, NormalizedExtraction,
    ReducedResult, RunOutput, SourceDocument, UnknownField,
};
pub use json::parse_lenient;
pub use normalize::normalize;
pub use registry::FieldRegistry;
