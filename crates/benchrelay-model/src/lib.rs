#![warn(missing_docs)]

//! Benchrelay data model: benchmark result documents, the declared result
//! schema, and the validator guarding the ingest path.

pub mod document;
pub mod error;
pub mod mapping;
pub mod validate;

pub use document::{
    format_timestamp, parse_timestamp, MetricValue, ResultDocument, TIMESTAMP_FORMAT,
};
pub use error::SchemaError;
pub use mapping::{
    results_index_name, results_template, MappingError, TemplateOverrides,
    RESULTS_INDEX_PATTERN, RESULTS_INDEX_PREFIX, RESULTS_TEMPLATE_NAME,
};
pub use validate::SchemaValidator;
