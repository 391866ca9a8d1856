//! Results index naming and the index template installed on each store.
//!
//! Documents land in monthly indices derived from their execution timestamp;
//! queries address the wildcard pattern. The template maps dynamic string
//! fields to `keyword` so unknown labels stay filterable without a mapping
//! change.

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

/// Prefix shared by every monthly results index.
pub const RESULTS_INDEX_PREFIX: &str = "benchmark-results-";

/// Wildcard pattern matching every monthly results index.
pub const RESULTS_INDEX_PATTERN: &str = "benchmark-results-*";

/// Name under which the results index template is installed.
pub const RESULTS_TEMPLATE_NAME: &str = "benchmark-results";

/// Shard/replica overrides applied to the results template.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateOverrides {
    /// Override for `index.number_of_shards`; must be at least 1.
    pub number_of_shards: Option<u32>,
    /// Override for `index.number_of_replicas`.
    pub number_of_replicas: Option<u32>,
}

/// A template override produced an unusable template.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MappingError {
    /// `number_of_shards` must be at least 1.
    #[error("number_of_shards must be >= 1, got {0}")]
    InvalidShardCount(u32),
}

/// Monthly index name for documents with the given execution timestamp.
pub fn results_index_name(ts: &DateTime<Utc>) -> String {
    format!("{}{:04}-{:02}", RESULTS_INDEX_PREFIX, ts.year(), ts.month())
}

/// Results index template body, with overrides applied.
///
/// Declared fields keep their strict types; every other string field is
/// mapped through a dynamic template to `keyword`. `date_detection` is off
/// so label values that merely look like dates stay plain keywords.
pub fn results_template(overrides: &TemplateOverrides) -> Result<serde_json::Value, MappingError> {
    let mut template = json!({
        "index_patterns": [RESULTS_INDEX_PATTERN],
        "settings": {
            "index": {
                "number_of_shards": 1,
                "number_of_replicas": 0
            }
        },
        "mappings": {
            "date_detection": false,
            "dynamic_templates": [
                {
                    "strings": {
                        "match_mapping_type": "string",
                        "mapping": { "type": "keyword" }
                    }
                }
            ],
            "properties": {
                "test-execution-id": { "type": "keyword" },
                "test-execution-timestamp": {
                    "type": "date",
                    "format": "basic_date_time_no_millis"
                },
                "active": { "type": "boolean" },
                "node-count": { "type": "integer" },
                "distribution-major-version": { "type": "integer" },
                "plugins": { "type": "keyword" },
                "value": {
                    "properties": {
                        "single": { "type": "double" },
                        "min": { "type": "double" },
                        "mean": { "type": "double" },
                        "median": { "type": "double" },
                        "max": { "type": "double" }
                    }
                }
            }
        }
    });

    if let Some(shards) = overrides.number_of_shards {
        if shards < 1 {
            return Err(MappingError::InvalidShardCount(shards));
        }
        template["settings"]["index"]["number_of_shards"] = json!(shards);
    }
    if let Some(replicas) = overrides.number_of_replicas {
        template["settings"]["index"]["number_of_replicas"] = json!(replicas);
    }

    Ok(template)
}
