//! Benchmark result documents: one metric sample per document.
//!
//! The wire format keeps the original kebab-case keys so existing dashboards
//! keep working. Closed, strongly-typed fields live as struct members; any
//! unknown top-level field rides along as an opaque string label.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// Wire format of `test-execution-timestamp`: basic date-time, no millis.
pub const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%SZ";

/// Parse a `basic_date_time_no_millis` timestamp (`20260821T101500Z`).
///
/// A trailing `Z` is interpreted as UTC; an explicit numeric offset
/// (`20260821T121500+0200`) is normalized to UTC.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Some(base) = s.strip_suffix('Z') {
        if let Ok(naive) = NaiveDateTime::parse_from_str(base, "%Y%m%dT%H%M%S") {
            return Some(naive.and_utc());
        }
    }
    DateTime::parse_from_str(s, "%Y%m%dT%H%M%S%z")
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Format a timestamp in the `basic_date_time_no_millis` wire format (UTC).
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

mod basic_ts {
    use super::*;
    use serde::de::Error as DeError;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&format_timestamp(ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(de)?;
        parse_timestamp(&raw)
            .ok_or_else(|| D::Error::custom(format!("invalid basic_date_time_no_millis: {raw}")))
    }
}

fn default_active() -> bool {
    true
}

/// Numeric summary of one metric sample.
///
/// Exactly the shape the results store expects: a `single` value for scalar
/// metrics, or min/mean/median/max for distributions. Percentile keys and
/// units produced by some drivers are preserved verbatim in `detail`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MetricValue {
    /// Scalar value for single-sample metrics.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub single: Option<f64>,
    /// Minimum over the sample distribution.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub min: Option<f64>,
    /// Mean over the sample distribution.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub mean: Option<f64>,
    /// Median over the sample distribution.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub median: Option<f64>,
    /// Maximum over the sample distribution.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub max: Option<f64>,
    /// Extra per-metric entries (percentiles such as `50_0`, `unit`).
    #[serde(flatten)]
    pub detail: BTreeMap<String, serde_json::Value>,
}

impl MetricValue {
    /// Build a scalar metric value.
    pub fn single(v: f64) -> Self {
        Self {
            single: Some(v),
            ..Default::default()
        }
    }

    /// True when none of the declared summary fields is set.
    ///
    /// Extra `detail` entries do not count: a value consisting only of
    /// percentiles carries no declared summary and is still invalid.
    pub fn is_empty(&self) -> bool {
        self.single.is_none()
            && self.min.is_none()
            && self.mean.is_none()
            && self.median.is_none()
            && self.max.is_none()
    }
}

/// One benchmark metric sample, the unit of ingest and replication.
///
/// Created exactly once by the benchmark driver at the end of a measurement
/// and never updated in place; `active` distinguishes superseding corrections
/// from a logical delete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultDocument {
    /// Opaque identifier of the benchmark execution.
    #[serde(rename = "test-execution-id")]
    pub test_execution_id: String,
    /// When the execution ran (UTC, second precision).
    #[serde(rename = "test-execution-timestamp", with = "basic_ts")]
    pub test_execution_timestamp: DateTime<Utc>,
    /// Logical-delete flag; superseded results are marked inactive.
    #[serde(default = "default_active")]
    pub active: bool,
    /// Version of the benchmark driver.
    #[serde(
        rename = "benchmark-version",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub benchmark_version: Option<String>,
    /// Revision of the benchmark driver.
    #[serde(
        rename = "benchmark-revision",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub benchmark_revision: Option<String>,
    /// Logical environment name (shared by comparable runs).
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub environment: Option<String>,
    /// Workload that produced this sample.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub workload: Option<String>,
    /// Test procedure within the workload (snake_case on the wire).
    #[serde(
        rename = "test_procedure",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub test_procedure: Option<String>,
    /// Provisioning profile of the benchmarked cluster.
    #[serde(
        rename = "provision-config-instance",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub provision_config_instance: Option<String>,
    /// Distribution flavor of the benchmarked store.
    #[serde(
        rename = "distribution-flavor",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub distribution_flavor: Option<String>,
    /// Distribution version of the benchmarked store.
    #[serde(
        rename = "distribution-version",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub distribution_version: Option<String>,
    /// Major component of `distribution-version`.
    #[serde(
        rename = "distribution-major-version",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub distribution_major_version: Option<u32>,
    /// Number of nodes in the benchmarked cluster.
    #[serde(
        rename = "node-count",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub node_count: Option<u32>,
    /// Task that produced this sample.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub task: Option<String>,
    /// Operation behind the task.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub operation: Option<String>,
    /// Job identifier for job-scoped metrics (e.g. ML processing time).
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub job: Option<String>,
    /// Metric name (`throughput`, `latency`, `service_time`, ...).
    pub name: String,
    /// Plugins active on the benchmarked cluster.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub plugins: Option<Vec<String>>,
    /// The numeric summary.
    pub value: MetricValue,
    /// Open label set: every unknown top-level field, kept verbatim.
    #[serde(flatten)]
    pub labels: BTreeMap<String, String>,
}

impl ResultDocument {
    /// Stable document id: `test-execution-id/name/task`.
    ///
    /// The triple uniquely identifies a sample within one execution, which
    /// makes re-put after an ambiguous timeout idempotent.
    pub fn doc_id(&self) -> String {
        format!(
            "{}/{}/{}",
            self.test_execution_id,
            self.name,
            self.task.as_deref().unwrap_or("")
        )
    }

    /// Monthly results index this document belongs to.
    pub fn index_name(&self) -> String {
        crate::mapping::results_index_name(&self.test_execution_timestamp)
    }

    /// Serialize to the canonical JSON wire form.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("result document serializes to JSON")
    }
}
