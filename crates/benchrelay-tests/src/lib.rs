//! Benchrelay end-to-end test infrastructure.
//!
//! An in-memory relay cluster with scripted fault injection drives the
//! coordinator, follower workers and reconciliation auditor through full
//! ingest, replication, crash recovery and drift repair scenarios.

pub mod harness;
pub mod ingest_integration;
pub mod reconciliation_integration;
pub mod recovery_integration;
pub mod replication_integration;

pub use harness::{sample_doc, sample_doc_at, sample_doc_id, wait_until, RelayCluster, SAMPLE_INDEX};
