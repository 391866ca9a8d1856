#![warn(missing_docs)]

//! Document store clients: the HTTP client used against real leader and
//! follower clusters, and an in-memory double for the test harness.

pub mod client;
pub mod error;
pub mod http;
pub mod memory;

pub use client::{DocumentStore, Health, SearchHit};
pub use error::StoreError;
pub use http::{ConsistencyPolicy, HttpDocumentStore, HttpStoreConfig};
pub use memory::MemoryDocumentStore;
