#![warn(missing_docs)]

//! Benchrelay daemon subsystem: results ingest API, operator endpoints, configuration, CLI

pub mod cli;
pub mod config;
pub mod http;
