//! `xbval-validator` library crate.
//!
//! Holds the per-cluster orchestrator and the report writer. The binary
//! entrypoint lives in `main.rs`.

pub mod orchestrator;
pub mod report;
