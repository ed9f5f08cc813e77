//! Domain-level building blocks shared by the storage adapters and the scanner.
//!
//! The crate owns the ledger model, the cursor/dedup storage contracts, the
//! environment-driven configuration, and the telemetry wiring so every binary
//! boots from the same deterministic contract.

pub mod config;
pub mod model;
pub mod services;
pub mod storage;

pub use services::*;
pub use storage::*;
