//! Golden Path
//!
//! Discovers the connectivity between a fleet of network accounts, records it
//! as a versioned baseline and verifies that baseline before and after a
//! release.
//!
//! ## Architecture
//!
//! - **Discovery**: per-account topology discovery, hub resolution and flow-log enrichment
//! - **Model**: merges per-account observations into deduplicated patterns
//! - **Golden Path**: the persisted baseline (schema migration, atomic store, drift)
//! - **Verification**: check planning and path analysis with guaranteed cleanup
//! - **Report**: run aggregation and summary publishing
//! - **Engine**: run orchestration with cancellation

pub mod aws;
pub mod config;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod golden_path;
pub mod model;
pub mod report;
pub mod session;
pub mod types;
pub mod verification;

pub use engine::{Engine, RunOptions};
pub use error::{ApiError, EngineError};
