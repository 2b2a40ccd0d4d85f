//! Golden Path
//!
//! The persisted connectivity baseline every verification phase compares
//! against.
//!
//! ## Architecture
//!
//! - **Document**: versioned snapshot of patterns, assertions and summary counts
//! - **Migration**: in-place upgrade of older schema versions on load
//! - **Store**: atomic save with timestamped backup of the replaced file
//! - **Diff**: added, removed and changed patterns between two baselines

mod document;
mod migration;
mod store;

pub use document::*;
pub use migration::*;
pub use store::*;
