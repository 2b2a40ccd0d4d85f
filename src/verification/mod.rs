//! Verification
//!
//! Re-tests live connectivity for every pattern recorded in the golden path.
//!
//! ## Architecture
//!
//! - **Plan**: checks per pattern (protocol-level plus one per observed port,
//!   both directions for peerings)
//! - **Dispatcher**: one strategy per connection kind, bounded concurrency
//! - **Analysis**: per-tuple path reuse, poll with deadline, guaranteed delete
//!
//! API errors are contained per check and become FAIL results. Authorization
//! errors end the run.

mod analysis;
mod dispatcher;
mod plan;

pub use analysis::*;
pub use dispatcher::*;
pub use plan::*;
