//! Network API seam
//!
//! Every cloud call the engine makes goes through [`NetworkApi`]. A client is
//! always scoped to one account; the session layer hands out clients per
//! account.
//!
//! ## Implementations
//!
//! - [`fixture::RecordedNetwork`]: replays a recorded topology document. Used
//!   for offline runs and as the deterministic backend in tests.

mod api;
pub mod fixture;

pub use api::*;
