//! Topology Discovery
//!
//! Reads raw connectivity facts from every configured account and turns them
//! into typed [`ConnectivityObservation`](crate::types::ConnectivityObservation)s.
//!
//! ## Architecture
//!
//! - **Survey**: authenticate each account, pick its VPC, read hub attachments
//! - **Hub resolution**: supplied router id, or the router most accounts share
//! - **Per-kind discovery**: hub-routed, peered, tunneled, private-endpoint
//! - **Flow-log enrichment**: best-effort traffic samples between known VPCs
//! - **Security groups**: ports each VPC's groups admit, narrowed per path
//!
//! Accounts are discovered concurrently and merged only after every account
//! has finished or failed. A failing account or connection kind becomes a
//! [`PartialDiscoveryWarning`](crate::error::PartialDiscoveryWarning); throttled
//! calls are retried with bounded exponential backoff, and every account's
//! work runs under a deadline.

mod flow_logs;
mod hub;
mod retry;
mod security_groups;
mod topology;

pub use flow_logs::*;
pub use hub::*;
pub use retry::*;
pub use security_groups::*;
pub use topology::*;
